use chatsync_storage::{Chat, Message, MessageId};

use super::CacheState;
use crate::events::ChatEvent;

type CacheUndo = Box<dyn FnOnce(&mut CacheState) -> Reverted + Send>;

/// What undoing the cache half leaves to do once the lock is released.
#[derive(Debug, Default)]
pub(crate) struct Reverted {
    pub(crate) events: Vec<ChatEvent>,
    /// Working-set copies the undo changed, written back to the store.
    pub(crate) messages: Vec<Message>,
}

impl From<Vec<ChatEvent>> for Reverted {
    fn from(events: Vec<ChatEvent>) -> Self {
        Self {
            events,
            messages: Vec::new(),
        }
    }
}

/// Store writes that reverse an optimistic step.
#[derive(Debug, Default)]
pub(crate) struct StoreUndo {
    pub(crate) delete_messages: Vec<MessageId>,
    pub(crate) put_messages: Vec<Message>,
    pub(crate) put_chats: Vec<Chat>,
}

impl StoreUndo {
    pub(crate) fn is_empty(&self) -> bool {
        self.delete_messages.is_empty() && self.put_messages.is_empty() && self.put_chats.is_empty()
    }
}

/// A local effect already applied to the caches, with the compensating action
/// that reverses it if the remote step fails.
pub(crate) struct Optimistic<T> {
    value: T,
    undo_cache: Option<CacheUndo>,
    undo_store: StoreUndo,
}

impl<T> Optimistic<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            value,
            undo_cache: None,
            undo_store: StoreUndo::default(),
        }
    }

    pub(crate) fn undo_cache(
        mut self,
        undo: impl FnOnce(&mut CacheState) -> Reverted + Send + 'static,
    ) -> Self {
        self.undo_cache = Some(Box::new(undo));
        self
    }

    pub(crate) fn undo_store(mut self, undo: StoreUndo) -> Self {
        self.undo_store = undo;
        self
    }

    pub(crate) fn value(&self) -> &T {
        &self.value
    }

    pub(crate) fn commit(self) -> T {
        self.value
    }

    /// Splits into the cache and store halves of the undo.
    pub(crate) fn into_undo(self) -> (Option<CacheUndo>, StoreUndo) {
        (self.undo_cache, self.undo_store)
    }
}
