use std::sync::Arc;

use chatsync_storage::{Chat, ChatId};

/// Change notifications fired after a mutation has been applied to the caches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// Optimistic insert under a provisional id.
    ChatCreated { chat: Chat },
    /// The remote authority confirmed a provisional chat.
    ChatReconciled {
        provisional: ChatId,
        durable: ChatId,
    },
    ChatCreationFailed { chat_id: ChatId },
    ChatUpdated { chat: Chat },
    ChatDeleted { chat_id: ChatId },
    MessagesChanged { chat_id: ChatId },
    ChatListChanged { owner_id: String },
}

impl ChatEvent {
    /// The chat the event concerns, if any.
    pub fn chat_id(&self) -> Option<&ChatId> {
        match self {
            Self::ChatCreated { chat } | Self::ChatUpdated { chat } => Some(&chat.id),
            Self::ChatReconciled { durable, .. } => Some(durable),
            Self::ChatCreationFailed { chat_id }
            | Self::ChatDeleted { chat_id }
            | Self::MessagesChanged { chat_id } => Some(chat_id),
            Self::ChatListChanged { .. } => None,
        }
    }
}

pub type ChatListener = Arc<dyn Fn(&ChatEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub(crate) struct Listeners {
    next_id: u64,
    entries: Vec<(SubscriptionId, ChatListener)>,
}

impl Listeners {
    pub(crate) fn subscribe(&mut self, listener: ChatListener) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.entries.push((id, listener));
        id
    }

    pub(crate) fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    /// Listeners are cloned out so callbacks run without the registry locked.
    pub(crate) fn snapshot(&self) -> Vec<ChatListener> {
        self.entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn unsubscribed_listeners_stop_receiving_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut listeners = Listeners::default();
        let sink = Arc::clone(&seen);
        let id = listeners.subscribe(Arc::new(move |event: &ChatEvent| {
            sink.lock().unwrap().push(event.clone());
        }));

        let event = ChatEvent::ChatListChanged {
            owner_id: "user-1".to_string(),
        };
        for listener in listeners.snapshot() {
            listener(&event);
        }
        assert!(listeners.unsubscribe(id));
        assert!(!listeners.unsubscribe(id));
        for listener in listeners.snapshot() {
            listener(&event);
        }

        assert_eq!(seen.lock().unwrap().as_slice(), &[event]);
    }
}
