use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::error::{StorageError, StorageResult};
use super::ids::{ChatId, MessageId};
use super::types::{Chat, Message, sort_for_display};
use super::{BoxFuture, ChatStore, MessageStore};

#[derive(Debug, Default)]
struct Tables {
    chats: HashMap<ChatId, Chat>,
    messages: HashMap<MessageId, Message>,
}

/// Process-local store with the same contract as [`crate::SqliteStorage`].
///
/// Nothing survives the process; useful for ephemeral sessions and for exercising
/// the sync engine against a store that can be told to fail.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    tables: Mutex<Tables>,
    failing: AtomicBool,
    message_reads: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every operation fails with [`StorageError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of `list_messages` calls served so far.
    pub fn message_reads(&self) -> usize {
        self.message_reads.load(Ordering::SeqCst)
    }

    pub fn chat_count(&self) -> usize {
        self.lock().chats.len()
    }

    pub fn message_count(&self) -> usize {
        self.lock().messages.len()
    }

    /// Every stored row whose id or chat id is still provisional.
    pub fn provisional_rows(&self) -> usize {
        let tables = self.lock();
        let chats = tables
            .chats
            .keys()
            .filter(|id| id.is_provisional())
            .count();
        let messages = tables
            .messages
            .values()
            .filter(|message| message.id.is_provisional() || message.chat_id.is_provisional())
            .count();
        chats + messages
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, stage: &'static str) -> StorageResult<MutexGuard<'_, Tables>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable { stage });
        }
        Ok(self.lock())
    }
}

fn newest_first(chats: &mut [Chat]) {
    chats.sort_by(|left, right| {
        right
            .created_at_unix_ms
            .cmp(&left.created_at_unix_ms)
            .then_with(|| right.id.cmp(&left.id))
    });
}

impl ChatStore for MemoryStorage {
    fn put_chat(&self, chat: Chat) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.check("memory-chat-put")?.chats.insert(chat.id.clone(), chat);
            Ok(())
        })
    }

    fn get_chat(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<Option<Chat>>> {
        Box::pin(async move { Ok(self.check("memory-chat-get")?.chats.get(&chat_id).cloned()) })
    }

    fn list_chats(&self, owner_id: String) -> BoxFuture<'_, StorageResult<Vec<Chat>>> {
        Box::pin(async move {
            let mut chats = self
                .check("memory-chat-list")?
                .chats
                .values()
                .filter(|chat| chat.owner_id == owner_id)
                .cloned()
                .collect::<Vec<_>>();
            newest_first(&mut chats);
            Ok(chats)
        })
    }

    fn list_child_chats(
        &self,
        parent_chat_id: ChatId,
    ) -> BoxFuture<'_, StorageResult<Vec<Chat>>> {
        Box::pin(async move {
            let mut chats = self
                .check("memory-chat-list-children")?
                .chats
                .values()
                .filter(|chat| chat.parent_chat_id.as_ref() == Some(&parent_chat_id))
                .cloned()
                .collect::<Vec<_>>();
            newest_first(&mut chats);
            Ok(chats)
        })
    }

    fn delete_chat(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.check("memory-chat-delete")?.chats.remove(&chat_id);
            Ok(())
        })
    }

    fn clear_parent_chat_refs(&self, parent_chat_id: ChatId) -> BoxFuture<'_, StorageResult<u64>> {
        Box::pin(async move {
            let mut tables = self.check("memory-chat-clear-parent-refs")?;
            let mut cleared = 0;
            for chat in tables.chats.values_mut() {
                if chat.parent_chat_id.as_ref() == Some(&parent_chat_id) {
                    chat.parent_chat_id = None;
                    cleared += 1;
                }
            }
            Ok(cleared)
        })
    }
}

impl MessageStore for MemoryStorage {
    fn put_messages(&self, messages: Vec<Message>) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let mut tables = self.check("memory-message-put")?;
            for message in messages {
                tables.messages.insert(message.id.clone(), message);
            }
            Ok(())
        })
    }

    fn list_messages(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<Vec<Message>>> {
        Box::pin(async move {
            self.message_reads.fetch_add(1, Ordering::SeqCst);
            let mut messages = self
                .check("memory-message-list")?
                .messages
                .values()
                .filter(|message| message.chat_id == chat_id)
                .cloned()
                .collect::<Vec<_>>();
            sort_for_display(&mut messages);
            Ok(messages)
        })
    }

    fn delete_message(&self, message_id: MessageId) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.check("memory-message-delete")?.messages.remove(&message_id);
            Ok(())
        })
    }

    fn delete_chat_messages(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<u64>> {
        Box::pin(async move {
            let mut tables = self.check("memory-message-delete-for-chat")?;
            let before = tables.messages.len();
            tables.messages.retain(|_, message| message.chat_id != chat_id);
            Ok((before - tables.messages.len()) as u64)
        })
    }

    fn reparent_messages(&self, from: ChatId, to: ChatId) -> BoxFuture<'_, StorageResult<u64>> {
        Box::pin(async move {
            let mut tables = self.check("memory-message-reparent")?;
            let mut moved = 0;
            for message in tables.messages.values_mut() {
                if message.chat_id == from {
                    message.chat_id = to.clone();
                    moved += 1;
                }
            }
            Ok(moved)
        })
    }

    fn replace_chat_messages(
        &self,
        chat_id: ChatId,
        messages: Vec<Message>,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let mut tables = self.check("memory-message-replace")?;
            tables.messages.retain(|_, message| message.chat_id != chat_id);
            for message in messages {
                tables.messages.insert(message.id.clone(), message);
            }
            Ok(())
        })
    }
}
