use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{ChatId, DurableChatId, DurableMessageId, LocalId, MessageId, PROVISIONAL_ID_MARKER};
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub use types::{
    Attachment, Chat, DEFAULT_CHAT_NAME, Message, MessageRole, active_view, display_order,
    sort_for_display,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait ChatStore: Send + Sync {
    /// Inserts the chat or overwrites the row with the same id.
    fn put_chat(&self, chat: Chat) -> BoxFuture<'_, StorageResult<()>>;
    fn get_chat(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<Option<Chat>>>;
    /// Chats owned by `owner_id`, newest first.
    fn list_chats(&self, owner_id: String) -> BoxFuture<'_, StorageResult<Vec<Chat>>>;
    fn list_child_chats(&self, parent_chat_id: ChatId)
    -> BoxFuture<'_, StorageResult<Vec<Chat>>>;
    fn delete_chat(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<()>>;
    /// Drops `parent_chat_id` back-references to the given chat; returns the rows touched.
    fn clear_parent_chat_refs(&self, parent_chat_id: ChatId) -> BoxFuture<'_, StorageResult<u64>>;
}

pub trait MessageStore: Send + Sync {
    /// Upserts every message in one transaction.
    fn put_messages(&self, messages: Vec<Message>) -> BoxFuture<'_, StorageResult<()>>;
    /// All messages of a chat, inactive versions included, in display order.
    fn list_messages(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<Vec<Message>>>;
    fn delete_message(&self, message_id: MessageId) -> BoxFuture<'_, StorageResult<()>>;
    fn delete_chat_messages(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<u64>>;
    /// Moves every message from `from` to `to`; returns the rows moved.
    fn reparent_messages(&self, from: ChatId, to: ChatId) -> BoxFuture<'_, StorageResult<u64>>;
    /// Atomically swaps a chat's messages for `messages`.
    fn replace_chat_messages(
        &self,
        chat_id: ChatId,
        messages: Vec<Message>,
    ) -> BoxFuture<'_, StorageResult<()>>;
}

pub trait DurableStore: ChatStore + MessageStore {}

impl<T> DurableStore for T where T: ChatStore + MessageStore {}
