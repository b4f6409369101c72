pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod inflight;
pub mod recency;
pub mod reconcile;
pub mod remote;
pub mod requests;
pub mod working_set;

pub use config::{RecencyConfig, RemoteConfig, SyncConfig};
pub use engine::{CacheStats, CreatedChat, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use events::{ChatEvent, ChatListener, SubscriptionId};
pub use remote::{
    AddMessageRequest, CreateChatRequest, HttpAuthority, MemoryAuthority, RemoteAuthority,
    RemoteError, RemoteOp, RemoteResult,
};
pub use requests::{NewChat, NewMessage};

pub use chatsync_storage::{
    Attachment, Chat, ChatId, ChatStore, DurableChatId, DurableMessageId, DurableStore, LocalId,
    MemoryStorage, Message, MessageId, MessageRole, MessageStore, SqliteStorage, StorageError,
};
