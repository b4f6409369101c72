use chatsync_storage::{
    Attachment, BoxFuture, Chat, DurableChatId, DurableMessageId, Message, MessageRole,
};
use serde::Serialize;
use snafu::Snafu;

pub mod http;
pub mod memory;

pub use http::HttpAuthority;
pub use memory::{MemoryAuthority, RemoteOp};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RemoteError {
    #[snafu(display("remote authority is unreachable on `{stage}`"))]
    Unavailable { stage: &'static str },
    #[snafu(display("remote authority rejected `{stage}`: {details}"))]
    Rejected {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("remote {entity} '{id}' does not exist"))]
    NotFound {
        stage: &'static str,
        entity: &'static str,
        id: String,
    },
    #[snafu(display("http transport failed on `{stage}`: {source}"))]
    Http {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("remote answered `{stage}` with status {status}: {body}"))]
    Status {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to decode remote response on `{stage}`: {source}"))]
    DecodeResponse {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("remote call `{stage}` timed out"))]
    Timeout { stage: &'static str },
}

pub type RemoteResult<T> = Result<T, RemoteError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChatRequest {
    pub name: String,
    pub owner_id: String,
    pub model: String,
    pub parent_chat_id: Option<DurableChatId>,
    pub is_public: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddMessageRequest {
    pub chat_id: DurableChatId,
    pub author_id: String,
    pub role: MessageRole,
    pub content: String,
    pub model: Option<String>,
    pub attachments: Vec<Attachment>,
    pub parent_message_id: Option<DurableMessageId>,
    pub version: u32,
    #[serde(rename = "creationTime")]
    pub creation_time_unix_ms: i64,
    pub sequence: u64,
}

/// The authoritative backend. Only durable ids cross this boundary.
pub trait RemoteAuthority: Send + Sync {
    fn create_chat(&self, request: CreateChatRequest) -> BoxFuture<'_, RemoteResult<Chat>>;
    fn delete_chat(&self, chat_id: DurableChatId) -> BoxFuture<'_, RemoteResult<()>>;
    fn update_chat_model(
        &self,
        chat_id: DurableChatId,
        model: String,
    ) -> BoxFuture<'_, RemoteResult<()>>;
    fn update_chat_visibility(
        &self,
        chat_id: DurableChatId,
        is_public: bool,
    ) -> BoxFuture<'_, RemoteResult<()>>;
    /// Stores the message; a parent deactivates the rest of its version group.
    fn add_message(&self, request: AddMessageRequest) -> BoxFuture<'_, RemoteResult<Message>>;
    /// Activates `message_id` within its group and returns every message of its chat.
    fn switch_message_version(
        &self,
        message_id: DurableMessageId,
    ) -> BoxFuture<'_, RemoteResult<Vec<Message>>>;
    /// Resets the message to `version = 1` and deactivates it.
    fn mark_as_original_version(
        &self,
        message_id: DurableMessageId,
    ) -> BoxFuture<'_, RemoteResult<()>>;
    /// Every message of the chat, inactive versions included.
    fn get_messages(&self, chat_id: DurableChatId) -> BoxFuture<'_, RemoteResult<Vec<Message>>>;
    fn list_chats(&self, owner_id: String) -> BoxFuture<'_, RemoteResult<Vec<Chat>>>;
    fn list_public_chats(&self) -> BoxFuture<'_, RemoteResult<Vec<Chat>>>;
}
