use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::ids::{ChatId, MessageId};

/// Name given to chats created without an explicit title.
pub const DEFAULT_CHAT_NAME: &str = "New Chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub url: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: ChatId,
    pub name: String,
    pub owner_id: String,
    pub current_model: String,
    pub initial_model: String,
    #[serde(default)]
    pub parent_chat_id: Option<ChatId>,
    #[serde(rename = "createdAt")]
    pub created_at_unix_ms: i64,
    #[serde(default)]
    pub is_public: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub author_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub parent_message_id: Option<MessageId>,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(rename = "createdAt")]
    pub created_at_unix_ms: i64,
    #[serde(rename = "creationTime")]
    pub creation_time_unix_ms: i64,
    // Secondary order key for messages sharing a creation time.
    #[serde(default)]
    pub sequence: u64,
}

impl Message {
    /// True when this message is `parent_id` itself or one of its alternate versions.
    pub fn in_version_group_of(&self, parent_id: &MessageId) -> bool {
        &self.id == parent_id || self.parent_message_id.as_ref() == Some(parent_id)
    }

    /// The id every member of this message's version group shares.
    pub fn version_root(&self) -> &MessageId {
        self.parent_message_id.as_ref().unwrap_or(&self.id)
    }
}

/// Display order: creation time, then construction sequence, then id.
pub fn display_order(left: &Message, right: &Message) -> Ordering {
    left.creation_time_unix_ms
        .cmp(&right.creation_time_unix_ms)
        .then_with(|| left.sequence.cmp(&right.sequence))
        .then_with(|| left.id.to_string().cmp(&right.id.to_string()))
}

pub fn sort_for_display(messages: &mut [Message]) {
    messages.sort_by(display_order);
}

/// Active messages in display order; the list conversation views render.
pub fn active_view(messages: &[Message]) -> Vec<Message> {
    let mut active = messages
        .iter()
        .filter(|message| message.is_active)
        .cloned()
        .collect::<Vec<_>>();
    sort_for_display(&mut active);
    active
}

fn default_version() -> u32 {
    1
}

fn default_active() -> bool {
    true
}
