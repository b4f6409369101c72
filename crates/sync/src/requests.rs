use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chatsync_storage::{Attachment, ChatId, DEFAULT_CHAT_NAME, MessageId, MessageRole};

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Next value of the process-wide construction counter.
pub(crate) fn next_sequence() -> u64 {
    NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChat {
    pub name: String,
    pub model: String,
    /// Falls back to the engine's session owner when unset.
    pub owner_id: Option<String>,
    pub parent_chat_id: Option<ChatId>,
    pub is_public: bool,
}

impl NewChat {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            owner_id: None,
            parent_chat_id: None,
            is_public: false,
        }
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_parent(mut self, parent_chat_id: ChatId) -> Self {
        self.parent_chat_id = Some(parent_chat_id);
        self
    }

    pub fn public(mut self) -> Self {
        self.is_public = true;
        self
    }

    pub(crate) fn display_name(&self) -> String {
        let name = self.name.trim();
        if name.is_empty() {
            DEFAULT_CHAT_NAME.to_string()
        } else {
            name.to_string()
        }
    }
}

/// A message as the caller intends to send it.
///
/// `creation_time_unix_ms` and `sequence` are stamped here, at construction, so the
/// display order reflects send order no matter which remote call settles first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub chat_id: ChatId,
    pub role: MessageRole,
    pub content: String,
    pub author_id: Option<String>,
    pub model: Option<String>,
    pub attachments: Vec<Attachment>,
    pub parent_message_id: Option<MessageId>,
    pub creation_time_unix_ms: i64,
    pub sequence: u64,
}

impl NewMessage {
    pub fn new(chat_id: ChatId, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            chat_id,
            role,
            content: content.into(),
            author_id: None,
            model: None,
            attachments: Vec::new(),
            parent_message_id: None,
            creation_time_unix_ms: now_unix_ms(),
            sequence: next_sequence(),
        }
    }

    pub fn user(chat_id: ChatId, content: impl Into<String>) -> Self {
        Self::new(chat_id, MessageRole::User, content)
    }

    pub fn assistant(chat_id: ChatId, content: impl Into<String>) -> Self {
        Self::new(chat_id, MessageRole::Assistant, content)
    }

    pub fn with_author(mut self, author_id: impl Into<String>) -> Self {
        self.author_id = Some(author_id.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    /// Files the message as a new version of `parent_message_id`'s group.
    pub fn with_parent(mut self, parent_message_id: MessageId) -> Self {
        self.parent_message_id = Some(parent_message_id);
        self
    }

    pub fn with_creation_time(mut self, creation_time_unix_ms: i64) -> Self {
        self.creation_time_unix_ms = creation_time_unix_ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_order_is_captured_by_sequence() {
        let chat_id = ChatId::provisional();
        let first = NewMessage::user(chat_id.clone(), "first").with_creation_time(10);
        let second = NewMessage::user(chat_id, "second").with_creation_time(10);

        assert!(first.sequence < second.sequence);
    }

    #[test]
    fn blank_chat_names_fall_back_to_default() {
        assert_eq!(NewChat::new("  ", "gpt-4o").display_name(), DEFAULT_CHAT_NAME);
        assert_eq!(
            NewChat::new(" Trip planning ", "gpt-4o").display_name(),
            "Trip planning"
        );
    }
}
