use std::collections::HashMap;

use chatsync_storage::{ChatId, DurableChatId, DurableMessageId, LocalId, MessageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Creation {
    InFlight,
    /// Deleted locally while the remote create was still running.
    Abandoned,
}

/// How a provisional chat's creation ended from the table's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationOutcome {
    Completed,
    Abandoned,
    /// The id was never marked pending.
    Unknown,
}

/// Provisional to durable id mapping for the lifetime of the process.
#[derive(Debug, Default)]
pub struct ReconcileTable {
    chats: HashMap<LocalId, DurableChatId>,
    messages: HashMap<LocalId, DurableMessageId>,
    pending_chats: HashMap<LocalId, Creation>,
}

impl ReconcileTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Durable ids pass through; mapped provisional ids come back durable; anything
    /// else is returned unchanged.
    pub fn resolve_chat(&self, chat_id: &ChatId) -> ChatId {
        match chat_id {
            ChatId::Provisional(local) => self
                .chats
                .get(local)
                .cloned()
                .map(ChatId::Durable)
                .unwrap_or_else(|| chat_id.clone()),
            ChatId::Durable(_) => chat_id.clone(),
        }
    }

    pub fn resolve_message(&self, message_id: &MessageId) -> MessageId {
        match message_id {
            MessageId::Provisional(local) => self
                .messages
                .get(local)
                .cloned()
                .map(MessageId::Durable)
                .unwrap_or_else(|| message_id.clone()),
            MessageId::Durable(_) => message_id.clone(),
        }
    }

    pub fn record_chat(&mut self, local: LocalId, durable: DurableChatId) {
        self.chats.insert(local, durable);
    }

    pub fn record_message(&mut self, local: LocalId, durable: DurableMessageId) {
        self.messages.insert(local, durable);
    }

    pub fn begin_creation(&mut self, local: LocalId) {
        self.pending_chats.insert(local, Creation::InFlight);
    }

    pub fn is_pending(&self, local: &LocalId) -> bool {
        self.pending_chats.get(local) == Some(&Creation::InFlight)
    }

    /// Marks a pending creation as abandoned; returns false when nothing was pending.
    pub fn abandon_creation(&mut self, local: &LocalId) -> bool {
        match self.pending_chats.get_mut(local) {
            Some(state @ Creation::InFlight) => {
                *state = Creation::Abandoned;
                true
            }
            _ => false,
        }
    }

    pub fn finish_creation(&mut self, local: &LocalId) -> CreationOutcome {
        match self.pending_chats.remove(local) {
            Some(Creation::InFlight) => CreationOutcome::Completed,
            Some(Creation::Abandoned) => CreationOutcome::Abandoned,
            None => CreationOutcome::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_ids_resolve_and_unknown_ids_pass_through() {
        let mut table = ReconcileTable::new();
        let local = LocalId::new_v7();
        let durable = DurableChatId::new("chat_1").unwrap();
        table.record_chat(local, durable.clone());

        assert_eq!(
            table.resolve_chat(&ChatId::Provisional(local)),
            ChatId::Durable(durable.clone())
        );
        assert_eq!(
            table.resolve_chat(&ChatId::Durable(durable.clone())),
            ChatId::Durable(durable)
        );

        let stranger = MessageId::provisional();
        assert_eq!(table.resolve_message(&stranger), stranger);
    }

    #[test]
    fn abandoned_creations_are_reported_once() {
        let mut table = ReconcileTable::new();
        let local = LocalId::new_v7();
        table.begin_creation(local);

        assert!(table.is_pending(&local));
        assert!(table.abandon_creation(&local));
        assert!(!table.is_pending(&local));
        assert_eq!(table.finish_creation(&local), CreationOutcome::Abandoned);
        assert_eq!(table.finish_creation(&local), CreationOutcome::Unknown);
    }
}
