use std::collections::HashMap;
use std::time::Duration;

use chatsync_storage::{ChatId, Message, MessageId};
use tokio::time::Instant;

use crate::config::RecencyConfig;

struct RecencyEntry {
    messages: Vec<Message>,
    touched_at: Instant,
}

/// Bounded hot cache of ready-to-render active message lists.
///
/// Reads and inserts touch an entry. Past `capacity` the least recently touched
/// entry is evicted; entries older than `ttl` are dropped when next looked at.
pub struct RecencyIndex {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<ChatId, RecencyEntry>,
}

impl RecencyIndex {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn from_config(config: &RecencyConfig) -> Self {
        Self::new(config.capacity, config.ttl())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, chat_id: &ChatId) -> bool {
        self.entries
            .get(chat_id)
            .is_some_and(|entry| entry.touched_at.elapsed() < self.ttl)
    }

    /// Returns the cached list and refreshes its recency.
    pub fn get(&mut self, chat_id: &ChatId) -> Option<Vec<Message>> {
        let now = Instant::now();
        let entry = self.entries.get_mut(chat_id)?;
        if now.duration_since(entry.touched_at) >= self.ttl {
            self.entries.remove(chat_id);
            return None;
        }
        entry.touched_at = now;
        Some(entry.messages.clone())
    }

    /// Inserts or replaces the list; returns the chat evicted to make room.
    pub fn insert(&mut self, chat_id: ChatId, messages: Vec<Message>) -> Option<ChatId> {
        let now = Instant::now();
        let mut evicted = None;
        if !self.entries.contains_key(&chat_id) && self.entries.len() >= self.capacity {
            self.drop_expired(now);
            if self.entries.len() >= self.capacity {
                evicted = self
                    .entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.touched_at)
                    .map(|(id, _)| id.clone());
                if let Some(id) = &evicted {
                    self.entries.remove(id);
                }
            }
        }

        self.entries.insert(
            chat_id,
            RecencyEntry {
                messages,
                touched_at: now,
            },
        );
        evicted
    }

    pub fn remove(&mut self, chat_id: &ChatId) -> Option<Vec<Message>> {
        self.entries.remove(chat_id).map(|entry| entry.messages)
    }

    /// Drops a message from whichever entry holds it.
    pub fn drop_message(&mut self, message_id: &MessageId) {
        for entry in self.entries.values_mut() {
            entry.messages.retain(|message| &message.id != message_id);
        }
    }

    fn drop_expired(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, entry| now.duration_since(entry.touched_at) < ttl);
    }
}
