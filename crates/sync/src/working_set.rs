use std::collections::{HashMap, HashSet};

use chatsync_storage::{Chat, ChatId, Message, MessageId, active_view, sort_for_display};

/// Messages known for one chat.
///
/// `complete` is set once the full list has been loaded from the store or the
/// remote, or when the chat was created in this session. Incomplete entries only
/// hold messages written locally since.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatMessages {
    pub messages: Vec<Message>,
    pub complete: bool,
}

/// In-memory view of the loaded chats and messages.
#[derive(Debug, Default)]
pub struct WorkingSet {
    chats: HashMap<ChatId, Chat>,
    messages: HashMap<ChatId, ChatMessages>,
    // chat -> version root -> member ids; rebuilt lazily after any message mutation.
    version_groups: HashMap<ChatId, HashMap<MessageId, Vec<MessageId>>>,
    chats_loaded_for: Option<String>,
    tombstones: HashSet<ChatId>,
}

impl WorkingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chat_count(&self) -> usize {
        self.chats.len()
    }

    pub fn message_list_count(&self) -> usize {
        self.messages.len()
    }

    pub fn chat(&self, chat_id: &ChatId) -> Option<&Chat> {
        self.chats.get(chat_id)
    }

    pub fn contains_chat(&self, chat_id: &ChatId) -> bool {
        self.chats.contains_key(chat_id) || self.messages.contains_key(chat_id)
    }

    pub fn upsert_chat(&mut self, chat: Chat) -> Option<Chat> {
        self.chats.insert(chat.id.clone(), chat)
    }

    pub fn remove_chat(&mut self, chat_id: &ChatId) -> Option<Chat> {
        self.chats.remove(chat_id)
    }

    pub fn patch_chat(&mut self, chat_id: &ChatId, patch: impl FnOnce(&mut Chat)) -> Option<Chat> {
        let chat = self.chats.get_mut(chat_id)?;
        patch(chat);
        Some(chat.clone())
    }

    /// Chats owned by `owner_id`, newest first.
    pub fn chats_for_owner(&self, owner_id: &str) -> Vec<Chat> {
        let mut chats = self
            .chats
            .values()
            .filter(|chat| chat.owner_id == owner_id)
            .cloned()
            .collect::<Vec<_>>();
        chats.sort_by(|left, right| {
            right
                .created_at_unix_ms
                .cmp(&left.created_at_unix_ms)
                .then_with(|| right.id.cmp(&left.id))
        });
        chats
    }

    pub fn chats_loaded_for(&self, owner_id: &str) -> bool {
        self.chats_loaded_for.as_deref() == Some(owner_id)
    }

    /// Replaces the owner's durable chats; provisional chats and other owners'
    /// chats are left alone.
    pub fn set_owner_chats(&mut self, owner_id: &str, chats: Vec<Chat>) {
        self.chats
            .retain(|id, chat| chat.owner_id != owner_id || id.is_provisional());
        for chat in chats {
            if !self.tombstones.contains(&chat.id) {
                self.chats.insert(chat.id.clone(), chat);
            }
        }
        self.chats_loaded_for = Some(owner_id.to_string());
    }

    /// Adds stored chats the working set does not hold yet.
    pub fn merge_owner_chats(&mut self, owner_id: &str, chats: Vec<Chat>) {
        for chat in chats {
            if self.tombstones.contains(&chat.id) {
                continue;
            }
            self.chats.entry(chat.id.clone()).or_insert(chat);
        }
        self.chats_loaded_for = Some(owner_id.to_string());
    }

    pub fn provisional_chats(&self) -> Vec<Chat> {
        self.chats
            .values()
            .filter(|chat| chat.id.is_provisional())
            .cloned()
            .collect()
    }

    /// Drops `parent_chat_id` references to `chat_id`; returns the chats that pointed at it.
    pub fn clear_parent_refs(&mut self, chat_id: &ChatId) -> Vec<ChatId> {
        let mut children = Vec::new();
        for chat in self.chats.values_mut() {
            if chat.parent_chat_id.as_ref() == Some(chat_id) {
                chat.parent_chat_id = None;
                children.push(chat.id.clone());
            }
        }
        children
    }

    pub fn set_parent_ref(&mut self, chat_id: &ChatId, parent_chat_id: Option<ChatId>) {
        if let Some(chat) = self.chats.get_mut(chat_id) {
            chat.parent_chat_id = parent_chat_id;
        }
    }

    pub fn repoint_parent_refs(&mut self, from: &ChatId, to: &ChatId) {
        for chat in self.chats.values_mut() {
            if chat.parent_chat_id.as_ref() == Some(from) {
                chat.parent_chat_id = Some(to.clone());
            }
        }
    }

    pub fn tombstone(&mut self, chat_id: ChatId) {
        self.tombstones.insert(chat_id);
    }

    pub fn lift_tombstone(&mut self, chat_id: &ChatId) {
        self.tombstones.remove(chat_id);
    }

    pub fn is_tombstoned(&self, chat_id: &ChatId) -> bool {
        self.tombstones.contains(chat_id)
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    pub fn entry(&self, chat_id: &ChatId) -> Option<&ChatMessages> {
        self.messages.get(chat_id)
    }

    pub fn is_complete(&self, chat_id: &ChatId) -> bool {
        self.messages
            .get(chat_id)
            .is_some_and(|entry| entry.complete)
    }

    /// Active messages in display order, only for complete entries.
    pub fn complete_active_view(&self, chat_id: &ChatId) -> Option<Vec<Message>> {
        self.messages
            .get(chat_id)
            .filter(|entry| entry.complete)
            .map(|entry| active_view(&entry.messages))
    }

    /// Whatever is known locally, complete or not.
    pub fn active_view(&self, chat_id: &ChatId) -> Vec<Message> {
        self.messages
            .get(chat_id)
            .map(|entry| active_view(&entry.messages))
            .unwrap_or_default()
    }

    /// Starts an empty, complete list for a chat created in this session.
    pub fn start_empty(&mut self, chat_id: ChatId) {
        self.messages.insert(
            chat_id,
            ChatMessages {
                messages: Vec::new(),
                complete: true,
            },
        );
    }

    /// Overwrites the chat's messages with an authoritative set.
    pub fn replace_messages(&mut self, chat_id: &ChatId, mut messages: Vec<Message>) {
        sort_for_display(&mut messages);
        self.messages.insert(
            chat_id.clone(),
            ChatMessages {
                messages,
                complete: true,
            },
        );
        self.version_groups.remove(chat_id);
    }

    /// Folds a freshly loaded list into the entry. Messages written locally in the
    /// meantime win over their loaded copies, and local-only ones are kept.
    pub fn merge_loaded(&mut self, chat_id: &ChatId, loaded: Vec<Message>) {
        let entry = self.messages.entry(chat_id.clone()).or_default();
        let local_ids = entry
            .messages
            .iter()
            .map(|message| message.id.clone())
            .collect::<HashSet<_>>();
        entry.messages.extend(
            loaded
                .into_iter()
                .filter(|message| !local_ids.contains(&message.id)),
        );
        sort_for_display(&mut entry.messages);
        entry.complete = true;
        self.version_groups.remove(chat_id);
    }

    pub fn insert_message(&mut self, message: Message) {
        let chat_id = message.chat_id.clone();
        let entry = self.messages.entry(chat_id.clone()).or_default();
        entry.messages.retain(|existing| existing.id != message.id);
        entry.messages.push(message);
        sort_for_display(&mut entry.messages);
        self.version_groups.remove(&chat_id);
    }

    pub fn remove_message(&mut self, chat_id: &ChatId, message_id: &MessageId) -> Option<Message> {
        let entry = self.messages.get_mut(chat_id)?;
        let index = entry
            .messages
            .iter()
            .position(|message| &message.id == message_id)?;
        self.version_groups.remove(chat_id);
        Some(entry.messages.remove(index))
    }

    pub fn find_message(&self, message_id: &MessageId) -> Option<&Message> {
        self.messages
            .values()
            .flat_map(|entry| entry.messages.iter())
            .find(|message| &message.id == message_id)
    }

    /// Applies `patch` to the message wherever it is cached; returns the patched copy.
    pub fn patch_message(
        &mut self,
        message_id: &MessageId,
        patch: impl FnOnce(&mut Message),
    ) -> Option<Message> {
        let (chat_id, message) = self.messages.iter_mut().find_map(|(chat_id, entry)| {
            entry
                .messages
                .iter_mut()
                .find(|message| &message.id == message_id)
                .map(|message| (chat_id.clone(), message))
        })?;
        patch(message);
        let patched = message.clone();
        self.version_groups.remove(&chat_id);
        Some(patched)
    }

    /// Deactivates the parent and every message pointing at it. Returns the prior
    /// flags of the members that were active, for rollback.
    pub fn deactivate_version_group(
        &mut self,
        chat_id: &ChatId,
        parent_id: &MessageId,
    ) -> Vec<(MessageId, bool)> {
        let Some(entry) = self.messages.get_mut(chat_id) else {
            return Vec::new();
        };

        let mut previous = Vec::new();
        for message in entry
            .messages
            .iter_mut()
            .filter(|message| message.in_version_group_of(parent_id))
        {
            if message.is_active {
                previous.push((message.id.clone(), true));
                message.is_active = false;
            }
        }
        self.version_groups.remove(chat_id);
        previous
    }

    /// Puts the recorded flags back; returns the copies that changed.
    pub fn restore_flags(&mut self, chat_id: &ChatId, flags: &[(MessageId, bool)]) -> Vec<Message> {
        let mut restored = Vec::new();
        if let Some(entry) = self.messages.get_mut(chat_id) {
            for message in entry.messages.iter_mut() {
                if let Some((_, is_active)) = flags.iter().find(|(id, _)| id == &message.id) {
                    message.is_active = *is_active;
                    restored.push(message.clone());
                }
            }
        }
        self.version_groups.remove(chat_id);
        restored
    }

    /// Activates the highest version of `root`'s group when no member is active.
    pub fn reactivate_latest(&mut self, chat_id: &ChatId, root: &MessageId) -> Option<Message> {
        let entry = self.messages.get_mut(chat_id)?;
        if entry
            .messages
            .iter()
            .any(|message| message.in_version_group_of(root) && message.is_active)
        {
            return None;
        }

        let latest = entry
            .messages
            .iter_mut()
            .filter(|message| message.in_version_group_of(root))
            .max_by(|left, right| {
                left.version
                    .cmp(&right.version)
                    .then_with(|| chatsync_storage::display_order(left, right))
            })?;
        latest.is_active = true;
        let latest = latest.clone();
        self.version_groups.remove(chat_id);
        Some(latest)
    }

    /// Provisional message ids of the chat, in display order.
    pub fn provisional_message_ids(&self, chat_id: &ChatId) -> Vec<MessageId> {
        self.messages
            .get(chat_id)
            .into_iter()
            .flat_map(|entry| entry.messages.iter())
            .filter(|message| message.id.is_provisional())
            .map(|message| message.id.clone())
            .collect()
    }

    /// Swaps a provisional message for its confirmed copy, keeping the locally held
    /// active flag and repointing later versions that referenced the old id.
    /// Returns the stored copy, or `None` when the local message is gone.
    pub fn confirm_message(
        &mut self,
        chat_id: &ChatId,
        provisional_id: &MessageId,
        mut confirmed: Message,
    ) -> Option<Message> {
        let entry = self.messages.get_mut(chat_id)?;
        let index = entry
            .messages
            .iter()
            .position(|message| &message.id == provisional_id)?;
        let local = entry.messages.remove(index);

        confirmed.is_active = local.is_active;
        confirmed.chat_id = local.chat_id;
        confirmed.creation_time_unix_ms = local.creation_time_unix_ms;
        confirmed.sequence = local.sequence;
        for message in entry.messages.iter_mut() {
            if message.parent_message_id.as_ref() == Some(provisional_id) {
                message.parent_message_id = Some(confirmed.id.clone());
            }
        }
        entry.messages.retain(|message| message.id != confirmed.id);
        entry.messages.push(confirmed.clone());
        sort_for_display(&mut entry.messages);
        self.version_groups.remove(chat_id);
        Some(confirmed)
    }

    /// Moves every message from `from` to `to`, rewriting their chat ids. An existing
    /// entry under `to` is merged.
    pub fn rekey_chat_messages(&mut self, from: &ChatId, to: &ChatId) {
        let Some(mut moved) = self.messages.remove(from) else {
            return;
        };
        for message in moved.messages.iter_mut() {
            message.chat_id = to.clone();
        }

        let target = self.messages.entry(to.clone()).or_default();
        let known = target
            .messages
            .iter()
            .map(|message| message.id.clone())
            .collect::<HashSet<_>>();
        target.messages.extend(
            moved
                .messages
                .into_iter()
                .filter(|message| !known.contains(&message.id)),
        );
        target.complete |= moved.complete;
        sort_for_display(&mut target.messages);
        self.version_groups.remove(from);
        self.version_groups.remove(to);
    }

    pub fn take_messages(&mut self, chat_id: &ChatId) -> Option<ChatMessages> {
        self.version_groups.remove(chat_id);
        self.messages.remove(chat_id)
    }

    pub fn restore_messages(&mut self, chat_id: ChatId, messages: ChatMessages) {
        self.version_groups.remove(&chat_id);
        self.messages.insert(chat_id, messages);
    }

    /// Every member of the message's version group, ordered by version.
    pub fn version_group(&mut self, message_id: &MessageId) -> Option<Vec<Message>> {
        let (chat_id, root) = {
            let message = self.find_message(message_id)?;
            (message.chat_id.clone(), message.version_root().clone())
        };
        let entry = self.messages.get(&chat_id)?;
        let groups = self
            .version_groups
            .entry(chat_id)
            .or_insert_with(|| build_version_groups(&entry.messages));
        let member_ids = groups.get(&root)?;

        let mut members = entry
            .messages
            .iter()
            .filter(|message| member_ids.contains(&message.id))
            .cloned()
            .collect::<Vec<_>>();
        members.sort_by(|left, right| {
            left.version
                .cmp(&right.version)
                .then_with(|| chatsync_storage::display_order(left, right))
        });
        Some(members)
    }

    /// Version number for a new member of `parent_id`'s group.
    pub fn next_version(&self, chat_id: &ChatId, parent_id: &MessageId) -> u32 {
        self.messages
            .get(chat_id)
            .into_iter()
            .flat_map(|entry| entry.messages.iter())
            .filter(|message| message.in_version_group_of(parent_id))
            .map(|message| message.version)
            .max()
            .unwrap_or(0)
            + 1
    }

    pub fn has_version_groups(&self, chat_id: &ChatId) -> bool {
        self.version_groups.contains_key(chat_id)
    }

    pub fn clear_version_groups(&mut self) {
        self.version_groups.clear();
    }

    /// Drops every chat and message; tombstones survive.
    pub fn clear(&mut self) {
        self.chats.clear();
        self.messages.clear();
        self.version_groups.clear();
        self.chats_loaded_for = None;
    }
}

fn build_version_groups(messages: &[Message]) -> HashMap<MessageId, Vec<MessageId>> {
    let mut groups: HashMap<MessageId, Vec<MessageId>> = HashMap::new();
    for message in messages {
        groups
            .entry(message.version_root().clone())
            .or_default()
            .push(message.id.clone());
    }
    groups
}
