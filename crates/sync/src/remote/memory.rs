use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chatsync_storage::{
    BoxFuture, Chat, ChatId, DurableChatId, DurableMessageId, Message, MessageId, MessageRole,
    sort_for_display,
};

use super::{
    AddMessageRequest, CreateChatRequest, RejectedSnafu, RemoteAuthority, RemoteError,
    RemoteResult,
};
use crate::requests::{next_sequence, now_unix_ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    CreateChat,
    DeleteChat,
    UpdateChatModel,
    UpdateChatVisibility,
    AddMessage,
    SwitchMessageVersion,
    MarkAsOriginalVersion,
    GetMessages,
    ListChats,
    ListPublicChats,
}

impl RemoteOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateChat => "create-chat",
            Self::DeleteChat => "delete-chat",
            Self::UpdateChatModel => "update-chat-model",
            Self::UpdateChatVisibility => "update-chat-visibility",
            Self::AddMessage => "add-message",
            Self::SwitchMessageVersion => "switch-message-version",
            Self::MarkAsOriginalVersion => "mark-as-original-version",
            Self::GetMessages => "get-messages",
            Self::ListChats => "list-chats",
            Self::ListPublicChats => "list-public-chats",
        }
    }
}

#[derive(Debug, Default)]
struct RemoteState {
    next_id: u64,
    chats: HashMap<DurableChatId, Chat>,
    messages: HashMap<DurableMessageId, Message>,
    offline: bool,
    failures: HashMap<RemoteOp, usize>,
    delays: HashMap<RemoteOp, VecDeque<Duration>>,
    calls: HashMap<RemoteOp, usize>,
}

impl RemoteState {
    fn mint(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}_{}", self.next_id)
    }

    fn mint_chat_id(&mut self) -> RemoteResult<DurableChatId> {
        DurableChatId::new(self.mint("chat")).map_err(|error| RemoteError::Rejected {
            stage: "mint-chat-id",
            details: error.to_string(),
        })
    }

    fn mint_message_id(&mut self) -> RemoteResult<DurableMessageId> {
        DurableMessageId::new(self.mint("msg")).map_err(|error| RemoteError::Rejected {
            stage: "mint-message-id",
            details: error.to_string(),
        })
    }

    fn chat_messages(&self, chat_id: &DurableChatId) -> Vec<Message> {
        let chat_id = ChatId::Durable(chat_id.clone());
        let mut messages = self
            .messages
            .values()
            .filter(|message| message.chat_id == chat_id)
            .cloned()
            .collect::<Vec<_>>();
        sort_for_display(&mut messages);
        messages
    }
}

/// In-process authority that mints `chat_<n>` / `msg_<n>` ids.
///
/// Besides backing offline sessions it can be told to fail, stall, or go offline,
/// and it counts calls per operation.
#[derive(Debug, Default)]
pub struct MemoryAuthority {
    state: Mutex<RemoteState>,
}

impl MemoryAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` calls of `op` fail with [`RemoteError::Unavailable`].
    pub fn fail_next(&self, op: RemoteOp, count: usize) {
        *self.lock().failures.entry(op).or_default() += count;
    }

    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Queues a latency for the next call of `op`; queued delays are consumed in order.
    pub fn push_delay(&self, op: RemoteOp, delay: Duration) {
        self.lock().delays.entry(op).or_default().push_back(delay);
    }

    pub fn calls(&self, op: RemoteOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or_default()
    }

    pub fn chat_count(&self) -> usize {
        self.lock().chats.len()
    }

    pub fn message_count(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn chat(&self, chat_id: &DurableChatId) -> Option<Chat> {
        self.lock().chats.get(chat_id).cloned()
    }

    pub fn messages_for(&self, chat_id: &DurableChatId) -> Vec<Message> {
        self.lock().chat_messages(chat_id)
    }

    /// Creates a chat directly on the authority, bypassing call accounting.
    pub fn seed_chat(&self, name: &str, owner_id: &str, model: &str) -> RemoteResult<Chat> {
        let mut state = self.lock();
        insert_chat(
            &mut state,
            CreateChatRequest {
                name: name.to_string(),
                owner_id: owner_id.to_string(),
                model: model.to_string(),
                parent_chat_id: None,
                is_public: false,
            },
        )
    }

    /// Appends an active message directly on the authority.
    pub fn seed_message(
        &self,
        chat_id: &DurableChatId,
        role: MessageRole,
        content: &str,
    ) -> RemoteResult<Message> {
        let mut state = self.lock();
        let owner_id = state
            .chats
            .get(chat_id)
            .map(|chat| chat.owner_id.clone())
            .ok_or_else(|| chat_not_found("seed-message", chat_id))?;
        insert_message(
            &mut state,
            AddMessageRequest {
                chat_id: chat_id.clone(),
                author_id: owner_id,
                role,
                content: content.to_string(),
                model: None,
                attachments: Vec::new(),
                parent_message_id: None,
                version: 1,
                creation_time_unix_ms: now_unix_ms(),
                sequence: next_sequence(),
            },
        )
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn admit(&self, op: RemoteOp) -> RemoteResult<()> {
        let (delay, fail) = {
            let mut state = self.lock();
            *state.calls.entry(op).or_default() += 1;
            let delay = state.delays.get_mut(&op).and_then(VecDeque::pop_front);
            let fail = match state.failures.get_mut(&op) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => state.offline,
            };
            (delay, fail)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            tracing::debug!(op = op.name(), "injected remote failure");
            return Err(RemoteError::Unavailable { stage: op.name() });
        }
        Ok(())
    }
}

fn chat_not_found(stage: &'static str, chat_id: &DurableChatId) -> RemoteError {
    RemoteError::NotFound {
        stage,
        entity: "chat",
        id: chat_id.to_string(),
    }
}

fn message_not_found(stage: &'static str, message_id: &DurableMessageId) -> RemoteError {
    RemoteError::NotFound {
        stage,
        entity: "message",
        id: message_id.to_string(),
    }
}

fn insert_chat(state: &mut RemoteState, request: CreateChatRequest) -> RemoteResult<Chat> {
    let id = state.mint_chat_id()?;
    let chat = Chat {
        id: ChatId::Durable(id.clone()),
        name: request.name,
        owner_id: request.owner_id,
        current_model: request.model.clone(),
        initial_model: request.model,
        parent_chat_id: request.parent_chat_id.map(ChatId::Durable),
        created_at_unix_ms: now_unix_ms(),
        is_public: request.is_public,
    };
    state.chats.insert(id, chat.clone());
    Ok(chat)
}

fn insert_message(state: &mut RemoteState, request: AddMessageRequest) -> RemoteResult<Message> {
    if !state.chats.contains_key(&request.chat_id) {
        return Err(chat_not_found("add-message", &request.chat_id));
    }

    let chat_id = ChatId::Durable(request.chat_id);
    let parent_message_id = request.parent_message_id.map(MessageId::Durable);
    if let Some(parent_id) = &parent_message_id {
        for message in state.messages.values_mut() {
            if message.chat_id == chat_id && message.in_version_group_of(parent_id) {
                message.is_active = false;
            }
        }
    }

    let id = state.mint_message_id()?;
    let message = Message {
        id: MessageId::Durable(id.clone()),
        chat_id,
        author_id: request.author_id,
        role: request.role,
        content: request.content,
        model: request.model,
        attachments: request.attachments,
        parent_message_id,
        version: request.version.max(1),
        is_active: true,
        created_at_unix_ms: now_unix_ms(),
        creation_time_unix_ms: request.creation_time_unix_ms,
        sequence: request.sequence,
    };
    state.messages.insert(id, message.clone());
    Ok(message)
}

impl RemoteAuthority for MemoryAuthority {
    fn create_chat(&self, request: CreateChatRequest) -> BoxFuture<'_, RemoteResult<Chat>> {
        Box::pin(async move {
            self.admit(RemoteOp::CreateChat).await?;
            if request.owner_id.trim().is_empty() {
                return RejectedSnafu {
                    stage: "create-chat",
                    details: "owner id must not be empty",
                }
                .fail();
            }
            insert_chat(&mut self.lock(), request)
        })
    }

    fn delete_chat(&self, chat_id: DurableChatId) -> BoxFuture<'_, RemoteResult<()>> {
        Box::pin(async move {
            self.admit(RemoteOp::DeleteChat).await?;
            let mut state = self.lock();
            state.chats.remove(&chat_id);
            let chat_id = ChatId::Durable(chat_id);
            state.messages.retain(|_, message| message.chat_id != chat_id);
            for chat in state.chats.values_mut() {
                if chat.parent_chat_id.as_ref() == Some(&chat_id) {
                    chat.parent_chat_id = None;
                }
            }
            Ok(())
        })
    }

    fn update_chat_model(
        &self,
        chat_id: DurableChatId,
        model: String,
    ) -> BoxFuture<'_, RemoteResult<()>> {
        Box::pin(async move {
            self.admit(RemoteOp::UpdateChatModel).await?;
            let mut state = self.lock();
            let chat = state
                .chats
                .get_mut(&chat_id)
                .ok_or_else(|| chat_not_found("update-chat-model", &chat_id))?;
            chat.current_model = model;
            Ok(())
        })
    }

    fn update_chat_visibility(
        &self,
        chat_id: DurableChatId,
        is_public: bool,
    ) -> BoxFuture<'_, RemoteResult<()>> {
        Box::pin(async move {
            self.admit(RemoteOp::UpdateChatVisibility).await?;
            let mut state = self.lock();
            let chat = state
                .chats
                .get_mut(&chat_id)
                .ok_or_else(|| chat_not_found("update-chat-visibility", &chat_id))?;
            chat.is_public = is_public;
            Ok(())
        })
    }

    fn add_message(&self, request: AddMessageRequest) -> BoxFuture<'_, RemoteResult<Message>> {
        Box::pin(async move {
            self.admit(RemoteOp::AddMessage).await?;
            insert_message(&mut self.lock(), request)
        })
    }

    fn switch_message_version(
        &self,
        message_id: DurableMessageId,
    ) -> BoxFuture<'_, RemoteResult<Vec<Message>>> {
        Box::pin(async move {
            self.admit(RemoteOp::SwitchMessageVersion).await?;
            let mut state = self.lock();
            let target = state
                .messages
                .get(&message_id)
                .cloned()
                .ok_or_else(|| message_not_found("switch-message-version", &message_id))?;
            let root = target.version_root().clone();
            for message in state.messages.values_mut() {
                if message.chat_id == target.chat_id && message.in_version_group_of(&root) {
                    message.is_active = message.id == target.id;
                }
            }

            let chat_id = match &target.chat_id {
                ChatId::Durable(chat_id) => chat_id.clone(),
                ChatId::Provisional(_) => return Ok(Vec::new()),
            };
            Ok(state.chat_messages(&chat_id))
        })
    }

    fn mark_as_original_version(
        &self,
        message_id: DurableMessageId,
    ) -> BoxFuture<'_, RemoteResult<()>> {
        Box::pin(async move {
            self.admit(RemoteOp::MarkAsOriginalVersion).await?;
            let mut state = self.lock();
            let message = state
                .messages
                .get_mut(&message_id)
                .ok_or_else(|| message_not_found("mark-as-original-version", &message_id))?;
            message.version = 1;
            message.is_active = false;
            Ok(())
        })
    }

    fn get_messages(&self, chat_id: DurableChatId) -> BoxFuture<'_, RemoteResult<Vec<Message>>> {
        Box::pin(async move {
            self.admit(RemoteOp::GetMessages).await?;
            let state = self.lock();
            if !state.chats.contains_key(&chat_id) {
                return Err(chat_not_found("get-messages", &chat_id));
            }
            Ok(state.chat_messages(&chat_id))
        })
    }

    fn list_chats(&self, owner_id: String) -> BoxFuture<'_, RemoteResult<Vec<Chat>>> {
        Box::pin(async move {
            self.admit(RemoteOp::ListChats).await?;
            let mut chats = self
                .lock()
                .chats
                .values()
                .filter(|chat| chat.owner_id == owner_id)
                .cloned()
                .collect::<Vec<_>>();
            chats.sort_by(|left, right| right.created_at_unix_ms.cmp(&left.created_at_unix_ms));
            Ok(chats)
        })
    }

    fn list_public_chats(&self) -> BoxFuture<'_, RemoteResult<Vec<Chat>>> {
        Box::pin(async move {
            self.admit(RemoteOp::ListPublicChats).await?;
            let mut chats = self
                .lock()
                .chats
                .values()
                .filter(|chat| chat.is_public)
                .cloned()
                .collect::<Vec<_>>();
            chats.sort_by(|left, right| right.created_at_unix_ms.cmp(&left.created_at_unix_ms));
            Ok(chats)
        })
    }
}
