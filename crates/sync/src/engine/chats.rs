use std::collections::HashSet;

use chatsync_storage::{Chat, ChatId, DurableChatId, LocalId, MessageId};
use snafu::ResultExt;

use super::{CacheState, CreatedChat, Optimistic, Reverted, StoreUndo, SyncEngine};
use crate::error::{RemoteSnafu, StorageSnafu, SyncError, SyncResult};
use crate::events::ChatEvent;
use crate::reconcile::CreationOutcome;
use crate::remote::{CreateChatRequest, RemoteResult};
use crate::requests::{NewChat, now_unix_ms};

/// A chat-level change the remote authority has to be told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChatPatch {
    Model(String),
    Visibility(bool),
}

impl ChatPatch {
    fn apply(&self, chat: &mut Chat) {
        match self {
            Self::Model(model) => chat.current_model = model.clone(),
            Self::Visibility(is_public) => chat.is_public = *is_public,
        }
    }

    fn stage(&self) -> &'static str {
        match self {
            Self::Model(_) => "update-chat-model",
            Self::Visibility(_) => "update-chat-visibility",
        }
    }
}

impl SyncEngine {
    /// Inserts the chat under a provisional id and starts its remote creation.
    ///
    /// Returns at once; the chat can be read from and written to before the remote
    /// confirms it. Must be called from within a Tokio runtime.
    pub fn create_chat(&self, request: NewChat) -> CreatedChat {
        let local = LocalId::new_v7();
        let chat_id = ChatId::Provisional(local);
        let owner_id = request
            .owner_id
            .clone()
            .filter(|owner_id| !owner_id.trim().is_empty())
            .or_else(|| self.owner())
            .unwrap_or_default();

        let chat = {
            let mut state = self.state();
            let parent_chat_id = request
                .parent_chat_id
                .as_ref()
                .map(|parent| state.reconcile.resolve_chat(parent));
            let chat = Chat {
                id: chat_id.clone(),
                name: request.display_name(),
                owner_id,
                current_model: request.model.clone(),
                initial_model: request.model.clone(),
                parent_chat_id,
                created_at_unix_ms: now_unix_ms(),
                is_public: request.is_public,
            };
            state.working_set.upsert_chat(chat.clone());
            state.working_set.start_empty(chat_id.clone());
            state.refresh_recency(&chat_id);
            state.reconcile.begin_creation(local);
            chat
        };

        tracing::debug!(chat_id = %chat_id, name = %chat.name, "created provisional chat");
        self.emit([ChatEvent::ChatCreated { chat: chat.clone() }]);

        let engine = self.clone();
        let task = tokio::spawn(async move { engine.complete_creation(local, chat).await });
        CreatedChat { id: chat_id, task }
    }

    async fn complete_creation(&self, local: LocalId, requested: Chat) -> SyncResult<Chat> {
        let provisional = ChatId::Provisional(local);
        let parent_chat_id = requested
            .parent_chat_id
            .as_ref()
            .and_then(|parent| self.resolve_chat_id(parent).as_durable().cloned());
        let request = CreateChatRequest {
            name: requested.name.clone(),
            owner_id: requested.owner_id.clone(),
            model: requested.initial_model.clone(),
            parent_chat_id,
            is_public: requested.is_public,
        };

        let created = match self.remote().create_chat(request).await {
            Ok(chat) => chat,
            Err(source) => {
                tracing::warn!(chat_id = %provisional, error = %source, "remote chat creation failed");
                self.discard_provisional_chat(local).await;
                return Err(SyncError::Remote {
                    stage: "create-chat",
                    source,
                });
            }
        };
        let Some(durable_id) = created.id.as_durable().cloned() else {
            self.discard_provisional_chat(local).await;
            return Err(SyncError::CreationAborted {
                stage: "create-chat",
                chat_id: provisional,
                details: format!("remote answered with non-durable id '{}'", created.id),
            });
        };
        let durable = ChatId::Durable(durable_id.clone());

        let stored = match self.store().list_messages(provisional.clone()).await {
            Ok(messages) => messages,
            Err(error) => {
                tracing::warn!(chat_id = %provisional, %error, "could not read stored provisional messages");
                Vec::new()
            }
        };

        let swapped = {
            let mut state = self.state();
            if state.reconcile.finish_creation(&local) == CreationOutcome::Abandoned {
                None
            } else {
                state.reconcile.record_chat(local, durable_id.clone());
                let local_chat = state.working_set.remove_chat(&provisional);
                let mut chat = created.clone();
                if let Some(local_chat) = local_chat {
                    chat.current_model = local_chat.current_model;
                    chat.is_public = local_chat.is_public;
                    if chat.parent_chat_id.is_none() {
                        chat.parent_chat_id = local_chat
                            .parent_chat_id
                            .map(|parent| state.reconcile.resolve_chat(&parent));
                    }
                }
                state.working_set.upsert_chat(chat.clone());
                state.working_set.repoint_parent_refs(&provisional, &durable);
                if !stored.is_empty() {
                    state.working_set.merge_loaded(&provisional, stored);
                }
                state.working_set.rekey_chat_messages(&provisional, &durable);
                if state.working_set.entry(&durable).is_none() {
                    state.working_set.start_empty(durable.clone());
                }
                state.recency.remove(&provisional);
                state.refresh_recency(&durable);
                let pending = state.working_set.provisional_message_ids(&durable);
                Some((chat, pending))
            }
        };

        let Some((chat, pending)) = swapped else {
            tracing::info!(chat_id = %durable, "chat was deleted while being created, removing it remotely");
            if let Err(error) = self.remote().delete_chat(durable_id).await {
                tracing::warn!(chat_id = %durable, %error, "failed to delete abandoned remote chat");
            }
            self.purge_provisional_rows(&provisional).await;
            self.emit([ChatEvent::ChatDeleted { chat_id: durable }]);
            return Err(SyncError::CreationAborted {
                stage: "complete-creation",
                chat_id: provisional,
                details: "chat was deleted before the remote confirmed it".to_string(),
            });
        };

        self.persist_chat("persist-created-chat", chat.clone()).await;
        if let Err(error) = self
            .store()
            .reparent_messages(provisional.clone(), durable.clone())
            .await
        {
            tracing::warn!(chat_id = %durable, %error, "failed to re-parent stored messages");
        }
        self.repoint_stored_children(&provisional, &durable).await;
        tracing::info!(
            provisional = %provisional,
            durable = %durable,
            pending = pending.len(),
            "chat reconciled with remote id"
        );

        self.replay_messages(&durable, &durable_id, pending).await;
        self.push_deferred_patches(&durable_id, &created).await;
        self.purge_provisional_rows(&provisional).await;

        self.emit([
            ChatEvent::ChatReconciled {
                provisional,
                durable: durable.clone(),
            },
            ChatEvent::ChatListChanged {
                owner_id: chat.owner_id.clone(),
            },
        ]);
        Ok(self.chat(&durable).unwrap_or(chat))
    }

    /// Sends the provisional messages of a freshly confirmed chat in display order.
    async fn replay_messages(
        &self,
        chat_id: &ChatId,
        durable_id: &DurableChatId,
        pending: Vec<MessageId>,
    ) {
        for message_id in pending {
            let message = self.state().working_set.find_message(&message_id).cloned();
            let Some(message) = message else {
                continue;
            };

            match self.push_message(durable_id, &message).await {
                Ok(confirmed) => {
                    self.confirm_message(chat_id, &message_id, confirmed).await;
                }
                Err(error) => {
                    tracing::warn!(chat_id = %chat_id, message_id = %message_id, %error, "replay of queued message failed");
                    self.drop_unconfirmed_message(chat_id, &message).await;
                }
            }
        }
    }

    /// Pushes model or visibility changes made while the chat was provisional.
    async fn push_deferred_patches(&self, durable_id: &DurableChatId, created: &Chat) {
        let chat_id = ChatId::Durable(durable_id.clone());
        let Some(current) = self.chat(&chat_id) else {
            return;
        };

        let mut patches = Vec::new();
        if current.current_model != created.current_model {
            patches.push(ChatPatch::Model(current.current_model.clone()));
        }
        if current.is_public != created.is_public {
            patches.push(ChatPatch::Visibility(current.is_public));
        }

        for patch in patches {
            let stage = patch.stage();
            if let Err(error) = self.push_chat_patch(durable_id.clone(), patch).await {
                tracing::warn!(stage, chat_id = %chat_id, %error, "deferred chat update failed, keeping remote value");
                let reverted = {
                    let mut state = self.state();
                    state.working_set.patch_chat(&chat_id, |chat| {
                        chat.current_model = created.current_model.clone();
                        chat.is_public = created.is_public;
                    })
                };
                if let Some(chat) = reverted {
                    self.persist_chat(stage, chat.clone()).await;
                    self.emit([ChatEvent::ChatUpdated { chat }]);
                }
                return;
            }
        }
    }

    async fn push_chat_patch(&self, chat_id: DurableChatId, patch: ChatPatch) -> RemoteResult<()> {
        match patch {
            ChatPatch::Model(model) => self.remote().update_chat_model(chat_id, model).await,
            ChatPatch::Visibility(is_public) => {
                self.remote()
                    .update_chat_visibility(chat_id, is_public)
                    .await
            }
        }
    }

    async fn repoint_stored_children(&self, from: &ChatId, to: &ChatId) {
        let children = match self.store().list_child_chats(from.clone()).await {
            Ok(children) => children,
            Err(error) => {
                tracing::warn!(chat_id = %from, %error, "failed to list stored child chats");
                return;
            }
        };
        for mut child in children {
            child.parent_chat_id = Some(to.clone());
            self.persist_chat("repoint-child-chat", child).await;
        }
    }

    async fn purge_provisional_rows(&self, chat_id: &ChatId) {
        let stage = "purge-provisional-rows";
        if let Err(error) = self.store().delete_chat_messages(chat_id.clone()).await {
            tracing::warn!(stage, chat_id = %chat_id, %error, "failed to delete provisional messages");
        }
        if let Err(error) = self.store().clear_parent_chat_refs(chat_id.clone()).await {
            tracing::warn!(stage, chat_id = %chat_id, %error, "failed to clear provisional parent refs");
        }
        if let Err(error) = self.store().delete_chat(chat_id.clone()).await {
            tracing::warn!(stage, chat_id = %chat_id, %error, "failed to delete provisional chat row");
        }
    }

    /// Forgets a chat the remote refused to create.
    async fn discard_provisional_chat(&self, local: LocalId) {
        let chat_id = ChatId::Provisional(local);
        {
            let mut state = self.state();
            state.reconcile.finish_creation(&local);
            state.working_set.remove_chat(&chat_id);
            state.working_set.take_messages(&chat_id);
            state.working_set.clear_parent_refs(&chat_id);
            state.recency.remove(&chat_id);
        }
        self.purge_provisional_rows(&chat_id).await;
        self.emit([ChatEvent::ChatCreationFailed { chat_id }]);
    }

    /// Removes the chat, its messages and every back-reference to it.
    ///
    /// All-or-nothing: when the store or the remote fails, caches and store are
    /// restored from a snapshot and the error is returned. A provisional chat that
    /// is still being created is only removed locally; its creation task deletes the
    /// remote copy once it arrives.
    pub async fn delete_chat(&self, chat_id: &ChatId) -> SyncResult<()> {
        match self.resolve_chat_id(chat_id) {
            ChatId::Provisional(local) => self.delete_provisional_chat(local).await,
            ChatId::Durable(durable) => self.delete_durable_chat(durable).await,
        }
    }

    async fn delete_provisional_chat(&self, local: LocalId) -> SyncResult<()> {
        let chat_id = ChatId::Provisional(local);
        let removed = {
            let mut state = self.state();
            let pending = state.reconcile.abandon_creation(&local);
            let known = state.working_set.contains_chat(&chat_id);
            if known {
                state.working_set.remove_chat(&chat_id);
                state.working_set.take_messages(&chat_id);
                state.working_set.clear_parent_refs(&chat_id);
                state.working_set.tombstone(chat_id.clone());
                state.recency.remove(&chat_id);
            }
            pending || known
        };
        if !removed {
            tracing::debug!(chat_id = %chat_id, "delete addressed to an unknown provisional chat, ignoring");
            return Ok(());
        }

        self.purge_provisional_rows(&chat_id).await;
        self.settle_tombstone(&chat_id);
        self.emit([ChatEvent::ChatDeleted { chat_id }]);
        Ok(())
    }

    async fn delete_durable_chat(&self, durable: DurableChatId) -> SyncResult<()> {
        let stage = "delete-chat";
        let chat_id = ChatId::Durable(durable.clone());
        let optimistic = {
            let mut state = self.state();
            let chat = state.working_set.remove_chat(&chat_id);
            let messages = state.working_set.take_messages(&chat_id);
            let recent = state.recency.remove(&chat_id);
            let children = state.working_set.clear_parent_refs(&chat_id);
            state.working_set.tombstone(chat_id.clone());

            let restore_id = chat_id.clone();
            Optimistic::new(()).undo_cache(move |state: &mut CacheState| {
                state.working_set.lift_tombstone(&restore_id);
                for child in &children {
                    state
                        .working_set
                        .set_parent_ref(child, Some(restore_id.clone()));
                }
                if let Some(messages) = messages {
                    state.working_set.restore_messages(restore_id.clone(), messages);
                }
                if let Some(recent) = recent {
                    state.recency.insert(restore_id.clone(), recent);
                }

                let mut events = Vec::new();
                if let Some(chat) = chat {
                    state.working_set.upsert_chat(chat.clone());
                    events.push(ChatEvent::ChatUpdated { chat });
                }
                events.push(ChatEvent::MessagesChanged {
                    chat_id: restore_id,
                });
                events.into()
            })
        };
        self.emit([ChatEvent::ChatDeleted {
            chat_id: chat_id.clone(),
        }]);

        let undo_store = match self.snapshot_stored_chat(&chat_id).await {
            Ok(undo_store) => undo_store,
            Err(error) => {
                tracing::warn!(stage, chat_id = %chat_id, %error, "could not snapshot stored chat, restoring");
                self.roll_back(optimistic, stage).await;
                return Err(error);
            }
        };
        let optimistic = optimistic.undo_store(undo_store);

        if let Err(error) = self.delete_stored_chat(&chat_id).await {
            tracing::warn!(stage, chat_id = %chat_id, %error, "store delete failed, restoring");
            self.roll_back(optimistic, stage).await;
            return Err(error);
        }
        if let Err(source) = self.remote().delete_chat(durable).await {
            tracing::warn!(stage, chat_id = %chat_id, error = %source, "remote delete failed, restoring");
            self.roll_back(optimistic, stage).await;
            return Err(SyncError::Remote { stage, source });
        }

        optimistic.commit();
        self.settle_tombstone(&chat_id);
        tracing::info!(chat_id = %chat_id, "deleted chat");
        Ok(())
    }

    /// Lifts the tombstone of a deleted chat unless a load started before the delete
    /// is still running; that load must still see the chat as gone.
    fn settle_tombstone(&self, chat_id: &ChatId) {
        if self.inner.inflight.pending(chat_id).is_some() {
            tracing::debug!(chat_id = %chat_id, "load in flight, keeping tombstone");
            return;
        }
        self.state().working_set.lift_tombstone(chat_id);
    }

    async fn snapshot_stored_chat(&self, chat_id: &ChatId) -> SyncResult<StoreUndo> {
        let stage = "snapshot-stored-chat";
        let chat = self
            .store()
            .get_chat(chat_id.clone())
            .await
            .context(StorageSnafu { stage })?;
        let messages = self
            .store()
            .list_messages(chat_id.clone())
            .await
            .context(StorageSnafu { stage })?;
        let children = self
            .store()
            .list_child_chats(chat_id.clone())
            .await
            .context(StorageSnafu { stage })?;

        Ok(StoreUndo {
            delete_messages: Vec::new(),
            put_messages: messages,
            put_chats: chat.into_iter().chain(children).collect(),
        })
    }

    async fn delete_stored_chat(&self, chat_id: &ChatId) -> SyncResult<()> {
        let stage = "delete-stored-chat";
        self.store()
            .delete_chat_messages(chat_id.clone())
            .await
            .context(StorageSnafu { stage })?;
        self.store()
            .clear_parent_chat_refs(chat_id.clone())
            .await
            .context(StorageSnafu { stage })?;
        self.store()
            .delete_chat(chat_id.clone())
            .await
            .context(StorageSnafu { stage })?;
        Ok(())
    }

    pub async fn update_chat_model(
        &self,
        chat_id: &ChatId,
        model: impl Into<String>,
    ) -> SyncResult<()> {
        self.patch_chat(chat_id, ChatPatch::Model(model.into()))
            .await
    }

    pub async fn set_chat_visibility(&self, chat_id: &ChatId, is_public: bool) -> SyncResult<()> {
        self.patch_chat(chat_id, ChatPatch::Visibility(is_public))
            .await
    }

    async fn patch_chat(&self, chat_id: &ChatId, patch: ChatPatch) -> SyncResult<()> {
        let stage = patch.stage();
        let (chat_id, previous, patched) = {
            let mut state = self.state();
            let chat_id = state.reconcile.resolve_chat(chat_id);
            let previous = state.working_set.chat(&chat_id).cloned();
            let patched = state
                .working_set
                .patch_chat(&chat_id, |chat| patch.apply(chat));
            (chat_id, previous, patched)
        };

        let durable = match &chat_id {
            ChatId::Durable(durable) => durable.clone(),
            ChatId::Provisional(_) => {
                match patched {
                    // Sent by the creation task once the chat is confirmed.
                    Some(chat) => self.emit([ChatEvent::ChatUpdated { chat }]),
                    None => {
                        tracing::debug!(stage, chat_id = %chat_id, "update addressed to an unknown provisional chat, ignoring");
                    }
                }
                return Ok(());
            }
        };

        if let Some(chat) = &patched {
            self.persist_chat(stage, chat.clone()).await;
            self.emit([ChatEvent::ChatUpdated { chat: chat.clone() }]);
        }
        let optimistic = Optimistic::new(())
            .undo_store(StoreUndo {
                put_chats: previous.clone().into_iter().collect(),
                ..StoreUndo::default()
            })
            .undo_cache(move |state: &mut CacheState| match previous {
                Some(previous) => {
                    state.working_set.upsert_chat(previous.clone());
                    vec![ChatEvent::ChatUpdated { chat: previous }].into()
                }
                None => Reverted::default(),
            });

        if let Err(source) = self.push_chat_patch(durable, patch.clone()).await {
            tracing::warn!(stage, chat_id = %chat_id, error = %source, "remote chat update failed, rolling back");
            self.roll_back(optimistic, stage).await;
            return Err(SyncError::Remote { stage, source });
        }
        optimistic.commit();

        if patched.is_none() {
            match self.store().get_chat(chat_id.clone()).await {
                Ok(Some(mut stored)) => {
                    patch.apply(&mut stored);
                    self.persist_chat(stage, stored).await;
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(stage, chat_id = %chat_id, %error, "could not refresh stored chat");
                }
            }
        }
        Ok(())
    }

    /// The session owner's chats, newest first. Served from the working set once
    /// loaded; store failures leave whatever is cached.
    pub async fn list_chats(&self) -> Vec<Chat> {
        let Some(owner_id) = self.owner() else {
            return Vec::new();
        };
        let cached = {
            let state = self.state();
            state
                .working_set
                .chats_loaded_for(&owner_id)
                .then(|| state.working_set.chats_for_owner(&owner_id))
        };
        if let Some(chats) = cached {
            return chats;
        }

        let stored = self.store().list_chats(owner_id.clone()).await;
        let mut state = self.state();
        match stored {
            Ok(stored) => state.working_set.merge_owner_chats(&owner_id, stored),
            Err(error) => {
                tracing::warn!(owner_id = %owner_id, %error, "failed to load stored chats");
            }
        }
        state.working_set.chats_for_owner(&owner_id)
    }

    /// Replaces the owner's chat list with the remote's. Provisional chats that are
    /// still being created are kept.
    pub async fn sync_chats(&self) -> SyncResult<Vec<Chat>> {
        let stage = "sync-chats";
        let Some(owner_id) = self.owner() else {
            return Ok(Vec::new());
        };
        let remote_chats = self
            .remote()
            .list_chats(owner_id.clone())
            .await
            .context(RemoteSnafu { stage })?;

        let remote_ids = remote_chats
            .iter()
            .map(|chat| chat.id.clone())
            .collect::<HashSet<_>>();
        match self.store().list_chats(owner_id.clone()).await {
            Ok(stored) => {
                for chat in stored
                    .into_iter()
                    .filter(|chat| !chat.id.is_provisional() && !remote_ids.contains(&chat.id))
                {
                    if let Err(error) = self.delete_stored_chat(&chat.id).await {
                        tracing::warn!(stage, chat_id = %chat.id, %error, "failed to drop chat missing remotely");
                    }
                }
            }
            Err(error) => tracing::warn!(stage, %error, "failed to read stored chats"),
        }
        for chat in &remote_chats {
            self.persist_chat(stage, chat.clone()).await;
        }

        let chats = {
            let mut state = self.state();
            state.working_set.set_owner_chats(&owner_id, remote_chats);
            state.working_set.chats_for_owner(&owner_id)
        };
        tracing::info!(owner_id = %owner_id, chats = chats.len(), "synchronized chat list");
        self.emit([ChatEvent::ChatListChanged { owner_id }]);
        Ok(chats)
    }

    pub async fn list_public_chats(&self) -> SyncResult<Vec<Chat>> {
        self.remote()
            .list_public_chats()
            .await
            .context(RemoteSnafu {
                stage: "list-public-chats",
            })
    }

    /// Drops the working set and version sub-caches and reloads the owner's chat
    /// list from the store. Message bodies load again on the next read.
    pub async fn refresh_cache(&self) -> Vec<Chat> {
        {
            let mut state = self.state();
            let CacheState {
                working_set,
                reconcile,
                ..
            } = &mut *state;
            let preserved = working_set
                .provisional_chats()
                .into_iter()
                .filter(|chat| match &chat.id {
                    ChatId::Provisional(local) => reconcile.is_pending(local),
                    ChatId::Durable(_) => false,
                })
                .map(|chat| {
                    let messages = working_set.take_messages(&chat.id);
                    (chat, messages)
                })
                .collect::<Vec<_>>();

            working_set.clear();
            for (chat, messages) in preserved {
                if let Some(messages) = messages {
                    working_set.restore_messages(chat.id.clone(), messages);
                }
                working_set.upsert_chat(chat);
            }
        }
        tracing::info!("working set dropped, reloading chat list");

        let chats = self.list_chats().await;
        if let Some(owner_id) = self.owner() {
            self.emit([ChatEvent::ChatListChanged { owner_id }]);
        }
        chats
    }
}
