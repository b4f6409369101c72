use chatsync_storage::{ChatId, DurableChatId, Message, MessageId};
use snafu::ResultExt;

use super::{CacheState, Optimistic, Reverted, StoreUndo, SyncEngine};
use crate::error::{RemoteSnafu, SyncError, SyncResult};
use crate::events::ChatEvent;
use crate::remote::{AddMessageRequest, RemoteResult};
use crate::requests::{NewMessage, now_unix_ms};

impl SyncEngine {
    /// Appends a message and returns its id as soon as the caches hold it.
    ///
    /// For a durable chat the remote call is awaited and the durable id returned; a
    /// failure removes the message again. Messages of a provisional chat are queued
    /// and sent by the chat's creation task once the chat is confirmed.
    pub async fn add_message(&self, request: NewMessage) -> SyncResult<MessageId> {
        let stage = "add-message";
        let chat_id = self.resolve_chat_id(&request.chat_id);
        let needs_history =
            !chat_id.is_provisional() && !self.state().working_set.is_complete(&chat_id);
        if needs_history {
            // A stored list would otherwise hold only this message and pass for the
            // whole history; version numbers also count over the whole group.
            self.get_messages(&chat_id).await;
        }

        let (message, deactivated) = {
            let mut state = self.state();
            let chat_id = state.reconcile.resolve_chat(&request.chat_id);
            if let ChatId::Provisional(local) = &chat_id {
                if !state.reconcile.is_pending(local) && !state.working_set.contains_chat(&chat_id) {
                    return Err(SyncError::UnknownProvisionalChat { stage, chat_id });
                }
            }

            let parent_message_id = request
                .parent_message_id
                .as_ref()
                .map(|parent| state.reconcile.resolve_message(parent));
            let (version, flags) = match &parent_message_id {
                Some(parent) => {
                    let version = state.working_set.next_version(&chat_id, parent);
                    let flags = state.working_set.deactivate_version_group(&chat_id, parent);
                    (version, flags)
                }
                None => (1, Vec::new()),
            };
            let deactivated = flags
                .iter()
                .filter_map(|(id, _)| state.working_set.find_message(id).cloned())
                .collect::<Vec<_>>();

            let author_id = request
                .author_id
                .or_else(|| self.owner())
                .or_else(|| {
                    state
                        .working_set
                        .chat(&chat_id)
                        .map(|chat| chat.owner_id.clone())
                })
                .unwrap_or_default();
            let message = Message {
                id: MessageId::provisional(),
                chat_id: chat_id.clone(),
                author_id,
                role: request.role,
                content: request.content,
                model: request.model,
                attachments: request.attachments,
                parent_message_id,
                version,
                is_active: true,
                created_at_unix_ms: now_unix_ms(),
                creation_time_unix_ms: request.creation_time_unix_ms,
                sequence: request.sequence,
            };
            state.working_set.insert_message(message.clone());
            state.refresh_recency(&chat_id);
            (message, deactivated)
        };
        let chat_id = message.chat_id.clone();

        let mut written = vec![message.clone()];
        written.extend(deactivated.iter().cloned());
        self.persist_messages(stage, written).await;
        self.emit([ChatEvent::MessagesChanged {
            chat_id: chat_id.clone(),
        }]);

        let durable_chat = match &chat_id {
            ChatId::Durable(durable) => durable.clone(),
            ChatId::Provisional(_) => {
                let resolved = self.resolve_message_id(&message.id);
                if !resolved.is_provisional() {
                    // Confirmed by the creation task before our row landed.
                    if let Err(error) = self.store().delete_message(message.id.clone()).await {
                        tracing::warn!(stage, message_id = %message.id, %error, "failed to drop provisional row");
                    }
                }
                tracing::debug!(chat_id = %chat_id, message_id = %resolved, "queued message for provisional chat");
                return Ok(resolved);
            }
        };

        let flags = deactivated
            .iter()
            .map(|message| (message.id.clone(), true))
            .collect::<Vec<_>>();
        let undo_chat_id = chat_id.clone();
        let undo_message_id = message.id.clone();
        let undo_root = message.parent_message_id.clone();
        let optimistic = Optimistic::new(message.id.clone())
            .undo_cache(move |state: &mut CacheState| {
                state
                    .working_set
                    .remove_message(&undo_chat_id, &undo_message_id);
                state.recency.drop_message(&undo_message_id);
                // Siblings may have been confirmed under a durable id since.
                let flags = flags
                    .into_iter()
                    .map(|(id, is_active)| (state.reconcile.resolve_message(&id), is_active))
                    .collect::<Vec<_>>();
                let mut restored = state.working_set.restore_flags(&undo_chat_id, &flags);
                if let Some(root) = undo_root {
                    let root = state.reconcile.resolve_message(&root);
                    restored.extend(state.working_set.reactivate_latest(&undo_chat_id, &root));
                }
                state.refresh_recency(&undo_chat_id);
                // Provisional siblings are written by their own confirmation or rollback.
                restored.retain(|message| !message.id.is_provisional());
                Reverted {
                    events: vec![ChatEvent::MessagesChanged {
                        chat_id: undo_chat_id,
                    }],
                    messages: restored,
                }
            })
            .undo_store(StoreUndo {
                delete_messages: vec![message.id.clone()],
                ..StoreUndo::default()
            });

        match self.push_message(&durable_chat, &message).await {
            Ok(confirmed) => {
                let provisional_id = optimistic.commit();
                let durable_id = confirmed.id.clone();
                self.confirm_message(&chat_id, &provisional_id, confirmed)
                    .await;
                Ok(durable_id)
            }
            Err(source) => {
                tracing::warn!(
                    stage,
                    chat_id = %chat_id,
                    message_id = %optimistic.value(),
                    error = %source,
                    "remote rejected message, rolling back"
                );
                self.roll_back(optimistic, stage).await;
                Err(SyncError::Remote { stage, source })
            }
        }
    }

    pub(super) async fn push_message(
        &self,
        chat_id: &DurableChatId,
        message: &Message,
    ) -> RemoteResult<Message> {
        let parent_message_id = message
            .parent_message_id
            .as_ref()
            .and_then(|parent| self.resolve_message_id(parent).as_durable().cloned());
        let request = AddMessageRequest {
            chat_id: chat_id.clone(),
            author_id: message.author_id.clone(),
            role: message.role,
            content: message.content.clone(),
            model: message.model.clone(),
            attachments: message.attachments.clone(),
            parent_message_id,
            version: message.version,
            creation_time_unix_ms: message.creation_time_unix_ms,
            sequence: message.sequence,
        };
        self.remote().add_message(request).await
    }

    /// Swaps a provisional message for the remote's copy in every tier.
    pub(super) async fn confirm_message(
        &self,
        chat_id: &ChatId,
        provisional_id: &MessageId,
        confirmed: Message,
    ) -> Option<Message> {
        let (stored, written) = {
            let mut state = self.state();
            if let (MessageId::Provisional(local), MessageId::Durable(durable)) =
                (provisional_id, &confirmed.id)
            {
                state.reconcile.record_message(*local, durable.clone());
            }
            let stored = state
                .working_set
                .confirm_message(chat_id, provisional_id, confirmed);
            let mut written = Vec::new();
            if let Some(stored) = &stored {
                written.push(stored.clone());
                written.extend(
                    state
                        .working_set
                        .entry(chat_id)
                        .into_iter()
                        .flat_map(|entry| entry.messages.iter())
                        .filter(|message| message.parent_message_id.as_ref() == Some(&stored.id))
                        .cloned(),
                );
            }
            state.refresh_recency(chat_id);
            (stored, written)
        };

        self.persist_messages("persist-confirmed-message", written)
            .await;
        if let Err(error) = self.store().delete_message(provisional_id.clone()).await {
            tracing::warn!(message_id = %provisional_id, %error, "failed to drop provisional message row");
        }
        self.emit([ChatEvent::MessagesChanged {
            chat_id: chat_id.clone(),
        }]);
        stored
    }

    /// Removes a queued message the remote refused during replay.
    pub(super) async fn drop_unconfirmed_message(&self, chat_id: &ChatId, message: &Message) {
        let reactivated = {
            let mut state = self.state();
            state.working_set.remove_message(chat_id, &message.id);
            state.recency.drop_message(&message.id);
            let reactivated = if message.is_active {
                state
                    .working_set
                    .reactivate_latest(chat_id, message.version_root())
            } else {
                None
            };
            state.refresh_recency(chat_id);
            reactivated
        };

        if let Err(error) = self.store().delete_message(message.id.clone()).await {
            tracing::warn!(message_id = %message.id, %error, "failed to drop unconfirmed message row");
        }
        self.persist_messages("reactivate-version", reactivated.into_iter().collect())
            .await;
        self.emit([ChatEvent::MessagesChanged {
            chat_id: chat_id.clone(),
        }]);
    }

    /// Makes `message_id` the active member of its version group. The remote's
    /// answer replaces the chat's cached messages; local messages it does not know
    /// yet are kept. Returns the new active view.
    pub async fn switch_message_version(&self, message_id: &MessageId) -> SyncResult<Vec<Message>> {
        let stage = "switch-message-version";
        let resolved = self.resolve_message_id(message_id);
        let MessageId::Durable(durable) = &resolved else {
            return Err(SyncError::MessageNotDurable {
                stage,
                message_id: resolved,
            });
        };
        let messages = self
            .remote()
            .switch_message_version(durable.clone())
            .await
            .context(RemoteSnafu { stage })?;

        let cached_chat = self
            .state()
            .working_set
            .find_message(&resolved)
            .map(|message| message.chat_id.clone());
        let Some(chat_id) = cached_chat.or_else(|| messages.first().map(|message| message.chat_id.clone()))
        else {
            return Ok(Vec::new());
        };

        let (view, local_only) = {
            let mut state = self.state();
            if state.working_set.is_tombstoned(&chat_id) {
                return Ok(Vec::new());
            }
            let local_only = state
                .working_set
                .entry(&chat_id)
                .into_iter()
                .flat_map(|entry| entry.messages.iter())
                .filter(|message| message.id.is_provisional())
                .cloned()
                .collect::<Vec<_>>();
            state
                .working_set
                .replace_messages(&chat_id, messages.clone());
            for message in &local_only {
                state.working_set.insert_message(message.clone());
            }
            state.working_set.clear_version_groups();
            state.refresh_recency(&chat_id);
            (state.working_set.active_view(&chat_id), local_only)
        };

        if let Err(error) = self
            .store()
            .replace_chat_messages(chat_id.clone(), messages)
            .await
        {
            tracing::warn!(stage, chat_id = %chat_id, %error, "failed to store switched versions");
        }
        self.persist_messages(stage, local_only).await;
        tracing::debug!(chat_id = %chat_id, message_id = %resolved, "switched active version");
        self.emit([ChatEvent::MessagesChanged { chat_id }]);
        Ok(view)
    }

    /// Resets the message to version 1 and inactive, locally and remotely.
    pub async fn mark_as_original_version(&self, message_id: &MessageId) -> SyncResult<()> {
        let stage = "mark-as-original-version";
        let resolved = self.resolve_message_id(message_id);
        let durable = match &resolved {
            MessageId::Durable(durable) => durable.clone(),
            MessageId::Provisional(_) => {
                let known = self.state().working_set.find_message(&resolved).is_some();
                if known {
                    return Err(SyncError::MessageNotDurable {
                        stage,
                        message_id: resolved,
                    });
                }
                tracing::debug!(stage, message_id = %resolved, "unknown provisional message, ignoring");
                return Ok(());
            }
        };

        self.remote()
            .mark_as_original_version(durable)
            .await
            .context(RemoteSnafu { stage })?;

        let patched = {
            let mut state = self.state();
            let patched = state.working_set.patch_message(&resolved, |message| {
                message.version = 1;
                message.is_active = false;
            });
            if let Some(message) = &patched {
                state.refresh_recency(&message.chat_id);
            }
            patched
        };
        let Some(message) = patched else {
            tracing::debug!(stage, message_id = %resolved, "message not cached, nothing to update locally");
            return Ok(());
        };

        let chat_id = message.chat_id.clone();
        self.persist_messages(stage, vec![message]).await;
        self.emit([ChatEvent::MessagesChanged { chat_id }]);
        Ok(())
    }

    /// Every cached version of the message's group, ordered by version.
    pub fn message_versions(&self, message_id: &MessageId) -> Vec<Message> {
        let mut state = self.state();
        let resolved = state.reconcile.resolve_message(message_id);
        state
            .working_set
            .version_group(&resolved)
            .unwrap_or_default()
    }
}
