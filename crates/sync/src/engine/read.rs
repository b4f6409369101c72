use std::sync::Arc;

use chatsync_storage::{ChatId, Message};

use super::SyncEngine;

impl SyncEngine {
    /// Active messages of the chat in display order.
    ///
    /// Answered by the first tier that can: the recency index, a load already in
    /// flight, a complete working-set list, then one shared load from the store and
    /// the remote. Concurrent callers for the same chat share that load. Failures
    /// degrade to whatever is cached locally.
    pub async fn get_messages(&self, chat_id: &ChatId) -> Vec<Message> {
        let chat_id = self.resolve_chat_id(chat_id);
        {
            let mut state = self.state();
            if state.working_set.is_tombstoned(&chat_id) {
                return Vec::new();
            }
            if let Some(messages) = state.recency.get(&chat_id) {
                return messages;
            }
        }

        if let Some(load) = self.inner.inflight.pending(&chat_id) {
            tracing::trace!(chat_id = %chat_id, "joining message load in flight");
            return load.await;
        }

        let complete = {
            let mut state = self.state();
            let view = state.working_set.complete_active_view(&chat_id);
            if let Some(view) = &view {
                state.recency.insert(chat_id.clone(), view.clone());
            }
            view
        };
        if let Some(view) = complete {
            return view;
        }

        let inner = Arc::downgrade(&self.inner);
        let key = chat_id.clone();
        self.inner
            .inflight
            .run(chat_id, move || async move {
                match inner.upgrade() {
                    Some(inner) => SyncEngine { inner }.load_messages(key).await,
                    None => Vec::new(),
                }
            })
            .await
    }

    async fn load_messages(&self, chat_id: ChatId) -> Vec<Message> {
        match self.store().list_messages(chat_id.clone()).await {
            Ok(stored) if !stored.is_empty() => {
                tracing::debug!(chat_id = %chat_id, count = stored.len(), "loaded messages from store");
                return self.backfill(&chat_id, stored).unwrap_or_default();
            }
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(chat_id = %chat_id, %error, "store read failed, trying remote");
            }
        }

        if let ChatId::Durable(durable) = &chat_id {
            match self.remote().get_messages(durable.clone()).await {
                Ok(loaded) => {
                    tracing::debug!(chat_id = %chat_id, count = loaded.len(), "loaded messages from remote");
                    let Some(view) = self.backfill(&chat_id, loaded.clone()) else {
                        return Vec::new();
                    };
                    self.persist_messages("store-remote-messages", loaded)
                        .await;
                    return view;
                }
                Err(error) => {
                    tracing::warn!(chat_id = %chat_id, %error, "remote read failed, serving cached messages");
                }
            }
        }

        self.state().working_set.active_view(&chat_id)
    }

    /// Folds a loaded list into the working set and recency index. `None` when
    /// the chat was deleted while loading.
    fn backfill(&self, chat_id: &ChatId, loaded: Vec<Message>) -> Option<Vec<Message>> {
        let mut state = self.state();
        if state.working_set.is_tombstoned(chat_id) {
            return None;
        }
        state.working_set.merge_loaded(chat_id, loaded);
        state.refresh_recency(chat_id);
        Some(state.working_set.active_view(chat_id))
    }
}
