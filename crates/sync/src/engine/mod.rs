use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwapOption;
use chatsync_storage::{Chat, ChatId, DurableStore, Message, MessageId, SqliteStorage};
use snafu::ResultExt;
use tokio::task::JoinHandle;

use crate::config::{RecencyConfig, SyncConfig};
use crate::error::{RemoteSnafu, StorageSnafu, SyncError, SyncResult};
use crate::events::{ChatEvent, ChatListener, Listeners, SubscriptionId};
use crate::inflight::InflightRequests;
use crate::recency::RecencyIndex;
use crate::reconcile::ReconcileTable;
use crate::remote::{HttpAuthority, MemoryAuthority, RemoteAuthority};
use crate::working_set::WorkingSet;

mod chats;
mod messages;
mod optimistic;
mod read;

pub(crate) use optimistic::{Optimistic, Reverted, StoreUndo};

/// Every cache tier, guarded together so a mutation is never observed half-applied.
pub(crate) struct CacheState {
    pub(crate) working_set: WorkingSet,
    pub(crate) recency: RecencyIndex,
    pub(crate) reconcile: ReconcileTable,
}

impl CacheState {
    fn new(recency: &RecencyConfig) -> Self {
        Self {
            working_set: WorkingSet::new(),
            recency: RecencyIndex::from_config(recency),
            reconcile: ReconcileTable::new(),
        }
    }

    /// Re-derives the chat's recency entry from a complete working-set list, or drops
    /// it when only a partial list is known.
    pub(crate) fn refresh_recency(&mut self, chat_id: &ChatId) {
        match self.working_set.complete_active_view(chat_id) {
            Some(view) => {
                if let Some(evicted) = self.recency.insert(chat_id.clone(), view) {
                    tracing::debug!(chat_id = %evicted, "evicted chat from recency index");
                }
            }
            None => {
                self.recency.remove(chat_id);
            }
        }
    }
}

pub(crate) struct EngineInner {
    store: Arc<dyn DurableStore>,
    remote: Arc<dyn RemoteAuthority>,
    state: Mutex<CacheState>,
    inflight: InflightRequests<ChatId, Vec<Message>>,
    listeners: Mutex<Listeners>,
    owner: ArcSwapOption<String>,
}

/// Client-side chat store kept consistent with a remote authority.
///
/// Writes apply to the local caches first and reconcile with the remote
/// afterwards; reads are served from the fastest tier that can answer. Cloning
/// is cheap and every clone drives the same state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

/// Point-in-time sizes of the cache tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub cached_chats: usize,
    pub cached_message_lists: usize,
    pub recent_chats: usize,
    pub loads_in_flight: usize,
    /// Deleted chats still masked from loads that were running when they went.
    pub tombstones: usize,
}

/// Handle returned by [`SyncEngine::create_chat`].
///
/// The chat is usable under [`CreatedChat::id`] right away. Dropping the handle
/// detaches the creation task; it still runs to completion.
#[derive(Debug)]
pub struct CreatedChat {
    id: ChatId,
    task: JoinHandle<SyncResult<Chat>>,
}

impl CreatedChat {
    pub fn id(&self) -> &ChatId {
        &self.id
    }

    /// Waits for the remote authority and yields the durable chat.
    pub async fn confirmed(self) -> SyncResult<Chat> {
        let Self { id, task } = self;
        match task.await {
            Ok(result) => result,
            Err(error) => Err(SyncError::CreationAborted {
                stage: "join-creation-task",
                chat_id: id,
                details: error.to_string(),
            }),
        }
    }
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn DurableStore>,
        remote: Arc<dyn RemoteAuthority>,
        recency: &RecencyConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                remote,
                state: Mutex::new(CacheState::new(recency)),
                inflight: InflightRequests::new(),
                listeners: Mutex::new(Listeners::default()),
                owner: ArcSwapOption::empty(),
            }),
        }
    }

    /// Opens the SQLite store and the configured remote. Without a remote endpoint
    /// the session runs against an in-process authority.
    pub async fn open(config: &SyncConfig) -> SyncResult<Self> {
        let config = config.clone().normalized();
        let database_path = config.database_path.to_string_lossy().into_owned();
        let store = SqliteStorage::open(&database_path)
            .await
            .context(StorageSnafu {
                stage: "open-durable-store",
            })?;

        let remote: Arc<dyn RemoteAuthority> = if config.remote.is_configured() {
            Arc::new(HttpAuthority::new(&config.remote).context(RemoteSnafu {
                stage: "open-remote-authority",
            })?)
        } else {
            tracing::warn!("no remote endpoint configured, running against an in-process authority");
            Arc::new(MemoryAuthority::new())
        };

        tracing::info!(database = %database_path, "opened sync engine");
        Ok(Self::new(Arc::new(store), remote, &config.recency))
    }

    pub fn set_owner(&self, owner_id: Option<String>) {
        self.inner.owner.store(owner_id.map(Arc::new));
    }

    pub fn owner(&self) -> Option<String> {
        self.inner
            .owner
            .load_full()
            .map(|owner| owner.as_ref().clone())
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&ChatEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let listener: ChatListener = Arc::new(listener);
        self.listeners().subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners().unsubscribe(id)
    }

    /// The durable id a provisional chat id was reconciled to, or the id itself.
    pub fn resolve_chat_id(&self, chat_id: &ChatId) -> ChatId {
        self.state().reconcile.resolve_chat(chat_id)
    }

    pub fn resolve_message_id(&self, message_id: &MessageId) -> MessageId {
        self.state().reconcile.resolve_message(message_id)
    }

    /// The cached chat record, if the working set holds it.
    pub fn chat(&self, chat_id: &ChatId) -> Option<Chat> {
        let state = self.state();
        let chat_id = state.reconcile.resolve_chat(chat_id);
        state.working_set.chat(&chat_id).cloned()
    }

    pub fn cache_stats(&self) -> CacheStats {
        let loads_in_flight = self.inner.inflight.len();
        let state = self.state();
        CacheStats {
            cached_chats: state.working_set.chat_count(),
            cached_message_lists: state.working_set.message_list_count(),
            recent_chats: state.recency.len(),
            loads_in_flight,
            tombstones: state.working_set.tombstone_count(),
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> MutexGuard<'_, Listeners> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn store(&self) -> &dyn DurableStore {
        self.inner.store.as_ref()
    }

    fn remote(&self) -> &dyn RemoteAuthority {
        self.inner.remote.as_ref()
    }

    /// Delivers events with neither the cache state nor the registry locked.
    fn emit(&self, events: impl IntoIterator<Item = ChatEvent>) {
        let listeners = self.listeners().snapshot();
        for event in events {
            for listener in &listeners {
                listener(&event);
            }
        }
    }

    /// Reverses an optimistic step: caches first, then the store on a best-effort basis.
    async fn roll_back<T>(&self, optimistic: Optimistic<T>, stage: &'static str) {
        let (undo_cache, undo_store) = optimistic.into_undo();
        let mut reverted = Reverted::default();
        if let Some(undo) = undo_cache {
            reverted = {
                let mut state = self.state();
                undo(&mut *state)
            };
            self.emit(std::mem::take(&mut reverted.events));
        }
        if undo_store.is_empty() && reverted.messages.is_empty() {
            return;
        }

        let StoreUndo {
            delete_messages,
            mut put_messages,
            put_chats,
        } = undo_store;
        put_messages.extend(reverted.messages);
        for message_id in delete_messages {
            if let Err(error) = self.store().delete_message(message_id.clone()).await {
                tracing::warn!(stage, %message_id, %error, "failed to delete message while rolling back");
            }
        }
        if !put_messages.is_empty() {
            if let Err(error) = self.store().put_messages(put_messages).await {
                tracing::warn!(stage, %error, "failed to restore messages while rolling back");
            }
        }
        for chat in put_chats {
            let chat_id = chat.id.clone();
            if let Err(error) = self.store().put_chat(chat).await {
                tracing::warn!(stage, %chat_id, %error, "failed to restore chat while rolling back");
            }
        }
    }

    /// Writes that the remote authority stays authoritative for; failures are logged.
    async fn persist_messages(&self, stage: &'static str, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        if let Err(error) = self.store().put_messages(messages).await {
            tracing::warn!(stage, %error, "durable store write failed, continuing");
        }
    }

    async fn persist_chat(&self, stage: &'static str, chat: Chat) {
        let chat_id = chat.id.clone();
        if let Err(error) = self.store().put_chat(chat).await {
            tracing::warn!(stage, %chat_id, %error, "durable store write failed, continuing");
        }
    }
}
