use std::sync::{Arc, Mutex};
use std::time::Duration;

use chatsync::{
    Attachment, ChatEvent, ChatId, ChatStore, DurableChatId, MemoryAuthority, MemoryStorage, Message,
    MessageId, MessageRole, MessageStore, NewChat, NewMessage, RecencyConfig, RemoteOp,
    SqliteStorage, SyncEngine, SyncError,
};

const OWNER: &str = "user-1";
const MODEL: &str = "gpt-4o";

struct Fixture {
    engine: SyncEngine,
    store: Arc<MemoryStorage>,
    remote: Arc<MemoryAuthority>,
    events: Arc<Mutex<Vec<ChatEvent>>>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_recency(RecencyConfig::default())
    }

    fn with_recency(recency: RecencyConfig) -> Self {
        let store = Arc::new(MemoryStorage::new());
        let remote = Arc::new(MemoryAuthority::new());
        let engine = SyncEngine::new(store.clone(), remote.clone(), &recency);
        engine.set_owner(Some(OWNER.to_string()));

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        engine.subscribe(move |event| sink.lock().unwrap().push(event.clone()));

        Self {
            engine,
            store,
            remote,
            events,
        }
    }

    /// A remote chat with the given assistant messages, not yet loaded locally.
    fn seed(&self, name: &str, contents: &[&str]) -> (ChatId, Vec<MessageId>) {
        let chat = self.remote.seed_chat(name, OWNER, MODEL).unwrap();
        let durable = durable_chat(&chat.id);
        let ids = contents
            .iter()
            .map(|content| {
                self.remote
                    .seed_message(&durable, MessageRole::Assistant, content)
                    .unwrap()
                    .id
            })
            .collect();
        (chat.id, ids)
    }

    fn events(&self) -> Vec<ChatEvent> {
        self.events.lock().unwrap().clone()
    }
}

fn durable_chat(chat_id: &ChatId) -> DurableChatId {
    chat_id.as_durable().cloned().unwrap()
}

fn contents(messages: &[Message]) -> Vec<&str> {
    messages
        .iter()
        .map(|message| message.content.as_str())
        .collect()
}

#[tokio::test]
async fn trip_planning_messages_survive_reconciliation() {
    let fx = Fixture::new();

    let created = fx.engine.create_chat(NewChat::new("Trip planning", MODEL));
    let provisional = created.id().clone();
    assert!(provisional.is_provisional());

    let hi = fx
        .engine
        .add_message(NewMessage::user(provisional.clone(), "Hi"))
        .await
        .unwrap();
    let optimistic = fx.engine.get_messages(&provisional).await;
    assert_eq!(contents(&optimistic), ["Hi"]);
    assert_eq!(optimistic[0].id, hi);

    let chat = created.confirmed().await.unwrap();
    assert!(!chat.id.is_provisional());
    assert_eq!(chat.name, "Trip planning");
    assert_eq!(fx.engine.resolve_chat_id(&provisional), chat.id);

    let messages = fx.engine.get_messages(&provisional).await;
    assert_eq!(contents(&messages), ["Hi"]);
    assert!(!messages[0].id.is_provisional());
    assert_eq!(messages[0].chat_id, chat.id);
    assert_eq!(fx.engine.resolve_message_id(&hi), messages[0].id);

    assert_eq!(fx.store.provisional_rows(), 0);
    assert_eq!(fx.store.message_count(), 1);
    assert_eq!(fx.remote.messages_for(&durable_chat(&chat.id)).len(), 1);

    let events = fx.events();
    assert!(matches!(events.first(), Some(ChatEvent::ChatCreated { chat }) if chat.id == provisional));
    assert!(events.contains(&ChatEvent::ChatReconciled {
        provisional,
        durable: chat.id.clone(),
    }));
}

#[tokio::test]
async fn replayed_messages_keep_their_metadata() {
    let fx = Fixture::new();
    let created = fx
        .engine
        .create_chat(NewChat::new("Shared notes", MODEL).with_owner("user-2"));
    let attachment = Attachment {
        name: "plan.pdf".to_string(),
        url: "https://files.example/plan.pdf".to_string(),
        mime_type: "application/pdf".to_string(),
    };
    fx.engine
        .add_message(
            NewMessage::user(created.id().clone(), "see attached")
                .with_author("user-3")
                .with_model("gpt-4o-mini")
                .with_attachments(vec![attachment.clone()]),
        )
        .await
        .unwrap();

    let chat = created.confirmed().await.unwrap();
    assert_eq!(chat.owner_id, "user-2");

    let remote = fx.remote.messages_for(&durable_chat(&chat.id));
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].author_id, "user-3");
    assert_eq!(remote[0].model.as_deref(), Some("gpt-4o-mini"));
    assert_eq!(remote[0].attachments, [attachment]);
}

#[tokio::test]
async fn reconciliation_leaves_no_provisional_rows_in_sqlite() {
    let store = Arc::new(SqliteStorage::open_in_memory().await.unwrap());
    let remote = Arc::new(MemoryAuthority::new());
    let engine = SyncEngine::new(store.clone(), remote.clone(), &RecencyConfig::default());
    engine.set_owner(Some(OWNER.to_string()));

    let created = engine.create_chat(NewChat::new("Groceries", MODEL));
    let provisional = created.id().clone();
    engine
        .add_message(NewMessage::user(provisional.clone(), "Milk"))
        .await
        .unwrap();
    engine
        .add_message(NewMessage::user(provisional.clone(), "Eggs"))
        .await
        .unwrap();
    let chat = created.confirmed().await.unwrap();

    assert!(store.get_chat(provisional.clone()).await.unwrap().is_none());
    assert!(store.list_messages(provisional).await.unwrap().is_empty());
    let stored = store.list_messages(chat.id.clone()).await.unwrap();
    assert_eq!(contents(&stored), ["Milk", "Eggs"]);
    assert!(stored.iter().all(|message| !message.id.is_provisional()));
    assert_eq!(store.get_chat(chat.id).await.unwrap().map(|chat| chat.name), Some("Groceries".to_string()));
}

#[tokio::test(start_paused = true)]
async fn concurrent_reads_share_one_load() {
    let fx = Fixture::new();
    let (chat_id, _) = fx.seed("Shared", &["hello"]);
    fx.remote
        .push_delay(RemoteOp::GetMessages, Duration::from_millis(50));

    let (first, second, third) = tokio::join!(
        fx.engine.get_messages(&chat_id),
        fx.engine.get_messages(&chat_id),
        fx.engine.get_messages(&chat_id),
    );

    assert_eq!(fx.remote.calls(RemoteOp::GetMessages), 1);
    assert_eq!(fx.store.message_reads(), 1);
    assert_eq!(contents(&first), ["hello"]);
    assert_eq!(first, second);
    assert_eq!(second, third);
    assert_eq!(fx.engine.cache_stats().loads_in_flight, 0);

    fx.engine.get_messages(&chat_id).await;
    assert_eq!(fx.remote.calls(RemoteOp::GetMessages), 1);
}

#[tokio::test]
async fn new_versions_leave_exactly_one_active_member() {
    let fx = Fixture::new();
    let (chat_id, ids) = fx.seed("Versions", &["first answer"]);
    let original = ids[0].clone();

    // The group is numbered over the full history, loaded on demand.
    let second = fx
        .engine
        .add_message(NewMessage::assistant(chat_id.clone(), "second answer").with_parent(original.clone()))
        .await
        .unwrap();
    let third = fx
        .engine
        .add_message(NewMessage::assistant(chat_id.clone(), "third answer").with_parent(original.clone()))
        .await
        .unwrap();

    let view = fx.engine.get_messages(&chat_id).await;
    assert_eq!(contents(&view), ["third answer"]);

    let versions = fx.engine.message_versions(&second);
    let numbers = versions.iter().map(|message| message.version).collect::<Vec<_>>();
    assert_eq!(numbers, [1, 2, 3]);
    assert_eq!(versions.iter().filter(|message| message.is_active).count(), 1);
    assert_eq!(versions[2].id, third);

    let remote_active = fx
        .remote
        .messages_for(&durable_chat(&chat_id))
        .into_iter()
        .filter(|message| message.in_version_group_of(&original) && message.is_active)
        .count();
    assert_eq!(remote_active, 1);
}

#[tokio::test]
async fn switching_versions_takes_the_remote_view() {
    let fx = Fixture::new();
    let (chat_id, ids) = fx.seed("Switch", &["first answer"]);
    fx.engine.get_messages(&chat_id).await;
    let retry = fx
        .engine
        .add_message(NewMessage::assistant(chat_id.clone(), "second answer").with_parent(ids[0].clone()))
        .await
        .unwrap();

    let view = fx.engine.switch_message_version(&ids[0]).await.unwrap();
    assert_eq!(contents(&view), ["first answer"]);
    assert_eq!(contents(&fx.engine.get_messages(&chat_id).await), ["first answer"]);

    let versions = fx.engine.message_versions(&retry);
    let active = versions
        .iter()
        .filter(|message| message.is_active)
        .map(|message| message.id.clone())
        .collect::<Vec<_>>();
    assert_eq!(active, [ids[0].clone()]);

    let stored = fx.store.list_messages(chat_id).await.unwrap();
    assert_eq!(stored.iter().filter(|message| message.is_active).count(), 1);
}

#[tokio::test(start_paused = true)]
async fn display_order_follows_construction_not_settlement() {
    let fx = Fixture::new();
    let (chat_id, _) = fx.seed("Order", &[]);
    fx.engine.get_messages(&chat_id).await;

    let first = NewMessage::user(chat_id.clone(), "first").with_creation_time(1_000);
    let second = NewMessage::user(chat_id.clone(), "second").with_creation_time(1_000);
    fx.remote
        .push_delay(RemoteOp::AddMessage, Duration::from_millis(50));

    let (left, right) = tokio::join!(fx.engine.add_message(first), fx.engine.add_message(second));
    left.unwrap();
    right.unwrap();

    assert_eq!(contents(&fx.engine.get_messages(&chat_id).await), ["first", "second"]);
    let remote = fx.remote.messages_for(&durable_chat(&chat_id));
    assert_eq!(contents(&remote), ["first", "second"]);
}

#[tokio::test]
async fn failed_add_rolls_back_every_tier() {
    let fx = Fixture::new();
    let (chat_id, _) = fx.seed("Rollback", &["kept"]);
    let before = fx.engine.get_messages(&chat_id).await;
    let stored_before = fx.store.message_count();

    fx.remote.fail_next(RemoteOp::AddMessage, 1);
    let result = fx
        .engine
        .add_message(NewMessage::user(chat_id.clone(), "lost"))
        .await;

    assert!(matches!(result, Err(SyncError::Remote { .. })));
    assert_eq!(fx.engine.get_messages(&chat_id).await, before);
    assert_eq!(fx.store.message_count(), stored_before);
    assert_eq!(fx.remote.messages_for(&durable_chat(&chat_id)).len(), 1);

    let changes = fx
        .events()
        .into_iter()
        .filter(|event| matches!(event, ChatEvent::MessagesChanged { .. }))
        .count();
    assert_eq!(changes, 2);
}

#[tokio::test]
async fn failed_retry_reactivates_the_previous_version() {
    let fx = Fixture::new();
    let (chat_id, ids) = fx.seed("Retry", &["original"]);
    fx.engine.get_messages(&chat_id).await;

    fx.remote.fail_next(RemoteOp::AddMessage, 1);
    let result = fx
        .engine
        .add_message(NewMessage::assistant(chat_id.clone(), "retry").with_parent(ids[0].clone()))
        .await;

    assert!(result.is_err());
    let view = fx.engine.get_messages(&chat_id).await;
    assert_eq!(contents(&view), ["original"]);
    assert!(view[0].is_active);
    let stored = fx.store.list_messages(chat_id).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].is_active);
}

#[tokio::test(start_paused = true)]
async fn failed_retry_keeps_a_sibling_confirmed_meanwhile_active() {
    let fx = Fixture::new();
    let (chat_id, ids) = fx.seed("Overlap", &["original"]);
    fx.engine.get_messages(&chat_id).await;

    fx.remote
        .push_delay(RemoteOp::AddMessage, Duration::from_millis(50));
    let engine = fx.engine.clone();
    let request = NewMessage::assistant(chat_id.clone(), "second").with_parent(ids[0].clone());
    let second = tokio::spawn(async move { engine.add_message(request).await });
    // The second version reaches the remote before the third is queued.
    tokio::time::sleep(Duration::from_millis(10)).await;

    fx.remote
        .push_delay(RemoteOp::AddMessage, Duration::from_millis(100));
    fx.remote.fail_next(RemoteOp::AddMessage, 1);
    let third = fx
        .engine
        .add_message(NewMessage::assistant(chat_id.clone(), "third").with_parent(ids[0].clone()))
        .await;

    let second = second.await.unwrap().unwrap();
    assert!(!second.is_provisional());
    assert!(matches!(third, Err(SyncError::Remote { .. })));

    let view = fx.engine.get_messages(&chat_id).await;
    assert_eq!(contents(&view), ["second"]);
    assert_eq!(view[0].id, second);

    let stored = fx.store.list_messages(chat_id.clone()).await.unwrap();
    assert_eq!(fx.store.provisional_rows(), 0);
    assert_eq!(stored.len(), 2);
    let stored_active = stored
        .iter()
        .filter(|message| message.is_active)
        .map(|message| message.id.clone())
        .collect::<Vec<_>>();
    assert_eq!(stored_active, [second.clone()]);

    let remote_active = fx
        .remote
        .messages_for(&durable_chat(&chat_id))
        .into_iter()
        .filter(|message| message.is_active)
        .map(|message| message.id)
        .collect::<Vec<_>>();
    assert_eq!(remote_active, [second]);
}

#[tokio::test]
async fn writing_to_an_unloaded_chat_keeps_its_history() {
    let fx = Fixture::new();
    let (chat_id, _) = fx.seed("Cold", &["hello"]);

    fx.engine
        .add_message(NewMessage::user(chat_id.clone(), "new"))
        .await
        .unwrap();

    assert_eq!(contents(&fx.engine.get_messages(&chat_id).await), ["hello", "new"]);
    let reopened = SyncEngine::new(fx.store.clone(), fx.remote.clone(), &RecencyConfig::default());
    assert_eq!(contents(&reopened.get_messages(&chat_id).await), ["hello", "new"]);
    assert_eq!(fx.remote.messages_for(&durable_chat(&chat_id)).len(), 2);
}

#[tokio::test]
async fn recency_index_stays_within_capacity() {
    let fx = Fixture::with_recency(RecencyConfig {
        capacity: 2,
        ..RecencyConfig::default()
    });
    let mut chats = Vec::new();
    for index in 0..4 {
        let (chat_id, _) = fx.seed(&format!("Chat {index}"), &["hello"]);
        fx.engine.get_messages(&chat_id).await;
        chats.push(chat_id);
    }

    let stats = fx.engine.cache_stats();
    assert_eq!(stats.recent_chats, 2);
    assert_eq!(stats.cached_message_lists, 4);

    // Evicted chats are still answered from the working set.
    assert_eq!(contents(&fx.engine.get_messages(&chats[0]).await), ["hello"]);
    assert_eq!(fx.remote.calls(RemoteOp::GetMessages), 4);
    assert_eq!(fx.engine.cache_stats().recent_chats, 2);
}

#[tokio::test]
async fn reads_fall_back_to_the_store_when_remote_is_down() {
    let fx = Fixture::new();
    let (chat_id, _) = fx.seed("Offline", &["cached"]);
    fx.engine.get_messages(&chat_id).await;

    let store = fx.store.clone();
    let reopened = SyncEngine::new(store, fx.remote.clone(), &RecencyConfig::default());
    fx.remote.set_offline(true);

    assert_eq!(contents(&reopened.get_messages(&chat_id).await), ["cached"]);
}

#[tokio::test]
async fn delete_removes_chat_from_every_tier() {
    let fx = Fixture::new();
    let (chat_id, _) = fx.seed("Doomed", &["bye"]);
    fx.engine.sync_chats().await.unwrap();
    fx.engine.get_messages(&chat_id).await;

    fx.engine.delete_chat(&chat_id).await.unwrap();

    assert!(fx.engine.chat(&chat_id).is_none());
    assert!(fx.engine.get_messages(&chat_id).await.is_empty());
    assert!(fx.engine.list_chats().await.is_empty());
    assert_eq!(fx.store.chat_count(), 0);
    assert_eq!(fx.store.message_count(), 0);
    assert_eq!(fx.remote.chat_count(), 0);
    assert_eq!(fx.engine.cache_stats().tombstones, 0);
    assert!(fx.events().contains(&ChatEvent::ChatDeleted { chat_id }));
}

#[tokio::test(start_paused = true)]
async fn delete_during_a_load_keeps_the_chat_hidden() {
    let fx = Fixture::new();
    let (chat_id, _) = fx.seed("Racing", &["late"]);
    fx.remote
        .push_delay(RemoteOp::GetMessages, Duration::from_millis(50));

    let engine = fx.engine.clone();
    let read_id = chat_id.clone();
    let load = tokio::spawn(async move { engine.get_messages(&read_id).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    fx.engine.delete_chat(&chat_id).await.unwrap();
    assert_eq!(fx.engine.cache_stats().tombstones, 1);

    assert!(load.await.unwrap().is_empty());
    assert!(fx.engine.get_messages(&chat_id).await.is_empty());
    assert_eq!(fx.store.message_count(), 0);
}

#[tokio::test]
async fn failed_remote_delete_restores_the_chat() {
    let fx = Fixture::new();
    let (parent_id, _) = fx.seed("Parent", &["keep me"]);
    fx.engine.sync_chats().await.unwrap();
    let before = fx.engine.get_messages(&parent_id).await;

    fx.remote.fail_next(RemoteOp::DeleteChat, 1);
    let result = fx.engine.delete_chat(&parent_id).await;

    assert!(matches!(result, Err(SyncError::Remote { .. })));
    assert!(fx.engine.chat(&parent_id).is_some());
    assert_eq!(fx.engine.get_messages(&parent_id).await, before);
    assert_eq!(fx.engine.list_chats().await.len(), 1);
    assert!(fx.store.get_chat(parent_id.clone()).await.unwrap().is_some());
    assert_eq!(fx.store.list_messages(parent_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_store_delete_restores_the_chat() {
    let fx = Fixture::new();
    let (chat_id, _) = fx.seed("Sticky", &["still here"]);
    fx.engine.sync_chats().await.unwrap();
    fx.engine.get_messages(&chat_id).await;

    fx.store.set_failing(true);
    let result = fx.engine.delete_chat(&chat_id).await;
    fx.store.set_failing(false);

    assert!(matches!(result, Err(SyncError::Storage { .. })));
    assert!(fx.engine.chat(&chat_id).is_some());
    assert_eq!(contents(&fx.engine.get_messages(&chat_id).await), ["still here"]);
    assert_eq!(fx.remote.chat_count(), 1);
    assert_eq!(fx.remote.calls(RemoteOp::DeleteChat), 0);
}

#[tokio::test(start_paused = true)]
async fn deleting_a_pending_chat_abandons_its_creation() {
    let fx = Fixture::new();
    fx.remote
        .push_delay(RemoteOp::CreateChat, Duration::from_millis(50));

    let created = fx.engine.create_chat(NewChat::new("Never mind", MODEL));
    let provisional = created.id().clone();
    fx.engine
        .add_message(NewMessage::user(provisional.clone(), "draft"))
        .await
        .unwrap();
    fx.engine.delete_chat(&provisional).await.unwrap();

    let result = created.confirmed().await;

    assert!(matches!(result, Err(SyncError::CreationAborted { .. })));
    assert!(fx.engine.chat(&provisional).is_none());
    assert_eq!(fx.remote.chat_count(), 0);
    assert_eq!(fx.remote.message_count(), 0);
    assert_eq!(fx.store.provisional_rows(), 0);
    assert!(fx.events().contains(&ChatEvent::ChatDeleted {
        chat_id: provisional.clone(),
    }));
    assert!(matches!(
        fx.engine
            .add_message(NewMessage::user(provisional, "too late"))
            .await,
        Err(SyncError::UnknownProvisionalChat { .. })
    ));
}

#[tokio::test]
async fn failed_creation_discards_the_provisional_chat() {
    let fx = Fixture::new();
    fx.remote.fail_next(RemoteOp::CreateChat, 1);

    let created = fx.engine.create_chat(NewChat::new("Unlucky", MODEL));
    let provisional = created.id().clone();
    fx.engine
        .add_message(NewMessage::user(provisional.clone(), "hello?"))
        .await
        .unwrap();

    let result = created.confirmed().await;

    assert!(matches!(result, Err(SyncError::Remote { .. })));
    assert!(fx.engine.chat(&provisional).is_none());
    assert!(fx.engine.get_messages(&provisional).await.is_empty());
    assert_eq!(fx.store.provisional_rows(), 0);
    assert!(fx.events().contains(&ChatEvent::ChatCreationFailed {
        chat_id: provisional,
    }));
}

#[tokio::test]
async fn unknown_provisional_chat_is_rejected() {
    let fx = Fixture::new();

    let result = fx
        .engine
        .add_message(NewMessage::user(ChatId::provisional(), "orphan"))
        .await;

    assert!(matches!(result, Err(SyncError::UnknownProvisionalChat { .. })));
    assert_eq!(fx.store.message_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn queued_messages_cannot_switch_versions() {
    let fx = Fixture::new();
    fx.remote
        .push_delay(RemoteOp::CreateChat, Duration::from_millis(50));
    let created = fx.engine.create_chat(NewChat::new("Queued", MODEL));
    let queued = fx
        .engine
        .add_message(NewMessage::user(created.id().clone(), "pending"))
        .await
        .unwrap();

    assert!(queued.is_provisional());
    assert!(matches!(
        fx.engine.switch_message_version(&queued).await,
        Err(SyncError::MessageNotDurable { .. })
    ));
    assert!(matches!(
        fx.engine.mark_as_original_version(&queued).await,
        Err(SyncError::MessageNotDurable { .. })
    ));

    created.confirmed().await.unwrap();
    assert!(!fx.engine.resolve_message_id(&queued).is_provisional());
    fx.engine.switch_message_version(&queued).await.unwrap();
}

#[tokio::test]
async fn mark_as_original_resets_version_and_activity() {
    let fx = Fixture::new();
    let (chat_id, ids) = fx.seed("Original", &["answer"]);
    fx.engine.get_messages(&chat_id).await;

    fx.engine.mark_as_original_version(&ids[0]).await.unwrap();

    assert!(fx.engine.get_messages(&chat_id).await.is_empty());
    let versions = fx.engine.message_versions(&ids[0]);
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].version, 1);
    assert!(!versions[0].is_active);
    let remote = fx.remote.messages_for(&durable_chat(&chat_id));
    assert!(!remote[0].is_active);
}

#[tokio::test(start_paused = true)]
async fn chat_list_sync_keeps_pending_chats() {
    let fx = Fixture::new();
    fx.seed("Remote", &[]);
    fx.remote
        .push_delay(RemoteOp::CreateChat, Duration::from_millis(50));
    let created = fx.engine.create_chat(NewChat::new("Local", MODEL));

    let synced = fx.engine.sync_chats().await.unwrap();
    let names = synced.iter().map(|chat| chat.name.as_str()).collect::<Vec<_>>();
    assert_eq!(synced.len(), 2);
    assert!(names.contains(&"Remote"));
    assert!(names.contains(&"Local"));

    let chat = created.confirmed().await.unwrap();
    let listed = fx.engine.list_chats().await;
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().all(|chat| !chat.id.is_provisional()));
    assert!(listed.iter().any(|listed| listed.id == chat.id));
}

#[tokio::test]
async fn failed_model_update_is_reverted() {
    let fx = Fixture::new();
    let (chat_id, _) = fx.seed("Models", &[]);
    fx.engine.sync_chats().await.unwrap();

    fx.remote.fail_next(RemoteOp::UpdateChatModel, 1);
    let result = fx.engine.update_chat_model(&chat_id, "o3").await;

    assert!(matches!(result, Err(SyncError::Remote { .. })));
    assert_eq!(fx.engine.chat(&chat_id).unwrap().current_model, MODEL);
    let stored = fx.store.get_chat(chat_id.clone()).await.unwrap().unwrap();
    assert_eq!(stored.current_model, MODEL);

    fx.engine.update_chat_model(&chat_id, "o3").await.unwrap();
    fx.engine.set_chat_visibility(&chat_id, true).await.unwrap();
    let remote = fx.remote.chat(&durable_chat(&chat_id)).unwrap();
    assert_eq!(remote.current_model, "o3");
    assert!(remote.is_public);
    assert_eq!(fx.engine.chat(&chat_id).unwrap().current_model, "o3");
}

#[tokio::test(start_paused = true)]
async fn updates_to_a_pending_chat_are_sent_after_creation() {
    let fx = Fixture::new();
    fx.remote
        .push_delay(RemoteOp::CreateChat, Duration::from_millis(50));
    let created = fx.engine.create_chat(NewChat::new("Later", MODEL));
    let provisional = created.id().clone();

    fx.engine
        .update_chat_model(&provisional, "o3")
        .await
        .unwrap();
    assert_eq!(fx.engine.chat(&provisional).unwrap().current_model, "o3");

    let chat = created.confirmed().await.unwrap();
    assert_eq!(chat.current_model, "o3");
    assert_eq!(chat.initial_model, MODEL);
    assert_eq!(fx.remote.chat(&durable_chat(&chat.id)).unwrap().current_model, "o3");
}

#[tokio::test]
async fn child_chats_follow_their_parent_to_a_durable_id() {
    let fx = Fixture::new();
    let parent = fx.engine.create_chat(NewChat::new("Parent", MODEL));
    let child = fx
        .engine
        .create_chat(NewChat::new("Child", MODEL).with_parent(parent.id().clone()));

    let parent = parent.confirmed().await.unwrap();
    let child = child.confirmed().await.unwrap();

    let cached = fx.engine.chat(&child.id).unwrap();
    assert_eq!(cached.parent_chat_id, Some(parent.id.clone()));
    assert_eq!(fx.store.provisional_rows(), 0);
}

#[tokio::test]
async fn refresh_reloads_chats_from_the_store() {
    let fx = Fixture::new();
    let (chat_id, _) = fx.seed("Persisted", &["stored"]);
    fx.engine.sync_chats().await.unwrap();
    fx.engine.get_messages(&chat_id).await;

    let chats = fx.engine.refresh_cache().await;

    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].id, chat_id);
    assert_eq!(fx.engine.cache_stats().cached_message_lists, 0);
    assert_eq!(contents(&fx.engine.get_messages(&chat_id).await), ["stored"]);
    assert!(fx.events().contains(&ChatEvent::ChatListChanged {
        owner_id: OWNER.to_string(),
    }));
}

#[tokio::test]
async fn unsubscribed_listeners_stop_receiving_events() {
    let fx = Fixture::new();
    let seen = Arc::new(Mutex::new(0_usize));
    let counter = Arc::clone(&seen);
    let id = fx.engine.subscribe(move |_| *counter.lock().unwrap() += 1);

    fx.engine.create_chat(NewChat::new("Counted", MODEL)).confirmed().await.unwrap();
    let counted = *seen.lock().unwrap();
    assert!(counted > 0);

    assert!(fx.engine.unsubscribe(id));
    fx.engine.create_chat(NewChat::new("Ignored", MODEL)).confirmed().await.unwrap();
    assert_eq!(*seen.lock().unwrap(), counted);
}
