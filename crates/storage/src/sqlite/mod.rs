use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};

use super::error::{
    CreateSqliteDirectorySnafu, DecodeAttachmentsSnafu, EncodeAttachmentsSnafu,
    InvariantViolationSnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu,
    SqlitePragmaSnafu, SqliteQuerySnafu, StorageError, StorageResult,
};
use super::ids::{ChatId, MessageId};
use super::types::{Attachment, Chat, Message, MessageRole};
use super::{BoxFuture, ChatStore, MessageStore};

const CHAT_COLUMNS: &str =
    "id, name, owner_id, current_model, initial_model, parent_chat_id, created_at, is_public";
const MESSAGE_COLUMNS: &str = "id, chat_id, author_id, role, content, model, attachments_json, parent_message_id, version, is_active, created_at, creation_time, seq";

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let in_memory = database_url.contains(":memory:");
        let mut connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(5_000));
        if !in_memory {
            connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
        }

        // A single long-lived connection keeps in-memory databases alive for the pool's lifetime.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "opened sqlite chat store");
        Ok(Self { pool, database_url })
    }

    pub async fn open_in_memory() -> StorageResult<Self> {
        Self::open(":memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }
}

impl ChatStore for SqliteStorage {
    fn put_chat(&self, chat: Chat) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO chats (id, name, owner_id, current_model, initial_model, parent_chat_id, created_at, is_public) VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, owner_id = excluded.owner_id, current_model = excluded.current_model, initial_model = excluded.initial_model, parent_chat_id = excluded.parent_chat_id, created_at = excluded.created_at, is_public = excluded.is_public",
            )
            .bind(chat.id.to_string())
            .bind(chat.name)
            .bind(chat.owner_id)
            .bind(chat.current_model)
            .bind(chat.initial_model)
            .bind(chat.parent_chat_id.map(|value| value.to_string()))
            .bind(chat.created_at_unix_ms)
            .bind(i64::from(chat.is_public))
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "chat-put-upsert",
            })?;

            Ok(())
        })
    }

    fn get_chat(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<Option<Chat>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, ChatRow>(&format!(
                "SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?"
            ))
            .bind(chat_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "chat-get-query",
            })?;

            row.map(chat_row_to_record).transpose()
        })
    }

    fn list_chats(&self, owner_id: String) -> BoxFuture<'_, StorageResult<Vec<Chat>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, ChatRow>(&format!(
                "SELECT {CHAT_COLUMNS} FROM chats WHERE owner_id = ? ORDER BY created_at DESC, id DESC"
            ))
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "chat-list-query",
            })?;

            rows.into_iter().map(chat_row_to_record).collect()
        })
    }

    fn list_child_chats(
        &self,
        parent_chat_id: ChatId,
    ) -> BoxFuture<'_, StorageResult<Vec<Chat>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, ChatRow>(&format!(
                "SELECT {CHAT_COLUMNS} FROM chats WHERE parent_chat_id = ? ORDER BY created_at DESC, id DESC"
            ))
            .bind(parent_chat_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "chat-list-children-query",
            })?;

            rows.into_iter().map(chat_row_to_record).collect()
        })
    }

    fn delete_chat(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            sqlx::query("DELETE FROM chats WHERE id = ?")
                .bind(chat_id.to_string())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "chat-delete-apply",
                })?;

            Ok(())
        })
    }

    fn clear_parent_chat_refs(&self, parent_chat_id: ChatId) -> BoxFuture<'_, StorageResult<u64>> {
        Box::pin(async move {
            let result = sqlx::query("UPDATE chats SET parent_chat_id = NULL WHERE parent_chat_id = ?")
                .bind(parent_chat_id.to_string())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "chat-clear-parent-refs-apply",
                })?;

            Ok(result.rows_affected())
        })
    }
}

impl MessageStore for SqliteStorage {
    fn put_messages(&self, messages: Vec<Message>) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            if messages.is_empty() {
                return Ok(());
            }

            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "message-put-begin",
            })?;
            for message in &messages {
                upsert_message(&mut tx, message, "message-put-upsert").await?;
            }
            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-put-commit",
            })?;

            Ok(())
        })
    }

    fn list_messages(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<Vec<Message>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, MessageRow>(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = ? ORDER BY creation_time ASC, seq ASC, id ASC"
            ))
            .bind(chat_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-list-query",
            })?;

            rows.into_iter().map(message_row_to_record).collect()
        })
    }

    fn delete_message(&self, message_id: MessageId) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            sqlx::query("DELETE FROM messages WHERE id = ?")
                .bind(message_id.to_string())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-delete-apply",
                })?;

            Ok(())
        })
    }

    fn delete_chat_messages(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<u64>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM messages WHERE chat_id = ?")
                .bind(chat_id.to_string())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-delete-for-chat-apply",
                })?;

            Ok(result.rows_affected())
        })
    }

    fn reparent_messages(&self, from: ChatId, to: ChatId) -> BoxFuture<'_, StorageResult<u64>> {
        Box::pin(async move {
            let result = sqlx::query("UPDATE messages SET chat_id = ? WHERE chat_id = ?")
                .bind(to.to_string())
                .bind(from.to_string())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-reparent-apply",
                })?;

            Ok(result.rows_affected())
        })
    }

    fn replace_chat_messages(
        &self,
        chat_id: ChatId,
        messages: Vec<Message>,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "message-replace-begin",
            })?;

            sqlx::query("DELETE FROM messages WHERE chat_id = ?")
                .bind(chat_id.to_string())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-replace-clear",
                })?;

            // Delete and insert share the transaction so readers never observe an empty chat.
            for message in &messages {
                upsert_message(&mut tx, message, "message-replace-insert").await?;
            }

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-replace-commit",
            })?;

            Ok(())
        })
    }
}

#[derive(Debug, FromRow)]
struct ChatRow {
    id: String,
    name: String,
    owner_id: String,
    current_model: String,
    initial_model: String,
    parent_chat_id: Option<String>,
    created_at: i64,
    is_public: i64,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    chat_id: String,
    author_id: String,
    role: String,
    content: String,
    model: Option<String>,
    attachments_json: String,
    parent_message_id: Option<String>,
    version: i64,
    is_active: Option<i64>,
    created_at: i64,
    creation_time: i64,
    seq: i64,
}

async fn upsert_message(
    tx: &mut Transaction<'_, Sqlite>,
    message: &Message,
    stage: &'static str,
) -> StorageResult<()> {
    let attachments_json =
        serde_json::to_string(&message.attachments).context(EncodeAttachmentsSnafu {
            stage,
            message_id: message.id.to_string(),
        })?;

    sqlx::query(
        "INSERT INTO messages (id, chat_id, author_id, role, content, model, attachments_json, parent_message_id, version, is_active, created_at, creation_time, seq) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET chat_id = excluded.chat_id, author_id = excluded.author_id, role = excluded.role, content = excluded.content, model = excluded.model, attachments_json = excluded.attachments_json, parent_message_id = excluded.parent_message_id, version = excluded.version, is_active = excluded.is_active, created_at = excluded.created_at, creation_time = excluded.creation_time, seq = excluded.seq",
    )
    .bind(message.id.to_string())
    .bind(message.chat_id.to_string())
    .bind(message.author_id.as_str())
    .bind(message.role.as_str())
    .bind(message.content.as_str())
    .bind(message.model.as_deref())
    .bind(attachments_json)
    .bind(message.parent_message_id.as_ref().map(|value| value.to_string()))
    .bind(i64::from(message.version))
    .bind(i64::from(message.is_active))
    .bind(message.created_at_unix_ms)
    .bind(message.creation_time_unix_ms)
    .bind(u64_to_i64(message.sequence, "message-upsert-seq")?)
    .execute(&mut **tx)
    .await
    .context(SqliteQuerySnafu { stage })?;

    Ok(())
}

fn chat_row_to_record(row: ChatRow) -> StorageResult<Chat> {
    Ok(Chat {
        id: ChatId::parse(&row.id)?,
        name: row.name,
        owner_id: row.owner_id,
        current_model: row.current_model,
        initial_model: row.initial_model,
        parent_chat_id: row
            .parent_chat_id
            .as_deref()
            .map(ChatId::parse)
            .transpose()?,
        created_at_unix_ms: row.created_at,
        is_public: row.is_public != 0,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<Message> {
    let attachments = serde_json::from_str::<Vec<Attachment>>(&row.attachments_json).context(
        DecodeAttachmentsSnafu {
            stage: "message-row-attachments",
            message_id: row.id.clone(),
        },
    )?;

    Ok(Message {
        id: MessageId::parse(&row.id)?,
        chat_id: ChatId::parse(&row.chat_id)?,
        author_id: row.author_id,
        role: role_from_sql(&row.role)?,
        content: row.content,
        model: row.model,
        attachments,
        parent_message_id: row
            .parent_message_id
            .as_deref()
            .map(MessageId::parse)
            .transpose()?,
        version: i64_to_u32(row.version, "message-row-version")?,
        // Rows written before the column existed carry NULL and count as active.
        is_active: row.is_active.is_none_or(|value| value != 0),
        created_at_unix_ms: row.created_at,
        creation_time_unix_ms: row.creation_time,
        sequence: i64_to_u64(row.seq, "message-row-seq")?,
    })
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    MessageRole::parse(raw).ok_or_else(|| StorageError::InvariantViolation {
        stage: "message-role-from-sql",
        details: format!("unknown message role '{raw}'"),
    })
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value.try_into().map_err(|_| StorageError::InvariantViolation {
        stage,
        details: format!("negative sqlite integer '{value}' cannot map to u64"),
    })
}

fn i64_to_u32(value: i64, stage: &'static str) -> StorageResult<u32> {
    let mapped: u32 = value.try_into().map_err(|_| StorageError::InvariantViolation {
        stage,
        details: format!("sqlite integer '{value}' cannot map to u32"),
    })?;
    if mapped == 0 {
        return InvariantViolationSnafu {
            stage,
            details: "message version must be at least 1".to_string(),
        }
        .fail();
    }
    Ok(mapped)
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value.try_into().map_err(|_| StorageError::InvariantViolation {
        stage,
        details: format!("u64 '{value}' cannot map to sqlite i64"),
    })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::DurableChatId;

    fn chat(id: ChatId, owner: &str, created_at: i64) -> Chat {
        Chat {
            id,
            name: "Trip planning".to_string(),
            owner_id: owner.to_string(),
            current_model: "gpt-4o".to_string(),
            initial_model: "gpt-4o".to_string(),
            parent_chat_id: None,
            created_at_unix_ms: created_at,
            is_public: false,
        }
    }

    fn message(chat_id: &ChatId, content: &str, creation_time: i64) -> Message {
        Message {
            id: MessageId::provisional(),
            chat_id: chat_id.clone(),
            author_id: "user-1".to_string(),
            role: MessageRole::User,
            content: content.to_string(),
            model: None,
            attachments: vec![Attachment {
                name: "map.png".to_string(),
                url: "https://files.example/map.png".to_string(),
                mime_type: "image/png".to_string(),
            }],
            parent_message_id: None,
            version: 1,
            is_active: true,
            created_at_unix_ms: creation_time,
            creation_time_unix_ms: creation_time,
            sequence: 0,
        }
    }

    #[tokio::test]
    async fn chats_are_listed_per_owner_newest_first() {
        let storage = SqliteStorage::open_in_memory().await.unwrap();
        let older = ChatId::durable("chat-a").unwrap();
        let newer = ChatId::durable("chat-b").unwrap();
        storage.put_chat(chat(older.clone(), "owner-1", 10)).await.unwrap();
        storage.put_chat(chat(newer.clone(), "owner-1", 20)).await.unwrap();
        storage
            .put_chat(chat(ChatId::durable("chat-c").unwrap(), "owner-2", 30))
            .await
            .unwrap();

        let listed = storage.list_chats("owner-1".to_string()).await.unwrap();
        let ids = listed.into_iter().map(|chat| chat.id).collect::<Vec<_>>();

        assert_eq!(ids, vec![newer, older]);
    }

    #[tokio::test]
    async fn reparenting_moves_provisional_rows_to_the_durable_chat() {
        let storage = SqliteStorage::open_in_memory().await.unwrap();
        let provisional = ChatId::provisional();
        let durable = ChatId::Durable(DurableChatId::new("chat-9").unwrap());
        storage
            .put_messages(vec![
                message(&provisional, "Hi", 1),
                message(&provisional, "Where to?", 2),
            ])
            .await
            .unwrap();

        let moved = storage
            .reparent_messages(provisional.clone(), durable.clone())
            .await
            .unwrap();

        assert_eq!(moved, 2);
        assert!(storage.list_messages(provisional).await.unwrap().is_empty());
        let reloaded = storage.list_messages(durable).await.unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded[0].content, "Hi");
        assert_eq!(reloaded[0].attachments.len(), 1);
    }

    #[tokio::test]
    async fn replace_swaps_the_whole_message_set() {
        let storage = SqliteStorage::open_in_memory().await.unwrap();
        let chat_id = ChatId::durable("chat-1").unwrap();
        storage
            .put_messages(vec![message(&chat_id, "old", 1)])
            .await
            .unwrap();

        let mut replacement = message(&chat_id, "new", 2);
        replacement.is_active = false;
        storage
            .replace_chat_messages(chat_id.clone(), vec![replacement.clone()])
            .await
            .unwrap();

        assert_eq!(storage.list_messages(chat_id).await.unwrap(), vec![replacement]);
    }

    #[tokio::test]
    async fn null_active_flag_reads_back_as_active() {
        let storage = SqliteStorage::open_in_memory().await.unwrap();
        let chat_id = ChatId::durable("chat-legacy").unwrap();
        storage
            .put_messages(vec![message(&chat_id, "legacy", 1)])
            .await
            .unwrap();
        sqlx::query("UPDATE messages SET is_active = NULL")
            .execute(storage.pool())
            .await
            .unwrap();

        let reloaded = storage.list_messages(chat_id).await.unwrap();

        assert!(reloaded[0].is_active);
    }

    #[tokio::test]
    async fn clearing_parent_refs_detaches_child_chats() {
        let storage = SqliteStorage::open_in_memory().await.unwrap();
        let parent = ChatId::durable("parent").unwrap();
        let mut child = chat(ChatId::durable("child").unwrap(), "owner-1", 5);
        child.parent_chat_id = Some(parent.clone());
        storage.put_chat(child).await.unwrap();

        assert_eq!(storage.list_child_chats(parent.clone()).await.unwrap().len(), 1);
        assert_eq!(storage.clear_parent_chat_refs(parent.clone()).await.unwrap(), 1);
        assert!(storage.list_child_chats(parent).await.unwrap().is_empty());
    }
}
