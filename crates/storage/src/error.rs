use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("'{raw}' is not a valid {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
    #[snafu(display("storage id for {id_type} must not be empty"))]
    EmptyId {
        stage: &'static str,
        id_type: &'static str,
    },
    #[snafu(display("'{raw}' carries the provisional marker and cannot be a durable {id_type}"))]
    MarkedDurableId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
    },
    #[snafu(display("chat store invariant violated: {details}"))]
    InvariantViolation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("failed to create chat store directory {path}"))]
    CreateSqliteDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse sqlite connection URL '{database_url}'"))]
    SqliteConnectOptions {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to open chat store at '{database_url}'"))]
    SqliteConnect {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to configure sqlite pragma '{pragma}'"))]
    SqlitePragma {
        stage: &'static str,
        pragma: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("failed to migrate chat store schema"))]
    SqliteMigrate {
        stage: &'static str,
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("chat store query failed at {stage}: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("failed to encode attachments for message '{message_id}'"))]
    EncodeAttachments {
        stage: &'static str,
        message_id: String,
        source: serde_json::Error,
    },
    #[snafu(display("failed to decode attachments for message '{message_id}'"))]
    DecodeAttachments {
        stage: &'static str,
        message_id: String,
        source: serde_json::Error,
    },
    #[snafu(display("durable store is unavailable at {stage}"))]
    Unavailable { stage: &'static str },
}

pub type StorageResult<T> = Result<T, StorageError>;
