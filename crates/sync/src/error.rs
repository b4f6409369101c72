use std::path::PathBuf;

use chatsync_storage::{ChatId, MessageId, StorageError};
use snafu::Snafu;

use crate::remote::RemoteError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SyncError {
    #[snafu(display("remote authority failed on `{stage}`: {source}"))]
    Remote {
        stage: &'static str,
        source: RemoteError,
    },
    #[snafu(display("durable store failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("chat '{chat_id}' is provisional and unknown to this session"))]
    UnknownProvisionalChat {
        stage: &'static str,
        chat_id: ChatId,
    },
    #[snafu(display("message '{message_id}' has not been confirmed by the remote authority yet"))]
    MessageNotDurable {
        stage: &'static str,
        message_id: MessageId,
    },
    #[snafu(display("creation of chat '{chat_id}' stopped before completing: {details}"))]
    CreationAborted {
        stage: &'static str,
        chat_id: ChatId,
        details: String,
    },
    #[snafu(display("failed to load sync configuration from {path:?} on `{stage}`: {source}"))]
    Config {
        stage: &'static str,
        path: PathBuf,
        #[snafu(source(from(figment::Error, Box::new)))]
        source: Box<figment::Error>,
    },
}

pub type SyncResult<T> = Result<T, SyncError>;
