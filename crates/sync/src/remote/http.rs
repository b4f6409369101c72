use std::time::Duration;

use chatsync_storage::{BoxFuture, Chat, DurableChatId, DurableMessageId, Message};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use snafu::ResultExt;

use super::{
    AddMessageRequest, CreateChatRequest, DecodeResponseSnafu, RemoteAuthority, RemoteError,
    RemoteResult,
};
use crate::config::RemoteConfig;

#[derive(Debug, Clone, Copy)]
enum FunctionKind {
    Query,
    Mutation,
}

impl FunctionKind {
    fn route(&self) -> &'static str {
        match self {
            Self::Query => "api/query",
            Self::Mutation => "api/mutation",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    status: String,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    error_message: Option<String>,
}

/// Remote authority reached over a JSON function-call API.
///
/// Every operation is a POST to `{endpoint}/api/query` or `{endpoint}/api/mutation`
/// carrying `{"path": "<module>:<function>", "args": {..}, "format": "json"}`, answered
/// with `{"status": "success", "value": ..}` or `{"status": "error", "errorMessage": ..}`.
#[derive(Debug, Clone)]
pub struct HttpAuthority {
    client: reqwest::Client,
    endpoint: String,
    auth_token: Option<String>,
}

impl HttpAuthority {
    pub fn new(config: &RemoteConfig) -> RemoteResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .context(super::HttpSnafu {
                stage: "build-http-client",
            })?;

        let auth_token = Some(config.auth_token.trim().to_string()).filter(|token| !token.is_empty());
        Ok(Self {
            client,
            endpoint: config.endpoint.trim().trim_end_matches('/').to_string(),
            auth_token,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call<T>(
        &self,
        kind: FunctionKind,
        stage: &'static str,
        path: &'static str,
        args: Value,
    ) -> RemoteResult<T>
    where
        T: DeserializeOwned,
    {
        let url = format!("{}/{}", self.endpoint, kind.route());
        let mut request = self.client.post(&url).json(&json!({
            "path": path,
            "args": args,
            "format": "json",
        }));
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|error| transport_error(stage, error))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| transport_error(stage, error))?;
        if !status.is_success() {
            return Err(RemoteError::Status {
                stage,
                status: status.as_u16(),
                body,
            });
        }

        let envelope: Envelope = serde_json::from_str(&body).context(DecodeResponseSnafu { stage })?;
        if envelope.status != "success" {
            let details = envelope
                .error_message
                .unwrap_or_else(|| format!("status `{}`", envelope.status));
            tracing::warn!(stage, path, %details, "remote function rejected the call");
            return Err(RemoteError::Rejected { stage, details });
        }

        serde_json::from_value(envelope.value).context(DecodeResponseSnafu { stage })
    }
}

fn transport_error(stage: &'static str, error: reqwest::Error) -> RemoteError {
    if error.is_timeout() {
        RemoteError::Timeout { stage }
    } else {
        RemoteError::Http {
            stage,
            source: error,
        }
    }
}

impl RemoteAuthority for HttpAuthority {
    fn create_chat(&self, request: CreateChatRequest) -> BoxFuture<'_, RemoteResult<Chat>> {
        Box::pin(async move {
            let args = json!(request);
            self.call(FunctionKind::Mutation, "create-chat", "chats:create", args)
                .await
        })
    }

    fn delete_chat(&self, chat_id: DurableChatId) -> BoxFuture<'_, RemoteResult<()>> {
        Box::pin(async move {
            let args = json!({ "chatId": chat_id });
            self.call(FunctionKind::Mutation, "delete-chat", "chats:remove", args)
                .await
        })
    }

    fn update_chat_model(
        &self,
        chat_id: DurableChatId,
        model: String,
    ) -> BoxFuture<'_, RemoteResult<()>> {
        Box::pin(async move {
            let args = json!({ "chatId": chat_id, "model": model });
            self.call(
                FunctionKind::Mutation,
                "update-chat-model",
                "chats:updateModel",
                args,
            )
            .await
        })
    }

    fn update_chat_visibility(
        &self,
        chat_id: DurableChatId,
        is_public: bool,
    ) -> BoxFuture<'_, RemoteResult<()>> {
        Box::pin(async move {
            let args = json!({ "chatId": chat_id, "isPublic": is_public });
            self.call(
                FunctionKind::Mutation,
                "update-chat-visibility",
                "chats:updateVisibility",
                args,
            )
            .await
        })
    }

    fn add_message(&self, request: AddMessageRequest) -> BoxFuture<'_, RemoteResult<Message>> {
        Box::pin(async move {
            let args = json!(request);
            self.call(FunctionKind::Mutation, "add-message", "messages:add", args)
                .await
        })
    }

    fn switch_message_version(
        &self,
        message_id: DurableMessageId,
    ) -> BoxFuture<'_, RemoteResult<Vec<Message>>> {
        Box::pin(async move {
            let args = json!({ "messageId": message_id });
            self.call(
                FunctionKind::Mutation,
                "switch-message-version",
                "messages:switchVersion",
                args,
            )
            .await
        })
    }

    fn mark_as_original_version(
        &self,
        message_id: DurableMessageId,
    ) -> BoxFuture<'_, RemoteResult<()>> {
        Box::pin(async move {
            let args = json!({ "messageId": message_id });
            self.call(
                FunctionKind::Mutation,
                "mark-as-original-version",
                "messages:markAsOriginal",
                args,
            )
            .await
        })
    }

    fn get_messages(&self, chat_id: DurableChatId) -> BoxFuture<'_, RemoteResult<Vec<Message>>> {
        Box::pin(async move {
            let args = json!({ "chatId": chat_id });
            self.call(FunctionKind::Query, "get-messages", "messages:list", args)
                .await
        })
    }

    fn list_chats(&self, owner_id: String) -> BoxFuture<'_, RemoteResult<Vec<Chat>>> {
        Box::pin(async move {
            let args = json!({ "ownerId": owner_id });
            self.call(FunctionKind::Query, "list-chats", "chats:list", args)
                .await
        })
    }

    fn list_public_chats(&self) -> BoxFuture<'_, RemoteResult<Vec<Chat>>> {
        Box::pin(async move {
            self.call(
                FunctionKind::Query,
                "list-public-chats",
                "chats:listPublic",
                json!({}),
            )
            .await
        })
    }
}
