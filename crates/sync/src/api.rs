//! REST client for the chat backend.
//!
//! Everything network-facing sits behind the [`ChatApi`] trait so the sender
//! pipeline and the offline queue can be exercised against a mock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

use printline_config::ApiConfig;
use printline_protocol::{
    ChatMessage, Conversation, MessageContent, MessageStatus, SenderType, SyncError, SyncResult,
};

/// What a successful send came back with.
#[derive(Debug, Clone, Default)]
pub struct SendOutcome {
    /// Set when the send created the conversation server-side.
    pub new_conversation: Option<Conversation>,
    /// Server echo of the user message, carrying its assigned id.
    pub message: Option<ChatMessage>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn send_message(
        &self,
        text: String,
        client_side_id: String,
        conversation_id: Option<String>,
        context: Option<Value>,
    ) -> SyncResult<SendOutcome>;

    async fn fetch_history(
        &self,
        conversation_id: String,
        page: u32,
        page_size: u32,
    ) -> SyncResult<Vec<ChatMessage>>;

    async fn list_conversations(&self, kind: Option<String>) -> SyncResult<Vec<Conversation>>;

    async fn rename_conversation(&self, id: String, title: String) -> SyncResult<()>;

    async fn delete_conversation(&self, id: String) -> SyncResult<()>;
}

/// Production [`ChatApi`] over reqwest.
pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    timeout_seconds: u64,
}

impl HttpChatApi {
    pub fn new(config: &ApiConfig) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| SyncError::internal(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
            timeout_seconds: config.request_timeout_seconds,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, format!("{}{path}", self.base_url));
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    fn map_error(&self, error: reqwest::Error) -> SyncError {
        if error.is_timeout() {
            SyncError::timeout(self.timeout_seconds)
        } else if error.is_connect() || error.is_request() {
            SyncError::network(error.to_string())
        } else {
            SyncError::internal(error.to_string())
        }
    }

    async fn check(&self, response: reqwest::Response) -> SyncResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(SyncError::api(status.as_u16(), message))
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn send_message(
        &self,
        text: String,
        client_side_id: String,
        conversation_id: Option<String>,
        context: Option<Value>,
    ) -> SyncResult<SendOutcome> {
        let body = SendRequest {
            message: text,
            client_side_id,
            conversation_id,
            context,
        };
        let response = self
            .request(reqwest::Method::POST, "/chat/message")
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;
        let response = self.check(response).await?;
        let parsed: SendResponse = response.json().await.map_err(|e| self.map_error(e))?;

        debug!(
            new_conversation = parsed.conversation.is_some(),
            "send confirmed"
        );
        Ok(SendOutcome {
            new_conversation: parsed.conversation.map(ApiConversation::into_conversation),
            message: parsed.message.map(ApiMessage::into_message),
        })
    }

    async fn fetch_history(
        &self,
        conversation_id: String,
        page: u32,
        page_size: u32,
    ) -> SyncResult<Vec<ChatMessage>> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/chat/history/{conversation_id}"),
            )
            .query(&[("page", page), ("limit", page_size)])
            .send()
            .await
            .map_err(|e| self.map_error(e))?;
        let response = self.check(response).await?;
        let parsed: HistoryResponse = response.json().await.map_err(|e| self.map_error(e))?;
        Ok(parsed
            .messages
            .into_iter()
            .map(ApiMessage::into_message)
            .collect())
    }

    async fn list_conversations(&self, kind: Option<String>) -> SyncResult<Vec<Conversation>> {
        let mut request = self.request(reqwest::Method::GET, "/chat/conversations");
        if let Some(kind) = kind {
            request = request.query(&[("type", kind)]);
        }
        let response = request.send().await.map_err(|e| self.map_error(e))?;
        let response = self.check(response).await?;
        let parsed: ConversationsResponse =
            response.json().await.map_err(|e| self.map_error(e))?;
        Ok(parsed
            .conversations
            .into_iter()
            .map(ApiConversation::into_conversation)
            .collect())
    }

    async fn rename_conversation(&self, id: String, title: String) -> SyncResult<()> {
        let response = self
            .request(reqwest::Method::PUT, &format!("/chat/conversations/{id}"))
            .json(&serde_json::json!({ "title": title }))
            .send()
            .await
            .map_err(|e| self.map_error(e))?;
        self.check(response).await?;
        Ok(())
    }

    async fn delete_conversation(&self, id: String) -> SyncResult<()> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("/chat/conversations/{id}"),
            )
            .send()
            .await
            .map_err(|e| self.map_error(e))?;
        self.check(response).await?;
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest {
    message: String,
    // Echoed back by the server so the optimistic entry can be unified.
    client_side_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    #[serde(default, alias = "newConversation")]
    conversation: Option<ApiConversation>,
    #[serde(default)]
    message: Option<ApiMessage>,
}

#[derive(Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    messages: Vec<ApiMessage>,
}

#[derive(Deserialize)]
struct ConversationsResponse {
    #[serde(default)]
    conversations: Vec<ApiConversation>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiMessage {
    #[serde(alias = "_id")]
    id: String,
    #[serde(default)]
    client_side_id: Option<String>,
    conversation_id: String,
    #[serde(default)]
    sender_type: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: Option<MessageStatus>,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl ApiMessage {
    fn into_message(self) -> ChatMessage {
        ChatMessage {
            id: self.id,
            client_side_id: self.client_side_id,
            conversation_id: self.conversation_id,
            sender: self
                .sender_type
                .as_deref()
                .map(SenderType::from)
                .unwrap_or(SenderType::Ai),
            content: MessageContent::text(self.message.unwrap_or_default()),
            status: self.status.unwrap_or(MessageStatus::Sent),
            metadata: self.metadata.unwrap_or_default(),
            created_at: self.created_at.unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiConversation {
    #[serde(alias = "_id")]
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, alias = "type")]
    kind: Option<String>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

impl ApiConversation {
    fn into_conversation(self) -> Conversation {
        Conversation {
            id: self.id,
            title: self.title.unwrap_or_else(|| "New chat".to_string()),
            updated_at: self.updated_at.unwrap_or_else(Utc::now),
            kind: self.kind.unwrap_or_else(Conversation::default_kind),
        }
    }
}
