use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Who produced a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SenderType {
    User,
    #[serde(rename = "AI", alias = "Ai", alias = "ai")]
    Ai,
    System,
}

impl From<&str> for SenderType {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "ai" | "assistant" | "system_bot" => SenderType::Ai,
            "system" => SenderType::System,
            _ => SenderType::User,
        }
    }
}

/// Delivery state of a message.
///
/// `Sent` is terminal: once a message reaches it, no later event may move it
/// back. The store enforces this; callers only propose transitions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sending,
    Thinking,
    Streaming,
    Sent,
    Retrying,
    Failed,
}

impl MessageStatus {
    /// Terminal states never transition further.
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Sent | MessageStatus::Failed)
    }

    /// States the watchdog considers "stuck" when its timer fires.
    pub fn is_in_flight(self) -> bool {
        matches!(self, MessageStatus::Thinking | MessageStatus::Streaming)
    }
}

/// Message payload variants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageContent {
    Text {
        text: String,
    },
    Media {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    Error {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        MessageContent::Text { text: text.into() }
    }

    pub fn error(text: impl Into<String>, code: Option<String>) -> Self {
        MessageContent::Error {
            text: text.into(),
            code,
        }
    }

    /// An empty text body. Placeholders start here and streams append to it.
    pub fn empty() -> Self {
        MessageContent::Text {
            text: String::new(),
        }
    }

    /// True when the content carries nothing useful. Upserts keep the
    /// existing content in that case instead of blanking it.
    pub fn is_empty(&self) -> bool {
        matches!(self, MessageContent::Text { text } if text.is_empty())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text { text } | MessageContent::Error { text, .. } => Some(text),
            MessageContent::Media { .. } => None,
        }
    }
}

/// A single chat message as the store tracks it.
///
/// Identity is the pair (`id` OR `client_side_id`): a locally-minted entry
/// carries a correlation id before the server id is known, and reconciliation
/// collapses the two into one record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_side_id: Option<String>,
    pub conversation_id: String,
    pub sender: SenderType,
    pub content: MessageContent,
    pub status: MessageStatus,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

/// Metadata key marking an AI placeholder awaiting its real message id.
pub const META_TEMP_PLACEHOLDER: &str = "temp_placeholder";
/// Metadata keys carrying the live thinking indicator.
pub const META_THINKING_ICON: &str = "thinking_icon";
pub const META_THINKING_TEXT: &str = "thinking_text";
/// Metadata key recording the error code of a failed send.
pub const META_ERROR_CODE: &str = "error_code";
/// Metadata key counting retry attempts on an outbound message.
pub const META_RETRY_COUNT: &str = "retry_count";

impl ChatMessage {
    /// Build an optimistic user message for an outbound send.
    pub fn outbound(text: impl Into<String>, conversation_id: impl Into<String>, client_side_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            client_side_id: Some(client_side_id.into()),
            conversation_id: conversation_id.into(),
            sender: SenderType::User,
            content: MessageContent::text(text),
            status: MessageStatus::Sending,
            metadata: Map::new(),
            created_at: Utc::now(),
        }
    }

    /// Build an AI placeholder inserted ahead of the real reply.
    pub fn ai_placeholder(conversation_id: impl Into<String>) -> Self {
        let mut metadata = Map::new();
        metadata.insert(META_TEMP_PLACEHOLDER.to_string(), Value::Bool(true));
        Self {
            id: format!("temp_ai_{}", cuid2::create_id()),
            client_side_id: None,
            conversation_id: conversation_id.into(),
            sender: SenderType::Ai,
            content: MessageContent::empty(),
            status: MessageStatus::Pending,
            metadata,
            created_at: Utc::now(),
        }
    }

    /// Build a synthetic error bubble appended after a failed send.
    pub fn error_notice(conversation_id: impl Into<String>, text: impl Into<String>, code: Option<String>) -> Self {
        let mut metadata = Map::new();
        if let Some(code) = &code {
            metadata.insert(META_ERROR_CODE.to_string(), Value::String(code.clone()));
        }
        Self {
            id: Uuid::new_v4().to_string(),
            client_side_id: None,
            conversation_id: conversation_id.into(),
            sender: SenderType::Ai,
            content: MessageContent::error(text, code),
            status: MessageStatus::Sent,
            metadata,
            created_at: Utc::now(),
        }
    }

    /// True when `key` matches either identity of this message.
    pub fn matches_id(&self, key: &str) -> bool {
        self.id == key || self.client_side_id.as_deref() == Some(key)
    }

    /// True when this is an AI placeholder still waiting for its stream.
    pub fn is_placeholder(&self) -> bool {
        self.sender == SenderType::Ai
            && (self.status == MessageStatus::Pending
                || self
                    .metadata
                    .get(META_TEMP_PLACEHOLDER)
                    .and_then(Value::as_bool)
                    .unwrap_or(false))
    }
}

/// Shallow patch applied to an existing message.
///
/// Absent fields leave the current value untouched; `metadata` keys are
/// merged over the existing bag rather than replacing it, and a null value
/// removes its key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl MessagePatch {
    pub fn status(status: MessageStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_type_from_role_strings() {
        assert_eq!(SenderType::from("assistant"), SenderType::Ai);
        assert_eq!(SenderType::from("AI"), SenderType::Ai);
        assert_eq!(SenderType::from("system"), SenderType::System);
        assert_eq!(SenderType::from("user"), SenderType::User);
        assert_eq!(SenderType::from("anything-else"), SenderType::User);
    }

    #[test]
    fn terminal_states() {
        assert!(MessageStatus::Sent.is_terminal());
        assert!(MessageStatus::Failed.is_terminal());
        assert!(!MessageStatus::Streaming.is_terminal());
        assert!(MessageStatus::Streaming.is_in_flight());
        assert!(!MessageStatus::Sent.is_in_flight());
    }

    #[test]
    fn outbound_message_identity() {
        let msg = ChatMessage::outbound("hello", "conv-1", "client_abc");
        assert!(msg.matches_id(&msg.id));
        assert!(msg.matches_id("client_abc"));
        assert!(!msg.matches_id("other"));
        assert_eq!(msg.status, MessageStatus::Sending);
    }

    #[test]
    fn placeholder_detection() {
        let placeholder = ChatMessage::ai_placeholder("conv-1");
        assert!(placeholder.is_placeholder());
        assert!(placeholder.content.is_empty());

        let user = ChatMessage::outbound("hi", "conv-1", "c1");
        assert!(!user.is_placeholder());
    }

    #[test]
    fn content_round_trips_as_tagged_json() {
        let content = MessageContent::error("boom", Some("NETWORK_ERROR".into()));
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["type"], "error");
        let back: MessageContent = serde_json::from_value(json).unwrap();
        assert_eq!(back, content);
    }
}
