//! Push-channel event contracts.
//!
//! The wire delivers loosely-shaped JSON under pusher-style event names. All
//! of it is decoded into tagged variants here, at the ingestion boundary;
//! nothing past this module ever sees an open-shaped payload.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::conversation::Conversation;
use crate::errors::{SyncError, SyncResult};
use crate::message::{ChatMessage, MessageContent, MessageStatus, SenderType};

/// Wire event names as the push channel emits them.
pub const EV_THINKING_UPDATE: &str = "ai:thinking:update";
pub const EV_STREAM_START: &str = "ai:stream:start";
pub const EV_STREAM_CHUNK: &str = "ai:stream:chunk";
pub const EV_MESSAGE_NEW: &str = "chat:message:new";
pub const EV_MESSAGE_UPDATED: &str = "chat:message:updated";
pub const EV_CONVERSATION_CREATED: &str = "conversation_created";
pub const EV_CONVERSATION_UPDATED: &str = "conversation_updated";

/// Whether a thinking update advances the indicator or closes the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingPhase {
    Running,
    Final,
}

/// A decoded push-channel event.
#[derive(Debug, Clone)]
pub enum PushEvent {
    ThinkingUpdate {
        conversation_id: String,
        icon: Option<String>,
        text: String,
        phase: ThinkingPhase,
    },
    StreamStart {
        message_id: String,
        conversation_id: String,
    },
    StreamChunk {
        message_id: Option<String>,
        conversation_id: String,
        text: String,
    },
    MessageNew(ChatMessage),
    MessageUpdated(ChatMessage),
    ConversationCreated(Conversation),
    ConversationUpdated {
        id: String,
        title: Option<String>,
        updated_at: Option<DateTime<Utc>>,
    },
}

impl PushEvent {
    /// Decode one wire frame. Unknown event names are an error the router
    /// logs and drops; malformed payloads never get further than this.
    pub fn decode(event: &str, data: Value) -> SyncResult<Self> {
        match event {
            EV_THINKING_UPDATE => {
                let wire: WireThinking = serde_json::from_value(data)?;
                Ok(PushEvent::ThinkingUpdate {
                    conversation_id: wire.conversation_id,
                    icon: wire.icon,
                    text: wire.text.unwrap_or_default(),
                    phase: wire.phase.unwrap_or(ThinkingPhase::Running),
                })
            }
            EV_STREAM_START => {
                let wire: WireStreamStart = serde_json::from_value(data)?;
                Ok(PushEvent::StreamStart {
                    message_id: wire.message_id,
                    conversation_id: wire.conversation_id,
                })
            }
            EV_STREAM_CHUNK => {
                let wire: WireStreamChunk = serde_json::from_value(data)?;
                Ok(PushEvent::StreamChunk {
                    message_id: wire.message_id,
                    conversation_id: wire.conversation_id,
                    text: wire.text,
                })
            }
            EV_MESSAGE_NEW => Ok(PushEvent::MessageNew(decode_message(data)?)),
            EV_MESSAGE_UPDATED => Ok(PushEvent::MessageUpdated(decode_message(data)?)),
            EV_CONVERSATION_CREATED => {
                let wire: WireConversation = serde_json::from_value(data)?;
                Ok(PushEvent::ConversationCreated(wire.into_conversation()))
            }
            EV_CONVERSATION_UPDATED => {
                let wire: WireConversationPatch = serde_json::from_value(data)?;
                Ok(PushEvent::ConversationUpdated {
                    id: wire.id,
                    title: wire.title,
                    updated_at: wire.updated_at,
                })
            }
            other => Err(SyncError::validation(format!(
                "unknown push event '{other}'"
            ))),
        }
    }

    /// Conversation this event targets, when it targets one.
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            PushEvent::ThinkingUpdate {
                conversation_id, ..
            }
            | PushEvent::StreamStart {
                conversation_id, ..
            }
            | PushEvent::StreamChunk {
                conversation_id, ..
            } => Some(conversation_id),
            PushEvent::MessageNew(msg) | PushEvent::MessageUpdated(msg) => {
                Some(&msg.conversation_id)
            }
            PushEvent::ConversationCreated(conv) => Some(&conv.id),
            PushEvent::ConversationUpdated { id, .. } => Some(id),
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            PushEvent::ThinkingUpdate { .. } => "thinking_update",
            PushEvent::StreamStart { .. } => "stream_start",
            PushEvent::StreamChunk { .. } => "stream_chunk",
            PushEvent::MessageNew(_) => "message_new",
            PushEvent::MessageUpdated(_) => "message_updated",
            PushEvent::ConversationCreated(_) => "conversation_created",
            PushEvent::ConversationUpdated { .. } => "conversation_updated",
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireThinking {
    conversation_id: String,
    #[serde(default)]
    icon: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default, rename = "type")]
    phase: Option<ThinkingPhase>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireStreamStart {
    message_id: String,
    conversation_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireStreamChunk {
    #[serde(default)]
    message_id: Option<String>,
    conversation_id: String,
    text: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(rename = "_id", alias = "id")]
    id: String,
    #[serde(default)]
    client_side_id: Option<String>,
    conversation_id: String,
    #[serde(default)]
    sender_type: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default, rename = "type")]
    message_type: Option<String>,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    status: Option<MessageStatus>,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

fn decode_message(data: Value) -> SyncResult<ChatMessage> {
    let wire: WireMessage = serde_json::from_value(data)?;

    // Older producers put the role under `role`, newer ones under
    // `senderType`; absent both, treat it as an AI message.
    let sender = wire
        .sender_type
        .as_deref()
        .or(wire.role.as_deref())
        .map(SenderType::from)
        .unwrap_or(SenderType::Ai);

    let text = wire
        .content
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let content = match wire.message_type.as_deref() {
        Some("error") => MessageContent::error(text, None),
        Some("image") | Some("file") | Some("media") => MessageContent::Media {
            url: wire
                .content
                .get("url")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            mime_type: wire
                .content
                .get("mimeType")
                .and_then(Value::as_str)
                .map(str::to_string),
            caption: if text.is_empty() { None } else { Some(text) },
        },
        _ => MessageContent::text(text),
    };

    Ok(ChatMessage {
        id: wire.id,
        client_side_id: wire.client_side_id,
        conversation_id: wire.conversation_id,
        sender,
        content,
        // A confirmed message from the server is delivered as sent unless it
        // says otherwise.
        status: wire.status.unwrap_or(MessageStatus::Sent),
        metadata: wire.metadata.unwrap_or_default(),
        created_at: wire.created_at.unwrap_or_else(Utc::now),
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireConversation {
    #[serde(rename = "_id", alias = "id")]
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

impl WireConversation {
    fn into_conversation(self) -> Conversation {
        Conversation {
            id: self.id,
            title: self.title.unwrap_or_else(|| "New chat".to_string()),
            updated_at: self.updated_at.unwrap_or_else(Utc::now),
            kind: self.kind.unwrap_or_else(Conversation::default_kind),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireConversationPatch {
    #[serde(rename = "_id", alias = "id")]
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_thinking_update() {
        let event = PushEvent::decode(
            EV_THINKING_UPDATE,
            json!({"conversationId": "c1", "icon": "🔍", "text": "Searching products"}),
        )
        .unwrap();
        match event {
            PushEvent::ThinkingUpdate {
                conversation_id,
                text,
                phase,
                ..
            } => {
                assert_eq!(conversation_id, "c1");
                assert_eq!(text, "Searching products");
                assert_eq!(phase, ThinkingPhase::Running);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn decodes_terminal_thinking_phase() {
        let event = PushEvent::decode(
            EV_THINKING_UPDATE,
            json!({"conversationId": "c1", "text": "Done", "type": "final"}),
        )
        .unwrap();
        assert!(matches!(
            event,
            PushEvent::ThinkingUpdate {
                phase: ThinkingPhase::Final,
                ..
            }
        ));
    }

    #[test]
    fn decodes_stream_chunk_without_message_id() {
        let event = PushEvent::decode(
            EV_STREAM_CHUNK,
            json!({"conversationId": "c1", "text": "Hel"}),
        )
        .unwrap();
        match event {
            PushEvent::StreamChunk {
                message_id,
                conversation_id,
                text,
            } => {
                assert!(message_id.is_none());
                assert_eq!(conversation_id, "c1");
                assert_eq!(text, "Hel");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn decodes_message_with_mongo_style_fields() {
        let event = PushEvent::decode(
            EV_MESSAGE_NEW,
            json!({
                "_id": "m1",
                "conversationId": "c1",
                "senderType": "AI",
                "type": "text",
                "content": {"text": "hello"},
                "createdAt": "2026-08-01T10:00:00Z"
            }),
        )
        .unwrap();
        match event {
            PushEvent::MessageNew(msg) => {
                assert_eq!(msg.id, "m1");
                assert_eq!(msg.sender, SenderType::Ai);
                assert_eq!(msg.status, MessageStatus::Sent);
                assert_eq!(msg.content.as_text(), Some("hello"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_event_names() {
        let err = PushEvent::decode("presence:join", json!({})).unwrap_err();
        assert!(matches!(err, SyncError::Validation { .. }));
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(PushEvent::decode(EV_STREAM_START, json!({"text": 42})).is_err());
    }

    #[test]
    fn decodes_conversation_created_with_defaults() {
        let event = PushEvent::decode(EV_CONVERSATION_CREATED, json!({"_id": "c9"})).unwrap();
        match event {
            PushEvent::ConversationCreated(conv) => {
                assert_eq!(conv.id, "c9");
                assert_eq!(conv.title, "New chat");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
