use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Conversation-lifecycle events fanned out to sibling tabs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventKind {
    ConversationCreated,
    ConversationRenamed,
    ConversationDeleted,
}

/// The cross-tab envelope. Ephemeral: it exists for the duration of one
/// broadcast cycle and is never persisted beyond delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub kind: SyncEventKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl SyncMessage {
    pub fn new(kind: SyncEventKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }
}
