use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An outbound send awaiting network confirmation, persisted durably so it
/// survives a restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, sqlx::FromRow)]
pub struct QueuedMessage {
    /// Correlation id of the optimistic message this entry backs.
    pub temp_id: String,
    /// The message text to resend.
    pub body: String,
    /// Target conversation; `None` when the send would create one.
    pub conversation_id: Option<String>,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
}

impl QueuedMessage {
    pub fn new(temp_id: impl Into<String>, body: impl Into<String>, conversation_id: Option<String>) -> Self {
        Self {
            temp_id: temp_id.into(),
            body: body.into(),
            conversation_id,
            retry_count: 0,
            created_at: Utc::now(),
        }
    }
}
