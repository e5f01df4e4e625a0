//! User-visible engine notices.

use serde::{Deserialize, Serialize};

/// Events the presentation layer may want to surface to the user. Delivered
/// on the engine's broadcast notice channel; losing one is harmless.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineNotice {
    /// A send attempt failed and is being retried.
    Retrying { message_key: String, attempt: u32 },
    /// A send exhausted its retries and was saved for later delivery.
    SavedOffline { temp_id: String },
    /// The turn watchdog gave up on a conversation.
    WatchdogTimeout { conversation_id: String },
    /// An offline-queue flush finished.
    FlushCompleted {
        sent: usize,
        dropped: usize,
        remaining: usize,
    },
}
