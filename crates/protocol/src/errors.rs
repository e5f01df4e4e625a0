//! Error taxonomy for the sync engine.

use thiserror::Error;

/// Result type alias for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Main error type for the sync engine.
///
/// Duplicate or stale events are deliberately absent: the store absorbs them
/// through idempotent upserts and they never surface as errors.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("network error: {message}")]
    Network { message: String },

    #[error("request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("server rejected the request ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("turn timed out in conversation {conversation_id}")]
    WatchdogTimeout { conversation_id: String },

    #[error("push channel error: {message}")]
    Channel { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl SyncError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn timeout(seconds: u64) -> Self {
        Self::Timeout { seconds }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn channel(message: impl Into<String>) -> Self {
        Self::Channel {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Network-class failures are retried locally and then queued offline;
    /// everything else surfaces immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Timeout { .. })
    }

    /// Stable code used in message metadata and user-facing notices.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Network { .. } => "NETWORK_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Api { .. } => "API_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::WatchdogTimeout { .. } => "WATCHDOG_TIMEOUT",
            Self::Channel { .. } => "CHANNEL_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(SyncError::network("connection refused").is_retryable());
        assert!(SyncError::timeout(30).is_retryable());
        assert!(!SyncError::validation("empty message").is_retryable());
        assert!(!SyncError::api(422, "bad request").is_retryable());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(SyncError::network("x").code(), "NETWORK_ERROR");
        assert_eq!(SyncError::timeout(1).code(), "TIMEOUT");
        assert_eq!(SyncError::validation("x").code(), "VALIDATION_ERROR");
    }
}
