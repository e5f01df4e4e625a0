use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix for locally-minted conversation ids awaiting server promotion.
pub const TEMP_ID_PREFIX: &str = "temp_";

/// A conversation as the registry tracks it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub updated_at: DateTime<Utc>,
    /// Free-form conversation class, e.g. `customer-bot`.
    #[serde(default = "Conversation::default_kind")]
    pub kind: String,
}

impl Conversation {
    pub fn default_kind() -> String {
        "customer-bot".to_string()
    }

    /// Mint a new local conversation awaiting its server id.
    pub fn temp() -> Self {
        Self {
            id: format!("{}{}", TEMP_ID_PREFIX, cuid2::create_id()),
            title: "New chat".to_string(),
            updated_at: Utc::now(),
            kind: Self::default_kind(),
        }
    }

    /// True for locally-minted ids that no server knows about yet.
    pub fn is_temp(&self) -> bool {
        is_temp_id(&self.id)
    }
}

/// Id-level check usable before a full `Conversation` exists.
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}
