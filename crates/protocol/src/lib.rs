//! Domain types and wire contracts for the Printline synchronization engine.
//!
//! Everything that crosses a boundary (the push channel, the REST client,
//! durable local storage, the cross-tab envelope) is defined here so the
//! higher crates agree on one vocabulary.

pub mod conversation;
pub mod errors;
pub mod events;
pub mod message;
pub mod queue;
pub mod tabsync;

pub use conversation::{is_temp_id, Conversation, TEMP_ID_PREFIX};
pub use errors::{SyncError, SyncResult};
pub use events::{PushEvent, ThinkingPhase};
pub use message::{
    ChatMessage, MessageContent, MessagePatch, MessageStatus, SenderType, META_ERROR_CODE,
    META_RETRY_COUNT, META_TEMP_PLACEHOLDER, META_THINKING_ICON, META_THINKING_TEXT,
};
pub use queue::QueuedMessage;
pub use tabsync::{SyncEventKind, SyncMessage};
