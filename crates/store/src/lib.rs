//! Printline state crate
//!
//! Holds the in-memory chat state shared by the sender pipeline and the sync
//! router: the per-conversation message store, the conversation registry with
//! the current selection, and the turn watchdog that unsticks frozen AI turns.

pub mod messages;
pub mod registry;
pub mod selection;
pub mod watchdog;

pub use messages::MessageStore;
pub use registry::ConversationRegistry;
pub use selection::SelectionStore;
pub use watchdog::Watchdog;
