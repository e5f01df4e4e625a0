//! Printline sync crate
//!
//! The moving parts that talk to the outside world: the REST client behind
//! the [`ChatApi`] trait, the bounded retry manager, the optimistic sender
//! pipeline, and the router that applies push-channel events to local state.

pub mod api;
pub mod channel;
pub mod notice;
pub mod retry;
pub mod router;
pub mod sender;

pub use api::{ChatApi, HttpChatApi, SendOutcome};
pub use channel::{PushChannel, PushFrame, WsPushChannel};
pub use notice::EngineNotice;
pub use retry::RetryManager;
pub use router::SyncRouter;
pub use sender::SenderPipeline;
