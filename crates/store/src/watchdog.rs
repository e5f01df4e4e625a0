//! Turn safety watchdog.
//!
//! Armed on every send, re-armed on activity, disarmed on any terminal
//! event. If the timer runs out first, every message still in flight in the
//! watched conversation is forced into an error state exactly once and a
//! timeout notice is published, so the UI never sits on a spinner forever.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::MessageStore;

const TIMEOUT_TEXT: &str = "The response took too long. Please try again.";
const TIMEOUT_CODE: &str = "TIMEOUT";

/// A conversation id whose turn timed out.
pub type TimeoutNotice = String;

#[derive(Clone)]
pub struct Watchdog {
    timeout: Duration,
    store: MessageStore,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
    timeouts: broadcast::Sender<TimeoutNotice>,
}

impl Watchdog {
    pub fn new(timeout: Duration, store: MessageStore) -> Self {
        let (timeouts, _) = broadcast::channel(16);
        Self {
            timeout,
            store,
            task: Arc::new(Mutex::new(None)),
            timeouts,
        }
    }

    /// Subscribe to timeout notices. Each fired timeout is delivered once per
    /// subscriber.
    pub fn subscribe(&self) -> broadcast::Receiver<TimeoutNotice> {
        self.timeouts.subscribe()
    }

    /// Start (or restart) the timer for a conversation's active turn. Only
    /// one timer runs at a time; re-arming cancels the previous one.
    pub async fn arm(&self, conversation_id: &str) {
        let timeout = self.timeout;
        let store = self.store.clone();
        let timeouts = self.timeouts.clone();
        let conversation_id = conversation_id.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let flipped = store
                .fail_in_flight(&conversation_id, TIMEOUT_TEXT, TIMEOUT_CODE)
                .await;
            warn!(
                conversation_id = %conversation_id,
                stuck = flipped,
                timeout_seconds = timeout.as_secs(),
                "turn watchdog fired"
            );
            let _ = timeouts.send(conversation_id);
        });

        let mut task = self.task.lock().await;
        if let Some(previous) = task.replace(handle) {
            previous.abort();
        }
    }

    /// Cancel the active timer, if any. Called on terminal events and on
    /// engine teardown.
    pub async fn disarm(&self) {
        let mut task = self.task.lock().await;
        if let Some(previous) = task.take() {
            previous.abort();
        }
    }
}
