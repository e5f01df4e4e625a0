//! Cross-tab conversation sync.
//!
//! Propagates conversation creation, rename, and deletion between open
//! instances of the same session so every tab reflects the change without
//! re-polling the server. Delivery runs over a pluggable [`TabTransport`];
//! picking a transport is configuration, not business logic.

pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use printline_protocol::{SyncEventKind, SyncMessage, SyncResult};

pub use transport::{ChannelHub, ChannelTransport, StorageTransport, TabEnvelope, TabTransport};

const SUBSCRIBER_CAPACITY: usize = 32;

/// Publish/subscribe fan-out for conversation lifecycle events, keyed by
/// [`SyncEventKind`]. The originating tab never hears its own broadcast.
pub struct CrossTabSync {
    tab_id: String,
    transport: Arc<dyn TabTransport>,
    subscribers: Arc<RwLock<HashMap<SyncEventKind, broadcast::Sender<SyncMessage>>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl CrossTabSync {
    pub fn new(transport: Arc<dyn TabTransport>) -> Self {
        Self {
            tab_id: cuid2::create_id(),
            transport,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            reader: Mutex::new(None),
        }
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    /// Begin receiving broadcasts from sibling tabs.
    pub async fn start(&self) -> SyncResult<()> {
        let mut incoming = self.transport.incoming().await?;
        let own_id = self.tab_id.clone();
        let subscribers = self.subscribers.clone();

        let handle = tokio::spawn(async move {
            while let Some(envelope) = incoming.recv().await {
                if envelope.origin == own_id {
                    continue;
                }
                let kind = envelope.message.kind;
                let senders = subscribers.read().await;
                if let Some(sender) = senders.get(&kind) {
                    if sender.send(envelope.message).is_err() {
                        debug!(?kind, "no live subscribers for tab sync event");
                    }
                }
            }
        });

        let mut reader = self.reader.lock().await;
        if let Some(previous) = reader.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Broadcast an event to every other tab.
    pub async fn publish(&self, kind: SyncEventKind, payload: Value) -> SyncResult<()> {
        let envelope = TabEnvelope {
            origin: self.tab_id.clone(),
            message: SyncMessage::new(kind, payload),
        };
        if let Err(error) = self.transport.publish(envelope).await {
            warn!(%error, ?kind, "failed to broadcast tab sync event");
            return Err(error);
        }
        Ok(())
    }

    /// Subscribe to one kind of event from sibling tabs.
    pub async fn subscribe(&self, kind: SyncEventKind) -> broadcast::Receiver<SyncMessage> {
        let mut senders = self.subscribers.write().await;
        senders
            .entry(kind)
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_CAPACITY).0)
            .subscribe()
    }

    pub async fn shutdown(&self) {
        let mut reader = self.reader.lock().await;
        if let Some(handle) = reader.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn sibling_tab_receives_broadcast() {
        let hub = ChannelHub::new();
        let tab_a = CrossTabSync::new(Arc::new(ChannelTransport::new(hub.clone())));
        let tab_b = CrossTabSync::new(Arc::new(ChannelTransport::new(hub)));
        tab_a.start().await.unwrap();
        tab_b.start().await.unwrap();

        let mut created = tab_b.subscribe(SyncEventKind::ConversationCreated).await;
        tab_a
            .publish(
                SyncEventKind::ConversationCreated,
                json!({ "id": "conv-1", "title": "New chat" }),
            )
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), created.recv())
            .await
            .expect("broadcast should arrive")
            .unwrap();
        assert_eq!(received.kind, SyncEventKind::ConversationCreated);
        assert_eq!(received.payload["id"], "conv-1");
    }

    #[tokio::test]
    async fn origin_tab_never_hears_itself() {
        let hub = ChannelHub::new();
        let tab = CrossTabSync::new(Arc::new(ChannelTransport::new(hub)));
        tab.start().await.unwrap();

        let mut deleted = tab.subscribe(SyncEventKind::ConversationDeleted).await;
        tab.publish(SyncEventKind::ConversationDeleted, json!({ "id": "conv-1" }))
            .await
            .unwrap();

        let outcome = tokio::time::timeout(Duration::from_millis(200), deleted.recv()).await;
        assert!(outcome.is_err(), "own broadcasts must be filtered");
    }

    #[tokio::test]
    async fn subscription_is_scoped_to_the_event_kind() {
        let hub = ChannelHub::new();
        let tab_a = CrossTabSync::new(Arc::new(ChannelTransport::new(hub.clone())));
        let tab_b = CrossTabSync::new(Arc::new(ChannelTransport::new(hub)));
        tab_a.start().await.unwrap();
        tab_b.start().await.unwrap();

        let mut renamed = tab_b.subscribe(SyncEventKind::ConversationRenamed).await;
        tab_a
            .publish(SyncEventKind::ConversationDeleted, json!({ "id": "conv-1" }))
            .await
            .unwrap();

        let outcome = tokio::time::timeout(Duration::from_millis(200), renamed.recv()).await;
        assert!(outcome.is_err());
    }
}
