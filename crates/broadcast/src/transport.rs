//! Tab transport implementations.
//!
//! `ChannelTransport` fans out over a shared in-process broadcast channel.
//! `StorageTransport` writes envelopes to a shared SQLite log that sibling
//! tabs observe with a polling cursor, mirroring the storage-event pattern
//! of browser tabs sharing localStorage.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use printline_protocol::{SyncMessage, SyncResult};

const HUB_CAPACITY: usize = 64;
const INCOMING_CAPACITY: usize = 64;
const LOG_RETENTION_SECONDS: i64 = 60;

/// Origin-tagged wrapper around a [`SyncMessage`]. The origin lets each tab
/// drop its own broadcasts on receive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabEnvelope {
    pub origin: String,
    pub message: SyncMessage,
}

/// Delivery mechanism between tabs.
#[async_trait]
pub trait TabTransport: Send + Sync {
    async fn publish(&self, envelope: TabEnvelope) -> SyncResult<()>;

    /// Open the stream of envelopes published by any tab, own ones included.
    async fn incoming(&self) -> SyncResult<mpsc::Receiver<TabEnvelope>>;
}

/// The shared primitive every in-process tab handle connects to.
#[derive(Clone)]
pub struct ChannelHub {
    sender: broadcast::Sender<TabEnvelope>,
}

impl ChannelHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(HUB_CAPACITY);
        Self { sender }
    }
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new()
    }
}

/// In-process transport over a shared broadcast channel.
pub struct ChannelTransport {
    hub: ChannelHub,
}

impl ChannelTransport {
    pub fn new(hub: ChannelHub) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl TabTransport for ChannelTransport {
    async fn publish(&self, envelope: TabEnvelope) -> SyncResult<()> {
        // No live receivers just means no other tab is open.
        let _ = self.hub.sender.send(envelope);
        Ok(())
    }

    async fn incoming(&self) -> SyncResult<mpsc::Receiver<TabEnvelope>> {
        let mut source = self.hub.sender.subscribe();
        let (tx, rx) = mpsc::channel(INCOMING_CAPACITY);
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(envelope) => {
                        if tx.send(envelope).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "tab transport lagged, dropping envelopes");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}

/// Write-then-observe transport over a shared SQLite log table. Each tab
/// polls past its own cursor; rows stay in the log until they age out so
/// every polling tab sees them, not just the first one to poll.
pub struct StorageTransport {
    pool: SqlitePool,
    poll_interval: Duration,
}

impl StorageTransport {
    pub async fn open(pool: SqlitePool, poll_interval: Duration) -> SyncResult<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tab_sync_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                origin TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;
        Ok(Self {
            pool,
            poll_interval,
        })
    }

    async fn drain_after(pool: &SqlitePool, cursor: i64) -> SyncResult<(i64, Vec<TabEnvelope>)> {
        let rows: Vec<(i64, String, String)> =
            sqlx::query_as("SELECT id, origin, payload FROM tab_sync_log WHERE id > ? ORDER BY id")
                .bind(cursor)
                .fetch_all(pool)
                .await?;

        let mut latest = cursor;
        let mut envelopes = Vec::with_capacity(rows.len());
        for (id, origin, payload) in rows {
            latest = id;
            match serde_json::from_str::<SyncMessage>(&payload) {
                Ok(message) => envelopes.push(TabEnvelope { origin, message }),
                Err(error) => warn!(%error, id, "skipping malformed tab sync row"),
            }
        }

        let horizon = Utc::now() - chrono::Duration::seconds(LOG_RETENTION_SECONDS);
        sqlx::query("DELETE FROM tab_sync_log WHERE created_at < ?")
            .bind(horizon)
            .execute(pool)
            .await?;
        Ok((latest, envelopes))
    }
}

#[async_trait]
impl TabTransport for StorageTransport {
    async fn publish(&self, envelope: TabEnvelope) -> SyncResult<()> {
        let payload = serde_json::to_string(&envelope.message)?;
        sqlx::query("INSERT INTO tab_sync_log (origin, payload, created_at) VALUES (?, ?, ?)")
            .bind(&envelope.origin)
            .bind(payload)
            .bind(envelope.message.timestamp)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn incoming(&self) -> SyncResult<mpsc::Receiver<TabEnvelope>> {
        // Start past whatever is already in the log: a freshly attached tab
        // only sees broadcasts published after it connected.
        let (cursor,): (Option<i64>,) = sqlx::query_as("SELECT MAX(id) FROM tab_sync_log")
            .fetch_one(&self.pool)
            .await?;
        let mut cursor = cursor.unwrap_or(0);

        let pool = self.pool.clone();
        let interval = self.poll_interval;
        let (tx, rx) = mpsc::channel(INCOMING_CAPACITY);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match Self::drain_after(&pool, cursor).await {
                    Ok((latest, envelopes)) => {
                        cursor = latest;
                        for envelope in envelopes {
                            if tx.send(envelope).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(error) => warn!(%error, "tab sync poll failed"),
                }
                if tx.is_closed() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use printline_protocol::SyncEventKind;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::TempDir;

    #[tokio::test]
    async fn storage_transport_delivers_and_prunes_aged_rows() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("tabs.db").display());
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .unwrap();

        let transport = StorageTransport::open(pool.clone(), Duration::from_millis(10))
            .await
            .unwrap();

        // A row already past the retention horizon.
        let mut stale = SyncMessage::new(SyncEventKind::ConversationDeleted, json!({ "id": "x" }));
        stale.timestamp = Utc::now() - chrono::Duration::seconds(LOG_RETENTION_SECONDS * 2);
        sqlx::query("INSERT INTO tab_sync_log (origin, payload, created_at) VALUES (?, ?, ?)")
            .bind("tab-old")
            .bind(serde_json::to_string(&stale).unwrap())
            .bind(stale.timestamp)
            .execute(&pool)
            .await
            .unwrap();

        let mut incoming = transport.incoming().await.unwrap();

        transport
            .publish(TabEnvelope {
                origin: "tab-a".to_string(),
                message: SyncMessage::new(
                    SyncEventKind::ConversationCreated,
                    json!({ "id": "conv-1" }),
                ),
            })
            .await
            .unwrap();

        let envelope = tokio::time::timeout(Duration::from_secs(2), incoming.recv())
            .await
            .expect("poll should deliver the envelope")
            .unwrap();
        assert_eq!(envelope.origin, "tab-a");
        assert_eq!(envelope.message.payload["id"], "conv-1");

        // Fresh rows survive for other tabs; aged ones are pruned.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let origins: Vec<(String,)> = sqlx::query_as("SELECT origin FROM tab_sync_log")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(origins, vec![("tab-a".to_string(),)]);
    }

    #[tokio::test]
    async fn storage_transport_skips_history_before_attach() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("tabs.db").display());
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .unwrap();

        let transport = StorageTransport::open(pool.clone(), Duration::from_millis(10))
            .await
            .unwrap();
        transport
            .publish(TabEnvelope {
                origin: "tab-a".to_string(),
                message: SyncMessage::new(
                    SyncEventKind::ConversationDeleted,
                    json!({ "id": "old" }),
                ),
            })
            .await
            .unwrap();

        let mut incoming = transport.incoming().await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_millis(100), incoming.recv()).await;
        assert!(outcome.is_err(), "pre-attach rows must not replay");
    }
}
