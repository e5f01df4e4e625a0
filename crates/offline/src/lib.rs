//! Durable offline send queue.
//!
//! Messages that exhaust their network retries land here and survive a
//! restart. A flush drains the queue sequentially in insertion order with a
//! small delay between sends, so replayed messages arrive in the order the
//! user wrote them and never as a burst.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use printline_config::QueueConfig;
use printline_protocol::{QueuedMessage, SyncResult};

/// Result of one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    pub dropped: usize,
    pub remaining: usize,
}

impl FlushReport {
    /// True when a delayed re-flush should be scheduled.
    pub fn needs_reflush(&self) -> bool {
        self.remaining > 0
    }
}

#[derive(Clone)]
pub struct OfflineQueue {
    pool: SqlitePool,
    config: QueueConfig,
    flushing: Arc<AtomicBool>,
}

impl OfflineQueue {
    /// Open the queue over an existing pool, creating its table on first use.
    pub async fn open(pool: SqlitePool, config: QueueConfig) -> SyncResult<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queued_messages (
                temp_id TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                conversation_id TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            config,
            flushing: Arc::new(AtomicBool::new(false)),
        })
    }

    pub async fn add(&self, message: &QueuedMessage) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO queued_messages (temp_id, body, conversation_id, retry_count, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(temp_id) DO UPDATE SET
                body = excluded.body,
                conversation_id = excluded.conversation_id,
                retry_count = excluded.retry_count
            "#,
        )
        .bind(&message.temp_id)
        .bind(&message.body)
        .bind(&message.conversation_id)
        .bind(message.retry_count)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;
        debug!(temp_id = %message.temp_id, "queued message for offline send");
        Ok(())
    }

    pub async fn remove(&self, temp_id: &str) -> SyncResult<()> {
        sqlx::query("DELETE FROM queued_messages WHERE temp_id = ?")
            .bind(temp_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_retry_count(&self, temp_id: &str, retry_count: i64) -> SyncResult<()> {
        sqlx::query("UPDATE queued_messages SET retry_count = ? WHERE temp_id = ?")
            .bind(retry_count)
            .bind(temp_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All queued messages in insertion order.
    pub async fn entries(&self) -> SyncResult<Vec<QueuedMessage>> {
        let rows = sqlx::query_as::<_, QueuedMessage>(
            "SELECT temp_id, body, conversation_id, retry_count, created_at \
             FROM queued_messages ORDER BY rowid",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn len(&self) -> SyncResult<usize> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queued_messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    pub async fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Drain the queue one message at a time through `send`.
    ///
    /// Entries are processed in insertion order with a fixed delay between
    /// sends. A failed entry has its retry count bumped and stays queued;
    /// past the configured maximum it is dropped with a warning. Returns
    /// `None` when another flush is already running.
    pub async fn flush<F, Fut>(&self, send: F) -> SyncResult<Option<FlushReport>>
    where
        F: Fn(QueuedMessage) -> Fut,
        Fut: std::future::Future<Output = SyncResult<()>>,
    {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("offline flush already in progress, skipping");
            return Ok(None);
        }

        let result = self.flush_pass(send).await;
        self.flushing.store(false, Ordering::SeqCst);
        result.map(Some)
    }

    async fn flush_pass<F, Fut>(&self, send: F) -> SyncResult<FlushReport>
    where
        F: Fn(QueuedMessage) -> Fut,
        Fut: std::future::Future<Output = SyncResult<()>>,
    {
        let entries = self.entries().await?;
        if entries.is_empty() {
            return Ok(FlushReport::default());
        }
        info!(count = entries.len(), "flushing offline queue");

        let mut report = FlushReport::default();
        let delay = Duration::from_millis(self.config.flush_delay_ms);

        for (index, entry) in entries.into_iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(delay).await;
            }

            let temp_id = entry.temp_id.clone();
            let retry_count = entry.retry_count;
            match send(entry).await {
                Ok(()) => {
                    self.remove(&temp_id).await?;
                    report.sent += 1;
                }
                Err(error) => {
                    let next = retry_count + 1;
                    if next > self.config.max_retries {
                        warn!(
                            temp_id = %temp_id,
                            retries = retry_count,
                            %error,
                            "dropping queued message after exhausting retries"
                        );
                        self.remove(&temp_id).await?;
                        report.dropped += 1;
                    } else {
                        debug!(temp_id = %temp_id, attempt = next, %error, "queued send failed");
                        self.update_retry_count(&temp_id, next).await?;
                    }
                }
            }
        }

        report.remaining = self.len().await?;
        Ok(report)
    }

    /// Delay before a follow-up flush when entries remain.
    pub fn reflush_delay(&self) -> Duration {
        Duration::from_millis(self.config.reflush_delay_ms)
    }
}
