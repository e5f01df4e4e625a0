//! Bounded exponential backoff for outbound sends.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use printline_config::RetryConfig;
use printline_protocol::{SyncError, SyncResult};

/// Runs fallible operations with exponential backoff, a delay cap, and
/// optional jitter. Each run is registered under a caller-supplied key so it
/// can be cancelled individually or all at once on teardown.
#[derive(Clone)]
pub struct RetryManager {
    config: RetryConfig,
    active: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
}

impl RetryManager {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `op` up to `max_attempts` times. `on_retry` fires before each
    /// re-attempt with the attempt number about to run (2-based: the first
    /// call is not a retry). Non-retryable errors abort immediately.
    pub async fn run<T, F, Fut, R, RFut>(&self, key: &str, on_retry: R, op: F) -> SyncResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = SyncResult<T>>,
        R: Fn(u32) -> RFut,
        RFut: std::future::Future<Output = ()>,
    {
        let cancel = Arc::new(Notify::new());
        {
            let mut active = self.active.lock().await;
            active.insert(key.to_string(), cancel.clone());
        }

        let result = self.run_inner(key, &cancel, on_retry, op).await;

        let mut active = self.active.lock().await;
        active.remove(key);
        result
    }

    async fn run_inner<T, F, Fut, R, RFut>(
        &self,
        key: &str,
        cancel: &Notify,
        on_retry: R,
        op: F,
    ) -> SyncResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = SyncResult<T>>,
        R: Fn(u32) -> RFut,
        RFut: std::future::Future<Output = ()>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = SyncError::internal("retry loop did not run");

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.backoff_delay(attempt - 1);
                debug!(key, attempt, delay_ms = delay.as_millis() as u64, "backing off");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.notified() => {
                        debug!(key, "retry cancelled during backoff");
                        return Err(SyncError::internal("retry cancelled"));
                    }
                }
                on_retry(attempt).await;
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt < max_attempts => {
                    debug!(key, attempt, %error, "attempt failed, will retry");
                    last_error = error;
                }
                Err(error) => {
                    if attempt >= max_attempts {
                        warn!(key, attempts = attempt, %error, "send exhausted its retries");
                    }
                    return Err(error);
                }
            }
        }
        Err(last_error)
    }

    fn backoff_delay(&self, failed_attempts: u32) -> Duration {
        let exp = failed_attempts.saturating_sub(1).min(16);
        let base = self
            .config
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.config.max_delay_ms);
        let jitter = if self.config.jitter && base > 0 {
            rand::thread_rng().gen_range(0..=base * 3 / 10)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }

    /// Cancel the run registered under `key`, if any.
    pub async fn cancel(&self, key: &str) {
        let active = self.active.lock().await;
        if let Some(cancel) = active.get(key) {
            cancel.notify_one();
        }
    }

    /// Cancel every registered run. Called on engine teardown.
    pub async fn cancel_all(&self) {
        let active = self.active.lock().await;
        for cancel in active.values() {
            cancel.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            jitter: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_op_runs_exactly_max_attempts() {
        let manager = RetryManager::new(config(3));
        let attempts = Arc::new(AtomicU32::new(0));
        let retries = Arc::new(AtomicU32::new(0));

        let counted = attempts.clone();
        let noted = retries.clone();
        let result: SyncResult<()> = manager
            .run(
                "k1",
                |_attempt| {
                    let noted = noted.clone();
                    async move {
                        noted.fetch_add(1, Ordering::SeqCst);
                    }
                },
                || {
                    let counted = counted.clone();
                    async move {
                        counted.fetch_add(1, Ordering::SeqCst);
                        Err(SyncError::network("down"))
                    }
                },
            )
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(retries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn success_on_first_attempt_skips_backoff() {
        let manager = RetryManager::new(config(3));
        let result = manager
            .run("k1", |_| async {}, || async { Ok(42u32) })
            .await
            .unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn second_attempt_can_recover() {
        let manager = RetryManager::new(config(3));
        let attempts = Arc::new(AtomicU32::new(0));

        let counted = attempts.clone();
        let result = manager
            .run("k1", |_| async {}, || {
                let counted = counted.clone();
                async move {
                    if counted.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(SyncError::timeout(30))
                    } else {
                        Ok("recovered")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "recovered");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn validation_errors_are_not_retried() {
        let manager = RetryManager::new(config(5));
        let attempts = Arc::new(AtomicU32::new(0));

        let counted = attempts.clone();
        let result: SyncResult<()> = manager
            .run("k1", |_| async {}, || {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::validation("empty message"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_the_backoff() {
        let manager = RetryManager::new(RetryConfig {
            max_attempts: 3,
            base_delay_ms: 60_000,
            max_delay_ms: 600_000,
            jitter: false,
        });

        let runner = manager.clone();
        let task = tokio::spawn(async move {
            runner
                .run("k1", |_| async {}, || async {
                    Err::<(), _>(SyncError::network("down"))
                })
                .await
        });

        // Let the first attempt fail and the backoff begin.
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.cancel("k1").await;

        let result = task.await.unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn backoff_is_capped() {
        let manager = RetryManager::new(RetryConfig {
            max_attempts: 10,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            jitter: false,
        });
        assert_eq!(manager.backoff_delay(1), Duration::from_millis(1_000));
        assert_eq!(manager.backoff_delay(2), Duration::from_millis(2_000));
        assert_eq!(manager.backoff_delay(5), Duration::from_millis(10_000));
        assert_eq!(manager.backoff_delay(30), Duration::from_millis(10_000));
    }
}
