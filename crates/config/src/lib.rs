use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

const DEFAULT_CONFIG_FILES: &[&str] = &[
    "printline.toml",
    "config/printline.toml",
    "crates/config/printline.toml",
    "../printline.toml",
    "../config/printline.toml",
    "../crates/config/printline.toml",
];

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SyncConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "ApiConfig::default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl ApiConfig {
    const fn default_request_timeout() -> u64 {
        30
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:7070/api".to_string(),
            request_timeout_seconds: Self::default_request_timeout(),
            auth_token: None,
        }
    }
}

/// Backoff settings for the send pipeline.
///
/// ```
/// use printline_config::RetryConfig;
///
/// let retry = RetryConfig::default();
/// assert_eq!(retry.max_attempts, 3);
/// assert_eq!(retry.base_delay_ms, 1_000);
/// assert_eq!(retry.max_delay_ms, 10_000);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    #[serde(default = "RetryConfig::default_jitter")]
    pub jitter: bool,
}

impl RetryConfig {
    const fn default_jitter() -> bool {
        true
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            jitter: Self::default_jitter(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    pub timeout_seconds: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub database_url: String,
    pub max_retries: i64,
    pub flush_delay_ms: u64,
    pub reflush_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://printline.db".to_string(),
            max_retries: 3,
            flush_delay_ms: 500,
            reflush_delay_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastTransport {
    Channel,
    Storage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    pub transport: BroadcastTransport,
    pub poll_interval_ms: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            transport: BroadcastTransport::Channel,
            poll_interval_ms: 250,
        }
    }
}

/// Load the engine configuration by combining defaults, files, and environment overrides.
///
/// ```
/// use printline_config::load;
///
/// std::env::remove_var("PRINTLINE_CONFIG");
///
/// let config = load().expect("configuration should load with defaults");
/// assert!(!config.api.base_url.is_empty());
/// ```
pub fn load() -> anyhow::Result<SyncConfig> {
    let defaults = SyncConfig::default();

    let mut builder = config::Config::builder();
    builder = builder
        .set_default("api.base_url", defaults.api.base_url.clone())
        .unwrap()
        .set_default(
            "api.request_timeout_seconds",
            i64::try_from(defaults.api.request_timeout_seconds).unwrap_or(i64::MAX),
        )
        .unwrap()
        .set_default("retry.max_attempts", i64::from(defaults.retry.max_attempts))
        .unwrap()
        .set_default(
            "retry.base_delay_ms",
            i64::try_from(defaults.retry.base_delay_ms).unwrap_or(i64::MAX),
        )
        .unwrap()
        .set_default(
            "retry.max_delay_ms",
            i64::try_from(defaults.retry.max_delay_ms).unwrap_or(i64::MAX),
        )
        .unwrap()
        .set_default("retry.jitter", defaults.retry.jitter)
        .unwrap()
        .set_default(
            "watchdog.timeout_seconds",
            i64::try_from(defaults.watchdog.timeout_seconds).unwrap_or(i64::MAX),
        )
        .unwrap()
        .set_default("queue.database_url", defaults.queue.database_url.clone())
        .unwrap()
        .set_default("queue.max_retries", defaults.queue.max_retries)
        .unwrap()
        .set_default(
            "queue.flush_delay_ms",
            i64::try_from(defaults.queue.flush_delay_ms).unwrap_or(i64::MAX),
        )
        .unwrap()
        .set_default(
            "queue.reflush_delay_ms",
            i64::try_from(defaults.queue.reflush_delay_ms).unwrap_or(i64::MAX),
        )
        .unwrap()
        .set_default("broadcast.transport", "channel")
        .unwrap()
        .set_default(
            "broadcast.poll_interval_ms",
            i64::try_from(defaults.broadcast.poll_interval_ms).unwrap_or(i64::MAX),
        )
        .unwrap();

    let environment_overrides = config::Environment::with_prefix("PRINTLINE").separator("__");

    let mut config_file_attached = false;

    if let Ok(path) = std::env::var("PRINTLINE_CONFIG") {
        builder = builder.add_source(config::File::from(PathBuf::from(&path)));
        config_file_attached = true;
        debug!(path, "loading configuration via PRINTLINE_CONFIG");
    } else if let Ok(cwd) = std::env::current_dir() {
        let fallback = DEFAULT_CONFIG_FILES
            .iter()
            .map(|candidate| cwd.join(candidate))
            .find(|path| path.exists());

        if let Some(path) = fallback {
            debug!(path = %path.display(), "loading configuration file");
            builder = builder.add_source(config::File::from(path));
            config_file_attached = true;
        }
    }

    if !config_file_attached {
        debug!("no configuration file found, relying on defaults and environment overrides");
    }

    builder = builder.add_source(environment_overrides);

    let cfg = builder.build().context("unable to build configuration")?;

    let config = cfg
        .try_deserialize::<SyncConfig>()
        .context("invalid configuration")?;

    debug!(?config, "loaded sync engine configuration");
    Ok(config)
}
