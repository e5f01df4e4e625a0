//! Comprehensive test plan for the `printline-config` crate.
//!
//! These tests exercise the configuration loader across default handling,
//! file discovery, environment overrides, and validation behaviour.

use std::fs;
use std::path::{Path, PathBuf};

use serial_test::serial;
use tempfile::TempDir;

use printline_config::{load, BroadcastTransport, RetryConfig, SyncConfig, WatchdogConfig};

const ENV_VARS_TO_RESET: &[&str] = &[
    "PRINTLINE_CONFIG",
    "PRINTLINE__API__AUTH_TOKEN",
    "PRINTLINE__API__BASE_URL",
    "PRINTLINE__API__REQUEST_TIMEOUT_SECONDS",
    "PRINTLINE__BROADCAST__POLL_INTERVAL_MS",
    "PRINTLINE__BROADCAST__TRANSPORT",
    "PRINTLINE__QUEUE__DATABASE_URL",
    "PRINTLINE__QUEUE__FLUSH_DELAY_MS",
    "PRINTLINE__QUEUE__MAX_RETRIES",
    "PRINTLINE__QUEUE__REFLUSH_DELAY_MS",
    "PRINTLINE__RETRY__BASE_DELAY_MS",
    "PRINTLINE__RETRY__JITTER",
    "PRINTLINE__RETRY__MAX_ATTEMPTS",
    "PRINTLINE__RETRY__MAX_DELAY_MS",
    "PRINTLINE__WATCHDOG__TIMEOUT_SECONDS",
];

struct TestContext {
    vars: Vec<(String, Option<String>)>,
    original_dir: Option<PathBuf>,
}

impl TestContext {
    fn new() -> Self {
        Self {
            vars: Vec::new(),
            original_dir: None,
        }
    }

    fn reset_environment(&mut self) {
        for key in ENV_VARS_TO_RESET {
            self.remove_var(key);
        }
    }

    fn set_var(&mut self, key: &str, value: impl AsRef<str>) {
        let previous = std::env::var(key).ok();
        std::env::set_var(key, value.as_ref());
        self.vars.push((key.to_string(), previous));
    }

    fn remove_var(&mut self, key: &str) {
        let previous = std::env::var(key).ok();
        std::env::remove_var(key);
        self.vars.push((key.to_string(), previous));
    }

    fn set_current_dir(&mut self, dir: &Path) {
        if self.original_dir.is_none() {
            self.original_dir =
                Some(std::env::current_dir().expect("failed to capture current directory"));
        }
        std::env::set_current_dir(dir).expect("failed to set current directory");
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        if let Some(original) = self.original_dir.take() {
            let _ = std::env::set_current_dir(original);
        }

        while let Some((key, value)) = self.vars.pop() {
            match value {
                Some(val) => std::env::set_var(&key, val),
                None => std::env::remove_var(&key),
            }
        }
    }
}

fn write_config_file(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("failed to create config directories");
    }
    fs::write(path, contents).expect("failed to write config file");
}

#[test]
#[serial]
fn load_uses_default_values_when_no_files_found() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let mut ctx = TestContext::new();
    ctx.reset_environment();
    ctx.set_current_dir(temp_dir.path());

    let config = load().expect("configuration load should succeed without files");
    let defaults = SyncConfig::default();

    assert_eq!(config.api.base_url, defaults.api.base_url);
    assert_eq!(
        config.api.request_timeout_seconds,
        defaults.api.request_timeout_seconds
    );
    assert!(config.api.auth_token.is_none());
    assert_eq!(config.retry.max_attempts, defaults.retry.max_attempts);
    assert_eq!(config.retry.base_delay_ms, defaults.retry.base_delay_ms);
    assert_eq!(config.retry.max_delay_ms, defaults.retry.max_delay_ms);
    assert_eq!(
        config.watchdog.timeout_seconds,
        defaults.watchdog.timeout_seconds
    );
    assert_eq!(config.queue.database_url, defaults.queue.database_url);
    assert_eq!(config.queue.max_retries, defaults.queue.max_retries);
    assert_eq!(config.broadcast.transport, BroadcastTransport::Channel);
}

#[test]
#[serial]
fn load_picks_first_available_file_in_search_order() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let mut ctx = TestContext::new();
    ctx.reset_environment();
    ctx.set_current_dir(temp_dir.path());

    write_config_file(
        temp_dir.path(),
        "printline.toml",
        r#"
        [watchdog]
        timeout_seconds = 42
        "#,
    );
    write_config_file(
        temp_dir.path(),
        "config/printline.toml",
        r#"
        [watchdog]
        timeout_seconds = 99
        "#,
    );

    let config = load().expect("configuration load should pick the first file");
    assert_eq!(config.watchdog.timeout_seconds, 42);
}

#[test]
#[serial]
fn load_merges_partial_file_with_defaults() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let mut ctx = TestContext::new();
    ctx.reset_environment();
    ctx.set_current_dir(temp_dir.path());

    write_config_file(
        temp_dir.path(),
        "printline.toml",
        r#"
        [retry]
        max_attempts = 5

        [queue]
        max_retries = 7
        "#,
    );

    let config = load().expect("configuration load should succeed");
    let defaults = SyncConfig::default();

    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.retry.base_delay_ms, defaults.retry.base_delay_ms);
    assert_eq!(config.queue.max_retries, 7);
    assert_eq!(config.queue.database_url, defaults.queue.database_url);
    assert_eq!(config.api.base_url, defaults.api.base_url);
}

#[test]
#[serial]
fn load_applies_environment_overrides() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let mut ctx = TestContext::new();
    ctx.reset_environment();
    ctx.set_current_dir(temp_dir.path());

    write_config_file(
        temp_dir.path(),
        "printline.toml",
        r#"
        [watchdog]
        timeout_seconds = 30
        "#,
    );

    ctx.set_var("PRINTLINE__WATCHDOG__TIMEOUT_SECONDS", "120");

    let config = load().expect("configuration load should honour env overrides");
    assert_eq!(config.watchdog.timeout_seconds, 120);
}

#[test]
#[serial]
fn load_supports_queue_database_url_environment_variable() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let mut ctx = TestContext::new();
    ctx.reset_environment();
    ctx.set_current_dir(temp_dir.path());

    let url = "sqlite:///tmp/printline-offline.db";
    ctx.set_var("PRINTLINE__QUEUE__DATABASE_URL", url);

    let config = load().expect("configuration load should read queue env override");
    assert_eq!(config.queue.database_url, url);
}

#[test]
#[serial]
fn load_accepts_auth_token_from_env() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let mut ctx = TestContext::new();
    ctx.reset_environment();
    ctx.set_current_dir(temp_dir.path());

    ctx.set_var("PRINTLINE__API__AUTH_TOKEN", "token-test-key");

    let config = load().expect("configuration load should read the auth token");
    assert_eq!(config.api.auth_token.as_deref(), Some("token-test-key"));
}

#[test]
#[serial]
fn load_accepts_storage_transport_from_file() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let mut ctx = TestContext::new();
    ctx.reset_environment();
    ctx.set_current_dir(temp_dir.path());

    write_config_file(
        temp_dir.path(),
        "printline.toml",
        r#"
        [broadcast]
        transport = "storage"
        poll_interval_ms = 100
        "#,
    );

    let config = load().expect("configuration load should parse the transport kind");
    assert_eq!(config.broadcast.transport, BroadcastTransport::Storage);
    assert_eq!(config.broadcast.poll_interval_ms, 100);
}

#[test]
#[serial]
fn load_errors_on_invalid_toml_contents() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let mut ctx = TestContext::new();
    ctx.reset_environment();
    ctx.set_current_dir(temp_dir.path());

    write_config_file(
        temp_dir.path(),
        "printline.toml",
        r#"
        [watchdog]
        timeout_seconds = "not-a-number
        "#,
    );

    let error = load().expect_err("invalid TOML should cause load to fail");
    let message = error.to_string();
    assert!(
        message.contains("invalid configuration")
            || message.contains("unable to build configuration"),
        "unexpected error message: {message}"
    );
}

#[test]
fn retry_config_defaults_match_send_pipeline_expectations() {
    let defaults = RetryConfig::default();
    assert_eq!(defaults.max_attempts, 3);
    assert_eq!(defaults.base_delay_ms, 1_000);
    assert_eq!(defaults.max_delay_ms, 10_000);
    assert!(defaults.jitter);
}

#[test]
fn watchdog_config_defaults_to_one_minute() {
    let defaults = WatchdogConfig::default();
    assert_eq!(defaults.timeout_seconds, 60);
}
