//! # Controller Configuration
//!
//! Controller-level settings loaded from environment variables.

use crate::constants::{
    DEFAULT_AUTOMATION_BINARY, DEFAULT_BACKOFF_MAX_SECS, DEFAULT_BACKOFF_MIN_SECS,
    DEFAULT_CONFLICT_REQUEUE_SECS, DEFAULT_DELETION_POLL_INTERVAL_MS,
    DEFAULT_DELETION_WAIT_TIMEOUT_MS, DEFAULT_FINALIZER_VISIBLE_TIMEOUT_MS,
    DEFAULT_MAX_CONCURRENT_RECONCILES, DEFAULT_METRICS_PORT, DEFAULT_SERVER_POLL_INTERVAL_MS,
    DEFAULT_SERVER_STARTUP_TIMEOUT_SECS, DEFAULT_WATCH_RESTART_DELAY_SECS,
};
use std::time::Duration;

/// Controller-level configuration
///
/// All settings have defaults and can be overridden via environment variables
/// populated from the deployment.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Maximum number of Stacks reconciled concurrently
    pub max_concurrent_reconciles: usize,
    /// Port for `/metrics`, `/healthz` and `/readyz`
    pub metrics_port: u16,
    /// How long to wait for the HTTP server to bind
    pub server_startup_timeout_secs: u64,
    /// Poll interval while waiting for the HTTP server
    pub server_poll_interval_ms: u64,
    /// Fixed delay used after an update conflict or stack-not-found outcome
    pub conflict_requeue_secs: u64,
    /// Bound for waiting on a finalized Stack to disappear
    pub deletion_wait_timeout_ms: u64,
    /// Poll interval while waiting for deletion
    pub deletion_poll_interval_ms: u64,
    /// Bound for the read-after-write check following a finalizer add
    pub finalizer_visible_timeout_ms: u64,
    /// Error backoff lower bound (seconds)
    pub backoff_min_secs: u64,
    /// Error backoff upper bound (seconds)
    pub backoff_max_secs: u64,
    /// Delay before restarting the watch after the stream ends
    pub watch_restart_delay_secs: u64,
    /// Automation engine executable, resolved on PATH
    pub automation_binary: String,
    /// Namespace the controller runs in
    pub controller_namespace: String,
    /// Restrict the watch to a single namespace
    pub watch_namespace: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: DEFAULT_MAX_CONCURRENT_RECONCILES,
            metrics_port: DEFAULT_METRICS_PORT,
            server_startup_timeout_secs: DEFAULT_SERVER_STARTUP_TIMEOUT_SECS,
            server_poll_interval_ms: DEFAULT_SERVER_POLL_INTERVAL_MS,
            conflict_requeue_secs: DEFAULT_CONFLICT_REQUEUE_SECS,
            deletion_wait_timeout_ms: DEFAULT_DELETION_WAIT_TIMEOUT_MS,
            deletion_poll_interval_ms: DEFAULT_DELETION_POLL_INTERVAL_MS,
            finalizer_visible_timeout_ms: DEFAULT_FINALIZER_VISIBLE_TIMEOUT_MS,
            backoff_min_secs: DEFAULT_BACKOFF_MIN_SECS,
            backoff_max_secs: DEFAULT_BACKOFF_MAX_SECS,
            watch_restart_delay_secs: DEFAULT_WATCH_RESTART_DELAY_SECS,
            automation_binary: DEFAULT_AUTOMATION_BINARY.to_string(),
            controller_namespace: "default".to_string(),
            watch_namespace: None,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent_reconciles: env_var_or_default(
                "MAX_CONCURRENT_RECONCILES",
                defaults.max_concurrent_reconciles,
            ),
            metrics_port: env_var_or_default("METRICS_PORT", defaults.metrics_port),
            server_startup_timeout_secs: env_var_or_default(
                "SERVER_STARTUP_TIMEOUT_SECS",
                defaults.server_startup_timeout_secs,
            ),
            server_poll_interval_ms: env_var_or_default(
                "SERVER_POLL_INTERVAL_MS",
                defaults.server_poll_interval_ms,
            ),
            conflict_requeue_secs: env_var_or_default(
                "CONFLICT_REQUEUE_SECS",
                defaults.conflict_requeue_secs,
            ),
            deletion_wait_timeout_ms: env_var_or_default(
                "DELETION_WAIT_TIMEOUT_MS",
                defaults.deletion_wait_timeout_ms,
            ),
            deletion_poll_interval_ms: env_var_or_default(
                "DELETION_POLL_INTERVAL_MS",
                defaults.deletion_poll_interval_ms,
            ),
            finalizer_visible_timeout_ms: env_var_or_default(
                "FINALIZER_VISIBLE_TIMEOUT_MS",
                defaults.finalizer_visible_timeout_ms,
            ),
            backoff_min_secs: env_var_or_default("BACKOFF_MIN_SECS", defaults.backoff_min_secs),
            backoff_max_secs: env_var_or_default("BACKOFF_MAX_SECS", defaults.backoff_max_secs),
            watch_restart_delay_secs: env_var_or_default(
                "WATCH_RESTART_DELAY_SECS",
                defaults.watch_restart_delay_secs,
            ),
            automation_binary: env_var_or_default_str(
                "AUTOMATION_BINARY",
                &defaults.automation_binary,
            ),
            controller_namespace: env_var_or_default_str(
                "POD_NAMESPACE",
                &defaults.controller_namespace,
            ),
            watch_namespace: std::env::var("WATCH_NAMESPACE")
                .ok()
                .filter(|ns| !ns.is_empty()),
        }
    }

    /// Fixed delay for conflict and stack-not-found retries
    pub fn conflict_requeue_duration(&self) -> Duration {
        Duration::from_secs(self.conflict_requeue_secs)
    }

    pub fn deletion_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.deletion_wait_timeout_ms)
    }

    pub fn deletion_poll_interval(&self) -> Duration {
        Duration::from_millis(self.deletion_poll_interval_ms)
    }

    pub fn finalizer_visible_timeout(&self) -> Duration {
        Duration::from_millis(self.finalizer_visible_timeout_ms)
    }

    pub fn watch_restart_delay(&self) -> Duration {
        Duration::from_secs(self.watch_restart_delay_secs)
    }
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as string or return default
fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
