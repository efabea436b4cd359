//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! Defaults here can be overridden through [`crate::config::ControllerConfig`]
//! where a matching environment variable exists.

/// Name used for the field manager, event reporter and log filter
pub const CONTROLLER_NAME: &str = "stack-controller";

/// Finalizer placed on every Stack that is not being deleted
pub const STACK_FINALIZER: &str = "finalizer.stack.pulumi.com";

/// Default HTTP server port for metrics and health probes
pub const DEFAULT_METRICS_PORT: u16 = 8383;

/// Default HTTP server startup timeout (how long to wait for server to be ready)
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default HTTP server readiness poll interval
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Default number of Stacks reconciled in parallel
pub const DEFAULT_MAX_CONCURRENT_RECONCILES: usize = 10;

/// Fixed requeue delay after an update conflict or a stack-not-found result (seconds)
pub const DEFAULT_CONFLICT_REQUEUE_SECS: u64 = 5;

/// Upper bound for waiting on a deleted Stack to disappear (milliseconds)
pub const DEFAULT_DELETION_WAIT_TIMEOUT_MS: u64 = 5_000;

/// Poll interval while waiting for deletion (milliseconds)
pub const DEFAULT_DELETION_POLL_INTERVAL_MS: u64 = 10;

/// Upper bound for waiting on a freshly added finalizer to be readable (milliseconds)
pub const DEFAULT_FINALIZER_VISIBLE_TIMEOUT_MS: u64 = 2_000;

/// Error backoff bounds (seconds)
pub const DEFAULT_BACKOFF_MIN_SECS: u64 = 5;
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 300;

/// Delay before restarting the watch stream after it ends (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;

/// Minimum and default resync interval when branch tracking or continuous resync is on (seconds)
pub const MIN_RESYNC_FREQUENCY_SECS: u64 = 60;

/// Tolerance when deciding whether a scheduled requeue has arrived (seconds)
pub const SCHEDULE_TOLERANCE_SECS: u64 = 2;

/// Default automation engine executable
pub const DEFAULT_AUTOMATION_BINARY: &str = "pulumi";

/// Value persisted in place of any output flagged as secret
pub const SECRET_OUTPUT_SENTINEL: &str = "[secret]";

/// Key holding the API token in the Secret named by `accessTokenSecret`
pub const ACCESS_TOKEN_SECRET_KEY: &str = "accessToken";

/// Environment variables exported into every workspace
pub const ENV_BACKEND_URL: &str = "PULUMI_BACKEND_URL";
pub const ENV_ACCESS_TOKEN: &str = "PULUMI_ACCESS_TOKEN";

/// Keys recognised in a legacy `gitAuthSecret`
pub const GIT_SECRET_SSH_PRIVATE_KEY: &str = "sshPrivateKey";
pub const GIT_SECRET_ACCESS_TOKEN: &str = "accessToken";
pub const GIT_SECRET_USERNAME: &str = "username";
pub const GIT_SECRET_PASSWORD: &str = "password";

/// Length of a hex-encoded SHA-1 digest; any other length is treated as SHA-256
pub const LEGACY_CHECKSUM_HEX_LEN: usize = 40;

/// Optimistic-concurrency retry policy for store writes
pub const CONFLICT_RETRY_ATTEMPTS: u32 = 4;
pub const CONFLICT_RETRY_INITIAL_DELAY_MS: u64 = 10;
pub const CONFLICT_RETRY_FACTOR: u32 = 5;

/// Backoff bounds for restarting the watch after API server throttling (milliseconds)
pub const WATCH_BACKOFF_START_MS: u64 = 1_000;
pub const WATCH_BACKOFF_MAX_MS: u64 = 30_000;
