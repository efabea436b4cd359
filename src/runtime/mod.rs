//! # Runtime
//!
//! Controller process lifecycle.
//!
//! - `initialization`: tracing, rustls, metrics, HTTP server, client and reconciler setup
//! - `watch_loop`: the kube-runtime controller and its restart loop
//! - `error_policy`: per-Stack error backoff and watch stream error handling

pub mod error_policy;
pub mod initialization;
pub mod watch_loop;

pub use initialization::{init_tracing, initialize, InitializationResult};
pub use watch_loop::run_watch_loop;
