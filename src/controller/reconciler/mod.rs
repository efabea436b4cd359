//! # Reconciler
//!
//! Core reconciliation logic for `Stack` resources.
//!
//! The reconciler:
//! - Fetches the Stack's program from git or from a published artifact
//! - Resolves config, secrets and environment from resource references
//! - Drives the automation engine through select, configure, refresh and update
//! - Destroys managed infrastructure on deletion when asked to
//! - Records the outcome in the Stack's status
//!
//! ## Modules
//!
//! - `store`: read/write access to Stacks and referenced objects, conflict retry
//! - `events`: Kubernetes Events on Stacks
//! - `resolver`: `ResourceRef` and git credential resolution
//! - `stack_config`: config assembly
//! - `source`: workspaces and the git/artifact fetch strategies
//! - `driver`: automation engine contract and its CLI implementation
//! - `lifecycle`: finalizers and status records
//! - `schedule`: resync rules and the trigger gate
//! - `session`: per-pass state
//! - `reconcile`: the control loop itself

pub mod driver;
pub mod events;
pub mod lifecycle;
pub mod reconcile;
pub mod resolver;
pub mod schedule;
pub mod session;
pub mod source;
pub mod stack_config;
pub mod store;
pub mod types;

// Re-export public API
pub use reconcile::{reconcile, reconcile_stack};
pub use types::{BackoffState, ReconcileOutcome, Reconciler, ReconcilerError, RequeueReason};
