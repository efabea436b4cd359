//! # Prelude
//!
//! Re-exports commonly used types and traits for convenience.
//!
//! ```rust
//! use stack_controller::prelude::*;
//! ```
//!
//! This brings into scope:
//! - All CRD types (Stack, StackSpec, ResourceRef, etc.)
//! - The seams the reconciler is built on (store, events, sources, driver)
//! - Reconciler types (Reconciler, ReconcilerError, etc.)
//! - Controller configuration

// CRD types - most commonly used
pub use crate::crd::*;

// Traits - needed for alternative implementations and tests
pub use crate::controller::reconciler::driver::AutomationDriver;
pub use crate::controller::reconciler::events::{EventPublisher, StackEvent};
pub use crate::controller::reconciler::source::SourceProvider;
pub use crate::controller::reconciler::store::{ResourceStore, StackKey, StoreError};

// Reconciler types - core controller functionality
pub use crate::controller::reconciler::{
    reconcile, reconcile_stack, BackoffState, ReconcileOutcome, Reconciler, ReconcilerError,
    RequeueReason,
};

// Config types
pub use crate::config::ControllerConfig;
