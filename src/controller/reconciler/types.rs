//! # Types
//!
//! Core types for the reconciler.

use crate::config::ControllerConfig;
use crate::constants::CONTROLLER_NAME;
use crate::controller::backoff::FibonacciBackoff;
use crate::controller::reconciler::driver::{AutomationDriver, DriverError, PulumiCliDriver};
use crate::controller::reconciler::events::{EventPublisher, KubeEventPublisher};
use crate::controller::reconciler::resolver::ResolveError;
use crate::controller::reconciler::schedule::TriggerGate;
use crate::controller::reconciler::source::{DefaultSourceProvider, SourceError, SourceProvider};
use crate::controller::reconciler::store::{KubeResourceStore, ResourceStore, StackKey, StoreError};
use crate::crd::SpecError;
use crate::observability::metrics;
use kube::Client;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("invalid stack spec: {0}")]
    Validation(#[from] SpecError),
    #[error("resolving references: {0}")]
    Resolution(#[from] ResolveError),
    #[error("acquiring source: {0}")]
    SourceAcquisition(#[from] SourceError),
    #[error(transparent)]
    Automation(#[from] DriverError),
    #[error("persisting status: {0}")]
    Persistence(StoreError),
    #[error("{error}; additionally failed to record the failure: {persist}")]
    MarkFailed {
        error: Box<ReconcilerError>,
        persist: StoreError,
    },
    #[error("Stack {key} still present {}ms after its finalizer was removed", .waited.as_millis())]
    DeletionTimeout { key: String, waited: Duration },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReconcilerError {
    /// Short label used for the `kind` field of error logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Resolution(_) => "resolution",
            Self::SourceAcquisition(_) => "source",
            Self::Automation(_) => "automation",
            Self::Persistence(_) => "persistence",
            Self::MarkFailed { .. } => "mark_failed",
            Self::DeletionTimeout { .. } => "deletion_timeout",
            Self::Store(_) => "store",
        }
    }
}

/// Why a successful pass asks to be run again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueReason {
    /// Periodic resync for branch tracking or continuous resync
    Resync,
    UpdateConflict,
    StackNotFound,
}

impl RequeueReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resync => "resync",
            Self::UpdateConflict => "update-conflict",
            Self::StackNotFound => "stack-not-found",
        }
    }
}

/// Result of a pass that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Done,
    RequeueAfter(Duration, RequeueReason),
}

impl ReconcileOutcome {
    pub fn requeue_after(self) -> Option<Duration> {
        match self {
            Self::Done => None,
            Self::RequeueAfter(delay, _) => Some(delay),
        }
    }
}

/// Backoff state for one Stack
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub backoff: FibonacciBackoff,
    pub error_count: u32,
}

impl BackoffState {
    pub fn new(min_secs: u64, max_secs: u64) -> Self {
        Self {
            backoff: FibonacciBackoff::new(min_secs, max_secs),
            error_count: 0,
        }
    }

    pub fn increment_error(&mut self) {
        self.error_count += 1;
    }

    pub fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
    }
}

/// Shared context handed to every reconciliation
#[derive(Clone)]
pub struct Reconciler {
    pub store: Arc<dyn ResourceStore>,
    pub events: Arc<dyn EventPublisher>,
    pub sources: Arc<dyn SourceProvider>,
    pub driver: Arc<dyn AutomationDriver>,
    pub config: ControllerConfig,
    /// Error backoff per Stack, advanced by the error policy
    pub backoff_states: Arc<Mutex<HashMap<StackKey, BackoffState>>>,
    pub gate: Arc<TriggerGate>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        events: Arc<dyn EventPublisher>,
        sources: Arc<dyn SourceProvider>,
        driver: Arc<dyn AutomationDriver>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            events,
            sources,
            driver,
            config,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
            gate: Arc::new(TriggerGate::new()),
        }
    }

    /// Clear the error backoff of `key` after a successful pass
    pub fn note_success(&self, key: &StackKey) {
        let mut states = self
            .backoff_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = states.get_mut(key) {
            state.reset();
        }
        metrics::set_stacks_failing(failing_count(&states));
    }

    /// Drop the error backoff of `key` once the Stack is gone
    pub fn forget(&self, key: &StackKey) {
        let mut states = self
            .backoff_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        states.remove(key);
        metrics::set_stacks_failing(failing_count(&states));
    }

    /// Count a failure for `key` and return the next backoff delay and error count
    pub fn note_failure(&self, key: &StackKey) -> (Duration, u32) {
        let mut states = self
            .backoff_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let state = states.entry(key.clone()).or_insert_with(|| {
            BackoffState::new(self.config.backoff_min_secs, self.config.backoff_max_secs)
        });
        state.increment_error();
        let result = (state.backoff.next_backoff(), state.error_count);
        metrics::set_stacks_failing(failing_count(&states));
        result
    }

    /// Production wiring: Kubernetes API, git/artifact sources and the engine CLI
    pub fn for_cluster(client: Client, config: ControllerConfig) -> anyhow::Result<Self> {
        let sources = DefaultSourceProvider::new()?;
        let driver = PulumiCliDriver::new(config.automation_binary.clone());
        Ok(Self::new(
            Arc::new(KubeResourceStore::new(client.clone())),
            Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME)),
            Arc::new(sources),
            Arc::new(driver),
            config,
        ))
    }
}

fn failing_count(states: &HashMap<StackKey, BackoffState>) -> usize {
    states.values().filter(|s| s.error_count > 0).count()
}
