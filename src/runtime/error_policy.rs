//! # Error Policy
//!
//! Error handling and backoff logic for the controller watch loop.
//! This module handles reconciliation errors and watch stream errors.

use crate::controller::reconciler::store::StackKey;
use crate::controller::reconciler::{Reconciler, ReconcilerError};
use crate::crd::Stack;
use crate::observability;
use kube_runtime::controller::Action;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Requeue a failed Stack with Fibonacci backoff
///
/// Backoff is tracked per Stack, so one failing Stack never delays another.
pub fn handle_reconciliation_error(
    stack: Arc<Stack>,
    error: &ReconcilerError,
    ctx: Arc<Reconciler>,
) -> Action {
    let key = StackKey::from_stack(&stack);
    let error_span = tracing::span!(
        tracing::Level::ERROR,
        "controller.watch.reconciliation_error",
        stack.name = %key.name,
        stack.namespace = %key.namespace,
        kind = error.kind(),
    );
    let _error_guard = error_span.enter();

    error!(stack = %key, error = %error, "Reconciliation failed");
    observability::metrics::increment_reconciliation_errors();

    let (delay, error_count) = ctx.note_failure(&key);
    ctx.gate
        .record(&key, stack.metadata.generation, Some(delay), Instant::now());

    let next_trigger_time = chrono::Utc::now()
        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    info!(
        stack = %key,
        backoff_secs = delay.as_secs(),
        error_count,
        next_retry = %next_trigger_time.to_rfc3339(),
        "Retrying with Fibonacci backoff"
    );

    observability::metrics::increment_requeues_total("error-backoff");
    Action::requeue(delay)
}

/// Classes of watch stream failures, each with its own recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchErrorKind {
    Unauthorized,
    Expired,
    Throttled,
    NotFound,
    Other,
}

/// Classify a watch error from its debug rendering
///
/// 404 is checked first: a plain-text 404 body surfaces as a serde error
/// that also mentions `WatchFailed`.
pub fn classify_watch_error(error: &str) -> WatchErrorKind {
    let is_not_found =
        error.contains("ObjectNotFound") || error.contains("404") || error.contains("not found");
    if (error.contains("401") || error.contains("Unauthorized")) && !is_not_found {
        WatchErrorKind::Unauthorized
    } else if error.contains("410")
        || error.contains("too old resource version")
        || error.contains("Expired")
        || error.contains("Gone")
    {
        WatchErrorKind::Expired
    } else if error.contains("429")
        || error.contains("storage is (re)initializing")
        || error.contains("TooManyRequests")
    {
        WatchErrorKind::Throttled
    } else if is_not_found {
        WatchErrorKind::NotFound
    } else {
        WatchErrorKind::Other
    }
}

/// Handle a watch stream error
///
/// Returns `None` to drop the error and let the watch restart, `Some(())` to
/// keep it in the stream.
pub async fn handle_watch_stream_error(
    error: &str,
    backoff_ms: &AtomicU64,
    max_backoff_ms: u64,
    watch_restart_delay: Duration,
) -> Option<()> {
    let error_span = tracing::span!(tracing::Level::WARN, "controller.watch.error", error = %error);
    let _error_guard = error_span.enter();

    match classify_watch_error(error) {
        WatchErrorKind::Unauthorized => {
            error!(
                "Watch authentication failed (401 Unauthorized): check that the controller's \
                 ClusterRole and ClusterRoleBinding still grant list/watch on stacks.pulumi.com"
            );
            warn!(
                delay_secs = watch_restart_delay.as_secs(),
                "Waiting before retrying watch"
            );
            tokio::time::sleep(watch_restart_delay).await;
            None
        }
        WatchErrorKind::Expired => {
            warn!(error_type = "410", "Watch resource version expired, watch will restart");
            None
        }
        WatchErrorKind::Throttled => {
            let current = backoff_ms.load(Ordering::Relaxed);
            warn!(
                backoff_ms = current,
                "API server storage reinitializing (429), backing off before restart"
            );
            tokio::time::sleep(Duration::from_millis(current)).await;
            backoff_ms.store(current.saturating_mul(2).min(max_backoff_ms), Ordering::Relaxed);
            None
        }
        WatchErrorKind::NotFound => {
            warn!(
                "Resource not found (404): expected if a Stack was just deleted, otherwise check \
                 that the Stack CRD is installed. Error: {}",
                error
            );
            Some(())
        }
        WatchErrorKind::Other => {
            error!("Controller stream error: {}", error);
            tokio::time::sleep(watch_restart_delay).await;
            None
        }
    }
}
