//! # Reconcile
//!
//! The per-Stack control loop.
//!
//! ## Pass
//!
//! 1. Fetch the Stack (gone means nothing to do)
//! 2. Validate the source descriptor and config keys
//! 3. Acquire a workspace at the current revision
//! 4. Select or create the engine stack, write settings and config, install dependencies
//! 5. Export legacy `envs`/`envSecrets`
//! 6. Deleting: finalize, drop the finalizer, wait for the object to go away
//! 7. New Stack: add the finalizer and a default permalink
//! 8. Branch tracking: stop early when the revision already succeeded
//! 9. Optional refresh
//! 10. Update, branching on conflict / not found / failure
//! 11. Collect outputs (none means the pass ends without touching status)
//! 12. Record success
//!
//! Every pass ends by removing its workspace, whatever the outcome.

use crate::controller::reconciler::driver::{outputs_to_status, UpdateResult};
use crate::controller::reconciler::events::StackEvent;
use crate::controller::reconciler::lifecycle::LifecycleManager;
use crate::controller::reconciler::schedule::{
    next_resync_delay, should_skip_for_unchanged_revision, GateDecision,
};
use crate::controller::reconciler::session::ReconcileSession;
use crate::controller::reconciler::stack_config::validate_config_keys;
use crate::controller::reconciler::store::StackKey;
use crate::controller::reconciler::types::{
    ReconcileOutcome, Reconciler, ReconcilerError, RequeueReason,
};
use crate::crd::{Permalink, SpecError, Stack};
use crate::observability::metrics;
use kube_runtime::controller::Action;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

/// Entry point for the kube-runtime controller
///
/// Deliveries that carry no spec change and arrive before the Stack's next
/// scheduled run are absorbed by the trigger gate.
pub async fn reconcile(stack: Arc<Stack>, ctx: Arc<Reconciler>) -> Result<Action, ReconcilerError> {
    let key = StackKey::from_stack(&stack);
    let generation = stack.metadata.generation;
    let deleting = stack.is_being_deleted();

    match ctx.gate.check(&key, generation, deleting, Instant::now()) {
        GateDecision::Run => {}
        GateDecision::Wait(remaining) => {
            debug!(stack = %key, remaining_secs = remaining.as_secs(), "Not due yet");
            return Ok(Action::requeue(remaining));
        }
        GateDecision::Idle => {
            debug!(stack = %key, "No spec change and nothing scheduled");
            return Ok(Action::await_change());
        }
    }

    let span = info_span!(
        "stack.reconcile",
        stack.name = %key.name,
        stack.namespace = %key.namespace,
        generation = ?generation,
    );
    let started = Instant::now();
    metrics::increment_reconciliations();
    let result = reconcile_stack(&ctx, &key).instrument(span).await;
    metrics::observe_reconciliation_duration(started.elapsed().as_secs_f64());

    let outcome = result?;
    if deleting {
        ctx.forget(&key);
        ctx.gate.forget(&key);
    } else {
        ctx.note_success(&key);
        ctx.gate
            .record(&key, generation, outcome.requeue_after(), Instant::now());
    }

    Ok(match outcome {
        ReconcileOutcome::Done => Action::await_change(),
        ReconcileOutcome::RequeueAfter(delay, reason) => {
            metrics::increment_requeues_total(reason.as_str());
            Action::requeue(delay)
        }
    })
}

/// Run one pass for the Stack at `key`
pub async fn reconcile_stack(
    ctx: &Reconciler,
    key: &StackKey,
) -> Result<ReconcileOutcome, ReconcilerError> {
    let stack = match ctx.store.get_stack(key).await {
        Ok(stack) => stack,
        Err(e) if e.is_not_found() => {
            debug!(stack = %key, "Stack not found, assuming it was deleted");
            return Ok(ReconcileOutcome::Done);
        }
        Err(e) => return Err(e.into()),
    };
    let lifecycle = LifecycleManager::new(ctx.store.as_ref(), ctx.events.as_ref(), &ctx.config);

    if stack.is_being_deleted() && !stack.has_finalizer() {
        debug!(stack = %key, "Stack is being deleted and carries no finalizer");
        return Ok(ReconcileOutcome::Done);
    }

    if let Err(error) = validate(&stack) {
        if !stack.is_being_deleted() {
            warn!(stack = %key, error = %error, "Invalid Stack");
            ctx.events
                .publish(&stack, StackEvent::ConfigInvalid, error.to_string())
                .await;
            return Ok(ReconcileOutcome::Done);
        }
        match error {
            // Overlapping keys still produce a usable config for destroy
            SpecError::DuplicateConfigKeys(_) => {}
            _ if !stack.spec.destroy_on_finalize => {
                info!(stack = %key, error = %error, "Invalid Stack needs no cleanup, releasing it");
                lifecycle.remove_finalizer(key).await?;
                lifecycle.wait_for_deletion(key).await?;
                return Ok(ReconcileOutcome::Done);
            }
            _ => return Err(error.into()),
        }
    }

    let mut session = ReconcileSession::acquire(ctx, stack).await?;
    let result = run_session(ctx, &lifecycle, &mut session).await;
    session.cleanup();
    result
}

fn validate(stack: &Stack) -> Result<(), SpecError> {
    stack.spec.source()?;
    validate_config_keys(&stack.spec)
}

async fn run_session(
    ctx: &Reconciler,
    lifecycle: &LifecycleManager<'_>,
    session: &mut ReconcileSession<'_>,
) -> Result<ReconcileOutcome, ReconcilerError> {
    let key = session.key().clone();
    let revision = session.revision().to_string();
    let driver = ctx.driver.as_ref();

    session.ensure_stack().await?;

    if let Err(error) = session.inject_legacy_envs().await {
        return Err(lifecycle
            .mark_failed(session.stack(), error, &revision, None)
            .await);
    }

    if session.stack().is_being_deleted() {
        session.finalize().await?;
        lifecycle.remove_finalizer(&key).await?;
        lifecycle.wait_for_deletion(&key).await?;
        info!(stack = %key, "Stack finalized");
        return Ok(ReconcileOutcome::Done);
    }

    if !session.stack().has_finalizer() {
        lifecycle.add_finalizer(&key).await?;
        lifecycle.wait_until_finalizer_visible(&key).await?;
        let info = driver
            .info(session.workspace(), session.stack_name())
            .await?;
        lifecycle
            .set_permalink(&key, info.url.map(Permalink))
            .await?;
    }

    let stack = session.stack();
    let spec = &stack.spec;
    let mut success = ReconcileOutcome::Done;
    if let Some(repo) = &spec.git_repo {
        let track_branch = repo.tracks_branch();
        let continue_on_match = repo.continue_resync_on_commit_match;
        let resync = next_resync_delay(track_branch, continue_on_match, spec.resync_frequency_seconds);
        let last_successful = stack.last_successful_commit();

        if should_skip_for_unchanged_revision(track_branch, &revision, last_successful, continue_on_match) {
            let delay = resync.unwrap_or_default();
            info!(stack = %key, revision = %revision, poll_secs = delay.as_secs(), "Commit unchanged, will poll again");
            return Ok(ReconcileOutcome::RequeueAfter(delay, RequeueReason::Resync));
        }
        if track_branch && stack.has_last_update() && last_successful != Some(revision.as_str()) {
            info!(stack = %key, revision = %revision, last = ?last_successful, "New commit detected");
            ctx.events
                .publish(
                    stack,
                    StackEvent::UpdateDetected,
                    format!("New commit detected: {revision:?}."),
                )
                .await;
        }
        if let Some(delay) = resync {
            success = ReconcileOutcome::RequeueAfter(delay, RequeueReason::Resync);
        }
    }

    if spec.refresh {
        match driver
            .refresh(session.workspace(), session.stack_name(), spec.expect_no_refresh_changes)
            .await
        {
            Ok(permalink) => {
                lifecycle.set_permalink(&key, permalink).await?;
            }
            Err(error) => {
                let permalink = error.permalink();
                return Err(lifecycle
                    .mark_failed(stack, error.into(), &revision, permalink)
                    .await);
            }
        }
    }

    let permalink = match driver.up(session.workspace(), session.stack_name()).await {
        UpdateResult::Succeeded { permalink } => permalink,
        UpdateResult::Conflict(error) => {
            warn!(stack = %key, error = %error, "Update conflicted with another update in progress");
            let message = if spec.retry_on_update_conflict {
                "Conflict with another concurrent update. Will retry."
            } else {
                "Conflict with another concurrent update. Not retrying: retryOnUpdateConflict is not set."
            };
            ctx.events
                .publish(stack, StackEvent::UpdateConflictDetected, message.to_string())
                .await;
            return Ok(if spec.retry_on_update_conflict {
                ReconcileOutcome::RequeueAfter(
                    ctx.config.conflict_requeue_duration(),
                    RequeueReason::UpdateConflict,
                )
            } else {
                ReconcileOutcome::Done
            });
        }
        UpdateResult::NotFound(error) => {
            warn!(stack = %key, error = %error, "Stack not found by the backend, will retry");
            ctx.events
                .publish(
                    stack,
                    StackEvent::StackNotFound,
                    format!("Stack not found. Will retry: {error}"),
                )
                .await;
            return Ok(ReconcileOutcome::RequeueAfter(
                ctx.config.conflict_requeue_duration(),
                RequeueReason::StackNotFound,
            ));
        }
        UpdateResult::Failed(error) => {
            let permalink = error.permalink();
            return Err(lifecycle
                .mark_failed(stack, error.into(), &revision, permalink)
                .await);
        }
    };

    let outputs = match driver.outputs(session.workspace(), session.stack_name()).await {
        Ok(outputs) => outputs,
        Err(error) => {
            ctx.events
                .publish(
                    stack,
                    StackEvent::OutputRetrievalFailure,
                    format!("Failed to get Stack outputs: {error}."),
                )
                .await;
            return Err(error.into());
        }
    };
    if outputs.is_empty() {
        debug!(stack = %key, revision = %revision, "Stack has no outputs, leaving status untouched");
        return Ok(success);
    }

    lifecycle
        .record_success(&key, outputs_to_status(&outputs), &revision, permalink)
        .await?;
    ctx.events
        .publish(
            stack,
            StackEvent::UpdateSuccessful,
            "Successfully updated stack.".to_string(),
        )
        .await;
    info!(stack = %key, revision = %revision, "Stack updated");
    Ok(success)
}
