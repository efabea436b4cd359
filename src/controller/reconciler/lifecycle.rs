//! # Lifecycle
//!
//! Finalizer membership, failure/success status records and the bounded wait
//! for a finalized Stack to disappear. Every write goes through
//! [`update_stack_with_retry`], so each mutation is applied to a fresh read.

use crate::config::ControllerConfig;
use crate::controller::reconciler::events::{EventPublisher, StackEvent};
use crate::controller::reconciler::store::{
    update_stack_with_retry, ResourceStore, StackKey, WriteTarget,
};
use crate::controller::reconciler::types::ReconcilerError;
use crate::crd::{Permalink, Stack, StackUpdateStateMessage};
use chrono::{SecondsFormat, Utc};
use std::collections::BTreeMap;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// RFC3339 timestamp stored in `lastResyncTime`
pub fn resync_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub struct LifecycleManager<'a> {
    store: &'a dyn ResourceStore,
    events: &'a dyn EventPublisher,
    config: &'a ControllerConfig,
}

impl<'a> LifecycleManager<'a> {
    pub fn new(
        store: &'a dyn ResourceStore,
        events: &'a dyn EventPublisher,
        config: &'a ControllerConfig,
    ) -> Self {
        Self {
            store,
            events,
            config,
        }
    }

    pub async fn add_finalizer(&self, key: &StackKey) -> Result<Stack, ReconcilerError> {
        let stack = update_stack_with_retry(self.store, key, WriteTarget::Object, |stack| {
            stack.add_finalizer();
        })
        .await?;
        debug!(stack = %key, "Added finalizer");
        Ok(stack)
    }

    pub async fn remove_finalizer(&self, key: &StackKey) -> Result<Stack, ReconcilerError> {
        let stack = update_stack_with_retry(self.store, key, WriteTarget::Object, |stack| {
            stack.remove_finalizer();
        })
        .await?;
        debug!(stack = %key, "Removed finalizer");
        Ok(stack)
    }

    /// Re-read until the finalizer shows up, bounded by the configured timeout
    ///
    /// A stale read after the timeout is tolerated; later writes re-read anyway.
    pub async fn wait_until_finalizer_visible(&self, key: &StackKey) -> Result<(), ReconcilerError> {
        let deadline = Instant::now() + self.config.finalizer_visible_timeout();
        loop {
            if self.store.get_stack(key).await?.has_finalizer() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(stack = %key, "Finalizer not yet visible, continuing");
                return Ok(());
            }
            tokio::time::sleep(self.config.deletion_poll_interval()).await;
        }
    }

    /// Replace `lastUpdate.permalink`
    pub async fn set_permalink(
        &self,
        key: &StackKey,
        permalink: Option<Permalink>,
    ) -> Result<Stack, ReconcilerError> {
        update_stack_with_retry(self.store, key, WriteTarget::Status, |stack| {
            stack
                .status
                .get_or_insert_with(Default::default)
                .last_update_mut()
                .permalink = permalink.clone();
        })
        .await
        .map_err(ReconcilerError::Persistence)
    }

    /// Record a failed run and hand back the error that caused it
    ///
    /// `lastSuccessfulCommit` is left untouched. When the status write itself
    /// fails, both errors are returned together.
    pub async fn mark_failed(
        &self,
        stack: &Stack,
        error: ReconcilerError,
        commit: &str,
        permalink: Option<Permalink>,
    ) -> ReconcilerError {
        let key = StackKey::from_stack(stack);
        self.events
            .publish(
                stack,
                StackEvent::UpdateFailure,
                format!("Failed to update Stack: {error}"),
            )
            .await;
        error!(stack = %key, stack.name = %stack.spec.stack, error = %error, "Failed to update Stack");

        let now = resync_timestamp();
        let written = update_stack_with_retry(self.store, &key, WriteTarget::Status, |stack| {
            let last_update = stack
                .status
                .get_or_insert_with(Default::default)
                .last_update_mut();
            last_update.state = Some(StackUpdateStateMessage::Failed);
            last_update.last_attempted_commit = Some(commit.to_string());
            last_update.permalink = permalink.clone();
            last_update.last_resync_time = Some(now.clone());
        })
        .await;

        match written {
            Ok(_) => error,
            Err(persist) => {
                error!(stack = %key, error = %persist, "Failed to update status for a failed Stack update");
                ReconcilerError::MarkFailed {
                    error: Box::new(error),
                    persist,
                }
            }
        }
    }

    /// Record a successful run at `commit`
    ///
    /// `outputs` of `None` leaves the stored outputs as they are.
    pub async fn record_success(
        &self,
        key: &StackKey,
        outputs: BTreeMap<String, serde_json::Value>,
        commit: &str,
        permalink: Option<Permalink>,
    ) -> Result<Stack, ReconcilerError> {
        let now = resync_timestamp();
        let stack = update_stack_with_retry(self.store, key, WriteTarget::Status, |stack| {
            let status = stack.status.get_or_insert_with(Default::default);
            status.outputs = Some(outputs.clone());
            let last_update = status.last_update_mut();
            last_update.state = Some(StackUpdateStateMessage::Succeeded);
            last_update.last_attempted_commit = Some(commit.to_string());
            last_update.last_successful_commit = Some(commit.to_string());
            last_update.permalink = permalink.clone();
            last_update.last_resync_time = Some(now.clone());
        })
        .await
        .map_err(ReconcilerError::Persistence)?;
        info!(stack = %key, revision = commit, "Recorded successful update");
        Ok(stack)
    }

    /// Poll until the Stack is gone
    pub async fn wait_for_deletion(&self, key: &StackKey) -> Result<(), ReconcilerError> {
        let timeout = self.config.deletion_wait_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            match self.store.get_stack(key).await {
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e.into()),
                Ok(_) => {}
            }
            if Instant::now() >= deadline {
                return Err(ReconcilerError::DeletionTimeout {
                    key: key.to_string(),
                    waited: timeout,
                });
            }
            tokio::time::sleep(self.config.deletion_poll_interval()).await;
        }
    }
}
