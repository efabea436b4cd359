//! # Events
//!
//! Kubernetes Events emitted on Stacks.
//!
//! Publishing is fire-and-forget: a failed event is logged and never fails
//! the reconciliation that produced it.

use crate::crd::Stack;
use async_trait::async_trait;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::warn;

/// Domain events surfaced on a Stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackEvent {
    ConfigInvalid,
    GitAuthenticationFailure,
    InitializationFailure,
    UpdateDetected,
    UpdateConflictDetected,
    StackNotFound,
    OutputRetrievalFailure,
    UpdateFailure,
    UpdateSuccessful,
}

impl StackEvent {
    /// Value of the event's `reason` field
    pub fn reason(self) -> &'static str {
        match self {
            Self::ConfigInvalid => "StackConfigInvalid",
            Self::GitAuthenticationFailure => "StackGitAuthenticationFailure",
            Self::InitializationFailure => "StackInitializationFailure",
            Self::UpdateDetected => "StackUpdateDetected",
            Self::UpdateConflictDetected => "StackUpdateConflictDetected",
            Self::StackNotFound => "StackNotFound",
            Self::OutputRetrievalFailure => "StackOutputRetrievalFailure",
            Self::UpdateFailure => "StackUpdateFailure",
            Self::UpdateSuccessful => "StackUpdateSuccessful",
        }
    }

    pub fn is_warning(self) -> bool {
        matches!(
            self,
            Self::ConfigInvalid
                | Self::GitAuthenticationFailure
                | Self::InitializationFailure
                | Self::UpdateConflictDetected
                | Self::StackNotFound
                | Self::OutputRetrievalFailure
                | Self::UpdateFailure
        )
    }

    fn event_type(self) -> EventType {
        if self.is_warning() {
            EventType::Warning
        } else {
            EventType::Normal
        }
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, stack: &Stack, event: StackEvent, message: String);
}

/// Production implementation wrapping `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl std::fmt::Debug for KubeEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeEventPublisher").finish_non_exhaustive()
    }
}

impl KubeEventPublisher {
    /// `controller_name` becomes the events' reporting component
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, stack: &Stack, event: StackEvent, message: String) {
        let reference = stack.object_ref(&());
        let ev = Event {
            type_: event.event_type(),
            reason: event.reason().to_string(),
            note: Some(message),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&ev, &reference).await {
            warn!(
                reason = event.reason(),
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _stack: &Stack, _event: StackEvent, _message: String) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_are_warnings() {
        assert!(StackEvent::UpdateFailure.is_warning());
        assert!(StackEvent::ConfigInvalid.is_warning());
        assert!(!StackEvent::UpdateSuccessful.is_warning());
        assert!(!StackEvent::UpdateDetected.is_warning());
    }

    #[test]
    fn test_reasons_are_prefixed() {
        assert_eq!(
            StackEvent::GitAuthenticationFailure.reason(),
            "StackGitAuthenticationFailure"
        );
        assert_eq!(StackEvent::StackNotFound.reason(), "StackNotFound");
    }
}
