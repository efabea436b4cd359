//! # Scheduling
//!
//! Decides whether a fetched revision warrants an automation run, how long
//! to wait before the next resync, and whether a watch delivery should run a
//! pass at all.
//!
//! ## Trigger gate
//!
//! Every status write produces a watch event for the Stack. Without a gate,
//! each of those would start another full pass. [`TriggerGate`] remembers,
//! per Stack, the generation last reconciled and when the next pass is due:
//!
//! - deletions and spec changes (new `metadata.generation`) always run
//! - otherwise a pass runs once its scheduled requeue has arrived
//! - anything else is a no-op

use crate::constants::{MIN_RESYNC_FREQUENCY_SECS, SCHEDULE_TOLERANCE_SECS};
use crate::controller::reconciler::store::StackKey;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// True when a branch-tracking Stack already succeeded at `current`
pub fn should_skip_for_unchanged_revision(
    track_branch: bool,
    current: &str,
    last_successful_commit: Option<&str>,
    continue_on_match: bool,
) -> bool {
    track_branch && !continue_on_match && last_successful_commit == Some(current)
}

/// Periodic requeue for branch tracking or continuous resync
///
/// The configured value is raised to at least 60 seconds; unset (0) means 60.
pub fn next_resync_delay(
    track_branch: bool,
    continue_on_match: bool,
    configured_secs: i64,
) -> Option<Duration> {
    if !(track_branch || continue_on_match) {
        return None;
    }
    let secs = u64::try_from(configured_secs)
        .unwrap_or(0)
        .max(MIN_RESYNC_FREQUENCY_SECS);
    Some(Duration::from_secs(secs))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Run,
    /// Not yet due; check again after the remaining delay
    Wait(Duration),
    /// Nothing scheduled and nothing changed
    Idle,
}

#[derive(Debug, Clone, Copy)]
struct GateEntry {
    generation: Option<i64>,
    due: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct TriggerGate {
    entries: Mutex<HashMap<StackKey, GateEntry>>,
}

impl TriggerGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(
        &self,
        key: &StackKey,
        generation: Option<i64>,
        deleting: bool,
        now: Instant,
    ) -> GateDecision {
        if deleting {
            return GateDecision::Run;
        }
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = entries.get(key) else {
            return GateDecision::Run;
        };
        if entry.generation != generation {
            return GateDecision::Run;
        }
        match entry.due {
            Some(due) if now + Duration::from_secs(SCHEDULE_TOLERANCE_SECS) >= due => {
                GateDecision::Run
            }
            Some(due) => GateDecision::Wait(due - now),
            None => GateDecision::Idle,
        }
    }

    /// Remember the outcome of a pass at `generation`
    pub fn record(
        &self,
        key: &StackKey,
        generation: Option<i64>,
        requeue_after: Option<Duration>,
        now: Instant,
    ) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key.clone(),
                GateEntry {
                    generation,
                    due: requeue_after.map(|d| now + d),
                },
            );
    }

    pub fn forget(&self, key: &StackKey) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_only_when_tracking_and_unchanged() {
        assert!(should_skip_for_unchanged_revision(true, "abc", Some("abc"), false));
        assert!(!should_skip_for_unchanged_revision(true, "abc", Some("abc"), true));
        assert!(!should_skip_for_unchanged_revision(true, "def", Some("abc"), false));
        assert!(!should_skip_for_unchanged_revision(true, "abc", None, false));
        assert!(!should_skip_for_unchanged_revision(false, "abc", Some("abc"), false));
    }

    #[test]
    fn test_resync_delay_clamp() {
        assert_eq!(next_resync_delay(true, false, 0), Some(Duration::from_secs(60)));
        assert_eq!(next_resync_delay(true, false, 30), Some(Duration::from_secs(60)));
        assert_eq!(next_resync_delay(false, true, 59), Some(Duration::from_secs(60)));
        assert_eq!(next_resync_delay(true, false, 60), Some(Duration::from_secs(60)));
        assert_eq!(next_resync_delay(true, true, 600), Some(Duration::from_secs(600)));
        assert_eq!(next_resync_delay(true, false, -5), Some(Duration::from_secs(60)));
        assert_eq!(next_resync_delay(false, false, 600), None);
    }

    #[test]
    fn test_gate_runs_first_delivery_and_spec_changes() {
        let gate = TriggerGate::new();
        let key = StackKey::new("infra", "network");
        let now = Instant::now();
        assert_eq!(gate.check(&key, Some(1), false, now), GateDecision::Run);

        gate.record(&key, Some(1), None, now);
        assert_eq!(gate.check(&key, Some(1), false, now), GateDecision::Idle);
        assert_eq!(gate.check(&key, Some(2), false, now), GateDecision::Run);
        assert_eq!(gate.check(&key, Some(1), true, now), GateDecision::Run);
    }

    #[test]
    fn test_gate_waits_for_scheduled_requeue() {
        let gate = TriggerGate::new();
        let key = StackKey::new("infra", "network");
        let now = Instant::now();
        gate.record(&key, Some(1), Some(Duration::from_secs(60)), now);

        let later = now + Duration::from_secs(10);
        assert_eq!(
            gate.check(&key, Some(1), false, later),
            GateDecision::Wait(Duration::from_secs(50))
        );
        // Within tolerance of the due time
        let almost = now + Duration::from_secs(59);
        assert_eq!(gate.check(&key, Some(1), false, almost), GateDecision::Run);
    }

    #[test]
    fn test_gate_forget() {
        let gate = TriggerGate::new();
        let key = StackKey::new("infra", "network");
        let now = Instant::now();
        gate.record(&key, Some(1), None, now);
        gate.forget(&key);
        assert_eq!(gate.check(&key, Some(1), false, now), GateDecision::Run);
    }
}
