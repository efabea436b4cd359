//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `stack_controller_reconciliations_total` - Total number of reconciliation passes
//! - `stack_controller_reconciliation_errors_total` - Total number of failed passes
//! - `stack_controller_reconciliation_duration_seconds` - Duration of reconciliation passes
//! - `stack_controller_automation_operations_total` - Automation engine operations by operation and outcome
//! - `stack_controller_automation_operation_duration_seconds` - Duration of automation engine operations
//! - `stack_controller_artifact_downloads_total` / `..._errors_total` - Artifact source downloads
//! - `stack_controller_git_clone_total` / `..._errors_total` - Git source clones
//! - `stack_controller_requeues_total` - Requeues by reason
//! - `stack_controller_stacks_failing` - Stacks whose last pass failed

use anyhow::Result;
use prometheus::{Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stack_controller_reconciliations_total",
        "Total number of reconciliation passes",
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stack_controller_reconciliation_errors_total",
        "Total number of reconciliation passes that returned an error",
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "stack_controller_reconciliation_duration_seconds",
            "Duration of reconciliation passes in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static AUTOMATION_OPERATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "stack_controller_automation_operations_total",
            "Total number of automation engine operations by operation and outcome",
        ),
        &["operation", "outcome"],
    )
    .expect("Failed to create AUTOMATION_OPERATIONS_TOTAL metric - this should never happen")
});

static AUTOMATION_OPERATION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "stack_controller_automation_operation_duration_seconds",
            "Duration of automation engine operations in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]),
        &["operation"],
    )
    .expect("Failed to create AUTOMATION_OPERATION_DURATION metric - this should never happen")
});

static ARTIFACT_DOWNLOADS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stack_controller_artifact_downloads_total",
        "Total number of source artifact downloads",
    )
    .expect("Failed to create ARTIFACT_DOWNLOADS_TOTAL metric - this should never happen")
});

static ARTIFACT_DOWNLOAD_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stack_controller_artifact_download_errors_total",
        "Total number of failed source artifact downloads, including checksum mismatches",
    )
    .expect("Failed to create ARTIFACT_DOWNLOAD_ERRORS_TOTAL metric - this should never happen")
});

static ARTIFACT_DOWNLOAD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "stack_controller_artifact_download_duration_seconds",
            "Duration of source artifact downloads in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
    )
    .expect("Failed to create ARTIFACT_DOWNLOAD_DURATION metric - this should never happen")
});

static GIT_CLONE_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stack_controller_git_clone_total",
        "Total number of git clone operations",
    )
    .expect("Failed to create GIT_CLONE_TOTAL metric - this should never happen")
});

static GIT_CLONE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "stack_controller_git_clone_duration_seconds",
            "Duration of git clone operations in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
    )
    .expect("Failed to create GIT_CLONE_DURATION metric - this should never happen")
});

static GIT_CLONE_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stack_controller_git_clone_errors_total",
        "Total number of git clone errors",
    )
    .expect("Failed to create GIT_CLONE_ERRORS_TOTAL metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "stack_controller_requeues_total",
            "Total number of requeues by reason",
        ),
        &["reason"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

static STACKS_FAILING: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "stack_controller_stacks_failing",
        "Number of Stacks whose most recent reconciliation failed",
    )
    .expect("Failed to create STACKS_FAILING metric - this should never happen")
});

#[allow(
    clippy::missing_errors_doc,
    reason = "Registration only fails on duplicate metric names"
)]
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(AUTOMATION_OPERATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(AUTOMATION_OPERATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(ARTIFACT_DOWNLOADS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ARTIFACT_DOWNLOAD_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ARTIFACT_DOWNLOAD_DURATION.clone()))?;
    REGISTRY.register(Box::new(GIT_CLONE_TOTAL.clone()))?;
    REGISTRY.register(Box::new(GIT_CLONE_DURATION.clone()))?;
    REGISTRY.register(Box::new(GIT_CLONE_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STACKS_FAILING.clone()))?;

    Ok(())
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors() {
    RECONCILIATION_ERRORS_TOTAL.inc();
}

pub fn observe_reconciliation_duration(duration: f64) {
    RECONCILIATION_DURATION.observe(duration);
}

/// Record one automation engine operation, e.g. (`up`, `conflict`)
pub fn record_automation_operation(operation: &str, outcome: &str, duration: f64) {
    AUTOMATION_OPERATIONS_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
    AUTOMATION_OPERATION_DURATION
        .with_label_values(&[operation])
        .observe(duration);
}

pub fn increment_artifact_downloads_total() {
    ARTIFACT_DOWNLOADS_TOTAL.inc();
}

pub fn increment_artifact_download_errors_total() {
    ARTIFACT_DOWNLOAD_ERRORS_TOTAL.inc();
}

pub fn observe_artifact_download_duration(duration: f64) {
    ARTIFACT_DOWNLOAD_DURATION.observe(duration);
}

pub fn increment_git_clone_total() {
    GIT_CLONE_TOTAL.inc();
}

pub fn observe_git_clone_duration(duration: f64) {
    GIT_CLONE_DURATION.observe(duration);
}

pub fn increment_git_clone_errors_total() {
    GIT_CLONE_ERRORS_TOTAL.inc();
}

pub fn increment_requeues_total(reason: &str) {
    REQUEUES_TOTAL.with_label_values(&[reason]).inc();
}

pub fn set_stacks_failing(count: usize) {
    STACKS_FAILING.set(i64::try_from(count).unwrap_or(i64::MAX));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_reconciliations() {
        let before = RECONCILIATIONS_TOTAL.get();
        increment_reconciliations();
        assert_eq!(RECONCILIATIONS_TOTAL.get(), before + 1u64);
    }

    #[test]
    fn test_record_automation_operation_by_outcome() {
        let before = AUTOMATION_OPERATIONS_TOTAL
            .with_label_values(&["up", "conflict"])
            .get();
        record_automation_operation("up", "conflict", 2.5);
        assert_eq!(
            AUTOMATION_OPERATIONS_TOTAL
                .with_label_values(&["up", "conflict"])
                .get(),
            before + 1
        );
    }

    #[test]
    fn test_requeues_by_reason() {
        let before = REQUEUES_TOTAL.with_label_values(&["resync"]).get();
        increment_requeues_total("resync");
        assert_eq!(REQUEUES_TOTAL.with_label_values(&["resync"]).get(), before + 1);
    }

    #[test]
    fn test_set_stacks_failing() {
        set_stacks_failing(3);
        assert_eq!(STACKS_FAILING.get(), 3);
    }
}
