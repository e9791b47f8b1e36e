//! Recording helpers over the raw Prometheus metrics.

use super::prometheus::{
    NOMINATIONS_CHANGED_TOTAL, NOMINATION_PASS_SECONDS, RETRY_CASCADE_DELETED_TOTAL,
    RUN_OPERATION_ERRORS_TOTAL, RUN_TRANSITIONS_TOTAL,
};
use crate::domain::RunStatus;
use crate::error::ErrorKind;

/// Metrics collector for lifecycle and nomination activity.
///
/// Every method is a no-op until [`init_metrics`](super::init_metrics) ran.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a committed status change.
    pub fn record_transition(&self, from: RunStatus, to: RunStatus) {
        if let Some(transitions) = RUN_TRANSITIONS_TOTAL.get() {
            transitions
                .with_label_values(&[from.as_str(), to.as_str()])
                .inc();
        }

        tracing::trace!(from = %from, to = %to, "Recorded transition metric");
    }

    /// Record a failed lifecycle operation.
    pub fn record_operation_error(&self, operation: &str, kind: ErrorKind) {
        if let Some(errors) = RUN_OPERATION_ERRORS_TOTAL.get() {
            errors
                .with_label_values(&[operation, kind.as_str()])
                .inc();
        }

        tracing::trace!(
            operation = operation,
            kind = kind.as_str(),
            "Recorded operation error metric"
        );
    }

    /// Record the outcome of one nomination pass.
    ///
    /// # Arguments
    ///
    /// * `pass` - `data`, `inputs` or `drop`
    /// * `inserted` - Rows inserted
    /// * `deleted` - Rows deleted
    /// * `duration_secs` - Time spent, lock wait included
    pub fn record_nomination_pass(
        &self,
        pass: &str,
        inserted: usize,
        deleted: usize,
        duration_secs: f64,
    ) {
        if let Some(changed) = NOMINATIONS_CHANGED_TOTAL.get() {
            changed
                .with_label_values(&[pass, "insert"])
                .inc_by(inserted as f64);
            changed
                .with_label_values(&[pass, "delete"])
                .inc_by(deleted as f64);
        }

        if let Some(seconds) = NOMINATION_PASS_SECONDS.get() {
            seconds.with_label_values(&[pass]).observe(duration_secs);
        }

        tracing::trace!(
            pass = pass,
            inserted = inserted,
            deleted = deleted,
            duration_secs = duration_secs,
            "Recorded nomination pass metric"
        );
    }

    /// Record rows removed by a retry cascade.
    pub fn record_cascade(&self, runs: usize, data: usize) {
        if let Some(deleted) = RETRY_CASCADE_DELETED_TOTAL.get() {
            deleted.with_label_values(&["run"]).inc_by(runs as f64);
            deleted.with_label_values(&["data"]).inc_by(data as f64);
        }

        tracing::trace!(runs = runs, data = data, "Recorded retry cascade metric");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_is_safe_before_and_after_init() {
        let collector = MetricsCollector::new();
        collector.record_transition(RunStatus::Aborting, RunStatus::Failed);
        collector.record_nomination_pass("data", 2, 1, 0.01);

        let _ = super::super::init_metrics();
        collector.record_operation_error("retry", ErrorKind::Protected);
        collector.record_cascade(1, 2);
        collector.record_transition(RunStatus::Done, RunStatus::Waiting);
    }
}
