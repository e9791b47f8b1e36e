//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by knitcore and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{CounterVec, Encoder, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all knitcore metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Committed run status changes, labeled by from and to status.
pub static RUN_TRANSITIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Failed lifecycle operations, labeled by operation and error kind.
pub static RUN_OPERATION_ERRORS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Nomination rows inserted or deleted, labeled by pass and change.
pub static NOMINATIONS_CHANGED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Duration of a nomination pass in seconds, labeled by pass.
pub static NOMINATION_PASS_SECONDS: OnceLock<HistogramVec> = OnceLock::new();

/// Rows removed by retry cascades, labeled by entity (run or data).
pub static RETRY_CASCADE_DELETED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls fail registration against a fresh
/// registry and leave the first set in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let run_transitions_total = CounterVec::new(
        Opts::new(
            "knitcore_run_transitions_total",
            "Committed run status changes",
        ),
        &["from", "to"],
    )?;

    let run_operation_errors_total = CounterVec::new(
        Opts::new(
            "knitcore_run_operation_errors_total",
            "Failed run lifecycle operations",
        ),
        &["operation", "kind"],
    )?;

    let nominations_changed_total = CounterVec::new(
        Opts::new(
            "knitcore_nominations_changed_total",
            "Nomination rows inserted or deleted",
        ),
        &["pass", "change"],
    )?;

    let nomination_pass_seconds = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "knitcore_nomination_pass_seconds",
            "Duration of a nomination pass in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["pass"],
    )?;

    let retry_cascade_deleted_total = CounterVec::new(
        Opts::new(
            "knitcore_retry_cascade_deleted_total",
            "Rows removed by retry cascades",
        ),
        &["entity"],
    )?;

    registry.register(Box::new(run_transitions_total.clone()))?;
    registry.register(Box::new(run_operation_errors_total.clone()))?;
    registry.register(Box::new(nominations_changed_total.clone()))?;
    registry.register(Box::new(nomination_pass_seconds.clone()))?;
    registry.register(Box::new(retry_cascade_deleted_total.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = RUN_TRANSITIONS_TOTAL.set(run_transitions_total);
    let _ = RUN_OPERATION_ERRORS_TOTAL.set(run_operation_errors_total);
    let _ = NOMINATIONS_CHANGED_TOTAL.set(nominations_changed_total);
    let _ = NOMINATION_PASS_SECONDS.set(nomination_pass_seconds);
    let _ = RETRY_CASCADE_DELETED_TOTAL.set(retry_cascade_deleted_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
