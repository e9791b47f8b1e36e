//! Metrics module for Prometheus-based monitoring.
//!
//! # Example
//!
//! ```ignore
//! use knitcore::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_nomination_pass("data", 3, 0, 0.002);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    NOMINATIONS_CHANGED_TOTAL, NOMINATION_PASS_SECONDS, REGISTRY, RETRY_CASCADE_DELETED_TOTAL,
    RUN_OPERATION_ERRORS_TOTAL, RUN_TRANSITIONS_TOTAL,
};
