//! Metrics module for Prometheus-based monitoring.
//!
//! Covers job outcomes, batch durations, heartbeats, partition claims and
//! lapsed partition leases.
//!
//! # Example
//!
//! ```ignore
//! use leaseworker::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_job(true);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{ClaimOutcome, MetricsCollector};
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    BATCH_DURATION, HEARTBEATS_TOTAL, JOBS_TOTAL, LEASES_LOST_TOTAL, PARTITION_CLAIMS_TOTAL,
    REGISTRY,
};
