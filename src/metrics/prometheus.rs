//! Prometheus metrics registration and export.
//!
//! Every metric lives in a `OnceLock` so that recording is a no-op until
//! `init_metrics` has run.

use prometheus::{CounterVec, Encoder, Histogram, IntCounter, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all leaseworker metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of jobs executed, labeled by status (`success`/`failure`).
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Wall-clock duration of a batch run in seconds.
pub static BATCH_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Total lease renewals, labeled by status (`success`/`failure`).
pub static HEARTBEATS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Partition claim attempts, labeled by outcome.
pub static PARTITION_CLAIMS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Partition locks that had expired by the time they were released.
pub static LEASES_LOST_TOTAL: OnceLock<IntCounter> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Calling this more than once keeps the metrics from the first call.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric creation or registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let jobs_total = CounterVec::new(
        Opts::new("leaseworker_jobs_total", "Total number of jobs executed"),
        &["status"],
    )?;

    let batch_duration = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "leaseworker_batch_duration_seconds",
            "Batch execution duration in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
    )?;

    let heartbeats_total = CounterVec::new(
        Opts::new("leaseworker_heartbeats_total", "Total lease renewals"),
        &["status"],
    )?;

    let partition_claims_total = CounterVec::new(
        Opts::new(
            "leaseworker_partition_claims_total",
            "Partition claim attempts by outcome",
        ),
        &["outcome"],
    )?;

    let leases_lost_total = IntCounter::new(
        "leaseworker_leases_lost_total",
        "Partition locks found expired at release",
    )?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(batch_duration.clone()))?;
    registry.register(Box::new(heartbeats_total.clone()))?;
    registry.register(Box::new(partition_claims_total.clone()))?;
    registry.register(Box::new(leases_lost_total.clone()))?;

    // Losing a race here means another caller initialised first.
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = BATCH_DURATION.set(batch_duration);
    let _ = HEARTBEATS_TOTAL.set(heartbeats_total);
    let _ = PARTITION_CLAIMS_TOTAL.set(partition_claims_total);
    let _ = LEASES_LOST_TOTAL.set(leases_lost_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of metrics when the registry has not been
/// initialised or encoding fails.
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(jobs) = JOBS_TOTAL.get() {
            jobs.with_label_values(&["success"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("leaseworker_jobs_total"));
    }
}
