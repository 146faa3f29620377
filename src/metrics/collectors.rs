//! High-level recording interface over the raw Prometheus metrics.

use super::prometheus::{
    BATCH_DURATION, HEARTBEATS_TOTAL, JOBS_TOTAL, LEASES_LOST_TOTAL, PARTITION_CLAIMS_TOTAL,
};

/// Result of trying to claim one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Lock acquired and the read returned jobs.
    Claimed,
    /// Lock acquired but nothing to process.
    Empty,
    /// Another holder owns the lock.
    Busy,
}

impl ClaimOutcome {
    /// Label value used in `leaseworker_partition_claims_total`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimOutcome::Claimed => "claimed",
            ClaimOutcome::Empty => "empty",
            ClaimOutcome::Busy => "busy",
        }
    }
}

/// Metrics collector for recording worker metrics.
///
/// Metrics must be initialized with `init_metrics()` for any of these calls
/// to have an effect.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record the outcome of a single job.
    pub fn record_job(&self, success: bool) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total
                .with_label_values(&[status_label(success)])
                .inc();
        }
    }

    /// Record a finished batch.
    pub fn record_batch(&self, duration_secs: f64) {
        if let Some(batch_duration) = BATCH_DURATION.get() {
            batch_duration.observe(duration_secs);
        }

        tracing::trace!(duration_secs = duration_secs, "Recorded batch metric");
    }

    /// Record a lease renewal attempt.
    pub fn record_heartbeat(&self, success: bool) {
        if let Some(heartbeats) = HEARTBEATS_TOTAL.get() {
            heartbeats
                .with_label_values(&[status_label(success)])
                .inc();
        }
    }

    /// Record a partition claim attempt.
    pub fn record_claim(&self, outcome: ClaimOutcome) {
        if let Some(claims) = PARTITION_CLAIMS_TOTAL.get() {
            claims.with_label_values(&[outcome.as_str()]).inc();
        }
    }

    /// Record a partition lock that expired before it was released.
    pub fn record_lease_lost(&self) {
        if let Some(lost) = LEASES_LOST_TOTAL.get() {
            lost.inc();
        }
    }
}

fn status_label(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_claim_outcome_labels() {
        assert_eq!(ClaimOutcome::Claimed.as_str(), "claimed");
        assert_eq!(ClaimOutcome::Empty.as_str(), "empty");
        assert_eq!(ClaimOutcome::Busy.as_str(), "busy");
    }

    #[test]
    fn test_collector_records_after_init() {
        init_metrics().expect("metrics init");
        let collector = MetricsCollector::new();

        collector.record_job(false);
        collector.record_heartbeat(true);
        collector.record_claim(ClaimOutcome::Busy);
        collector.record_lease_lost();
        collector.record_batch(1.5);

        let exported = export_metrics();
        assert!(exported.contains("leaseworker_heartbeats_total"));
        assert!(exported.contains("leaseworker_partition_claims_total"));
        assert!(exported.contains("leaseworker_leases_lost_total"));
    }
}
