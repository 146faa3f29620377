//! Job definitions for the scheduler.
//!
//! This module defines the core job types and the seams of the engine:
//!
//! - `JobUnit`: a unit of work handed out by a source
//! - `JobPayload`: the domain payload carried by a job
//! - `JobSourceResponse`: a batch plus the recommended lease-renewal interval
//! - `BatchReport`: per-batch outcome of the engine
//! - `JobSource`, `JobLogicRunner`, `FailureHandler`: pluggable collaborators

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{JobError, SourceError};

/// Domain payload of a job.
///
/// Encoded as a JSON object; unknown fields are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobPayload {
    /// How long the job logic sleeps.
    #[serde(rename = "SleepDurationSeconds", default)]
    pub sleep_duration_seconds: u64,
}

impl JobPayload {
    pub fn sleep(seconds: u64) -> Self {
        Self {
            sleep_duration_seconds: seconds,
        }
    }

    pub fn sleep_duration(&self) -> Duration {
        Duration::from_secs(self.sleep_duration_seconds)
    }
}

/// A unit of work handed out by a job source.
///
/// The id is opaque to the engine. Sources use it to find their own
/// bookkeeping (stream record id, queue message id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobUnit {
    pub id: String,
    pub payload: JobPayload,
}

impl JobUnit {
    pub fn new(id: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

/// A batch of jobs returned by `JobSource::get_jobs`.
#[derive(Debug, Clone, Default)]
pub struct JobSourceResponse {
    pub items: Vec<JobUnit>,
    /// Seconds between lease renewals. Zero means the source needs none.
    pub recommended_heartbeat_seconds: u64,
}

impl JobSourceResponse {
    pub fn new(items: Vec<JobUnit>, recommended_heartbeat_seconds: u64) -> Self {
        Self {
            items,
            recommended_heartbeat_seconds,
        }
    }

    /// An empty batch: the source has no work right now.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.recommended_heartbeat_seconds > 0)
            .then(|| Duration::from_secs(self.recommended_heartbeat_seconds))
    }
}

/// Outcome of one `JobManager::run` call.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// Every job of the batch with its recorded result, in dispatch order.
    pub results: Vec<(JobUnit, bool)>,
    pub succeeded: usize,
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn failed(&self) -> usize {
        self.total() - self.succeeded
    }
}

/// Decodes a raw record into a job payload.
///
/// A `null` or non-object document carries no job and yields `Ok(None)`.
pub fn decode_payload(raw: &str) -> Result<Option<JobPayload>, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    if !value.is_object() {
        return Ok(None);
    }
    serde_json::from_value(value).map(Some)
}

/// Orders a batch so the longest-running jobs are dispatched first.
///
/// The sort is stable: jobs of equal length keep their source order.
pub fn sort_longest_first(jobs: &mut [JobUnit]) {
    jobs.sort_by(|a, b| {
        b.payload
            .sleep_duration_seconds
            .cmp(&a.payload.sleep_duration_seconds)
    });
}

/// A pluggable provider of jobs.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Pulls the next batch. An empty batch means "no work right now".
    async fn get_jobs(&self, cancel: &CancellationToken) -> Result<JobSourceResponse, SourceError>;

    /// Extends the lease on a job that is still running.
    async fn heartbeat(&self, job: &JobUnit, cancel: &CancellationToken)
        -> Result<(), SourceError>;

    /// Reports the final result of a job back to the source.
    async fn acknowledge_completion(
        &self,
        job: &JobUnit,
        success: bool,
        cancel: &CancellationToken,
    ) -> Result<(), SourceError>;
}

/// The domain logic executed for each job.
#[async_trait]
pub trait JobLogicRunner: Send + Sync {
    async fn run(&self, payload: &JobPayload, cancel: &CancellationToken) -> Result<(), JobError>;
}

/// Reaction to a job that failed for good.
#[async_trait]
pub trait FailureHandler: Send + Sync {
    async fn handle_failure(
        &self,
        job: &JobUnit,
        error: &JobError,
        cancel: &CancellationToken,
    ) -> Result<(), SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str, secs: u64) -> JobUnit {
        JobUnit::new(id, JobPayload::sleep(secs))
    }

    #[test]
    fn test_decode_payload() {
        let payload = decode_payload(r#"{"SleepDurationSeconds": 7, "Extra": "x"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(payload.sleep_duration_seconds, 7);
        assert_eq!(payload.sleep_duration(), Duration::from_secs(7));
    }

    #[test]
    fn test_decode_payload_without_job() {
        assert!(decode_payload("null").unwrap().is_none());
        assert!(decode_payload("[1, 2]").unwrap().is_none());
        assert!(decode_payload("42").unwrap().is_none());
    }

    #[test]
    fn test_decode_payload_rejects_garbage() {
        assert!(decode_payload("not json").is_err());
        assert!(decode_payload(r#"{"SleepDurationSeconds": "soon"}"#).is_err());
    }

    #[test]
    fn test_payload_wire_name() {
        let encoded = serde_json::to_string(&JobPayload::sleep(3)).unwrap();
        assert_eq!(encoded, r#"{"SleepDurationSeconds":3}"#);
    }

    #[test]
    fn test_sort_longest_first_is_stable() {
        let mut jobs = vec![job("a", 1), job("b", 5), job("c", 1), job("d", 3)];
        sort_longest_first(&mut jobs);

        let ids: Vec<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn test_response_heartbeat_interval() {
        let response = JobSourceResponse::new(vec![job("a", 1)], 0);
        assert!(response.heartbeat_interval().is_none());
        assert_eq!(response.len(), 1);

        let response = JobSourceResponse::new(vec![job("a", 1)], 23);
        assert_eq!(response.heartbeat_interval(), Some(Duration::from_secs(23)));
        assert!(JobSourceResponse::empty().is_empty());
    }

    #[test]
    fn test_batch_report_counts() {
        let report = BatchReport {
            results: vec![(job("a", 1), true), (job("b", 1), false), (job("c", 1), true)],
            succeeded: 2,
            elapsed: Duration::from_secs(2),
        };
        assert_eq!(report.total(), 3);
        assert_eq!(report.failed(), 1);
    }
}
