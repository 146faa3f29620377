//! The poll / execute / acknowledge cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use crate::error::{EngineError, SourceError, WorkerError};
use crate::retry::{retry, RetryOutcome, RetryPolicy};
use crate::shutdown::ShutdownArbiter;

use super::job::{JobSource, JobSourceResponse};
use super::manager::JobManager;

/// Why a poll produced no batch.
#[derive(Debug)]
enum PollError {
    NoWork,
    Source(SourceError),
}

impl PollError {
    fn is_retryable(&self) -> bool {
        match self {
            PollError::NoWork => true,
            PollError::Source(e) => !e.is_usage_error(),
        }
    }
}

/// Drives the engine until the shutdown arbiter fires.
pub struct WorkerLoop {
    manager: Arc<JobManager>,
    source: Arc<dyn JobSource>,
    arbiter: ShutdownArbiter,
    idle_policy: RetryPolicy,
}

impl WorkerLoop {
    /// Creates a loop that backs off between `min_idle` and `max_idle` when
    /// the source has nothing to do.
    pub fn new(
        manager: Arc<JobManager>,
        source: Arc<dyn JobSource>,
        arbiter: ShutdownArbiter,
        min_idle: Duration,
        max_idle: Duration,
    ) -> Self {
        Self {
            manager,
            source,
            arbiter,
            idle_policy: RetryPolicy::Exponential {
                min: min_idle,
                max: max_idle,
            },
        }
    }

    /// Runs until shutdown.
    ///
    /// # Errors
    ///
    /// Returns usage errors from the source and engine errors other than
    /// cancellation. Backend failures only cause a backoff.
    pub async fn run(&self) -> Result<(), WorkerError> {
        self.manager.start()?;
        info!(workers = self.manager.worker_count(), "Worker loop started");

        let result = self.poll_and_execute().await;

        self.manager.shutdown().await;
        info!("Worker loop stopped");
        result
    }

    async fn poll_and_execute(&self) -> Result<(), WorkerError> {
        let cancel = self.arbiter.token();

        while self.arbiter.should_keep_running() {
            let outcome = retry(
                move |attempt| self.poll(attempt, cancel),
                PollError::is_retryable,
                &self.idle_policy,
                cancel,
            )
            .await;

            let batch = match outcome {
                RetryOutcome::Succeeded { value, .. } => value,
                RetryOutcome::Cancelled { .. } => break,
                RetryOutcome::Fatal {
                    error: PollError::Source(e),
                    ..
                } => return Err(e.into()),
                RetryOutcome::Fatal { .. } | RetryOutcome::Exhausted { .. } => continue,
            };

            let report = match self.manager.run(batch, cancel).await {
                Ok(report) => report,
                Err(EngineError::Cancelled) => break,
                Err(e) => return Err(e.into()),
            };

            for (job, success) in &report.results {
                if let Err(e) = self
                    .source
                    .acknowledge_completion(job, *success, cancel)
                    .await
                {
                    warn!(job_id = %job.id, error = %e, "Failed to acknowledge job");
                }
            }
        }

        Ok(())
    }

    async fn poll(&self, attempt: u32, cancel: &CancellationToken) -> Result<JobSourceResponse, PollError> {
        match self.source.get_jobs(cancel).await {
            Ok(batch) if batch.is_empty() => {
                trace!(attempt = attempt, "No jobs available");
                Err(PollError::NoWork)
            }
            Ok(batch) => Ok(batch),
            Err(e) if e.is_usage_error() => Err(PollError::Source(e)),
            Err(e) => {
                warn!(attempt = attempt, error = %e, "Failed to fetch jobs");
                Err(PollError::Source(e))
            }
        }
    }
}
