//! Safe execution of a single job.
//!
//! `SafeJobRunner` never returns an error: it retries retryable failures a
//! bounded number of times, hands final failures to the failure handler and
//! reduces everything to a success flag.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::JobError;
use crate::retry::{retry, RetryOutcome, RetryPolicy};

use super::job::{FailureHandler, JobLogicRunner, JobUnit};

/// Runs job logic with local retry and failure delegation.
pub struct SafeJobRunner {
    logic: Arc<dyn JobLogicRunner>,
    failure_handler: Arc<dyn FailureHandler>,
    retry_count: u32,
}

impl SafeJobRunner {
    pub fn new(
        logic: Arc<dyn JobLogicRunner>,
        failure_handler: Arc<dyn FailureHandler>,
        retry_count: u32,
    ) -> Self {
        Self {
            logic,
            failure_handler,
            retry_count,
        }
    }

    /// Number of local retries after the first attempt.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Runs the job. Returns `true` only if the logic eventually succeeded.
    pub async fn run(&self, job: &JobUnit, cancel: &CancellationToken) -> bool {
        let logic = &self.logic;
        let payload = &job.payload;
        let policy = RetryPolicy::Immediate {
            max_retries: self.retry_count,
        };

        let outcome = retry(
            move |attempt| {
                if attempt > 0 {
                    debug!(job_id = %job.id, attempt = attempt, "Retrying job");
                }
                logic.run(payload, cancel)
            },
            JobError::is_retryable,
            &policy,
            cancel,
        )
        .await;

        match outcome {
            RetryOutcome::Succeeded { attempts, .. } => {
                debug!(job_id = %job.id, attempts = attempts, "Job succeeded");
                true
            }
            // Cancellation is not a job failure, whether it struck between
            // attempts or inside one.
            RetryOutcome::Cancelled { attempts }
            | RetryOutcome::Fatal {
                error: JobError::Cancelled,
                attempts,
            } => {
                debug!(job_id = %job.id, attempts = attempts, "Job cancelled");
                false
            }
            RetryOutcome::Exhausted { error, attempts } | RetryOutcome::Fatal { error, attempts } => {
                warn!(job_id = %job.id, attempts = attempts, error = %error, "Job failed");
                self.report_failure(job, &error, cancel).await;
                false
            }
        }
    }

    async fn report_failure(&self, job: &JobUnit, err: &JobError, cancel: &CancellationToken) {
        if let Err(e) = self.failure_handler.handle_failure(job, err, cancel).await {
            error!(job_id = %job.id, error = %e, "Failure handler failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::scheduler::job::JobPayload;
    use crate::scheduler::logic::SleepLogicRunner;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Fails with the given error until `failures` attempts have been made.
    struct FlakyLogic {
        failures: u32,
        retryable: bool,
        calls: AtomicU32,
    }

    impl FlakyLogic {
        fn new(failures: u32, retryable: bool) -> Self {
            Self {
                failures,
                retryable,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl JobLogicRunner for FlakyLogic {
        async fn run(&self, _payload: &JobPayload, _cancel: &CancellationToken) -> Result<(), JobError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                if self.retryable {
                    Err(JobError::Retryable("busy".to_string()))
                } else {
                    Err(JobError::Fatal("bad payload".to_string()))
                }
            } else {
                Ok(())
            }
        }
    }

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl FailureHandler for CountingHandler {
        async fn handle_failure(
            &self,
            _job: &JobUnit,
            _error: &JobError,
            _cancel: &CancellationToken,
        ) -> Result<(), SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(SourceError::Redis(redis::RedisError::from((
                    redis::ErrorKind::IoError,
                    "connection refused",
                ))))
            } else {
                Ok(())
            }
        }
    }

    fn job() -> JobUnit {
        JobUnit::new("job-1", JobPayload::sleep(0))
    }

    #[tokio::test]
    async fn test_always_retryable_exhausts_retries() {
        let logic = Arc::new(FlakyLogic::new(u32::MAX, true));
        let handler = Arc::new(CountingHandler::default());
        let runner = SafeJobRunner::new(logic.clone(), handler.clone(), 2);

        assert!(!runner.run(&job(), &CancellationToken::new()).await);
        assert_eq!(logic.calls.load(Ordering::SeqCst), 3);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_within_retry_budget() {
        let logic = Arc::new(FlakyLogic::new(2, true));
        let handler = Arc::new(CountingHandler::default());
        let runner = SafeJobRunner::new(logic.clone(), handler.clone(), 2);

        assert!(runner.run(&job(), &CancellationToken::new()).await);
        assert_eq!(logic.calls.load(Ordering::SeqCst), 3);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let logic = Arc::new(FlakyLogic::new(1, false));
        let handler = Arc::new(CountingHandler::default());
        let runner = SafeJobRunner::new(logic.clone(), handler.clone(), 5);

        assert!(!runner.run(&job(), &CancellationToken::new()).await);
        assert_eq!(logic.calls.load(Ordering::SeqCst), 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_handler_errors_are_swallowed() {
        let logic = Arc::new(FlakyLogic::new(u32::MAX, false));
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail: true,
        });
        let runner = SafeJobRunner::new(logic, handler.clone(), 0);

        assert!(!runner.run(&job(), &CancellationToken::new()).await);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_job_skips_failure_handler() {
        let logic = Arc::new(FlakyLogic::new(0, true));
        let handler = Arc::new(CountingHandler::default());
        let runner = SafeJobRunner::new(logic.clone(), handler.clone(), 2);

        let token = CancellationToken::new();
        token.cancel();

        assert!(!runner.run(&job(), &token).await);
        assert_eq!(logic.calls.load(Ordering::SeqCst), 0);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_cancelled_mid_run_skips_failure_handler() {
        let handler = Arc::new(CountingHandler::default());
        let runner = SafeJobRunner::new(Arc::new(SleepLogicRunner::new()), handler.clone(), 2);

        let token = CancellationToken::new();
        let stopper = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            stopper.cancel();
        });

        let started = tokio::time::Instant::now();
        let job = JobUnit::new("long", JobPayload::sleep(60));
        assert!(!runner.run(&job, &token).await);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }
}
