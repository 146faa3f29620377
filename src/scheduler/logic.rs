//! Demo job logic.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::JobError;

use super::job::{JobLogicRunner, JobPayload};

/// Sleeps for the payload's `SleepDurationSeconds`.
///
/// Returns `JobError::Cancelled` if the token fires first.
#[derive(Debug, Clone, Default)]
pub struct SleepLogicRunner;

impl SleepLogicRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobLogicRunner for SleepLogicRunner {
    async fn run(&self, payload: &JobPayload, cancel: &CancellationToken) -> Result<(), JobError> {
        tracing::debug!(seconds = payload.sleep_duration_seconds, "Sleeping");
        tokio::select! {
            _ = cancel.cancelled() => Err(JobError::Cancelled),
            _ = tokio::time::sleep(payload.sleep_duration()) => Ok(()),
        }
    }
}
