//! Failure handlers invoked for jobs that failed for good.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;

use crate::error::{JobError, SourceError};

use super::job::{FailureHandler, JobUnit};
use super::queue::QueueError;

/// Ignores failures. The source decides what happens to the job.
#[derive(Debug, Clone, Default)]
pub struct NoReactionFailureHandler;

#[async_trait]
impl FailureHandler for NoReactionFailureHandler {
    async fn handle_failure(
        &self,
        _job: &JobUnit,
        _error: &JobError,
        _cancel: &CancellationToken,
    ) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Forwards the failed job's payload to a dead-letter list.
pub struct DeadLetterFailureHandler {
    redis: ConnectionManager,
    dead_letter_queue: String,
}

impl DeadLetterFailureHandler {
    /// Connects to Redis and targets the given list.
    pub async fn connect(redis_url: &str, dead_letter_queue: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, dead_letter_queue))
    }

    pub fn from_connection(redis: ConnectionManager, dead_letter_queue: &str) -> Self {
        Self {
            redis,
            dead_letter_queue: dead_letter_queue.to_string(),
        }
    }

    pub fn dead_letter_queue(&self) -> &str {
        &self.dead_letter_queue
    }
}

/// Entry pushed to the dead-letter list.
pub fn dead_letter_entry(job: &JobUnit, error: &JobError) -> serde_json::Value {
    serde_json::json!({
        "job_id": job.id,
        "payload": job.payload,
        "error": error.to_string(),
        "moved_at": chrono::Utc::now().to_rfc3339(),
    })
}

#[async_trait]
impl FailureHandler for DeadLetterFailureHandler {
    async fn handle_failure(
        &self,
        job: &JobUnit,
        error: &JobError,
        _cancel: &CancellationToken,
    ) -> Result<(), SourceError> {
        let serialized =
            serde_json::to_string(&dead_letter_entry(job, error)).map_err(QueueError::from)?;

        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.dead_letter_queue, serialized)
            .await?;

        tracing::info!(
            job_id = %job.id,
            queue = %self.dead_letter_queue,
            "Moved failed job to dead letter queue"
        );
        Ok(())
    }
}
