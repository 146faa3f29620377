//! Error types for leaseworker operations.
//!
//! Defines error types for each subsystem:
//! - Job logic execution (retryable vs. fatal)
//! - Job sources (stream partitions and point queues)
//! - Distributed locking, checkpoint storage and partition reads
//! - The execution engine and the top-level worker loop

use thiserror::Error;

/// Errors raised by job logic.
///
/// Only `Retryable` is retried locally by the safe runner; every other
/// variant goes straight to the failure handler.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Retryable job error: {0}")]
    Retryable(String),

    #[error("Job failed: {0}")]
    Fatal(String),

    #[error("Job cancelled")]
    Cancelled,
}

impl JobError {
    /// Whether the safe runner may try the job again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Retryable(_))
    }
}

/// Errors that can occur while acquiring or releasing a distributed lock.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock backend error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Invalid lock request for '{name}': {reason}")]
    InvalidRequest { name: String, reason: String },
}

/// Errors that can occur while reading or writing checkpoints.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Short-term checkpoint store error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Long-term checkpoint store error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("Failed to resolve read position for partition '{partition}': {reason}")]
    Resolve { partition: String, reason: String },
}

/// Errors that can occur while reading a partition of the log.
#[derive(Debug, Error)]
pub enum ReadError {
    /// The position token is no longer valid. Callers treat this as an
    /// empty read and fall back to the last durable checkpoint.
    #[error("Read position '{position}' expired for partition '{partition}'")]
    PositionExpired { partition: String, position: String },

    #[error("Stream backend error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Errors surfaced by a job source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// `get_jobs` was called while the previous batch still holds its
    /// partition lock. This is a caller bug and is never retried.
    #[error("Previous batch from partition '{partition}' is not fully acknowledged ({acknowledged}/{drawn})")]
    BatchOutstanding {
        partition: String,
        drawn: usize,
        acknowledged: usize,
    },

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Partition read error: {0}")]
    Read(#[from] ReadError),

    #[error("Queue error: {0}")]
    Queue(#[from] crate::scheduler::queue::QueueError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl SourceError {
    /// Usage errors must reach the process boundary; everything else is a
    /// backend hiccup the worker loop can wait out.
    pub fn is_usage_error(&self) -> bool {
        matches!(self, SourceError::BatchOutstanding { .. })
    }
}

/// Errors raised by the execution engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Job manager already started")]
    AlreadyStarted,

    #[error("Job manager not started")]
    NotStarted,

    #[error("A batch is already running")]
    RunInProgress,

    #[error("Batch cancelled before dispatch")]
    Cancelled,
}

/// Errors that end the worker loop.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Job source error: {0}")]
    Source(#[from] SourceError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_error_retryable() {
        assert!(JobError::Retryable("busy".to_string()).is_retryable());
        assert!(!JobError::Fatal("bad input".to_string()).is_retryable());
        assert!(!JobError::Cancelled.is_retryable());
    }

    #[test]
    fn test_source_error_usage_classification() {
        let err = SourceError::BatchOutstanding {
            partition: "shard-0".to_string(),
            drawn: 5,
            acknowledged: 2,
        };
        assert!(err.is_usage_error());
        assert!(err.to_string().contains("shard-0"));
        assert!(err.to_string().contains("2/5"));

        let err = SourceError::Read(ReadError::PositionExpired {
            partition: "shard-0".to_string(),
            position: "1-0".to_string(),
        });
        assert!(!err.is_usage_error());
    }
}
