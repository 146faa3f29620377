//! Job execution: the worker pool engine and its collaborators.
//!
//! - **JobManager**: fixed pool of worker tasks, batch dispatch, lease renewal
//! - **SafeJobRunner**: one job with bounded local retry and failure delegation
//! - **WorkerLoop**: poll / execute / acknowledge with idle backoff
//! - **QueueJobSource**: Redis point queue with visibility leases
//!
//! # Architecture
//!
//! ```text
//!   WorkerLoop ──get_jobs──▶ JobSource (stream or queue)
//!       │                        ▲   ▲
//!       │ run(batch)             │   │ heartbeat
//!       ▼                        │   │
//!   JobManager ──────────────────┘   │
//!       │  ├── HeartbeatMonitor ─────┘
//!       │  │
//!       ▼  ▼
//!   ┌─────────┐   ┌─────────┐   ┌─────────┐
//!   │ Worker 1│   │ Worker 2│   │ Worker N│ ── SafeJobRunner ── JobLogicRunner
//!   └─────────┘   └─────────┘   └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use leaseworker::scheduler::{JobManager, SafeJobRunner, SleepLogicRunner,
//!     NoReactionFailureHandler, WorkerLoop};
//! use leaseworker::ShutdownArbiter;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let runner = Arc::new(SafeJobRunner::new(
//!     Arc::new(SleepLogicRunner::new()),
//!     Arc::new(NoReactionFailureHandler),
//!     2,
//! ));
//! let manager = Arc::new(JobManager::new(4, source.clone(), runner));
//! let arbiter = ShutdownArbiter::new();
//! arbiter.listen_for_signals();
//!
//! WorkerLoop::new(manager, source, arbiter, Duration::from_secs(1), Duration::from_secs(30))
//!     .run()
//!     .await?;
//! ```

pub mod failure;
pub mod job;
pub mod logic;
pub mod manager;
pub mod queue;
pub mod runner;
pub mod worker_loop;

// Re-export main types for convenience
pub use failure::{DeadLetterFailureHandler, NoReactionFailureHandler};
pub use job::{
    BatchReport, FailureHandler, JobLogicRunner, JobPayload, JobSource, JobSourceResponse,
    JobUnit,
};
pub use logic::SleepLogicRunner;
pub use manager::{JobEnvelope, JobManager};
pub use queue::{QueueError, QueueJobSource, QueueStats};
pub use runner::SafeJobRunner;
pub use worker_loop::WorkerLoop;
