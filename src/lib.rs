//! leaseworker: lease-aware background job worker.
//!
//! This library provides a fixed-size execution engine with lease renewal,
//! a poll/execute/backoff worker loop, and two job sources: a partitioned
//! stream claimed through distributed locks and checkpoints, and a point
//! queue with visibility leases.

// Core modules
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
pub mod stream;

// Re-export commonly used types
pub use config::{ConfigError, SourceKind, WorkerConfig};
pub use error::{
    CheckpointError, EngineError, JobError, LockError, ReadError, SourceError, WorkerError,
};
pub use shutdown::ShutdownArbiter;
