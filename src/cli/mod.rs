//! Command-line interface for leaseworker.
//!
//! Provides commands for running the worker, producing jobs and inspecting
//! the stream's partitions.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
