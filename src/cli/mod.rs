//! Command-line interface for traceforge.
//!
//! Provides commands for shard generation, iteration merging, progress
//! inspection and shard planning.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
