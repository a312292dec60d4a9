//! Error types for traceforge operations.
//!
//! Defines error types for each subsystem of the trace-generation pipeline:
//! - LLM API interactions (agent policy and grader)
//! - Durable run storage (attempt log, batch snapshots)
//! - Tool-call cache
//! - Answer verification
//! - The agent loop inside one episode
//! - Shard assignment, scheduling and configuration
//!
//! Only [`StorageError`] is fatal to a shard. Everything raised inside an
//! episode resolves to an attempt outcome, and [`CacheError`] never leaves
//! the cache module.

use thiserror::Error;

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: {0} environment variable not set")]
    MissingApiKey(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("LLM returned an empty response")]
    EmptyResponse,
}

/// Errors raised by the durable run store.
///
/// These mean the pipeline can no longer record what happened, so they halt
/// the affected scheduler instead of being folded into an attempt.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to create storage directory: {0}")]
    DirectoryCreationFailed(String),

    #[error("Invalid run data: {0}")]
    InvalidData(String),
}

/// Errors raised by the tool-call cache backends.
///
/// Never propagated past [`crate::cache::ToolCache`]; a failing cache
/// degrades to a miss or a dropped write.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that can occur while scoring an answer.
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("Item '{0}' has no ground-truth answer to verify against")]
    MissingGroundTruth(String),

    #[error("Score {0} is outside the range [0, 1]")]
    ScoreOutOfRange(f64),

    #[error("Grader request failed: {0}")]
    Grader(#[from] LlmError),

    #[error("Unrecognized grader verdict: {0}")]
    UnrecognizedVerdict(String),
}

/// Errors that end an agent loop without a usable answer.
#[derive(Debug, Error)]
pub enum AgentLoopError {
    #[error("Turn limit exceeded: no final answer after {max_turns} turns")]
    TurnLimitExceeded { max_turns: usize },

    #[error("Malformed agent output: {0}")]
    MalformedResponse(String),

    #[error("Agent policy failed: {0}")]
    Agent(String),

    #[error("Tool '{tool}' failed unrecoverably: {message}")]
    Tool { tool: String, message: String },
}

/// Errors from shard assignment.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShardError {
    #[error("total_workers must be at least 1")]
    ZeroWorkers,

    #[error("worker_index {worker_index} is out of range for {total_workers} workers")]
    WorkerIndexOutOfRange {
        worker_index: usize,
        total_workers: usize,
    },
}

/// Errors that halt a batch scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Sampler task panicked: {0}")]
    TaskPanicked(String),

    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfig(String),
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_error_display() {
        let err = ShardError::WorkerIndexOutOfRange {
            worker_index: 4,
            total_workers: 4,
        };
        assert!(err.to_string().contains("worker_index 4"));
        assert!(ShardError::ZeroWorkers.to_string().contains("at least 1"));
    }

    #[test]
    fn test_scheduler_error_from_storage() {
        let err: SchedulerError = StorageError::InvalidData("torn snapshot".to_string()).into();
        assert!(err.to_string().contains("torn snapshot"));
    }

    #[test]
    fn test_agent_loop_error_display() {
        let err = AgentLoopError::TurnLimitExceeded { max_turns: 12 };
        assert!(err.to_string().contains("12 turns"));
    }
}
