//! traceforge: rejection-sampled trace generation for tool-using agents.
//!
//! An agent answers dataset questions with the help of HTTP tools. Each
//! answer is scored by a verifier, and an item is retried until an attempt
//! is accepted or its attempt budget runs out. Every attempt is logged
//! durably so an interrupted run resumes without repeating settled work.
//!
//! The layers, bottom up:
//!
//! - [`cache`]: content-addressed tool result cache (memory plus SQLite)
//! - [`scaffold`], [`llm`], [`verification`]: the agent loop, its model
//!   client and answer verifiers
//! - [`episode`]: one question, one attempt, one scored trace
//! - [`sampler`]: the per-item retry state machine
//! - [`scheduler`]: bounded-concurrency batches with checkpoints
//! - [`shard`]: splitting a dataset across workers
//! - [`merge`]: folding iterations into one result per item

pub mod cache;
pub mod cli;
pub mod dataset;
pub mod episode;
pub mod error;
pub mod export;
pub mod llm;
pub mod merge;
pub mod metrics;
pub mod pipeline;
pub mod sampler;
pub mod scaffold;
pub mod scheduler;
pub mod shard;
pub mod trajectory;
pub mod verification;

// Re-export commonly used error types
pub use error::{
    AgentLoopError, CacheError, ConfigError, LlmError, SchedulerError, ShardError, StorageError,
    VerificationError,
};
