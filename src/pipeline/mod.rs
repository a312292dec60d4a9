//! Run configuration and pipeline assembly.
//!
//! # Pipeline Flow
//!
//! 1. **Config**: a YAML [`RunConfig`] names the agent endpoint, tools,
//!    verifier, cache, sampling policy and scheduler limits
//! 2. **Assembly**: [`build_executor`] wires the LLM agent, the cached tool
//!    invoker and the verifier into an episode executor
//! 3. **Shard**: [`select_shard`] keeps this worker's items
//! 4. **Run**: [`run_shard`] drives the batch scheduler and streams settled
//!    entries to disk
//!
//! # Example
//!
//! ```rust,ignore
//! use traceforge::pipeline::{build_executor, open_cache, run_shard, RunConfig};
//!
//! let config = RunConfig::from_file("run.yaml")?;
//! let cache = open_cache(&config.cache).await;
//! let executor = Arc::new(build_executor(&config, cache.clone())?);
//! let report = run_shard(&config, executor, store, key, items, stop, Some(output)).await?;
//! cache.close().await;
//! ```

pub mod config;
pub mod runner;

pub use config::{
    AgentSection, CacheSection, DatasetSection, RunConfig, SchedulerSection, StorageSection,
    ToolSpec, VerifierKind, VerifierSection, EXAMPLE_CONFIG,
};
pub use runner::{
    build_executor, build_registry, build_verifier, llm_client, open_cache, run_shard,
    select_shard, ShardReport,
};
