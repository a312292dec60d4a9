//! Wiring a [`RunConfig`] into a running shard.
//!
//! The builders here turn config sections into the collaborators the
//! episode executor needs (LLM client, tool registry, verifier, cache).
//! [`run_shard`] then drives one storage key through the batch scheduler,
//! streaming entries to an output file as they settle.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::info;

use super::config::{CacheSection, RunConfig, ToolSpec, VerifierKind};
use crate::cache::ToolCache;
use crate::episode::{EpisodeExecutor, EpisodeRunner, ExecutorConfig};
use crate::error::{ConfigError, LlmError, SchedulerError, ShardError};
use crate::export::JsonlWriter;
use crate::llm::{LiteLlmClient, LlmProvider};
use crate::scaffold::{HttpTool, LlmAgent, ToolInvoker, ToolRegistry};
use crate::scheduler::{BatchScheduler, HealthSnapshot, ProgressMonitor, StopSignal};
use crate::shard::ShardKey;
use crate::trajectory::{IterationRecord, Item, RunStore, StorageKey};
use crate::verification::{F1Verifier, LlmJudgeVerifier, Verifier};

/// Outcome of one `generate` run for a storage key.
#[derive(Debug, Clone)]
pub struct ShardReport {
    pub key: StorageKey,
    pub record: IterationRecord,
    pub health: HealthSnapshot,
    pub output: Option<PathBuf>,
    /// The stop signal fired before every item settled.
    pub stopped: bool,
}

/// Builds an OpenAI-compatible client, reading the key from `key_env` if set.
pub fn llm_client(
    api_base: &str,
    key_env: Option<&str>,
    model: &str,
    timeout: Duration,
) -> Result<LiteLlmClient, ConfigError> {
    let client = match key_env {
        Some(var) => LiteLlmClient::from_key_env(api_base, var, model, timeout),
        None => LiteLlmClient::new(api_base, None, model, timeout),
    };
    client.map_err(|e| match e {
        LlmError::MissingApiKey(var) => ConfigError::MissingEnvVar(var),
        other => ConfigError::InvalidValue {
            key: "agent.api_base".to_string(),
            message: other.to_string(),
        },
    })
}

/// Registers one [`HttpTool`] per configured tool.
pub fn build_registry(specs: &[ToolSpec]) -> Result<ToolRegistry, ConfigError> {
    let mut registry = ToolRegistry::new();
    for tool_spec in specs {
        let mut tool = HttpTool::new(
            tool_spec.name.clone(),
            tool_spec.description.clone(),
            tool_spec.endpoint.clone(),
            tool_spec.parameters.clone(),
            Duration::from_secs(tool_spec.timeout_secs),
        );
        if let Some(var) = &tool_spec.api_key_env {
            let key = std::env::var(var).map_err(|_| ConfigError::MissingEnvVar(var.clone()))?;
            tool = tool.with_api_key(key);
        }
        registry.register(Arc::new(tool));
    }
    Ok(registry)
}

pub fn build_verifier(config: &RunConfig) -> Result<Arc<dyn Verifier>, ConfigError> {
    let section = &config.verifier;
    match section.kind {
        VerifierKind::F1 => Ok(Arc::new(F1Verifier)),
        VerifierKind::LlmJudge => {
            let model = section
                .grader_model
                .clone()
                .unwrap_or_else(|| config.agent.settings.model.clone());
            let api_base = section
                .grader_api_base
                .as_deref()
                .unwrap_or(&config.agent.api_base);
            let key_env = section
                .grader_api_key_env
                .as_deref()
                .or(config.agent.api_key_env.as_deref());
            let grader = llm_client(
                api_base,
                key_env,
                &model,
                Duration::from_secs(config.agent.request_timeout_secs),
            )?;
            Ok(Arc::new(
                LlmJudgeVerifier::new(Arc::new(grader), model)
                    .with_f1_threshold(section.f1_threshold)
                    .with_temperature(section.temperature)
                    .with_max_tokens(section.max_tokens),
            ))
        }
    }
}

/// Opens the process-wide tool cache described by `section`.
///
/// A disabled cache is still returned so callers never branch on it.
pub async fn open_cache(section: &CacheSection) -> Arc<ToolCache> {
    if !section.enabled {
        let cache = ToolCache::in_memory(0);
        cache.disable();
        return Arc::new(cache);
    }
    let cache = ToolCache::open(&section.path, section.memory_entries).await;
    info!(
        path = ?section.path,
        durable = cache.is_durable(),
        persisted = ?cache.persisted_entries().await,
        "Opened tool cache"
    );
    Arc::new(cache)
}

/// Builds the production episode executor.
pub fn build_executor(
    config: &RunConfig,
    cache: Arc<ToolCache>,
) -> Result<EpisodeExecutor, ConfigError> {
    let registry = Arc::new(build_registry(&config.tools)?);
    let agent = &config.agent;
    let client = llm_client(
        &agent.api_base,
        agent.api_key_env.as_deref(),
        &agent.settings.model,
        Duration::from_secs(agent.request_timeout_secs),
    )?;
    let llm: Arc<dyn LlmProvider> = Arc::new(client);
    let policy = LlmAgent::new(llm, agent.settings.clone(), &registry);

    let executor_config = ExecutorConfig::default()
        .with_max_turns(agent.settings.max_turns)
        .with_force_final_answer(agent.settings.force_final_answer)
        .with_threshold(config.sampling.threshold);

    info!(
        model = %agent.settings.model,
        tools = ?registry.list_tools(),
        verifier = ?config.verifier.kind,
        "Built episode executor"
    );

    Ok(EpisodeExecutor::new(
        Arc::new(policy),
        ToolInvoker::new(registry, cache),
        build_verifier(config)?,
        executor_config,
    ))
}

/// Keeps only the items this worker owns.
pub fn select_shard(items: Vec<Item>, shard: &ShardKey) -> Result<Vec<Item>, ShardError> {
    let range = shard.range(items.len())?;
    Ok(items
        .into_iter()
        .skip(range.start)
        .take(range.len())
        .collect())
}

/// Runs one storage key to completion (or until `stop` fires).
///
/// Entries are appended to `output` in dataset order as their batch is
/// checkpointed.
pub async fn run_shard(
    config: &RunConfig,
    runner: Arc<dyn EpisodeRunner>,
    store: Arc<RunStore>,
    key: StorageKey,
    items: Vec<Item>,
    stop: StopSignal,
    output: Option<PathBuf>,
) -> Result<ShardReport, SchedulerError> {
    let scheduler = BatchScheduler::new(
        runner,
        store,
        key.clone(),
        config.sampling,
        config.scheduler.core.clone(),
    )?
    .with_stop_signal(stop.clone());

    let monitor = ProgressMonitor::start(
        scheduler.progress().clone(),
        Duration::from_secs(config.scheduler.progress_interval_secs),
        Duration::from_secs(config.scheduler.stall_after_secs),
    );

    let mut writer = match &output {
        Some(path) => Some(JsonlWriter::create(path).await?),
        None => None,
    };
    let mut record = IterationRecord::new(key.dataset.clone(), key.iteration);
    let total = items.len();

    let result = async {
        let stream = scheduler.run(items);
        futures::pin_mut!(stream);
        while let Some(entry) = stream.next().await {
            let entry = entry?;
            if let Some(writer) = writer.as_mut() {
                writer.write(&entry).await?;
                writer.flush().await?;
            }
            record.entries.push(entry);
        }
        Ok::<(), SchedulerError>(())
    }
    .await;
    monitor.stop().await;
    result?;

    if let Some(writer) = writer {
        writer.finish().await?;
    }

    let stopped = record.entries.len() < total && stop.is_tripped();
    Ok(ShardReport {
        key,
        health: scheduler.health(),
        record,
        output,
        stopped,
    })
}
