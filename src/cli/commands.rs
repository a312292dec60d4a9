//! CLI command definitions for traceforge.
//!
//! `generate` runs one worker's shard of one iteration. `merge` folds every
//! persisted iteration of a dataset into one result. `status` and `shard`
//! are read-only helpers for operators watching a multi-worker run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crate::dataset::load_jsonl;
use crate::episode::EpisodeRunner;
use crate::export::{write_jsonl, SftExporter};
use crate::merge::merge;
use crate::metrics::{export_metrics, init_metrics};
use crate::pipeline::{
    build_executor, build_registry, open_cache, run_shard, select_shard, RunConfig, ShardReport,
    EXAMPLE_CONFIG,
};
use crate::scaffold::prompts::build_system_prompt;
use crate::scheduler::StopSignal;
use crate::shard::{assign, ShardKey};
use crate::trajectory::{IterationRecord, ItemStatus, RunStore, StorageKey};

/// Default storage root when neither the config nor a flag names one.
const DEFAULT_STORAGE_ROOT: &str = "./runs";

/// Rejection-sampling trace generator for tool-using agents.
#[derive(Parser)]
#[command(name = "traceforge")]
#[command(about = "Generate verified agent traces by rejection sampling")]
#[command(version)]
#[command(
    long_about = "traceforge runs a tool-using agent over a question dataset, retries each question until a verifier accepts the answer, and checkpoints every attempt so interrupted runs resume where they stopped.\n\nExample usage:\n  traceforge generate --config run.yaml --data questions.jsonl --iteration 1\n  traceforge merge --dataset questions --output merged.jsonl --sft-output sft.jsonl"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run one shard of one iteration.
    #[command(alias = "gen")]
    Generate(GenerateArgs),

    /// Merge persisted iterations into one result per item.
    Merge(MergeArgs),

    /// Show persisted progress for a storage key.
    Status(StatusArgs),

    /// Print how a dataset splits across workers.
    Shard(ShardArgs),

    /// Print an annotated example config.
    ExampleConfig,
}

/// Arguments for the generate command.
#[derive(Parser, Debug)]
pub struct GenerateArgs {
    /// YAML run config. Defaults apply when omitted.
    #[arg(short, long, env = "TRACEFORGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// JSONL dataset file. Overrides `dataset.path`.
    #[arg(long = "data")]
    pub data: Option<PathBuf>,

    /// Dataset name used in storage paths. Defaults to the file stem.
    #[arg(long)]
    pub dataset: Option<String>,

    /// Iteration number (1-based).
    #[arg(short, long, default_value = "1")]
    pub iteration: u32,

    /// Index of this worker.
    #[arg(long, default_value = "0", env = "TRACEFORGE_WORKER_INDEX")]
    pub worker_index: usize,

    /// Total number of workers sharing the dataset.
    #[arg(long, default_value = "1", env = "TRACEFORGE_TOTAL_WORKERS")]
    pub total_workers: usize,

    /// Maximum concurrent episodes.
    #[arg(long)]
    pub max_concurrent: Option<usize>,

    /// Items per checkpointed batch.
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Attempts allowed per item.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Score needed to accept an attempt.
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Only load the first N rows of the dataset.
    #[arg(long)]
    pub max_examples: Option<usize>,

    /// Resume from persisted progress (`false` discards it and starts over).
    #[arg(long, env = "TRACEFORGE_USE_CACHE")]
    pub use_cache: Option<bool>,

    /// Bypass the tool cache for this run.
    #[arg(long)]
    pub no_tool_cache: bool,

    /// Storage root. Overrides `storage.root`.
    #[arg(long)]
    pub storage_root: Option<PathBuf>,

    /// Entries file. Defaults to `entries.jsonl` in the shard directory.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Write Prometheus metrics here when the run ends.
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,

    /// Print the per-item table.
    #[arg(long)]
    pub verbose_items: bool,
}

/// Arguments for the merge command.
#[derive(Parser, Debug)]
pub struct MergeArgs {
    /// Dataset name as used by `generate`.
    #[arg(long)]
    pub dataset: String,

    /// Storage root holding the iterations.
    #[arg(long, default_value = DEFAULT_STORAGE_ROOT)]
    pub storage_root: PathBuf,

    /// Iterations to merge, in order. Defaults to every persisted one.
    #[arg(long, value_delimiter = ',')]
    pub iterations: Vec<u32>,

    /// Merged JSONL output.
    #[arg(short, long, default_value = "merged.jsonl")]
    pub output: PathBuf,

    /// Also write accepted traces in chat form.
    #[arg(long)]
    pub sft_output: Option<PathBuf>,

    /// Run config whose tools shape the SFT system prompt.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Print the summary as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the status command.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    #[arg(long)]
    pub dataset: String,

    #[arg(long, default_value = DEFAULT_STORAGE_ROOT)]
    pub storage_root: PathBuf,

    #[arg(short, long, default_value = "1")]
    pub iteration: u32,

    #[arg(long, default_value = "0")]
    pub worker_index: usize,

    #[arg(long, default_value = "1")]
    pub total_workers: usize,

    /// Print as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the shard command.
#[derive(Parser, Debug)]
pub struct ShardArgs {
    /// Number of dataset items.
    #[arg(long)]
    pub total_items: usize,

    /// Number of workers.
    #[arg(long)]
    pub total_workers: usize,
}

/// Parse CLI arguments without running.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse CLI arguments and run the selected command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(Cli::parse()).await
}

/// Run the selected command with already-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Generate(args) => run_generate_command(args).await,
        Commands::Merge(args) => run_merge_command(args).await,
        Commands::Status(args) => run_status_command(args).await,
        Commands::Shard(args) => run_shard_command(args),
        Commands::ExampleConfig => {
            print!("{}", EXAMPLE_CONFIG);
            Ok(())
        }
    }
}

/// Applies command-line overrides on top of the file config.
fn resolve_config(args: &GenerateArgs) -> anyhow::Result<RunConfig> {
    let mut config = match &args.config {
        Some(path) => RunConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RunConfig::default(),
    };

    if let Some(n) = args.max_concurrent {
        config.scheduler.core.max_concurrent = n;
    }
    if let Some(n) = args.batch_size {
        config.scheduler.core.batch_size = n;
    }
    if let Some(use_cache) = args.use_cache {
        config.scheduler.core.resume_from_cache = use_cache;
    }
    if let Some(n) = args.max_attempts {
        config.sampling.max_attempts = n;
    }
    if let Some(t) = args.threshold {
        config.sampling.threshold = t;
    }
    if args.no_tool_cache {
        config.cache.enabled = false;
    }
    if let Some(root) = &args.storage_root {
        config.storage.root = root.clone();
    }
    if let Some(path) = &args.data {
        config.dataset.path = Some(path.clone());
    }
    if let Some(name) = &args.dataset {
        config.dataset.name = Some(name.clone());
    }
    if args.max_examples.is_some() {
        config.dataset.max_examples = args.max_examples;
    }

    config.validate()?;
    Ok(config)
}

/// Dataset name from the config, else the data file's stem.
fn dataset_name(config: &RunConfig, path: &Path) -> String {
    config.dataset.name.clone().unwrap_or_else(|| {
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dataset".to_string())
    })
}

async fn run_generate_command(args: GenerateArgs) -> anyhow::Result<()> {
    let config = resolve_config(&args)?;
    let shard = ShardKey::checked(args.worker_index, args.total_workers)?;

    let data_path = config
        .dataset
        .path
        .clone()
        .context("no dataset given: pass --data or set dataset.path")?;
    let dataset = dataset_name(&config, &data_path);

    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics registry unavailable");
    }

    let items = load_jsonl(
        &data_path,
        &dataset,
        &config.dataset.fields,
        config.dataset.max_examples,
    )
    .await
    .with_context(|| format!("loading dataset {}", data_path.display()))?;
    let total_items = items.len();
    let items = select_shard(items, &shard)?;

    info!(
        dataset = %dataset,
        iteration = args.iteration,
        shard = %shard,
        items = items.len(),
        of = total_items,
        "Starting generation"
    );

    let cache = open_cache(&config.cache).await;
    let runner: Arc<dyn EpisodeRunner> = Arc::new(build_executor(&config, cache.clone())?);
    let store = Arc::new(RunStore::new(config.storage.root.clone()));
    let key = StorageKey::new(dataset, args.iteration, shard);
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| store.shard_dir(&key).join("entries.jsonl"));

    let stop = StopSignal::new();
    let interrupt = stop.clone();
    let listener = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight episodes");
            interrupt.trip();
        }
    });

    let result = run_shard(&config, runner, store, key, items, stop, Some(output)).await;
    listener.abort();

    let stats = cache.stats();
    cache.close().await;

    if let Some(path) = &args.metrics_file {
        tokio::fs::write(path, export_metrics())
            .await
            .with_context(|| format!("writing metrics to {}", path.display()))?;
    }

    let report = result?;
    print_shard_report(&report, args.verbose_items);
    println!(
        "Tool cache:    {} hits / {} misses ({:.1}% hit rate)",
        stats.hits,
        stats.misses,
        stats.hit_rate() * 100.0
    );

    if report.stopped {
        println!("Run interrupted. Re-run the same command to resume.");
    }
    Ok(())
}

fn print_shard_report(report: &ShardReport, verbose_items: bool) {
    let record = &report.record;

    println!("\n{}", "=".repeat(60));
    println!("Shard {} complete", report.key);
    println!("{}", "=".repeat(60));

    if verbose_items {
        println!("{:<24} {:<10} {:>8} {:>8}", "item", "status", "attempts", "score");
        for entry in &record.entries {
            let score = entry
                .attempt
                .as_ref()
                .and_then(|a| a.score)
                .map(|s| format!("{:.2}", s))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:<24} {:<10} {:>8} {:>8}",
                entry.item_id,
                entry.status.as_str(),
                entry.attempts,
                score
            );
        }
        println!();
    }

    println!("Accepted:      {}", record.count(ItemStatus::Accepted));
    println!("Rejected:      {}", record.count(ItemStatus::Rejected));
    println!("Exhausted:     {}", record.count(ItemStatus::Exhausted));
    println!("Attempts:      {}", report.health.attempts);
    println!("Elapsed:       {}s", report.health.elapsed_secs);
    if let Some(path) = &report.output {
        println!("Entries:       {}", path.display());
    }
}

async fn run_merge_command(args: MergeArgs) -> anyhow::Result<()> {
    let store = RunStore::new(args.storage_root.clone());
    let iterations = if args.iterations.is_empty() {
        store.list_iterations(&args.dataset).await?
    } else {
        args.iterations.clone()
    };
    if iterations.is_empty() {
        anyhow::bail!(
            "no iterations found for '{}' under {}",
            args.dataset,
            args.storage_root.display()
        );
    }

    let mut records: Vec<IterationRecord> = Vec::with_capacity(iterations.len());
    for iteration in &iterations {
        let record = store.load_iteration(&args.dataset, *iteration).await?;
        info!(iteration, entries = record.entries.len(), "Loaded iteration");
        records.push(record);
    }

    let merged = merge(&records);
    let summary = merged.summary();
    let written = write_jsonl(&args.output, &merged.items).await?;

    let mut sft_written = None;
    if let Some(path) = &args.sft_output {
        let tools = match &args.config {
            Some(config) => {
                let config = RunConfig::from_file(config)
                    .with_context(|| format!("loading config {}", config.display()))?;
                build_registry(&config.tools)?.to_json_schema()
            }
            None => serde_json::Value::Array(Vec::new()),
        };
        let exporter = SftExporter::new(args.dataset.clone(), build_system_prompt(&tools));
        let records = exporter.records(merged.accepted());
        sft_written = Some(write_jsonl(path, &records).await?);
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("\n{}", "=".repeat(60));
    println!("Merged {} iteration(s) of '{}'", iterations.len(), args.dataset);
    println!("{}", "=".repeat(60));
    println!("Items:                {}", summary.items);
    println!(
        "Accepted:             {} ({:.1}%)",
        summary.accepted,
        summary.acceptance_rate * 100.0
    );
    println!("Rejected:             {}", summary.rejected);
    println!("Exhausted:            {}", summary.exhausted);
    println!("Incomplete:           {}", summary.incomplete);
    println!("Avg attempts/accept:  {:.2}", summary.avg_attempts_to_accept);
    println!("Avg iterations/item:  {:.2}", summary.avg_iterations_per_item);
    println!("Merged rows:          {} -> {}", written, args.output.display());
    if let (Some(rows), Some(path)) = (sft_written, &args.sft_output) {
        println!("SFT rows:             {} -> {}", rows, path.display());
    }
    Ok(())
}

async fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let shard = ShardKey::checked(args.worker_index, args.total_workers)?;
    let store = RunStore::new(args.storage_root.clone());
    let key = StorageKey::new(args.dataset.clone(), args.iteration, shard);
    let progress = store.progress(&key).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&progress)?);
        return Ok(());
    }

    println!("Storage key:   {}", key);
    println!("Directory:     {}", store.shard_dir(&key).display());
    println!("Batches:       {}", progress.batches);
    println!("Accepted:      {}", progress.accepted);
    println!("Rejected:      {}", progress.rejected);
    println!("Exhausted:     {}", progress.exhausted);
    println!("Open items:    {}", progress.open);
    println!("Attempts:      {}", progress.attempts_logged);
    Ok(())
}

fn run_shard_command(args: ShardArgs) -> anyhow::Result<()> {
    let mut table: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
    for worker in 0..args.total_workers {
        let range = assign(args.total_items, worker, args.total_workers)?;
        table.insert(worker, (range.start, range.end));
    }
    if table.is_empty() {
        anyhow::bail!("total-workers must be at least 1");
    }

    println!("{:<8} {:>10} {:>10} {:>8}", "worker", "start", "end", "items");
    for (worker, (start, end)) in table {
        println!("{:<8} {:>10} {:>10} {:>8}", worker, start, end, end - start);
    }
    Ok(())
}
