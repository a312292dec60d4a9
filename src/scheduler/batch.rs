//! Bounded-concurrency batch scheduler.
//!
//! Items are split into ordered batches. Inside a batch every item gets its
//! own sampler task, gated by a semaphore sized to `max_concurrent`; the
//! batch is drained, checkpointed as one snapshot file, and only then
//! emitted in input order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::progress::{HealthSnapshot, ProgressCounters};
use super::signal::StopSignal;
use crate::episode::EpisodeRunner;
use crate::error::SchedulerError;
use crate::metrics;
use crate::sampler::{record_settled, RejectionSampler, SamplingPolicy};
use crate::trajectory::{BatchSnapshot, IterationEntry, IterationRecord, Item, RunStore, StorageKey};

/// Concurrency and checkpointing knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Hard ceiling on concurrently sampled items (and so on episodes).
    pub max_concurrent: usize,
    /// Items per checkpointed batch.
    pub batch_size: usize,
    /// Skip items already settled in persisted output for this key.
    pub resume_from_cache: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            batch_size: 64,
            resume_from_cache: true,
        }
    }
}

impl SchedulerConfig {
    pub fn new(max_concurrent: usize, batch_size: usize) -> Self {
        Self {
            max_concurrent,
            batch_size,
            ..Default::default()
        }
    }

    pub fn with_resume(mut self, resume_from_cache: bool) -> Self {
        self.resume_from_cache = resume_from_cache;
        self
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.max_concurrent == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(SchedulerError::InvalidConfig(
                "batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Drives one shard's items through rejection sampling.
pub struct BatchScheduler {
    runner: Arc<dyn EpisodeRunner>,
    store: Arc<RunStore>,
    key: StorageKey,
    policy: SamplingPolicy,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
    stop: StopSignal,
    progress: ProgressCounters,
}

impl BatchScheduler {
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidConfig`] when either the scheduler
    /// config or the sampling policy is out of range.
    pub fn new(
        runner: Arc<dyn EpisodeRunner>,
        store: Arc<RunStore>,
        key: StorageKey,
        policy: SamplingPolicy,
        config: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        policy
            .validate()
            .map_err(|e| SchedulerError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            runner,
            store,
            key,
            policy,
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            stop: StopSignal::new(),
            progress: ProgressCounters::new(),
        })
    }

    /// Shares an externally owned stop signal (for example the CLI's Ctrl-C hook).
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    pub fn progress(&self) -> &ProgressCounters {
        &self.progress
    }

    pub fn key(&self) -> &StorageKey {
        &self.key
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn health(&self) -> HealthSnapshot {
        self.progress.snapshot()
    }

    pub fn is_stalled(&self, max_idle: Duration) -> bool {
        self.progress.is_stalled(max_idle)
    }

    /// Streams one settled entry per item, in input order.
    ///
    /// Entries of a batch are yielded only after its snapshot is on disk.
    /// A storage failure stops the shard: the batch drains, nothing is
    /// checkpointed for it, and the stream ends with the error.
    pub fn run(
        &self,
        items: Vec<Item>,
    ) -> impl Stream<Item = Result<IterationEntry, SchedulerError>> + '_ {
        try_stream! {
            let sampler = Arc::new(
                RejectionSampler::new(
                    self.runner.clone(),
                    self.store.clone(),
                    self.key.clone(),
                    self.policy,
                )
                .with_stop_signal(self.stop.clone())
                .with_progress(self.progress.clone()),
            );

            let (mut settled, mut log) = if self.config.resume_from_cache {
                let mut settled: HashMap<String, IterationEntry> = HashMap::new();
                for snapshot in self.store.load_snapshots(&self.key).await? {
                    for entry in snapshot.entries {
                        if entry.status.is_terminal() {
                            settled.entry(entry.item_id.clone()).or_insert(entry);
                        }
                    }
                }
                (settled, self.store.load_attempts(&self.key).await?)
            } else {
                self.store.reset(&self.key).await?;
                (HashMap::new(), HashMap::new())
            };

            self.progress.add_total(items.len());
            info!(
                key = %self.key,
                items = items.len(),
                already_settled = settled.len(),
                max_concurrent = self.config.max_concurrent,
                batch_size = self.config.batch_size,
                "Starting shard"
            );

            for (batch_index, batch) in items.chunks(self.config.batch_size).enumerate() {
                if self.stop.is_tripped() {
                    break;
                }

                let mut slots: Vec<Option<IterationEntry>> = vec![None; batch.len()];
                let mut tasks = JoinSet::new();
                let mut dispatched = 0usize;

                for (slot, item) in batch.iter().enumerate() {
                    if let Some(entry) = settled.remove(&item.id) {
                        self.progress.item_settled(entry.status);
                        slots[slot] = Some(entry);
                        continue;
                    }
                    // Keep walking after a stop so settled items still land in the snapshot
                    if self.stop.is_tripped() {
                        continue;
                    }

                    let permit = self
                        .permits
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|e| SchedulerError::InvalidConfig(e.to_string()))?;
                    if self.stop.is_tripped() {
                        continue;
                    }

                    let prior = log.remove(&item.id).unwrap_or_default();
                    let sampler = sampler.clone();
                    let progress = self.progress.clone();
                    let stop = self.stop.clone();
                    let item = item.clone();
                    progress.item_started();
                    tasks.spawn(async move {
                        let result = sampler.sample(&item, &prior).await;
                        if result.is_err() {
                            stop.trip();
                        }
                        drop(permit);
                        progress.item_finished();
                        (slot, item, result)
                    });
                    dispatched += 1;
                }

                let mut failure: Option<SchedulerError> = None;
                while let Some(joined) = tasks.join_next().await {
                    match joined {
                        Ok((slot, item, Ok(outcome))) => {
                            record_settled(&self.progress, outcome.status);
                            slots[slot] = Some(outcome.into_entry(&item));
                        }
                        Ok((_, item, Err(e))) => {
                            error!(item_id = %item.id, error = %e, "Attempt log write failed");
                            failure.get_or_insert(e.into());
                        }
                        Err(e) => {
                            self.stop.trip();
                            failure.get_or_insert(SchedulerError::TaskPanicked(e.to_string()));
                        }
                    }
                }
                if let Some(e) = failure {
                    Err::<(), _>(e)?;
                }

                let entries: Vec<IterationEntry> = slots
                    .into_iter()
                    .flatten()
                    .filter(|entry| entry.status.is_terminal())
                    .collect();

                if dispatched > 0 {
                    let snapshot = BatchSnapshot {
                        batch_index,
                        written_at: Utc::now(),
                        entries: entries.clone(),
                    };
                    self.store.write_batch(&self.key, &snapshot).await?;
                    metrics::record_batch_completed();
                    info!(
                        key = %self.key,
                        batch = batch_index,
                        dispatched,
                        settled = entries.len(),
                        "Batch checkpointed"
                    );
                }

                for entry in entries {
                    yield entry;
                }
            }

            if self.stop.is_tripped() {
                warn!(key = %self.key, "Shard stopped before every item settled");
            }
        }
    }

    /// Runs to completion (or stop) and collects the stream.
    pub async fn run_to_record(
        &self,
        items: Vec<Item>,
    ) -> Result<IterationRecord, SchedulerError> {
        let mut record = IterationRecord::new(self.key.dataset.clone(), self.key.iteration);
        let stream = self.run(items);
        futures::pin_mut!(stream);
        while let Some(entry) = stream.next().await {
            record.entries.push(entry?);
        }
        Ok(record)
    }
}
