//! Rejection sampling: retry one item until an attempt is accepted or the
//! attempt budget runs out.
//!
//! The per-item state machine is explicit. [`transition`] maps one recorded
//! attempt to the item's next status, and [`ResumePoint::from_log`] replays
//! a persisted attempt log through it, so resuming after a crash depends
//! only on what reached disk.
//!
//! ```text
//! pending     -> in_progress   attempt 1 dispatched
//! in_progress -> accepted      score >= threshold
//! in_progress -> in_progress   miss or error, attempts < max_attempts
//! in_progress -> rejected      scored miss at attempt max_attempts
//! in_progress -> exhausted     error at attempt max_attempts
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::episode::EpisodeRunner;
use crate::error::{ConfigError, StorageError};
use crate::metrics;
use crate::scheduler::{ProgressCounters, StopSignal};
use crate::trajectory::{Attempt, AttemptOutcome, IterationEntry, Item, ItemStatus, RunStore, StorageKey};

/// Acceptance rule and attempt budget for one run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingPolicy {
    pub max_attempts: u32,
    pub threshold: f64,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            threshold: 1.0,
        }
    }
}

impl SamplingPolicy {
    pub fn new(max_attempts: u32, threshold: f64) -> Self {
        Self {
            max_attempts,
            threshold,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "sampling.max_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(ConfigError::InvalidValue {
                key: "sampling.threshold".to_string(),
                message: format!("{} is outside [0, 1]", self.threshold),
            });
        }
        Ok(())
    }

    fn accepts(&self, attempt: &Attempt) -> bool {
        attempt.outcome != AttemptOutcome::Error
            && attempt.score.is_some_and(|score| score >= self.threshold)
    }
}

/// The item status after `attempt` has been recorded.
pub fn transition(attempt: &Attempt, policy: &SamplingPolicy) -> ItemStatus {
    if policy.accepts(attempt) {
        return ItemStatus::Accepted;
    }
    if attempt.attempt_number < policy.max_attempts {
        return ItemStatus::InProgress;
    }
    match attempt.outcome {
        AttemptOutcome::Error => ItemStatus::Exhausted,
        AttemptOutcome::Success | AttemptOutcome::Failure => ItemStatus::Rejected,
    }
}

/// Where an item stands according to its persisted attempt log.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumePoint {
    /// The log already settles the item.
    Terminal {
        status: ItemStatus,
        attempts: u32,
        attempt: Attempt,
    },
    /// Sampling continues at `next_attempt`.
    Continue {
        next_attempt: u32,
        last: Option<Attempt>,
    },
}

impl ResumePoint {
    /// Replays `log` (in append order) through [`transition`].
    ///
    /// A repeated attempt number keeps its first record, and the log is cut
    /// at the first missing number so numbering stays contiguous from 1.
    pub fn from_log(log: &[Attempt], policy: &SamplingPolicy) -> Self {
        let mut last: Option<&Attempt> = None;
        let mut expected = 1u32;

        while let Some(attempt) = log.iter().find(|a| a.attempt_number == expected) {
            let status = transition(attempt, policy);
            if status.is_terminal() {
                return ResumePoint::Terminal {
                    status,
                    attempts: expected,
                    attempt: attempt.clone(),
                };
            }
            last = Some(attempt);
            expected += 1;
        }

        ResumePoint::Continue {
            next_attempt: expected,
            last: last.cloned(),
        }
    }
}

/// Result of sampling one item.
///
/// A stopped sampler reports `pending` (nothing ran) or `in_progress`.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleOutcome {
    pub status: ItemStatus,
    pub attempts: u32,
    pub attempt: Option<Attempt>,
}

impl SampleOutcome {
    pub fn into_entry(self, item: &Item) -> IterationEntry {
        IterationEntry::from_item(item, self.status, self.attempts, self.attempt)
    }
}

/// Runs the retry state machine for one item at a time.
///
/// One sampler is shared by every item of a shard; attempts for a single
/// item always run sequentially inside [`RejectionSampler::sample`].
pub struct RejectionSampler {
    runner: Arc<dyn EpisodeRunner>,
    store: Arc<RunStore>,
    key: StorageKey,
    policy: SamplingPolicy,
    stop: StopSignal,
    progress: ProgressCounters,
}

impl RejectionSampler {
    pub fn new(
        runner: Arc<dyn EpisodeRunner>,
        store: Arc<RunStore>,
        key: StorageKey,
        policy: SamplingPolicy,
    ) -> Self {
        Self {
            runner,
            store,
            key,
            policy,
            stop: StopSignal::new(),
            progress: ProgressCounters::new(),
        }
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_progress(mut self, progress: ProgressCounters) -> Self {
        self.progress = progress;
        self
    }

    pub fn policy(&self) -> &SamplingPolicy {
        &self.policy
    }

    /// Samples `item`, continuing after whatever `prior` already records.
    ///
    /// Each attempt is appended to the attempt log before its transition is
    /// evaluated. A failed append aborts the item.
    pub async fn sample(
        &self,
        item: &Item,
        prior: &[Attempt],
    ) -> Result<SampleOutcome, StorageError> {
        let (mut next_attempt, mut last) = match ResumePoint::from_log(prior, &self.policy) {
            ResumePoint::Terminal {
                status,
                attempts,
                attempt,
            } => {
                debug!(item_id = %item.id, status = %status, "Item already settled in attempt log");
                return Ok(SampleOutcome {
                    status,
                    attempts,
                    attempt: Some(attempt),
                });
            }
            ResumePoint::Continue { next_attempt, last } => (next_attempt, last),
        };
        if next_attempt > 1 {
            info!(item_id = %item.id, next_attempt, "Resuming item from attempt log");
        }

        loop {
            if self.stop.is_tripped() {
                let status = if next_attempt == 1 {
                    ItemStatus::Pending
                } else {
                    ItemStatus::InProgress
                };
                return Ok(SampleOutcome {
                    status,
                    attempts: next_attempt - 1,
                    attempt: last,
                });
            }

            let attempt = self.runner.execute(item, next_attempt).await;
            self.store.append_attempt(&self.key, &attempt).await?;
            self.progress.attempt_recorded();

            let status = transition(&attempt, &self.policy);
            debug!(
                item_id = %item.id,
                attempt = next_attempt,
                outcome = %attempt.outcome,
                score = ?attempt.score,
                status = %status,
                "Attempt recorded"
            );

            if status.is_terminal() {
                info!(
                    item_id = %item.id,
                    attempts = next_attempt,
                    status = %status,
                    "Item settled"
                );
                return Ok(SampleOutcome {
                    status,
                    attempts: next_attempt,
                    attempt: Some(attempt),
                });
            }

            last = Some(attempt);
            next_attempt += 1;
        }
    }
}

/// Records an item's final status in the shared counters and metrics.
pub(crate) fn record_settled(progress: &ProgressCounters, status: ItemStatus) {
    if status.is_terminal() {
        progress.item_settled(status);
        metrics::record_item_status(status.as_str());
    }
}
