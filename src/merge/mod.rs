//! Merging iteration records into one result per item.
//!
//! Records are scanned in the order given. The first accepted attempt for
//! an item wins; an item never accepted keeps its last-seen status and
//! attempt for diagnostics. Repeated `(iteration, item)` pairs are ignored
//! after their first occurrence, so feeding the same record twice changes
//! nothing.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::trajectory::{Attempt, IterationRecord, ItemStatus};

/// One item's merged outcome across iterations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedItem {
    pub item_id: String,
    pub index: usize,
    pub question: String,
    pub ground_truth: Option<String>,
    pub status: ItemStatus,
    /// Iteration whose attempt was accepted.
    pub accepted_in: Option<u32>,
    /// Attempts made in the iteration the kept entry came from.
    pub attempts: u32,
    pub attempt: Option<Attempt>,
    /// Distinct iterations that contained the item.
    pub iterations_seen: u32,
}

impl MergedItem {
    pub fn is_accepted(&self) -> bool {
        self.status == ItemStatus::Accepted
    }
}

/// Dataset-level numbers for a merged result.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeSummary {
    pub items: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub exhausted: usize,
    /// Items whose latest entry never settled.
    pub incomplete: usize,
    pub acceptance_rate: f64,
    /// Mean attempt number of the accepted attempt, over accepted items.
    pub avg_attempts_to_accept: f64,
    pub avg_iterations_per_item: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergedResult {
    pub items: Vec<MergedItem>,
}

impl MergedResult {
    pub fn accepted(&self) -> impl Iterator<Item = &MergedItem> {
        self.items.iter().filter(|item| item.is_accepted())
    }

    pub fn summary(&self) -> MergeSummary {
        let mut summary = MergeSummary {
            items: self.items.len(),
            ..Default::default()
        };
        let mut attempts_to_accept = 0u64;
        let mut iterations = 0u64;

        for item in &self.items {
            iterations += u64::from(item.iterations_seen);
            match item.status {
                ItemStatus::Accepted => {
                    summary.accepted += 1;
                    attempts_to_accept += item
                        .attempt
                        .as_ref()
                        .map(|a| u64::from(a.attempt_number))
                        .unwrap_or(u64::from(item.attempts));
                }
                ItemStatus::Rejected => summary.rejected += 1,
                ItemStatus::Exhausted => summary.exhausted += 1,
                ItemStatus::Pending | ItemStatus::InProgress => summary.incomplete += 1,
            }
        }

        if summary.items > 0 {
            summary.acceptance_rate = summary.accepted as f64 / summary.items as f64;
            summary.avg_iterations_per_item = iterations as f64 / summary.items as f64;
        }
        if summary.accepted > 0 {
            summary.avg_attempts_to_accept = attempts_to_accept as f64 / summary.accepted as f64;
        }
        summary
    }
}

/// Merges `records` in order. See the module docs for the rules.
pub fn merge(records: &[IterationRecord]) -> MergedResult {
    let mut seen: HashSet<(u32, &str)> = HashSet::new();
    let mut by_id: HashMap<&str, MergedItem> = HashMap::new();

    for record in records {
        for entry in &record.entries {
            if !seen.insert((record.iteration, entry.item_id.as_str())) {
                continue;
            }

            let merged = by_id
                .entry(entry.item_id.as_str())
                .or_insert_with(|| MergedItem {
                    item_id: entry.item_id.clone(),
                    index: entry.index,
                    question: entry.question.clone(),
                    ground_truth: entry.ground_truth.clone(),
                    status: ItemStatus::Pending,
                    accepted_in: None,
                    attempts: 0,
                    attempt: None,
                    iterations_seen: 0,
                });
            merged.iterations_seen += 1;

            if merged.accepted_in.is_some() {
                continue;
            }
            merged.status = entry.status;
            merged.attempts = entry.attempts;
            if entry.attempt.is_some() {
                merged.attempt = entry.attempt.clone();
            }
            if entry.status == ItemStatus::Accepted {
                merged.accepted_in = Some(record.iteration);
            }
        }
    }

    let mut items: Vec<MergedItem> = by_id.into_values().collect();
    items.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.item_id.cmp(&b.item_id)));
    MergedResult { items }
}
