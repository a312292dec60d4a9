//! Trace data types for rejection-sampled agent episodes.
//!
//! This module defines the records produced while driving a research agent
//! over a dataset: the [`Item`] being answered, each [`Attempt`] at it with
//! its recorded [`TraceStep`]s, and the per-item [`IterationEntry`] rows
//! that make up one pass of the scheduler ([`IterationRecord`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of an item inside one scheduler pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// No attempt has been dispatched yet.
    Pending,
    /// At least one attempt was made and the item is not terminal.
    InProgress,
    /// An attempt met the acceptance threshold.
    Accepted,
    /// The final attempt was scored below the threshold.
    Rejected,
    /// The final attempt ended in an error.
    Exhausted,
}

impl ItemStatus {
    /// Returns true for `accepted`, `rejected` and `exhausted`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Accepted | ItemStatus::Rejected | ItemStatus::Exhausted
        )
    }

    /// Stable lowercase name, used for logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::InProgress => "in_progress",
            ItemStatus::Accepted => "accepted",
            ItemStatus::Rejected => "rejected",
            ItemStatus::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One question to be answered by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Stable identifier, unique within the dataset.
    pub id: String,
    /// Position of the item in the full (unsharded) dataset.
    pub index: usize,
    /// The question or prompt given to the agent.
    pub question: String,
    /// Reference answer used for verification.
    pub ground_truth: Option<String>,
    /// Current status; owned by the scheduler that holds the item.
    #[serde(default = "default_status")]
    pub status: ItemStatus,
}

fn default_status() -> ItemStatus {
    ItemStatus::Pending
}

impl Item {
    /// Creates a pending item.
    pub fn new(
        id: impl Into<String>,
        index: usize,
        question: impl Into<String>,
        ground_truth: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            index,
            question: question.into(),
            ground_truth,
            status: ItemStatus::Pending,
        }
    }
}

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Scored at or above the acceptance threshold.
    Success,
    /// Scored below the acceptance threshold.
    Failure,
    /// The agent loop or the verifier failed; no usable score.
    Error,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Failure => "failure",
            AttemptOutcome::Error => "error",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in an episode trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceStep {
    /// Raw text produced by the agent on one turn.
    AgentOutput { turn: u32, text: String },
    /// A tool invocation and what came back.
    ToolCall {
        turn: u32,
        tool: String,
        arguments: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Whether the output was served from the tool cache.
        #[serde(default)]
        cached: bool,
    },
    /// The answer the agent committed to.
    FinalAnswer { turn: u32, answer: String },
}

/// One execution of an item through the agent and the verifier.
///
/// Immutable once recorded in the attempt log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub item_id: String,
    /// 1-based, contiguous per item.
    pub attempt_number: u32,
    pub answer: Option<String>,
    pub score: Option<f64>,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub trace: Vec<TraceStep>,
    #[serde(default)]
    pub tool_calls: u32,
    #[serde(default)]
    pub failed_tool_calls: u32,
    #[serde(default)]
    pub cache_hits: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl Attempt {
    /// Builds an `error` attempt with an empty trace.
    pub fn error(item_id: impl Into<String>, attempt_number: u32, message: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            item_id: item_id.into(),
            attempt_number,
            answer: None,
            score: None,
            outcome: AttemptOutcome::Error,
            error: Some(message.into()),
            trace: Vec::new(),
            tool_calls: 0,
            failed_tool_calls: 0,
            cache_hits: 0,
            started_at: now,
            finished_at: now,
            elapsed_ms: 0,
        }
    }
}

/// One item's row in an iteration: its terminal status and terminal attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationEntry {
    pub item_id: String,
    pub index: usize,
    pub question: String,
    pub ground_truth: Option<String>,
    pub status: ItemStatus,
    /// Number of attempts made for the item in this iteration.
    pub attempts: u32,
    /// The attempt that decided the status, if any was made.
    pub attempt: Option<Attempt>,
}

impl IterationEntry {
    pub fn from_item(item: &Item, status: ItemStatus, attempts: u32, attempt: Option<Attempt>) -> Self {
        Self {
            item_id: item.id.clone(),
            index: item.index,
            question: item.question.clone(),
            ground_truth: item.ground_truth.clone(),
            status,
            attempts,
            attempt,
        }
    }
}

/// One scheduler pass over a dataset (or a subset of it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub dataset: String,
    pub iteration: u32,
    pub entries: Vec<IterationEntry>,
}

impl IterationRecord {
    pub fn new(dataset: impl Into<String>, iteration: u32) -> Self {
        Self {
            dataset: dataset.into(),
            iteration,
            entries: Vec::new(),
        }
    }

    pub fn count(&self, status: ItemStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }
}

/// Persisted result of one completed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSnapshot {
    pub batch_index: usize,
    pub written_at: DateTime<Utc>,
    pub entries: Vec<IterationEntry>,
}
