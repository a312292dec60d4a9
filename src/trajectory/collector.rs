//! Trace collector for recording one episode.
//!
//! The `TraceCollector` accumulates agent outputs and tool calls as the
//! agent loop runs, along with the per-attempt counters, and turns them
//! into an [`Attempt`] once the episode has been verified.

use chrono::{DateTime, Utc};
use std::time::Instant;

use super::types::{Attempt, AttemptOutcome, TraceStep};

/// Collector for recording the steps of one attempt.
///
/// # Usage Pattern
///
/// For each turn of the agent loop:
/// 1. Call `record_agent_output()` with the raw agent text
/// 2. Call `record_tool_call()` once the tool (or cache) has answered
///
/// When the agent commits to an answer call `record_final_answer()`, then
/// `finish()` with the verification result.
pub struct TraceCollector {
    item_id: String,
    attempt_number: u32,
    steps: Vec<TraceStep>,
    tool_calls: u32,
    failed_tool_calls: u32,
    cache_hits: u32,
    started_at: DateTime<Utc>,
    clock: Instant,
}

impl TraceCollector {
    pub fn new(item_id: &str, attempt_number: u32) -> Self {
        Self {
            item_id: item_id.to_string(),
            attempt_number,
            steps: Vec::new(),
            tool_calls: 0,
            failed_tool_calls: 0,
            cache_hits: 0,
            started_at: Utc::now(),
            clock: Instant::now(),
        }
    }

    pub fn record_agent_output(&mut self, turn: u32, text: impl Into<String>) {
        self.steps.push(TraceStep::AgentOutput {
            turn,
            text: text.into(),
        });
    }

    /// Records a tool call and its result.
    ///
    /// A call with an error counts as failed even if the agent recovers.
    pub fn record_tool_call(
        &mut self,
        turn: u32,
        tool: &str,
        arguments: serde_json::Value,
        result: Result<serde_json::Value, String>,
        cached: bool,
    ) {
        self.tool_calls += 1;
        if cached {
            self.cache_hits += 1;
        }
        let (output, error) = match result {
            Ok(value) => (Some(value), None),
            Err(message) => {
                self.failed_tool_calls += 1;
                (None, Some(message))
            }
        };
        self.steps.push(TraceStep::ToolCall {
            turn,
            tool: tool.to_string(),
            arguments,
            output,
            error,
            cached,
        });
    }

    pub fn record_final_answer(&mut self, turn: u32, answer: impl Into<String>) {
        self.steps.push(TraceStep::FinalAnswer {
            turn,
            answer: answer.into(),
        });
    }

    /// Returns the steps recorded so far.
    pub fn steps(&self) -> &[TraceStep] {
        &self.steps
    }

    pub fn tool_calls(&self) -> u32 {
        self.tool_calls
    }

    /// Finalizes the attempt.
    pub fn finish(
        self,
        answer: Option<String>,
        score: Option<f64>,
        outcome: AttemptOutcome,
        error: Option<String>,
    ) -> Attempt {
        Attempt {
            item_id: self.item_id,
            attempt_number: self.attempt_number,
            answer,
            score,
            outcome,
            error,
            trace: self.steps,
            tool_calls: self.tool_calls,
            failed_tool_calls: self.failed_tool_calls,
            cache_hits: self.cache_hits,
            started_at: self.started_at,
            finished_at: Utc::now(),
            elapsed_ms: self.clock.elapsed().as_millis() as u64,
        }
    }
}
