//! Supervised fine-tuning export of accepted traces.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::merge::MergedItem;
use crate::scaffold::prompts::{build_question_prompt, format_tool_result};
use crate::trajectory::TraceStep;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SftTurn {
    pub content: String,
    pub role: String,
}

impl SftTurn {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            role: role.to_string(),
        }
    }
}

/// One accepted trace in chat form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SftRecord {
    pub id: String,
    pub source_id: String,
    pub question: String,
    pub source: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub num_tool_calls: u32,
    pub conversations: Vec<SftTurn>,
}

/// Turns accepted merged items into [`SftRecord`]s.
pub struct SftExporter {
    dataset: String,
    system_prompt: String,
}

impl SftExporter {
    pub fn new(dataset: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            system_prompt: system_prompt.into(),
        }
    }

    /// `None` unless the item was accepted with a recorded attempt.
    pub fn record(&self, item: &MergedItem) -> Option<SftRecord> {
        if !item.is_accepted() {
            return None;
        }
        let attempt = item.attempt.as_ref()?;

        Some(SftRecord {
            id: Uuid::new_v4().to_string(),
            source_id: format!("{}_{}", self.dataset, item.index),
            question: item.question.clone(),
            source: self.dataset.clone(),
            kind: "short_form".to_string(),
            num_tool_calls: attempt.tool_calls,
            conversations: vec![
                SftTurn::new("system", self.system_prompt.clone()),
                SftTurn::new("user", build_question_prompt(&item.question)),
                SftTurn::new("assistant", render_transcript(&attempt.trace)),
            ],
        })
    }

    pub fn records<'a>(&'a self, items: impl IntoIterator<Item = &'a MergedItem>) -> Vec<SftRecord> {
        items.into_iter().filter_map(|item| self.record(item)).collect()
    }
}

/// Flattens a trace into one assistant transcript.
///
/// Tool results are inlined between the agent outputs that requested and
/// consumed them. The answer tag is appended only when no agent output
/// already carried it (a forced answer, for instance).
pub fn render_transcript(trace: &[TraceStep]) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut answered = false;

    for step in trace {
        match step {
            TraceStep::AgentOutput { text, .. } => {
                answered |= text.contains("<answer>");
                parts.push(text.trim().to_string());
            }
            TraceStep::ToolCall {
                tool,
                output,
                error,
                ..
            } => {
                let rendered = match (output, error) {
                    (Some(value), _) => format_tool_result(tool, Ok(value)),
                    (None, Some(error)) => format_tool_result(tool, Err(error.as_str())),
                    (None, None) => format_tool_result(tool, Err("no output")),
                };
                parts.push(format!("<tool_output>\n{}\n</tool_output>", rendered));
            }
            TraceStep::FinalAnswer { answer, .. } => {
                if !answered {
                    parts.push(format!("<answer>{}</answer>", answer));
                    answered = true;
                }
            }
        }
    }

    parts.join("\n\n")
}
