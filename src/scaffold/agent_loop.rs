//! Agent policy for the research loop.
//!
//! The episode executor owns the loop itself (turn limit, tool routing,
//! trace recording). This module only decides what the agent does next:
//! the [`AgentPolicy`] looks at the question and the trace so far and
//! returns either a tool call or a final answer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use super::prompts::{build_question_prompt, build_system_prompt, format_tool_result, FORCE_ANSWER_PROMPT};
use super::tools::ToolRegistry;
use crate::llm::{GenerationRequest, LlmProvider, Message};
use crate::trajectory::TraceStep;

/// Errors that can occur while asking the policy for its next move.
#[derive(Debug, Error)]
pub enum AgentError {
    /// LLM provider error.
    #[error("LLM error: {0}")]
    LlmError(#[from] crate::error::LlmError),

    /// The reply was neither a tool call nor a final answer.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

/// Configuration for the LLM-backed agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Maximum number of agent turns per attempt.
    pub max_turns: usize,
    /// Model to use; empty means the provider's default.
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Ask once for a final answer when the turn limit is hit.
    pub force_final_answer: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: 16,
            model: String::new(),
            temperature: 0.2,
            max_tokens: 4096,
            force_final_answer: true,
        }
    }
}

impl AgentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_force_final_answer(mut self, force: bool) -> Self {
        self.force_final_answer = force;
        self
    }
}

/// A tool call extracted from the agent's reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

/// What the agent wants to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentAction {
    CallTool(ToolCall),
    FinalAnswer(String),
}

/// One policy decision together with the raw text that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentTurn {
    pub output: String,
    pub action: AgentAction,
}

/// What the policy sees: the question and everything recorded so far.
#[derive(Debug, Clone, Copy)]
pub struct AgentContext<'a> {
    pub question: &'a str,
    /// 1-based number of the turn being decided.
    pub turn: u32,
    pub trace: &'a [TraceStep],
}

/// The agent's decision procedure, treated as a black box by the executor.
#[async_trait]
pub trait AgentPolicy: Send + Sync {
    /// Chooses the next tool call or commits to an answer.
    async fn next_action(&self, ctx: &AgentContext<'_>) -> Result<AgentTurn, AgentError>;

    /// Asked once when the turn limit is reached. `None` means no answer.
    async fn propose_final_answer(&self, ctx: &AgentContext<'_>) -> Result<Option<String>, AgentError>;
}

/// Trait for parsing agent replies.
pub trait ResponseParser: Send + Sync {
    fn parse(&self, response: &str) -> Result<AgentAction, AgentError>;
}

/// Parses `<answer>` tags and JSON tool calls.
///
/// Accepted tool-call shapes, bare or inside a ```json block:
/// `{"tool": .., "arguments": {..}}` and `{"name": .., "parameters": {..}}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonResponseParser;

impl ResponseParser for JsonResponseParser {
    fn parse(&self, response: &str) -> Result<AgentAction, AgentError> {
        if let Some(answer) = extract_answer(response) {
            return Ok(AgentAction::FinalAnswer(answer));
        }
        if let Some(call) = parse_code_block(response).or_else(|| parse_json_object(response)) {
            return Ok(AgentAction::CallTool(call));
        }
        Err(AgentError::MalformedResponse(preview(response)))
    }
}

/// Extracts the contents of the first `<answer>` tag.
///
/// An unclosed tag takes the rest of the text; an empty answer is `None`.
pub fn extract_answer(text: &str) -> Option<String> {
    let start = text.find("<answer>")? + "<answer>".len();
    let rest = &text[start..];
    let body = match rest.find("</answer>") {
        Some(end) => &rest[..end],
        None => rest,
    };
    let answer = body.trim();
    if answer.is_empty() {
        None
    } else {
        Some(answer.to_string())
    }
}

fn tool_call_from_value(value: &Value) -> Option<ToolCall> {
    let empty = || Value::Object(serde_json::Map::new());
    if let Some(name) = value.get("tool").and_then(|v| v.as_str()) {
        return Some(ToolCall {
            name: name.to_string(),
            arguments: value.get("arguments").cloned().unwrap_or_else(empty),
        });
    }
    if let Some(name) = value.get("name").and_then(|v| v.as_str()) {
        return Some(ToolCall {
            name: name.to_string(),
            arguments: value
                .get("parameters")
                .or_else(|| value.get("args"))
                .cloned()
                .unwrap_or_else(empty),
        });
    }
    None
}

fn parse_code_block(response: &str) -> Option<ToolCall> {
    let start = response.find("```json")? + "```json".len();
    let remaining = &response[start..];
    let end = remaining.find("```")?;
    let value: Value = serde_json::from_str(remaining[..end].trim()).ok()?;
    tool_call_from_value(&value)
}

/// Scans for the first balanced top-level JSON object that is a tool call.
fn parse_json_object(response: &str) -> Option<ToolCall> {
    let mut depth = 0usize;
    let mut start = None;

    for (i, c) in response.char_indices() {
        match c {
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        if let Ok(value) = serde_json::from_str::<Value>(&response[s..=i]) {
                            if let Some(call) = tool_call_from_value(&value) {
                                return Some(call);
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }
    None
}

fn preview(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(200) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

/// Chat-completions agent over an [`LlmProvider`].
pub struct LlmAgent {
    llm_client: Arc<dyn LlmProvider>,
    parser: Box<dyn ResponseParser>,
    config: AgentConfig,
    system_prompt: String,
}

impl LlmAgent {
    pub fn new(llm_client: Arc<dyn LlmProvider>, config: AgentConfig, tools: &ToolRegistry) -> Self {
        Self {
            llm_client,
            parser: Box::new(JsonResponseParser),
            config,
            system_prompt: build_system_prompt(&tools.to_json_schema()),
        }
    }

    /// Set a custom response parser.
    pub fn with_parser(mut self, parser: Box<dyn ResponseParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Rebuilds the conversation from the recorded trace.
    pub fn conversation(&self, ctx: &AgentContext<'_>) -> Vec<Message> {
        let mut messages = vec![
            Message::system(&self.system_prompt),
            Message::user(build_question_prompt(ctx.question)),
        ];
        for step in ctx.trace {
            match step {
                TraceStep::AgentOutput { text, .. } => messages.push(Message::assistant(text)),
                TraceStep::ToolCall {
                    tool,
                    output,
                    error,
                    ..
                } => {
                    let result = match (output, error) {
                        (_, Some(error)) => Err(error.as_str()),
                        (Some(output), None) => Ok(output),
                        (None, None) => Ok(&Value::Null),
                    };
                    messages.push(Message::user(format_tool_result(tool, result)));
                }
                TraceStep::FinalAnswer { .. } => {}
            }
        }
        messages
    }

    async fn complete(&self, messages: Vec<Message>) -> Result<String, AgentError> {
        let request = GenerationRequest::new(self.config.model.clone(), messages)
            .with_temperature(self.config.temperature)
            .with_max_tokens(self.config.max_tokens);
        let response = self.llm_client.generate(request).await?;
        response
            .content()
            .map(|s| s.to_string())
            .ok_or(AgentError::LlmError(crate::error::LlmError::EmptyResponse))
    }
}

#[async_trait]
impl AgentPolicy for LlmAgent {
    async fn next_action(&self, ctx: &AgentContext<'_>) -> Result<AgentTurn, AgentError> {
        let output = self.complete(self.conversation(ctx)).await?;
        let action = self.parser.parse(&output)?;
        Ok(AgentTurn { output, action })
    }

    async fn propose_final_answer(&self, ctx: &AgentContext<'_>) -> Result<Option<String>, AgentError> {
        let mut messages = self.conversation(ctx);
        messages.push(Message::user(FORCE_ANSWER_PROMPT));
        let output = self.complete(messages).await?;
        if let Some(answer) = extract_answer(&output) {
            return Ok(Some(answer));
        }
        // Models asked only for an answer often drop the tags.
        let bare = output.trim();
        if bare.is_empty() || parse_json_object(bare).is_some() {
            Ok(None)
        } else {
            Ok(Some(bare.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::GenerationResponse;
    use std::sync::Mutex;

    struct ScriptedLlm {
        replies: Mutex<Vec<String>>,
        seen: Mutex<Vec<GenerationRequest>>,
    }

    impl ScriptedLlm {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().rev().map(|s| s.to_string()).collect()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
            self.seen.lock().unwrap().push(request);
            let reply = self.replies.lock().unwrap().pop().ok_or(LlmError::EmptyResponse)?;
            Ok(GenerationResponse::from_text("scripted", reply))
        }
    }

    #[test]
    fn test_agent_config_default() {
        let config = AgentConfig::default();
        assert_eq!(config.max_turns, 16);
        assert!(config.model.is_empty());
        assert!((config.temperature - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.max_tokens, 4096);
        assert!(config.force_final_answer);
    }

    #[test]
    fn test_agent_config_builder() {
        let config = AgentConfig::new()
            .with_max_turns(4)
            .with_model("gpt-4")
            .with_temperature(0.5)
            .with_max_tokens(8192)
            .with_force_final_answer(false);

        assert_eq!(config.max_turns, 4);
        assert_eq!(config.model, "gpt-4");
        assert_eq!(config.max_tokens, 8192);
        assert!(!config.force_final_answer);
    }

    #[test]
    fn test_parser_answer_tag() {
        let action = JsonResponseParser
            .parse("I found it. <answer> Ada Lovelace </answer>")
            .unwrap();
        assert_eq!(action, AgentAction::FinalAnswer("Ada Lovelace".to_string()));
    }

    #[test]
    fn test_parser_json_format() {
        let response = r#"Let me search: {"tool": "google_search", "arguments": {"query": "rust"}}"#;
        match JsonResponseParser.parse(response).unwrap() {
            AgentAction::CallTool(call) => {
                assert_eq!(call.name, "google_search");
                assert_eq!(call.arguments["query"], "rust");
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_parser_name_parameters_format() {
        let response = r#"{"name": "browse_webpage", "parameters": {"url": "https://x.org"}}"#;
        match JsonResponseParser.parse(response).unwrap() {
            AgentAction::CallTool(call) => {
                assert_eq!(call.name, "browse_webpage");
                assert_eq!(call.arguments["url"], "https://x.org");
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_parser_code_block_format() {
        let response = "Searching:\n\n```json\n{\"tool\": \"snippet_search\", \"arguments\": {\"query\": \"f1\"}}\n```\n";
        match JsonResponseParser.parse(response).unwrap() {
            AgentAction::CallTool(call) => assert_eq!(call.name, "snippet_search"),
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_parser_malformed() {
        let err = JsonResponseParser
            .parse("Let me think about this {not json}")
            .unwrap_err();
        assert!(matches!(err, AgentError::MalformedResponse(_)));
    }

    #[test]
    fn test_extract_answer_edge_cases() {
        assert_eq!(extract_answer("<answer>42"), Some("42".to_string()));
        assert_eq!(extract_answer("<answer>  </answer>"), None);
        assert_eq!(extract_answer("no tags"), None);
    }

    #[tokio::test]
    async fn test_llm_agent_rebuilds_conversation() {
        let llm = Arc::new(ScriptedLlm::new(&["<answer>Paris</answer>"]));
        let agent = LlmAgent::new(llm.clone(), AgentConfig::default(), &ToolRegistry::new());
        let trace = vec![
            TraceStep::AgentOutput {
                turn: 1,
                text: r#"{"tool": "google_search", "arguments": {"query": "capital of France"}}"#
                    .to_string(),
            },
            TraceStep::ToolCall {
                turn: 1,
                tool: "google_search".to_string(),
                arguments: serde_json::json!({"query": "capital of France"}),
                output: Some(serde_json::json!("Paris is the capital")),
                error: None,
                cached: false,
            },
        ];
        let ctx = AgentContext {
            question: "What is the capital of France?",
            turn: 2,
            trace: &trace,
        };

        let turn = agent.next_action(&ctx).await.unwrap();
        assert_eq!(turn.action, AgentAction::FinalAnswer("Paris".to_string()));

        let seen = llm.seen.lock().unwrap();
        let roles: Vec<&str> = seen[0].messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert!(seen[0].messages[3].content.contains("Paris is the capital"));
    }

    #[tokio::test]
    async fn test_propose_final_answer_accepts_bare_text() {
        let llm = Arc::new(ScriptedLlm::new(&["Paris"]));
        let agent = LlmAgent::new(llm, AgentConfig::default(), &ToolRegistry::new());
        let ctx = AgentContext {
            question: "Capital of France?",
            turn: 17,
            trace: &[],
        };
        assert_eq!(
            agent.propose_final_answer(&ctx).await.unwrap(),
            Some("Paris".to_string())
        );
    }
}
