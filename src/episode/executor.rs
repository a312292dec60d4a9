//! One agent-and-verification run per attempt.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::EpisodeRunner;
use crate::error::{AgentLoopError, VerificationError};
use crate::metrics;
use crate::scaffold::{AgentAction, AgentContext, AgentError, AgentPolicy, AgentTurn, ToolInvoker};
use crate::trajectory::{Attempt, AttemptOutcome, Item, TraceCollector};
use crate::verification::Verifier;

/// Settings for the episode loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    /// Hard limit on agent turns per attempt.
    pub max_turns: usize,
    /// Ask the policy once for an answer when the limit is reached.
    pub force_final_answer: bool,
    /// Scores at or above this are `success`.
    pub threshold: f64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_turns: 16,
            force_final_answer: true,
            threshold: 1.0,
        }
    }
}

impl ExecutorConfig {
    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_force_final_answer(mut self, force: bool) -> Self {
        self.force_final_answer = force;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }
}

/// Drives the agent loop for one attempt, then verifies the answer.
pub struct EpisodeExecutor {
    policy: Arc<dyn AgentPolicy>,
    tools: ToolInvoker,
    verifier: Arc<dyn Verifier>,
    config: ExecutorConfig,
}

impl EpisodeExecutor {
    pub fn new(
        policy: Arc<dyn AgentPolicy>,
        tools: ToolInvoker,
        verifier: Arc<dyn Verifier>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            policy,
            tools,
            verifier,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Runs turns until a final answer, the turn limit or an unrecoverable tool error.
    async fn run_agent(
        &self,
        item: &Item,
        collector: &mut TraceCollector,
    ) -> Result<String, AgentLoopError> {
        for turn in 1..=self.config.max_turns as u32 {
            let AgentTurn { output, action } = {
                let ctx = AgentContext {
                    question: &item.question,
                    turn,
                    trace: collector.steps(),
                };
                self.policy.next_action(&ctx).await.map_err(loop_error)?
            };
            collector.record_agent_output(turn, output);

            let call = match action {
                AgentAction::FinalAnswer(answer) => {
                    collector.record_final_answer(turn, answer.clone());
                    return Ok(answer);
                }
                AgentAction::CallTool(call) => call,
            };

            match self.tools.invoke(&call.name, call.arguments.clone()).await {
                Ok(invocation) => {
                    collector.record_tool_call(
                        turn,
                        &call.name,
                        call.arguments,
                        Ok(invocation.output),
                        invocation.cached,
                    );
                }
                Err(e) if e.is_recoverable() => {
                    debug!(item_id = %item.id, tool = %call.name, error = %e, "Recoverable tool error");
                    collector.record_tool_call(turn, &call.name, call.arguments, Err(e.to_string()), false);
                }
                Err(e) => {
                    collector.record_tool_call(turn, &call.name, call.arguments, Err(e.to_string()), false);
                    return Err(AgentLoopError::Tool {
                        tool: call.name,
                        message: e.to_string(),
                    });
                }
            }
        }

        if self.config.force_final_answer {
            let turn = self.config.max_turns as u32 + 1;
            let proposed = {
                let ctx = AgentContext {
                    question: &item.question,
                    turn,
                    trace: collector.steps(),
                };
                self.policy.propose_final_answer(&ctx).await.map_err(loop_error)?
            };
            if let Some(answer) = proposed {
                collector.record_final_answer(turn, answer.clone());
                return Ok(answer);
            }
        }

        Err(AgentLoopError::TurnLimitExceeded {
            max_turns: self.config.max_turns,
        })
    }

    async fn verify(&self, item: &Item, answer: &str) -> Result<f64, VerificationError> {
        let ground_truth = item
            .ground_truth
            .as_deref()
            .ok_or_else(|| VerificationError::MissingGroundTruth(item.id.clone()))?;
        let score = self.verifier.score(&item.question, answer, ground_truth).await?;
        if !(0.0..=1.0).contains(&score) {
            return Err(VerificationError::ScoreOutOfRange(score));
        }
        Ok(score)
    }
}

fn loop_error(error: AgentError) -> AgentLoopError {
    match error {
        AgentError::MalformedResponse(text) => AgentLoopError::MalformedResponse(text),
        AgentError::LlmError(e) => AgentLoopError::Agent(e.to_string()),
    }
}

#[async_trait]
impl EpisodeRunner for EpisodeExecutor {
    async fn execute(&self, item: &Item, attempt_number: u32) -> Attempt {
        let _in_flight = metrics::InFlightGuard::new();
        let mut collector = TraceCollector::new(&item.id, attempt_number);

        if item.ground_truth.is_none() {
            let err = VerificationError::MissingGroundTruth(item.id.clone());
            return finish(collector, None, None, AttemptOutcome::Error, Some(err.to_string()));
        }

        let answer = match self.run_agent(item, &mut collector).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(item_id = %item.id, attempt = attempt_number, error = %e, "Agent loop failed");
                return finish(collector, None, None, AttemptOutcome::Error, Some(e.to_string()));
            }
        };

        match self.verify(item, &answer).await {
            Ok(score) => {
                let outcome = if score >= self.config.threshold {
                    AttemptOutcome::Success
                } else {
                    AttemptOutcome::Failure
                };
                finish(collector, Some(answer), Some(score), outcome, None)
            }
            Err(e) => {
                warn!(item_id = %item.id, attempt = attempt_number, verifier = self.verifier.name(), error = %e, "Verification failed");
                finish(collector, Some(answer), None, AttemptOutcome::Error, Some(e.to_string()))
            }
        }
    }
}

fn finish(
    collector: TraceCollector,
    answer: Option<String>,
    score: Option<f64>,
    outcome: AttemptOutcome,
    error: Option<String>,
) -> Attempt {
    let attempt = collector.finish(answer, score, outcome, error);
    metrics::record_attempt(outcome.as_str(), attempt.elapsed_ms as f64 / 1000.0);
    attempt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ToolCache;
    use crate::error::LlmError;
    use crate::scaffold::tools::testing::EchoTool;
    use crate::scaffold::{ToolCall, ToolError, ToolRegistry};
    use crate::trajectory::TraceStep;
    use crate::verification::F1Verifier;
    use serde_json::json;
    use std::sync::Mutex;

    enum Scripted {
        Tool(&'static str, serde_json::Value),
        Answer(&'static str),
        Garbage,
        Fail,
    }

    struct ScriptedPolicy {
        script: Mutex<Vec<Scripted>>,
        forced: Option<&'static str>,
    }

    impl ScriptedPolicy {
        fn new(mut script: Vec<Scripted>, forced: Option<&'static str>) -> Arc<Self> {
            script.reverse();
            Arc::new(Self {
                script: Mutex::new(script),
                forced,
            })
        }
    }

    #[async_trait]
    impl AgentPolicy for ScriptedPolicy {
        async fn next_action(&self, _ctx: &AgentContext<'_>) -> Result<AgentTurn, AgentError> {
            let next = self.script.lock().unwrap().pop().unwrap_or(Scripted::Garbage);
            let action = match next {
                Scripted::Tool(name, args) => AgentAction::CallTool(ToolCall {
                    name: name.to_string(),
                    arguments: args,
                }),
                Scripted::Answer(a) => AgentAction::FinalAnswer(a.to_string()),
                Scripted::Garbage => return Err(AgentError::MalformedResponse("???".into())),
                Scripted::Fail => return Err(AgentError::LlmError(LlmError::EmptyResponse)),
            };
            Ok(AgentTurn {
                output: "scripted".to_string(),
                action,
            })
        }

        async fn propose_final_answer(&self, _ctx: &AgentContext<'_>) -> Result<Option<String>, AgentError> {
            Ok(self.forced.map(str::to_string))
        }
    }

    fn executor(policy: Arc<ScriptedPolicy>, tools: Vec<Arc<EchoTool>>, config: ExecutorConfig) -> EpisodeExecutor {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool);
        }
        let invoker = ToolInvoker::new(Arc::new(registry), Arc::new(ToolCache::in_memory(32)));
        EpisodeExecutor::new(policy, invoker, Arc::new(F1Verifier), config)
    }

    fn item(ground_truth: Option<&str>) -> Item {
        Item::new("q1", 0, "Who wrote the first program?", ground_truth.map(str::to_string))
    }

    #[tokio::test]
    async fn test_answer_after_tool_call_succeeds() {
        let policy = ScriptedPolicy::new(
            vec![
                Scripted::Tool("search", json!({"q": "first program"})),
                Scripted::Answer("Ada Lovelace"),
            ],
            None,
        );
        let exec = executor(policy, vec![Arc::new(EchoTool::new("search"))], ExecutorConfig::default());

        let attempt = exec.execute(&item(Some("Ada Lovelace")), 1).await;
        assert_eq!(attempt.outcome, AttemptOutcome::Success);
        assert_eq!(attempt.score, Some(1.0));
        assert_eq!(attempt.tool_calls, 1);
        assert!(matches!(attempt.trace.last(), Some(TraceStep::FinalAnswer { .. })));
    }

    #[tokio::test]
    async fn test_low_score_is_failure() {
        let policy = ScriptedPolicy::new(vec![Scripted::Answer("Charles Babbage")], None);
        let exec = executor(policy, vec![], ExecutorConfig::default());
        let attempt = exec.execute(&item(Some("Ada Lovelace")), 2).await;
        assert_eq!(attempt.outcome, AttemptOutcome::Failure);
        assert_eq!(attempt.score, Some(0.0));
        assert_eq!(attempt.attempt_number, 2);
    }

    #[tokio::test]
    async fn test_threshold_below_one_accepts_partial() {
        let policy = ScriptedPolicy::new(vec![Scripted::Answer("Lovelace")], None);
        let exec = executor(policy, vec![], ExecutorConfig::default().with_threshold(0.5));
        let attempt = exec.execute(&item(Some("Ada Lovelace")), 1).await;
        assert_eq!(attempt.outcome, AttemptOutcome::Success);
    }

    #[tokio::test]
    async fn test_recoverable_tool_error_continues() {
        let policy = ScriptedPolicy::new(
            vec![
                Scripted::Tool("nonexistent", json!({})),
                Scripted::Answer("Ada Lovelace"),
            ],
            None,
        );
        let exec = executor(policy, vec![], ExecutorConfig::default());
        let attempt = exec.execute(&item(Some("Ada Lovelace")), 1).await;
        assert_eq!(attempt.outcome, AttemptOutcome::Success);
        assert_eq!(attempt.failed_tool_calls, 1);
    }

    #[tokio::test]
    async fn test_unrecoverable_tool_error_is_error_outcome() {
        let policy = ScriptedPolicy::new(
            vec![Scripted::Tool("browse", json!({"url": "x"})), Scripted::Answer("never")],
            None,
        );
        let tool = Arc::new(EchoTool::failing("browse", ToolError::Timeout { seconds: 3 }));
        let exec = executor(policy, vec![tool], ExecutorConfig::default());
        let attempt = exec.execute(&item(Some("Ada Lovelace")), 1).await;
        assert_eq!(attempt.outcome, AttemptOutcome::Error);
        assert!(attempt.error.unwrap().contains("browse"));
        assert_eq!(attempt.failed_tool_calls, 1);
    }

    #[tokio::test]
    async fn test_turn_limit_without_forced_answer() {
        let script = (0..3).map(|i| Scripted::Tool("search", json!({ "page": i }))).collect();
        let policy = ScriptedPolicy::new(script, None);
        let exec = executor(
            policy,
            vec![Arc::new(EchoTool::new("search"))],
            ExecutorConfig::default().with_max_turns(3),
        );
        let attempt = exec.execute(&item(Some("Ada Lovelace")), 1).await;
        assert_eq!(attempt.outcome, AttemptOutcome::Error);
        assert!(attempt.error.unwrap().contains("Turn limit"));
        assert_eq!(attempt.tool_calls, 3);
    }

    #[tokio::test]
    async fn test_turn_limit_with_forced_answer() {
        let script = (0..2).map(|i| Scripted::Tool("search", json!({ "page": i }))).collect();
        let policy = ScriptedPolicy::new(script, Some("Ada Lovelace"));
        let exec = executor(
            policy,
            vec![Arc::new(EchoTool::new("search"))],
            ExecutorConfig::default().with_max_turns(2),
        );
        let attempt = exec.execute(&item(Some("Ada Lovelace")), 1).await;
        assert_eq!(attempt.outcome, AttemptOutcome::Success);
    }

    #[tokio::test]
    async fn test_forced_answer_disabled() {
        let policy = ScriptedPolicy::new(vec![Scripted::Tool("search", json!({}))], Some("Ada Lovelace"));
        let exec = executor(
            policy,
            vec![Arc::new(EchoTool::new("search"))],
            ExecutorConfig::default().with_max_turns(1).with_force_final_answer(false),
        );
        let attempt = exec.execute(&item(Some("Ada Lovelace")), 1).await;
        assert_eq!(attempt.outcome, AttemptOutcome::Error);
    }

    #[tokio::test]
    async fn test_malformed_and_llm_failures_are_errors() {
        for step in [Scripted::Garbage, Scripted::Fail] {
            let policy = ScriptedPolicy::new(vec![step], None);
            let exec = executor(policy, vec![], ExecutorConfig::default());
            let attempt = exec.execute(&item(Some("Ada Lovelace")), 1).await;
            assert_eq!(attempt.outcome, AttemptOutcome::Error);
            assert!(attempt.score.is_none());
        }
    }

    #[tokio::test]
    async fn test_missing_ground_truth_is_error() {
        let policy = ScriptedPolicy::new(vec![Scripted::Answer("Ada Lovelace")], None);
        let exec = executor(policy, vec![], ExecutorConfig::default());
        let attempt = exec.execute(&item(None), 1).await;
        assert_eq!(attempt.outcome, AttemptOutcome::Error);
        assert!(attempt.error.unwrap().contains("ground-truth"));
    }

    #[tokio::test]
    async fn test_repeated_tool_call_hits_cache() {
        let policy = ScriptedPolicy::new(
            vec![
                Scripted::Tool("search", json!({"q": "ada"})),
                Scripted::Tool("search", json!({"q": "ada"})),
                Scripted::Answer("Ada Lovelace"),
            ],
            None,
        );
        let tool = Arc::new(EchoTool::new("search"));
        let exec = executor(policy, vec![tool.clone()], ExecutorConfig::default());
        let attempt = exec.execute(&item(Some("Ada Lovelace")), 1).await;
        assert_eq!(attempt.cache_hits, 1);
        assert_eq!(tool.calls(), 1);
    }
}
