//! F1 with an LLM grader fallback.
//!
//! Close token overlap is accepted outright. Anything below the F1
//! threshold goes to a grader model that answers `A` (correct) or `B`
//! (incorrect). A correct verdict scores 1.0; an incorrect one keeps the
//! F1 score so near misses stay distinguishable in the attempt log.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::f1::f1_score;
use super::Verifier;
use crate::error::{LlmError, VerificationError};
use crate::llm::{GenerationRequest, LlmProvider, Message};
use crate::scaffold::prompts::{build_grader_prompt, GRADER_SYSTEM_PROMPT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Correct,
    Incorrect,
}

/// Parses a grader reply such as `A`, `b`, `A: CORRECT` or `**B**`.
pub fn parse_verdict(reply: &str) -> Result<Verdict, VerificationError> {
    let token: String = reply
        .trim()
        .trim_start_matches(|c: char| !c.is_ascii_alphanumeric())
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect();
    match token.to_ascii_lowercase().as_str() {
        "a" | "correct" => Ok(Verdict::Correct),
        "b" | "incorrect" => Ok(Verdict::Incorrect),
        _ => Err(VerificationError::UnrecognizedVerdict(reply.trim().to_string())),
    }
}

pub struct LlmJudgeVerifier {
    grader: Arc<dyn LlmProvider>,
    model: String,
    f1_threshold: f64,
    temperature: f64,
    max_tokens: u32,
}

impl LlmJudgeVerifier {
    pub fn new(grader: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            grader,
            model: model.into(),
            f1_threshold: 0.9,
            temperature: 0.3,
            max_tokens: 16,
        }
    }

    pub fn with_f1_threshold(mut self, threshold: f64) -> Self {
        self.f1_threshold = threshold;
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

    async fn grade(
        &self,
        question: &str,
        answer: &str,
        ground_truth: &str,
    ) -> Result<Verdict, VerificationError> {
        let request = GenerationRequest::new(
            self.model.clone(),
            vec![
                Message::system(GRADER_SYSTEM_PROMPT),
                Message::user(build_grader_prompt(question, ground_truth, answer)),
            ],
        )
        .with_temperature(self.temperature)
        .with_max_tokens(self.max_tokens);

        let response = self.grader.generate(request).await?;
        let reply = response.content().ok_or(LlmError::EmptyResponse)?;
        parse_verdict(reply)
    }
}

#[async_trait]
impl Verifier for LlmJudgeVerifier {
    async fn score(
        &self,
        question: &str,
        answer: &str,
        ground_truth: &str,
    ) -> Result<f64, VerificationError> {
        let f1 = f1_score(answer, ground_truth);
        if f1 >= self.f1_threshold {
            return Ok(1.0);
        }
        let verdict = self.grade(question, answer, ground_truth).await?;
        debug!(f1 = f1, verdict = ?verdict, "Grader verdict");
        Ok(match verdict {
            Verdict::Correct => 1.0,
            Verdict::Incorrect => f1,
        })
    }

    fn name(&self) -> &str {
        "llm_judge"
    }
}
