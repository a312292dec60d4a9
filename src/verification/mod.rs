//! Answer verification.
//!
//! A [`Verifier`] scores a final answer against the item's ground truth,
//! producing a value in `[0, 1]`. The episode executor compares it with the
//! acceptance threshold.

pub mod f1;
pub mod judge;

pub use f1::{f1_score, normalize_answer, F1Verifier};
pub use judge::{parse_verdict, LlmJudgeVerifier, Verdict};

use async_trait::async_trait;

use crate::error::VerificationError;

#[async_trait]
pub trait Verifier: Send + Sync {
    /// Scores `answer` against `ground_truth`.
    async fn score(
        &self,
        question: &str,
        answer: &str,
        ground_truth: &str,
    ) -> Result<f64, VerificationError>;

    /// Short name used in logs.
    fn name(&self) -> &str;
}
