//! SQuAD-style token-overlap F1.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

use super::Verifier;
use crate::error::VerificationError;

fn articles() -> &'static Regex {
    static ARTICLES: OnceLock<Regex> = OnceLock::new();
    ARTICLES.get_or_init(|| Regex::new(r"\b(a|an|the)\b").expect("Invalid regex for articles"))
}

/// Lower-cases, strips ASCII punctuation, drops articles, collapses whitespace.
pub fn normalize_answer(text: &str) -> String {
    let lowered = text.to_lowercase();
    let no_punct: String = lowered.chars().filter(|c| !c.is_ascii_punctuation()).collect();
    let no_articles = articles().replace_all(&no_punct, " ");
    no_articles.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Token-overlap F1 between a prediction and a reference, in `[0, 1]`.
pub fn f1_score(prediction: &str, gold: &str) -> f64 {
    let pred = normalize_answer(prediction);
    let gold = normalize_answer(gold);
    let pred_tokens: Vec<&str> = pred.split_whitespace().collect();
    let gold_tokens: Vec<&str> = gold.split_whitespace().collect();

    let mut gold_counts: HashMap<&str, usize> = HashMap::new();
    for token in &gold_tokens {
        *gold_counts.entry(token).or_default() += 1;
    }
    let mut same = 0usize;
    for token in &pred_tokens {
        if let Some(count) = gold_counts.get_mut(token) {
            if *count > 0 {
                *count -= 1;
                same += 1;
            }
        }
    }
    if same == 0 {
        return 0.0;
    }

    let precision = same as f64 / pred_tokens.len() as f64;
    let recall = same as f64 / gold_tokens.len() as f64;
    2.0 * precision * recall / (precision + recall)
}

/// Scores answers by token-overlap F1 alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct F1Verifier;

#[async_trait]
impl Verifier for F1Verifier {
    async fn score(
        &self,
        _question: &str,
        answer: &str,
        ground_truth: &str,
    ) -> Result<f64, VerificationError> {
        Ok(f1_score(answer, ground_truth))
    }

    fn name(&self) -> &str {
        "f1"
    }
}
