//! Episode execution: one question, one agent run, one verification.
//!
//! The [`EpisodeRunner`] trait is the seam between the rejection sampler
//! and everything that talks to the outside world. It never fails: every
//! problem inside an episode is folded into the returned [`Attempt`]'s
//! outcome.

pub mod executor;

pub use executor::{EpisodeExecutor, ExecutorConfig};

use async_trait::async_trait;

use crate::trajectory::{Attempt, Item};

#[async_trait]
pub trait EpisodeRunner: Send + Sync {
    /// Runs `item` once as attempt number `attempt_number`.
    async fn execute(&self, item: &Item, attempt_number: u32) -> Attempt;
}
