//! Trace records for rejection-sampled episodes.
//!
//! # Overview
//!
//! - **Item**: one question with an optional ground truth
//! - **Attempt**: one agent run over an item, with its trace and score
//! - **IterationRecord**: one pass over a dataset, one terminal entry per item
//!
//! Attempts are appended to a per-shard log as they finish and each
//! completed batch is snapshotted, both through [`RunStore`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use traceforge::trajectory::{RunStore, StorageKey, TraceCollector};
//! use traceforge::shard::ShardKey;
//!
//! let mut collector = TraceCollector::new("q-17", 1);
//! collector.record_agent_output(1, "<answer>Paris</answer>");
//! collector.record_final_answer(1, "Paris");
//! let attempt = collector.finish(Some("Paris".into()), Some(1.0), AttemptOutcome::Success, None);
//!
//! let store = RunStore::new("runs");
//! let key = StorageKey::new("geo", 1, ShardKey::single());
//! store.append_attempt(&key, &attempt).await?;
//! ```

pub mod collector;
pub mod storage;
pub mod types;

pub use collector::TraceCollector;
pub use storage::{RunStore, StorageKey, StoredProgress};
pub use types::{
    Attempt, AttemptOutcome, BatchSnapshot, Item, ItemStatus, IterationEntry, IterationRecord,
    TraceStep,
};
