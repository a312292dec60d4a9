//! Static dataset partitioning across worker processes.
//!
//! Assignment is a pure function of `(total_items, worker_index,
//! total_workers)`. Workers never talk to each other; rerunning a crashed
//! worker with the same index reproduces the same range, which is what
//! makes its storage key safe to resume.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::ShardError;

/// Returns the contiguous index range owned by `worker_index`.
///
/// Every shard gets `ceil(total_items / total_workers)` items except the
/// trailing ones, which may be shorter or empty.
///
/// # Errors
///
/// Returns [`ShardError::ZeroWorkers`] when `total_workers` is zero and
/// [`ShardError::WorkerIndexOutOfRange`] when the index does not name a worker.
///
/// # Example
///
/// ```
/// use traceforge::shard::assign;
///
/// assert_eq!(assign(10, 0, 3).unwrap(), 0..4);
/// assert_eq!(assign(10, 2, 3).unwrap(), 8..10);
/// ```
pub fn assign(
    total_items: usize,
    worker_index: usize,
    total_workers: usize,
) -> Result<Range<usize>, ShardError> {
    if total_workers == 0 {
        return Err(ShardError::ZeroWorkers);
    }
    if worker_index >= total_workers {
        return Err(ShardError::WorkerIndexOutOfRange {
            worker_index,
            total_workers,
        });
    }

    let chunk = total_items.div_ceil(total_workers);
    let start = worker_index.saturating_mul(chunk).min(total_items);
    let end = (worker_index + 1).saturating_mul(chunk).min(total_items);
    Ok(start..end)
}

/// One worker's position in a sharded run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardKey {
    pub worker_index: usize,
    pub total_workers: usize,
}

impl ShardKey {
    pub fn new(worker_index: usize, total_workers: usize) -> Self {
        Self {
            worker_index,
            total_workers,
        }
    }

    /// The whole dataset as one shard.
    pub fn single() -> Self {
        Self::new(0, 1)
    }

    /// Checked constructor; rejects keys [`assign`] would refuse.
    pub fn checked(worker_index: usize, total_workers: usize) -> Result<Self, ShardError> {
        assign(0, worker_index, total_workers)?;
        Ok(Self::new(worker_index, total_workers))
    }

    /// The index range this shard owns in a dataset of `total_items`.
    pub fn range(&self, total_items: usize) -> Result<Range<usize>, ShardError> {
        assign(total_items, self.worker_index, self.total_workers)
    }
}

impl Default for ShardKey {
    fn default() -> Self {
        Self::single()
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard-{}-of-{}", self.worker_index, self.total_workers)
    }
}
