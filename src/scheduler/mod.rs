//! Shard execution: bounded-concurrency batches over the rejection sampler.
//!
//! # Architecture
//!
//! ```text
//!   items ──► batch 0 ──► [permit] sampler(item) ─┐
//!             batch 1       [permit] sampler(item) ─┼─► drain ─► snapshot ─► yield (input order)
//!             ...           [permit] sampler(item) ─┘
//! ```
//!
//! At most `max_concurrent` samplers hold a permit at once, and a sampler
//! runs one episode at a time, so the same bound holds for episodes.
//!
//! # Example
//!
//! ```rust,ignore
//! use traceforge::scheduler::{BatchScheduler, SchedulerConfig};
//!
//! let scheduler = BatchScheduler::new(runner, store, key, policy, SchedulerConfig::new(4, 32))?
//!     .with_stop_signal(stop);
//! let record = scheduler.run_to_record(items).await?;
//! ```

pub mod batch;
pub mod progress;
pub mod signal;

pub use batch::{BatchScheduler, SchedulerConfig};
pub use progress::{HealthSnapshot, ProgressCounters, ProgressMonitor};
pub use signal::StopSignal;
