//! Metrics module for Prometheus-based monitoring.
//!
//! Counts attempts, terminal items, tool calls and cache lookups, and
//! tracks how many episodes are in flight.
//!
//! # Example
//!
//! ```ignore
//! use traceforge::metrics::{init_metrics, export_metrics};
//!
//! init_metrics()?;
//! // ... run a shard ...
//! std::fs::write("metrics.prom", export_metrics())?;
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{
    record_attempt, record_batch_completed, record_cache_lookup, record_item_status,
    record_tool_call, InFlightGuard,
};
pub use prometheus::{export_metrics, init_metrics, REGISTRY};
