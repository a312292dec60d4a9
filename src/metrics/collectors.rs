//! Recording helpers over the raw Prometheus metrics.
//!
//! Every helper is a no-op until [`super::init_metrics`] has run, so library
//! code and tests can record unconditionally.

use super::prometheus::{
    ATTEMPTS_TOTAL, BATCHES_COMPLETED, CACHE_LOOKUPS_TOTAL, EPISODES_IN_FLIGHT, EPISODE_DURATION,
    ITEMS_TOTAL, TOOL_CALLS_TOTAL,
};

/// Record one finished attempt.
pub fn record_attempt(outcome: &str, duration_secs: f64) {
    if let Some(counter) = ATTEMPTS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
    if let Some(histogram) = EPISODE_DURATION.get() {
        histogram.observe(duration_secs);
    }
}

/// Record an item reaching a terminal status.
pub fn record_item_status(status: &str) {
    if let Some(counter) = ITEMS_TOTAL.get() {
        counter.with_label_values(&[status]).inc();
    }
}

pub fn record_tool_call(tool: &str, status: &str) {
    if let Some(counter) = TOOL_CALLS_TOTAL.get() {
        counter.with_label_values(&[tool, status]).inc();
    }
}

pub fn record_cache_lookup(hit: bool) {
    if let Some(counter) = CACHE_LOOKUPS_TOTAL.get() {
        counter
            .with_label_values(&[if hit { "hit" } else { "miss" }])
            .inc();
    }
}

pub fn record_batch_completed() {
    if let Some(counter) = BATCHES_COMPLETED.get() {
        counter.inc();
    }
}

/// Holds the in-flight episode gauge up for as long as it lives.
#[derive(Debug)]
pub struct InFlightGuard(());

impl InFlightGuard {
    pub fn new() -> Self {
        if let Some(gauge) = EPISODES_IN_FLIGHT.get() {
            gauge.inc();
        }
        Self(())
    }
}

impl Default for InFlightGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(gauge) = EPISODES_IN_FLIGHT.get() {
            gauge.dec();
        }
    }
}
