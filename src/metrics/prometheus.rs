//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by traceforge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all traceforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Attempts finished, labeled by outcome (success, failure, error).
pub static ATTEMPTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Items reaching a terminal status, labeled by status.
pub static ITEMS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Episode executions currently running.
pub static EPISODES_IN_FLIGHT: OnceLock<Gauge> = OnceLock::new();

/// Episode wall-clock duration in seconds.
pub static EPISODE_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Tool calls, labeled by tool and status (ok, cached or an error kind).
pub static TOOL_CALLS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Tool cache lookups, labeled by result (hit, miss).
pub static CACHE_LOOKUPS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Batches checkpointed to the run store.
pub static BATCHES_COMPLETED: OnceLock<Counter> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Recording before this is a no-op. Calling it again
/// keeps the first registration.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let attempts_total = CounterVec::new(
        Opts::new("traceforge_attempts_total", "Attempts finished by outcome"),
        &["outcome"],
    )?;

    let items_total = CounterVec::new(
        Opts::new("traceforge_items_total", "Items reaching a terminal status"),
        &["status"],
    )?;

    let episodes_in_flight = Gauge::new(
        "traceforge_episodes_in_flight",
        "Episode executions currently running",
    )?;

    let episode_duration = Histogram::with_opts(
        HistogramOpts::new(
            "traceforge_episode_duration_seconds",
            "Episode wall-clock duration in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0]),
    )?;

    let tool_calls_total = CounterVec::new(
        Opts::new("traceforge_tool_calls_total", "Tool calls by tool and status"),
        &["tool", "status"],
    )?;

    let cache_lookups_total = CounterVec::new(
        Opts::new("traceforge_cache_lookups_total", "Tool cache lookups by result"),
        &["result"],
    )?;

    let batches_completed = Counter::new(
        "traceforge_batches_completed_total",
        "Batches checkpointed to the run store",
    )?;

    registry.register(Box::new(attempts_total.clone()))?;
    registry.register(Box::new(items_total.clone()))?;
    registry.register(Box::new(episodes_in_flight.clone()))?;
    registry.register(Box::new(episode_duration.clone()))?;
    registry.register(Box::new(tool_calls_total.clone()))?;
    registry.register(Box::new(cache_lookups_total.clone()))?;
    registry.register(Box::new(batches_completed.clone()))?;

    // If any of these fail, metrics were already initialized
    let _ = REGISTRY.set(registry);
    let _ = ATTEMPTS_TOTAL.set(attempts_total);
    let _ = ITEMS_TOTAL.set(items_total);
    let _ = EPISODES_IN_FLIGHT.set(episodes_in_flight);
    let _ = EPISODE_DURATION.set(episode_duration);
    let _ = TOOL_CALLS_TOTAL.set(tool_calls_total);
    let _ = CACHE_LOOKUPS_TOTAL.set(cache_lookups_total);
    let _ = BATCHES_COMPLETED.set(batches_completed);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead if the registry was never initialized
/// or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
