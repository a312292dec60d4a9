//! Liveness tracking for one shard.
//!
//! Samplers bump the shared counters as attempts land and items settle.
//! A background [`ProgressMonitor`] logs them periodically, and
//! [`HealthSnapshot`] exposes them to whatever supervises the process.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::trajectory::ItemStatus;

/// Point-in-time view of a shard's progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    /// Items handed to the scheduler.
    pub total: usize,
    /// Items neither terminal nor currently sampling.
    pub pending: usize,
    /// Items whose sampler is running right now.
    pub in_flight: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub exhausted: usize,
    /// Attempts executed by this process (resumed ones excluded).
    pub attempts: usize,
    /// Seconds since an attempt or item last completed.
    pub idle_secs: f64,
    pub elapsed_secs: f64,
}

impl HealthSnapshot {
    pub fn terminal(&self) -> usize {
        self.accepted + self.rejected + self.exhausted
    }

    pub fn is_complete(&self) -> bool {
        self.terminal() >= self.total
    }
}

#[derive(Debug)]
struct Counters {
    started: Instant,
    total: AtomicUsize,
    in_flight: AtomicUsize,
    accepted: AtomicUsize,
    rejected: AtomicUsize,
    exhausted: AtomicUsize,
    attempts: AtomicUsize,
    /// Milliseconds after `started` of the last progress event.
    last_progress_ms: AtomicU64,
}

/// Shared atomic counters for shard progress.
///
/// Cloning shares the underlying counters.
#[derive(Debug, Clone)]
pub struct ProgressCounters {
    inner: Arc<Counters>,
}

impl Default for ProgressCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Counters {
                started: Instant::now(),
                total: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                accepted: AtomicUsize::new(0),
                rejected: AtomicUsize::new(0),
                exhausted: AtomicUsize::new(0),
                attempts: AtomicUsize::new(0),
                last_progress_ms: AtomicU64::new(0),
            }),
        }
    }

    pub fn add_total(&self, n: usize) {
        self.inner.total.fetch_add(n, Ordering::Relaxed);
        self.touch();
    }

    pub fn item_started(&self) {
        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn item_finished(&self) {
        self.inner.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn attempt_recorded(&self) {
        self.inner.attempts.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Counts an item that settled, either freshly or from a snapshot.
    pub fn item_settled(&self, status: ItemStatus) {
        let counter = match status {
            ItemStatus::Accepted => &self.inner.accepted,
            ItemStatus::Rejected => &self.inner.rejected,
            ItemStatus::Exhausted => &self.inner.exhausted,
            ItemStatus::Pending | ItemStatus::InProgress => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    fn touch(&self) {
        let ms = self.inner.started.elapsed().as_millis() as u64;
        self.inner.last_progress_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let c = &self.inner;
        let total = c.total.load(Ordering::Relaxed);
        let in_flight = c.in_flight.load(Ordering::Relaxed);
        let accepted = c.accepted.load(Ordering::Relaxed);
        let rejected = c.rejected.load(Ordering::Relaxed);
        let exhausted = c.exhausted.load(Ordering::Relaxed);
        let elapsed = c.started.elapsed();
        let last = Duration::from_millis(c.last_progress_ms.load(Ordering::Relaxed));

        HealthSnapshot {
            total,
            pending: total.saturating_sub(accepted + rejected + exhausted + in_flight),
            in_flight,
            accepted,
            rejected,
            exhausted,
            attempts: c.attempts.load(Ordering::Relaxed),
            idle_secs: elapsed.saturating_sub(last).as_secs_f64(),
            elapsed_secs: elapsed.as_secs_f64(),
        }
    }

    /// True when work remains but nothing has completed for `max_idle`.
    pub fn is_stalled(&self, max_idle: Duration) -> bool {
        let snap = self.snapshot();
        !snap.is_complete() && snap.idle_secs >= max_idle.as_secs_f64()
    }
}

/// A background task that periodically logs shard progress.
///
/// Call [`ProgressMonitor::stop`] to cancel; dropping it also stops the
/// loop at its next tick.
pub struct ProgressMonitor {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    /// Starts logging every `interval`, warning once per tick while the
    /// shard has been idle longer than `stall_after`.
    pub fn start(counters: ProgressCounters, interval: Duration, stall_after: Duration) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }

                let snap = counters.snapshot();
                let pct = if snap.total > 0 {
                    (snap.terminal() as f64 / snap.total as f64 * 100.0).min(100.0)
                } else {
                    0.0
                };
                let attempts_per_min = if snap.elapsed_secs > 0.0 {
                    snap.attempts as f64 / snap.elapsed_secs * 60.0
                } else {
                    0.0
                };

                tracing::info!(
                    total = snap.total,
                    pending = snap.pending,
                    in_flight = snap.in_flight,
                    accepted = snap.accepted,
                    rejected = snap.rejected,
                    exhausted = snap.exhausted,
                    attempts = snap.attempts,
                    progress_pct = format!("{:.1}%", pct),
                    attempts_per_min = format!("{:.2}", attempts_per_min),
                    elapsed_secs = snap.elapsed_secs as u64,
                    "Shard progress"
                );

                if counters.is_stalled(stall_after) {
                    tracing::warn!(
                        idle_secs = snap.idle_secs as u64,
                        in_flight = snap.in_flight,
                        "No progress within the stall window"
                    );
                }
            }
        });

        Self {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signal the background monitor to stop and wait for it to finish.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }
}
