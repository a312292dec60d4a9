//! Process-wide stop flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

/// Cooperative stop request shared by the scheduler and its samplers.
///
/// Tripping it never interrupts running work. Episodes already in flight
/// finish and get logged; no new attempt or item starts afterwards.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    tripped: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trip(&self) {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            info!("Stop requested; letting in-flight episodes finish");
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }
}
