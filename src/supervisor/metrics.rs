//! Counters for command execution: `commands.total`, `commands.errors`,
//! `commands.duration`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Default)]
pub struct CommandMetrics {
    total: AtomicU64,
    errors: AtomicU64,
    rejected: AtomicU64,
    duration_ms_total: AtomicU64,
    duration_ms_max: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub errors: u64,
    /// Calls turned away by an open breaker; never spawned, not in `total`.
    pub rejected: u64,
    pub duration_ms_total: u64,
    pub duration_ms_max: u64,
}

impl CommandMetrics {
    pub fn record_attempt(&self, duration: Duration, failed: bool) {
        let ms = duration.as_millis() as u64;
        self.total.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.duration_ms_total.fetch_add(ms, Ordering::Relaxed);
        self.duration_ms_max.fetch_max(ms, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            duration_ms_total: self.duration_ms_total.load(Ordering::Relaxed),
            duration_ms_max: self.duration_ms_max.load(Ordering::Relaxed),
        }
    }
}
