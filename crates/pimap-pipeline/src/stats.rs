//! PIMAP Pipeline Statistics
//!
//! Lock-free counters updated on the ingest and evaluation paths, and the
//! serializable snapshot reported to operators.
//!
//! @version 0.1.0
//! @author PIMAP Development Team

use chrono::{DateTime, Utc};
use pimap_streaming::WindowCounts;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

// =============================================================================
// Counters
// =============================================================================

#[derive(Debug)]
pub(crate) struct Counters {
    started: Instant,
    started_at: DateTime<Utc>,
    pub samples_stored: AtomicU64,
    pub samples_unchanged: AtomicU64,
    pub samples_rejected: AtomicU64,
    pub late_events: AtomicU64,
    pub side_output_events: AtomicU64,
    pub windows_closed: AtomicU64,
    pub evaluations: AtomicU64,
    pub evaluations_cancelled: AtomicU64,
    pub recomputations: AtomicU64,
    pub metrics_written: AtomicU64,
    pub metrics_unchanged: AtomicU64,
    pub metrics_failed: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            started_at: Utc::now(),
            samples_stored: AtomicU64::new(0),
            samples_unchanged: AtomicU64::new(0),
            samples_rejected: AtomicU64::new(0),
            late_events: AtomicU64::new(0),
            side_output_events: AtomicU64::new(0),
            windows_closed: AtomicU64::new(0),
            evaluations: AtomicU64::new(0),
            evaluations_cancelled: AtomicU64::new(0),
            recomputations: AtomicU64::new(0),
            metrics_written: AtomicU64::new(0),
            metrics_unchanged: AtomicU64::new(0),
            metrics_failed: AtomicU64::new(0),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, windows: WindowCounts, pending_evaluations: usize) -> PipelineStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let uptime_secs = self.started.elapsed().as_secs_f64();
        let per_sec = |n: u64| if uptime_secs > 0.0 { n as f64 / uptime_secs } else { 0.0 };

        let samples_stored = load(&self.samples_stored);
        let metrics_written = load(&self.metrics_written);

        PipelineStats {
            started_at: self.started_at,
            uptime_secs,
            samples_stored,
            samples_unchanged: load(&self.samples_unchanged),
            samples_rejected: load(&self.samples_rejected),
            late_events: load(&self.late_events),
            side_output_events: load(&self.side_output_events),
            windows_closed: load(&self.windows_closed),
            evaluations: load(&self.evaluations),
            evaluations_cancelled: load(&self.evaluations_cancelled),
            recomputations: load(&self.recomputations),
            metrics_written,
            metrics_unchanged: load(&self.metrics_unchanged),
            metrics_failed: load(&self.metrics_failed),
            pending_evaluations,
            windows,
            throughput_in: per_sec(samples_stored),
            throughput_out: per_sec(metrics_written),
        }
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Point-in-time pipeline statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStats {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: f64,
    pub samples_stored: u64,
    pub samples_unchanged: u64,
    pub samples_rejected: u64,
    pub late_events: u64,
    pub side_output_events: u64,
    pub windows_closed: u64,
    pub evaluations: u64,
    pub evaluations_cancelled: u64,
    pub recomputations: u64,
    pub metrics_written: u64,
    pub metrics_unchanged: u64,
    pub metrics_failed: u64,
    /// Evaluations queued or running.
    pub pending_evaluations: usize,
    pub windows: WindowCounts,
    /// Samples stored per second since start.
    pub throughput_in: f64,
    /// Metrics written per second since start.
    pub throughput_out: f64,
}
