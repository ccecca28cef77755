//! PIMAP Watermark Tracker
//!
//! Per-stream event-time watermarks. A stream's watermark is the largest
//! observed timestamp minus the stream's allowed lateness; it starts at
//! negative infinity and never decreases. Updates are a single atomic
//! compare-and-set loop, so concurrent producers cannot regress it.
//!
//! Key Features:
//! - Lock-free monotonic advance per stream
//! - Auto-registration with configured lateness
//! - Group watermark as the minimum over member streams
//! - Snapshot and restore for checkpoints
//!
//! @version 0.1.0
//! @author PIMAP Development Team

use parking_lot::RwLock;
use pimap_common::{millis_to_micros, PipelineConfig, StreamId, Timestamp};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

// =============================================================================
// Watermark Advance
// =============================================================================

/// Watermark values before and after an advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatermarkAdvance {
    pub previous: Timestamp,
    pub current: Timestamp,
}

impl WatermarkAdvance {
    pub fn advanced(&self) -> bool {
        self.current > self.previous
    }
}

// =============================================================================
// Stream Watermark
// =============================================================================

struct StreamWatermark {
    value: AtomicI64,
    allowed_lateness: i64,
    retired: AtomicBool,
}

impl StreamWatermark {
    fn new(allowed_lateness: i64) -> Self {
        Self {
            value: AtomicI64::new(Timestamp::MIN.0),
            allowed_lateness,
            retired: AtomicBool::new(false),
        }
    }

    fn load(&self) -> Timestamp {
        Timestamp(self.value.load(Ordering::Acquire))
    }

    /// Raise the watermark to `candidate` if it is larger.
    fn raise(&self, candidate: Timestamp) -> WatermarkAdvance {
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            if candidate.0 <= current {
                return WatermarkAdvance {
                    previous: Timestamp(current),
                    current: Timestamp(current),
                };
            }
            match self.value.compare_exchange_weak(
                current,
                candidate.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return WatermarkAdvance {
                        previous: Timestamp(current),
                        current: candidate,
                    }
                }
                Err(actual) => current = actual,
            }
        }
    }
}

// =============================================================================
// Watermark Tracker
// =============================================================================

/// Tracks the watermark of every known stream.
pub struct WatermarkTracker {
    streams: RwLock<HashMap<StreamId, Arc<StreamWatermark>>>,
    default_lateness: i64,
    lateness_overrides: HashMap<StreamId, i64>,
}

impl WatermarkTracker {
    /// Tracker where every stream uses `allowed_lateness` (timestamp units).
    pub fn new(allowed_lateness: i64) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            default_lateness: allowed_lateness.max(0),
            lateness_overrides: HashMap::new(),
        }
    }

    /// Tracker using the default and per-stream lateness from `config`.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let lateness_overrides = config
            .streams
            .keys()
            .map(|stream| (StreamId::new(stream.as_str()), config.lateness_for(stream)))
            .collect();
        Self {
            streams: RwLock::new(HashMap::new()),
            default_lateness: millis_to_micros(config.watermark.allowed_lateness_ms),
            lateness_overrides,
        }
    }

    fn configured_lateness(&self, stream: &StreamId) -> i64 {
        self.lateness_overrides
            .get(stream)
            .copied()
            .unwrap_or(self.default_lateness)
    }

    fn entry(&self, stream: &StreamId) -> Option<Arc<StreamWatermark>> {
        self.streams.read().get(stream).cloned()
    }

    fn entry_or_register(&self, stream: &StreamId) -> Arc<StreamWatermark> {
        if let Some(entry) = self.entry(stream) {
            return entry;
        }
        let lateness = self.configured_lateness(stream);
        self.streams
            .write()
            .entry(stream.clone())
            .or_insert_with(|| Arc::new(StreamWatermark::new(lateness)))
            .clone()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Register a stream with an explicit lateness. Returns false if it was
    /// already known; the existing watermark is kept.
    pub fn register_stream(&self, stream: impl Into<StreamId>, allowed_lateness: i64) -> bool {
        let stream = stream.into();
        let mut streams = self.streams.write();
        if streams.contains_key(&stream) {
            return false;
        }
        streams.insert(stream, Arc::new(StreamWatermark::new(allowed_lateness.max(0))));
        true
    }

    /// Mark a stream as finished. A retired stream no longer holds back the
    /// watermark of its groups; its own watermark is kept, so a later sample
    /// reactivates it without regressing. Returns the final watermark.
    pub fn retire_stream(&self, stream: &StreamId) -> Option<Timestamp> {
        let entry = self.entry(stream)?;
        entry.retired.store(true, Ordering::Release);
        tracing::debug!(stream = %stream, watermark = %entry.load(), "stream retired");
        Some(entry.load())
    }

    pub fn is_retired(&self, stream: &StreamId) -> bool {
        self.entry(stream)
            .is_some_and(|e| e.retired.load(Ordering::Acquire))
    }

    // -------------------------------------------------------------------------
    // Advance and Query
    // -------------------------------------------------------------------------

    /// Advance the stream's watermark for an observed timestamp.
    pub fn advance(&self, stream: &StreamId, observed: Timestamp) -> WatermarkAdvance {
        let entry = self.entry_or_register(stream);
        entry.retired.store(false, Ordering::Release);
        let candidate = observed.saturating_sub_micros(entry.allowed_lateness);
        entry.raise(candidate)
    }

    /// Current watermark; negative infinity for unknown streams.
    pub fn watermark(&self, stream: &StreamId) -> Timestamp {
        self.entry(stream).map_or(Timestamp::MIN, |e| e.load())
    }

    /// True when the stream's watermark has reached `window_end`.
    pub fn is_closed(&self, stream: &StreamId, window_end: Timestamp) -> bool {
        self.watermark(stream) >= window_end
    }

    /// Watermark of a stream group: the minimum over active members.
    ///
    /// Unknown members hold the group at negative infinity. Retired members
    /// are skipped; a group whose members are all retired is fully closed.
    pub fn min_watermark(&self, members: &[StreamId]) -> Timestamp {
        let streams = self.streams.read();
        let mut min = Timestamp::MAX;
        for member in members {
            match streams.get(member) {
                None => return Timestamp::MIN,
                Some(entry) if entry.retired.load(Ordering::Acquire) => continue,
                Some(entry) => min = min.min(entry.load()),
            }
        }
        min
    }

    pub fn allowed_lateness(&self, stream: &StreamId) -> i64 {
        self.entry(stream)
            .map_or_else(|| self.configured_lateness(stream), |e| e.allowed_lateness)
    }

    pub fn streams(&self) -> Vec<StreamId> {
        let mut streams: Vec<StreamId> = self.streams.read().keys().cloned().collect();
        streams.sort();
        streams
    }

    // -------------------------------------------------------------------------
    // Checkpointing
    // -------------------------------------------------------------------------

    /// Raise a stream's watermark to a checkpointed value.
    pub fn restore(&self, stream: &StreamId, value: Timestamp) -> WatermarkAdvance {
        self.entry_or_register(stream).raise(value)
    }

    /// Watermarks of all known streams.
    pub fn snapshot(&self) -> BTreeMap<StreamId, Timestamp> {
        self.streams
            .read()
            .iter()
            .map(|(stream, entry)| (stream.clone(), entry.load()))
            .collect()
    }
}

impl Default for WatermarkTracker {
    fn default() -> Self {
        Self::new(0)
    }
}

// =============================================================================
// Tests
// =============================================================================
