//! PIMAP Types - Core Data Types
//!
//! The data model shared by every pipeline stage: sensor samples, derived
//! metrics, window bounds and the identifiers that key them in storage.
//!
//! Key Features:
//! - Type-safe identifiers (StreamId, ScopeId, MetricId, Lsn)
//! - Event-time timestamps with a reserved negative infinity
//! - Totally ordered storage keys for range scans
//! - Serialization support via serde
//!
//! @version 0.1.0
//! @author PIMAP Development Team

use crate::error::{FailureClass, PimapError, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

// =============================================================================
// Identifier Types
// =============================================================================

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of an originating sensor channel.
    StreamId
);

string_id!(
    /// Identifier of a metric computation, e.g. "impact_score".
    MetricId
);

string_id!(
    /// Source scope of a window or metric: a stream id or a stream-group id.
    ScopeId
);

impl From<&StreamId> for ScopeId {
    fn from(stream: &StreamId) -> Self {
        Self(stream.0.clone())
    }
}

/// Log sequence number for record log entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn(pub u64);

// =============================================================================
// Timestamp
// =============================================================================

/// Event time in microseconds since the Unix epoch.
///
/// `Timestamp::MIN` stands for negative infinity and is never a valid sample
/// timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub const MIN: Timestamp = Timestamp(i64::MIN);
    pub const MAX: Timestamp = Timestamp(i64::MAX);

    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub const fn from_millis(millis: i64) -> Self {
        Self(millis.saturating_mul(1_000))
    }

    /// Convert floating epoch seconds, rejecting NaN, infinities and overflow.
    pub fn from_secs_f64(secs: f64) -> Option<Self> {
        if !secs.is_finite() {
            return None;
        }
        let micros = (secs * 1_000_000.0).round();
        if micros <= i64::MIN as f64 || micros >= i64::MAX as f64 {
            return None;
        }
        Some(Self(micros as i64))
    }

    pub fn now() -> Self {
        Self(Utc::now().timestamp_micros())
    }

    pub const fn as_micros(&self) -> i64 {
        self.0
    }

    pub const fn as_millis(&self) -> i64 {
        self.0.div_euclid(1_000)
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// True for the reserved negative infinity.
    pub const fn is_min(&self) -> bool {
        self.0 == i64::MIN
    }

    pub const fn saturating_add_micros(&self, micros: i64) -> Self {
        Self(self.0.saturating_add(micros))
    }

    pub const fn saturating_sub_micros(&self, micros: i64) -> Self {
        Self(self.0.saturating_sub(micros))
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_micros(self.0).single()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_min() {
            write!(f, "-inf")
        } else {
            write!(f, "{}us", self.0)
        }
    }
}

/// Convert a configured duration in milliseconds to timestamp units.
pub fn millis_to_micros(millis: u64) -> i64 {
    i64::try_from(millis).unwrap_or(i64::MAX).saturating_mul(1_000)
}

// =============================================================================
// Sample
// =============================================================================

/// Numeric payload of a sample: a scalar or a small fixed-size vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SampleValue(pub Vec<f64>);

impl SampleValue {
    pub fn scalar(value: f64) -> Self {
        Self(vec![value])
    }

    pub fn vector(values: impl Into<Vec<f64>>) -> Self {
        Self(values.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn get(&self, field: usize) -> Option<f64> {
        self.0.get(field).copied()
    }

    /// Euclidean norm of all fields.
    pub fn magnitude(&self) -> f64 {
        self.0.iter().map(|v| v * v).sum::<f64>().sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }
}

/// Unique identity of a stored sample, ordered for range scans.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SampleKey {
    pub stream_id: StreamId,
    pub timestamp: Timestamp,
    pub sequence: u64,
}

impl SampleKey {
    pub fn new(stream_id: impl Into<StreamId>, timestamp: Timestamp, sequence: u64) -> Self {
        Self {
            stream_id: stream_id.into(),
            timestamp,
            sequence,
        }
    }
}

impl fmt::Display for SampleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.stream_id, self.timestamp.0, self.sequence)
    }
}

/// A raw, timestamped sensor reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub stream_id: StreamId,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub sequence: u64,
    pub value: SampleValue,
}

impl Sample {
    pub fn new(stream_id: impl Into<StreamId>, timestamp: Timestamp, value: SampleValue) -> Self {
        Self {
            stream_id: stream_id.into(),
            timestamp,
            sequence: 0,
            value,
        }
    }

    pub fn scalar(stream_id: impl Into<StreamId>, timestamp: Timestamp, value: f64) -> Self {
        Self::new(stream_id, timestamp, SampleValue::scalar(value))
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn key(&self) -> SampleKey {
        SampleKey {
            stream_id: self.stream_id.clone(),
            timestamp: self.timestamp,
            sequence: self.sequence,
        }
    }

    /// Check the required fields before the sample enters the store.
    pub fn validate(&self) -> Result<()> {
        if self.stream_id.as_str().trim().is_empty() {
            return Err(PimapError::MalformedSample("stream_id is empty".to_string()));
        }
        if self.timestamp.is_min() {
            return Err(PimapError::MalformedSample(format!(
                "{}: timestamp is not finite",
                self.key()
            )));
        }
        if self.value.is_empty() {
            return Err(PimapError::MalformedSample(format!(
                "{}: value has no fields",
                self.key()
            )));
        }
        if !self.value.is_finite() {
            return Err(PimapError::MalformedSample(format!(
                "{}: value contains a non-finite field",
                self.key()
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Window Types
// =============================================================================

/// How samples are grouped into windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    #[default]
    Fixed,
    Sliding,
    Session,
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed => write!(f, "fixed"),
            Self::Sliding => write!(f, "sliding"),
            Self::Session => write!(f, "session"),
        }
    }
}

/// Half-open event-time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WindowBounds {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl WindowBounds {
    pub const fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, timestamp: Timestamp) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end && !self.start.is_min()
    }

    pub fn duration_micros(&self) -> i64 {
        self.end.0.saturating_sub(self.start.0)
    }
}

impl fmt::Display for WindowBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.0, self.end.0)
    }
}

// =============================================================================
// Metric Types
// =============================================================================

/// Result of a metric computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricValue {
    Scalar(f64),
    Vector(Vec<f64>),
    Fields(BTreeMap<String, f64>),
}

impl MetricValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn field(&self, name: &str) -> Option<f64> {
        match self {
            Self::Fields(fields) => fields.get(name).copied(),
            _ => None,
        }
    }
}

/// Content fingerprint of the inputs a metric was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputsVersion(pub u128);

impl fmt::Display for InputsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl Serialize for InputsVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for InputsVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        u128::from_str_radix(&hex, 16)
            .map(InputsVersion)
            .map_err(serde::de::Error::custom)
    }
}

/// Logical identity of a metric; recomputation overwrites in place.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MetricKey {
    pub metric_id: MetricId,
    pub scope: ScopeId,
    pub window_start: Timestamp,
    pub window_end: Timestamp,
}

impl MetricKey {
    pub fn new(metric_id: impl Into<MetricId>, scope: impl Into<ScopeId>, bounds: WindowBounds) -> Self {
        Self {
            metric_id: metric_id.into(),
            scope: scope.into(),
            window_start: bounds.start,
            window_end: bounds.end,
        }
    }

    pub fn bounds(&self) -> WindowBounds {
        WindowBounds::new(self.window_start, self.window_end)
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}{}", self.metric_id, self.scope, self.bounds())
    }
}

/// A derived measurement summarizing one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub metric_id: MetricId,
    pub scope: ScopeId,
    pub window_start: Timestamp,
    pub window_end: Timestamp,
    pub value: MetricValue,
    pub inputs_version: InputsVersion,
    pub sample_count: usize,
}

impl Metric {
    pub fn key(&self) -> MetricKey {
        MetricKey {
            metric_id: self.metric_id.clone(),
            scope: self.scope.clone(),
            window_start: self.window_start,
            window_end: self.window_end,
        }
    }
}

/// Explicit marker for a metric that terminally failed on a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricFailure {
    pub metric_id: MetricId,
    pub scope: ScopeId,
    pub window_start: Timestamp,
    pub window_end: Timestamp,
    pub class: FailureClass,
    pub error: String,
    pub attempts: u32,
    pub inputs_version: Option<InputsVersion>,
}

impl MetricFailure {
    pub fn key(&self) -> MetricKey {
        MetricKey {
            metric_id: self.metric_id.clone(),
            scope: self.scope.clone(),
            window_start: self.window_start,
            window_end: self.window_end,
        }
    }
}

/// What the metric store holds for a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MetricRecord {
    Computed(Metric),
    Failed(MetricFailure),
}

impl MetricRecord {
    pub fn key(&self) -> MetricKey {
        match self {
            Self::Computed(metric) => metric.key(),
            Self::Failed(failure) => failure.key(),
        }
    }

    pub fn as_metric(&self) -> Option<&Metric> {
        match self {
            Self::Computed(metric) => Some(metric),
            Self::Failed(_) => None,
        }
    }

    pub fn as_failure(&self) -> Option<&MetricFailure> {
        match self {
            Self::Computed(_) => None,
            Self::Failed(failure) => Some(failure),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn window_start(&self) -> Timestamp {
        match self {
            Self::Computed(metric) => metric.window_start,
            Self::Failed(failure) => failure.window_start,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
