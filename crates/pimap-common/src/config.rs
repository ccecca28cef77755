//! PIMAP Config - Pipeline Configuration
//!
//! Configuration types for the store and analyze pipeline. Loaded from TOML
//! files or constructed programmatically; every section has defaults so a
//! partial file is valid.
//!
//! Key Features:
//! - Storage configuration (data directory, sync policy, segment size)
//! - Watermark lateness and window definitions with per-stream overrides
//! - Static stream groups for multi-stream analysis
//! - Metric engine tuning (workers, retry, timeouts)
//! - Declarative built-in metric registration
//!
//! @version 0.1.0
//! @author PIMAP Development Team

use crate::error::{PimapError, Result};
use crate::types::{millis_to_micros, WindowKind};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Storage Configuration
// =============================================================================

/// Configuration for the sample and metric stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for record logs and checkpoints. Memory-only when unset.
    pub data_directory: Option<PathBuf>,
    pub sync_writes: bool,
    pub segment_size: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_directory: None,
            sync_writes: true,
            segment_size: 64 * 1024 * 1024, // 64 MB
        }
    }
}

impl StorageConfig {
    pub fn samples_directory(&self) -> Option<PathBuf> {
        self.data_directory.as_ref().map(|d| d.join("samples"))
    }

    pub fn metrics_directory(&self) -> Option<PathBuf> {
        self.data_directory.as_ref().map(|d| d.join("metrics"))
    }

    pub fn checkpoint_path(&self) -> Option<PathBuf> {
        self.data_directory.as_ref().map(|d| d.join("checkpoint.json"))
    }
}

// =============================================================================
// Watermark Configuration
// =============================================================================

/// Default watermark settings applied to every stream without an override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WatermarkConfig {
    pub allowed_lateness_ms: u64,
}

// =============================================================================
// Window Configuration
// =============================================================================

/// Window definition for a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub kind: WindowKind,
    pub window_size_ms: u64,
    /// Hop between sliding windows. Ignored for fixed windows.
    pub window_stride_ms: u64,
    pub session_gap_ms: u64,
    /// Number of retired session bounds remembered per scope for late recompute.
    pub session_history: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            kind: WindowKind::Fixed,
            window_size_ms: 1_000,
            window_stride_ms: 1_000,
            session_gap_ms: 5_000,
            session_history: 64,
        }
    }
}

impl WindowConfig {
    pub fn fixed(size_ms: u64) -> Self {
        Self {
            kind: WindowKind::Fixed,
            window_size_ms: size_ms,
            window_stride_ms: size_ms,
            ..Default::default()
        }
    }

    pub fn sliding(size_ms: u64, stride_ms: u64) -> Self {
        Self {
            kind: WindowKind::Sliding,
            window_size_ms: size_ms,
            window_stride_ms: stride_ms,
            ..Default::default()
        }
    }

    pub fn session(gap_ms: u64) -> Self {
        Self {
            kind: WindowKind::Session,
            session_gap_ms: gap_ms,
            ..Default::default()
        }
    }

    pub fn size_micros(&self) -> i64 {
        millis_to_micros(self.window_size_ms)
    }

    /// Effective stride: fixed windows tile, so stride equals size.
    pub fn stride_micros(&self) -> i64 {
        match self.kind {
            WindowKind::Fixed => self.size_micros(),
            _ => millis_to_micros(self.window_stride_ms),
        }
    }

    pub fn gap_micros(&self) -> i64 {
        millis_to_micros(self.session_gap_ms)
    }

    pub fn validate(&self, scope: &str) -> Result<()> {
        match self.kind {
            WindowKind::Fixed if self.window_size_ms == 0 => Err(PimapError::Configuration(
                format!("{}: window_size_ms must be positive", scope),
            )),
            WindowKind::Sliding if self.window_size_ms == 0 || self.window_stride_ms == 0 => {
                Err(PimapError::Configuration(format!(
                    "{}: sliding windows need positive window_size_ms and window_stride_ms",
                    scope
                )))
            }
            WindowKind::Session if self.session_gap_ms == 0 => Err(PimapError::Configuration(
                format!("{}: session_gap_ms must be positive", scope),
            )),
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Late Data Policy
// =============================================================================

/// What happens to a sample whose window already closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LateDataPolicy {
    Drop,
    #[default]
    Recompute,
    SideOutput,
}

impl std::fmt::Display for LateDataPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Drop => write!(f, "drop"),
            Self::Recompute => write!(f, "recompute"),
            Self::SideOutput => write!(f, "side-output"),
        }
    }
}

// =============================================================================
// Engine Configuration
// =============================================================================

/// Configuration for the metric engine worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub workers: usize,
    pub retry_max_attempts: u32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub evaluation_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            retry_max_attempts: 3,
            retry_backoff_base_ms: 100,
            retry_backoff_max_ms: 5_000,
            evaluation_timeout_ms: 5_000,
        }
    }
}

impl EngineConfig {
    pub fn retry_backoff_base(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_base_ms)
    }

    pub fn retry_backoff_max(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_max_ms)
    }

    pub fn evaluation_timeout(&self) -> Duration {
        Duration::from_millis(self.evaluation_timeout_ms)
    }
}

// =============================================================================
// Side Output Configuration
// =============================================================================

/// Configuration for the late-data side-output channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SideOutputConfig {
    pub buffer_size: usize,
    /// Number of late events kept for replay.
    pub retention: usize,
}

impl Default for SideOutputConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            retention: 10_000,
        }
    }
}

// =============================================================================
// Stream, Group and Metric Definitions
// =============================================================================

/// Per-stream settings that replace the pipeline defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamOverride {
    pub allowed_lateness_ms: Option<u64>,
    pub late_data_policy: Option<LateDataPolicy>,
    pub window: Option<WindowConfig>,
}

/// A statically declared set of streams analyzed together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub id: String,
    pub members: Vec<String>,
    #[serde(default)]
    pub window: Option<WindowConfig>,
    #[serde(default)]
    pub late_data_policy: Option<LateDataPolicy>,
}

/// A built-in metric enabled from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub id: String,
    /// Built-in function name, e.g. "sum" or "objective_mobility".
    pub function: String,
    /// Sample field to aggregate; the vector magnitude when unset.
    #[serde(default)]
    pub field: Option<usize>,
    /// Window kind the metric applies to; every kind when unset.
    #[serde(default)]
    pub kind: Option<WindowKind>,
    #[serde(default)]
    pub max_pressure: Option<f64>,
    #[serde(default)]
    pub movement_threshold: Option<f64>,
}

// =============================================================================
// Pipeline Configuration
// =============================================================================

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub storage: StorageConfig,
    pub watermark: WatermarkConfig,
    pub window: WindowConfig,
    pub late_data_policy: LateDataPolicy,
    pub engine: EngineConfig,
    pub side_output: SideOutputConfig,
    pub streams: HashMap<String, StreamOverride>,
    pub groups: Vec<GroupConfig>,
    pub metrics: Vec<MetricDefinition>,
}

impl PipelineConfig {
    /// Load and validate configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| PimapError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// In-memory configuration, used by tests and embedded callers.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Persistent configuration rooted at `dir`.
    pub fn persistent(dir: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig {
                data_directory: Some(dir.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.window.validate("window")?;
        if self.engine.workers == 0 {
            return Err(PimapError::Configuration(
                "engine.workers must be at least 1".to_string(),
            ));
        }
        if self.engine.retry_max_attempts == 0 {
            return Err(PimapError::Configuration(
                "engine.retry_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.storage.segment_size == 0 {
            return Err(PimapError::Configuration(
                "storage.segment_size must be positive".to_string(),
            ));
        }
        if self.side_output.buffer_size == 0 {
            return Err(PimapError::Configuration(
                "side_output.buffer_size must be positive".to_string(),
            ));
        }

        for (stream, overrides) in &self.streams {
            if let Some(window) = &overrides.window {
                window.validate(stream)?;
            }
        }

        let mut group_ids = HashSet::new();
        for group in &self.groups {
            if group.id.trim().is_empty() {
                return Err(PimapError::Configuration("group id is empty".to_string()));
            }
            if !group_ids.insert(group.id.as_str()) {
                return Err(PimapError::Configuration(format!(
                    "duplicate group id: {}",
                    group.id
                )));
            }
            if group.members.is_empty() {
                return Err(PimapError::Configuration(format!(
                    "group {} has no members",
                    group.id
                )));
            }
            if self.streams.contains_key(&group.id) {
                return Err(PimapError::Configuration(format!(
                    "group id {} collides with a stream id",
                    group.id
                )));
            }
            if let Some(window) = &group.window {
                window.validate(&group.id)?;
            }
        }

        let mut metric_ids = HashSet::new();
        for metric in &self.metrics {
            if !metric_ids.insert(metric.id.as_str()) {
                return Err(PimapError::Configuration(format!(
                    "duplicate metric id: {}",
                    metric.id
                )));
            }
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Resolved Settings
    // -------------------------------------------------------------------------

    pub fn group(&self, id: &str) -> Option<&GroupConfig> {
        self.groups.iter().find(|g| g.id == id)
    }

    /// Allowed lateness for a stream, in timestamp units.
    pub fn lateness_for(&self, stream: &str) -> i64 {
        let ms = self
            .streams
            .get(stream)
            .and_then(|o| o.allowed_lateness_ms)
            .unwrap_or(self.watermark.allowed_lateness_ms);
        millis_to_micros(ms)
    }

    /// Window definition for a stream or group scope.
    pub fn window_for(&self, scope: &str) -> &WindowConfig {
        if let Some(group) = self.group(scope) {
            return group.window.as_ref().unwrap_or(&self.window);
        }
        self.streams
            .get(scope)
            .and_then(|o| o.window.as_ref())
            .unwrap_or(&self.window)
    }

    /// Late-data policy for a stream or group scope.
    pub fn policy_for(&self, scope: &str) -> LateDataPolicy {
        if let Some(group) = self.group(scope) {
            return group.late_data_policy.unwrap_or(self.late_data_policy);
        }
        self.streams
            .get(scope)
            .and_then(|o| o.late_data_policy)
            .unwrap_or(self.late_data_policy)
    }
}

// =============================================================================
// Tests
// =============================================================================
