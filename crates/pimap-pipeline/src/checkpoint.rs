//! PIMAP Checkpoint
//!
//! Durable copy of the streaming state that is not derivable from the
//! stores alone: per-stream watermarks, retired streams and the live window
//! index. Written atomically on shutdown, restored and consumed on open.
//! The sample high-water mark records how far the state reflects the
//! sample log; anything written after it is replayed on open.
//!
//! @version 0.1.0
//! @author PIMAP Development Team

use chrono::{DateTime, Utc};
use pimap_common::{Lsn, PimapError, Result, StreamId, Timestamp};
use pimap_storage::SampleStore;
use pimap_streaming::{WatermarkTracker, WindowIndexSnapshot, WindowManager};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const CHECKPOINT_FORMAT: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format: u32,
    pub created_at: DateTime<Utc>,
    pub watermarks: BTreeMap<StreamId, Timestamp>,
    #[serde(default)]
    pub retired: Vec<StreamId>,
    /// Last sample write reflected in `watermarks` and `windows`.
    #[serde(default)]
    pub sample_lsn: Lsn,
    pub windows: WindowIndexSnapshot,
}

impl Checkpoint {
    /// Snapshot the streaming state. Ingest must be quiescent so the
    /// sample high-water mark matches the captured windows.
    pub fn capture(
        samples: &SampleStore,
        tracker: &WatermarkTracker,
        windows: &WindowManager,
    ) -> Self {
        let sample_lsn = samples.high_water();
        let watermarks = tracker.snapshot();
        let retired = watermarks
            .keys()
            .filter(|stream| tracker.is_retired(stream))
            .cloned()
            .collect();
        Self {
            format: CHECKPOINT_FORMAT,
            created_at: Utc::now(),
            watermarks,
            retired,
            sample_lsn,
            windows: windows.snapshot(),
        }
    }

    /// Load watermarks and windows. Returns the number of windows restored.
    pub fn apply(self, tracker: &WatermarkTracker, windows: &WindowManager) -> usize {
        for (stream, watermark) in &self.watermarks {
            tracker.restore(stream, *watermark);
        }
        for stream in &self.retired {
            tracker.retire_stream(stream);
        }
        windows.restore(self.windows)
    }

    pub fn window_count(&self) -> usize {
        self.windows.scopes.iter().map(|s| s.windows.len()).sum()
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Write to `path` through a temporary file and rename.
    pub async fn write(&self, path: &Path, sync: bool) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| PimapError::Serialization(e.to_string()))?;
        let temp_path = path.with_extension("json.tmp");

        tokio::fs::write(&temp_path, &data).await?;
        if sync {
            tokio::fs::File::open(&temp_path).await?.sync_all().await?;
        }
        tokio::fs::rename(&temp_path, path).await?;

        #[cfg(unix)]
        if sync {
            if let Some(dir) = path.parent() {
                tokio::fs::File::open(dir).await?.sync_all().await?;
            }
        }

        tracing::info!(
            path = %path.display(),
            streams = self.watermarks.len(),
            windows = self.window_count(),
            sample_lsn = self.sample_lsn.0,
            "checkpoint written"
        );
        Ok(())
    }

    /// Read the checkpoint at `path`, if one exists.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checkpoint: Self = serde_json::from_slice(&data)
            .map_err(|e| PimapError::Corruption(format!("{}: {}", path.display(), e)))?;
        if checkpoint.format != CHECKPOINT_FORMAT {
            return Err(PimapError::Corruption(format!(
                "{}: unsupported checkpoint format {}",
                path.display(),
                checkpoint.format
            )));
        }
        Ok(Some(checkpoint))
    }

    /// Remove a consumed checkpoint so a crash falls back to log replay.
    pub async fn remove(path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
