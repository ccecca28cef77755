//! PIMAP Streaming Events
//!
//! Late-data signals raised when a sample targets a window that has already
//! closed. These are notifications, not errors: the sample itself is stored.
//!
//! @version 0.1.0
//! @author PIMAP Development Team

use pimap_common::{LateDataPolicy, SampleKey, ScopeId, Timestamp, WindowBounds};
use serde::{Deserialize, Serialize};

// =============================================================================
// Late Disposition
// =============================================================================

/// What the window manager did with a late sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LateDisposition {
    /// Reported only; the window keeps its result.
    Dropped,
    /// The window was reopened for re-evaluation.
    Recomputing,
    /// Routed to the side-output channel.
    SideOutput,
}

// =============================================================================
// Late Data Event
// =============================================================================

/// A sample arrived after the watermark passed the end of its window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LateDataEvent {
    pub sample: SampleKey,
    pub scope: ScopeId,
    pub window: WindowBounds,
    /// Watermark of the scope when the sample was assigned.
    pub watermark: Timestamp,
    pub policy: LateDataPolicy,
    pub disposition: LateDisposition,
}

impl LateDataEvent {
    /// How far behind the watermark the sample was, in timestamp units.
    pub fn lateness(&self) -> i64 {
        self.watermark.0.saturating_sub(self.sample.timestamp.0).max(0)
    }
}
