//! PIMAP Streaming - Event-Time Windowing
//!
//! Tracks per-stream watermarks and groups stored samples into event-time
//! windows. Windows close when the watermark of their scope passes their end
//! and are handed to the metric engine as evaluation tasks. Samples that
//! arrive for an already closed window are reported as late data.
//!
//! Key Features:
//! - Lock-free monotonic watermarks with allowed lateness
//! - Fixed, sliding and session windows per stream or stream group
//! - Window lifecycle with at most one evaluation in flight
//! - Late-data policies: drop, recompute, side output
//! - Serializable window index for checkpoints
//!
//! @version 0.1.0
//! @author PIMAP Development Team

pub mod channel;
pub mod event;
pub mod watermark;
pub mod window;

pub use channel::{SideOutput, SideOutputReceiver, SideOutputStats};
pub use event::{LateDataEvent, LateDisposition};
pub use watermark::{WatermarkAdvance, WatermarkTracker};
pub use window::{
    window_bounds, Assignment, ClosedWindow, Completion, WindowCounts, WindowIndexSnapshot,
    WindowKey, WindowManager, WindowPhase,
};
