//! PIMAP Pipeline - Store and Analyze Orchestration
//!
//! Ties the sample store, watermark tracker, window manager and metric
//! engine into a single ingest pipeline. Producers submit samples; a pool of
//! workers evaluates windows as their watermark closes them; readers query
//! samples and metrics for visualization.
//!
//! Key Features:
//! - Idempotent, at-least-once sample submission
//! - Bounded worker pool with cooperative cancellation
//! - Checkpointed window index and watermarks across restarts
//! - PIMAP text datum codec for Sense and Visualize interop
//! - Throughput and lifecycle counters
//!
//! @version 0.1.0
//! @author PIMAP Development Team

pub mod checkpoint;
pub mod datum;
pub mod pipeline;
pub mod stats;

pub use checkpoint::Checkpoint;
pub use datum::{Datum, DatumKind};
pub use pipeline::Pipeline;
pub use stats::PipelineStats;
