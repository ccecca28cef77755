//! PIMAP Common - Shared Types and Utilities
//!
//! Foundational types, error handling, and configuration used across every
//! PIMAP engine component. Provides the data model that flows between the
//! sample store, the streaming layer, and the metric engine.
//!
//! Key Features:
//! - Sample, Metric and Window identity types with total ordering
//! - Unified error type with transient/permanent classification
//! - TOML-backed pipeline configuration with per-stream overrides
//! - Content fingerprinting and checksum helpers
//!
//! @version 0.1.0
//! @author PIMAP Development Team

pub mod config;
pub mod error;
pub mod types;
pub mod utils;

pub use config::{LateDataPolicy, PipelineConfig};
pub use error::{FailureClass, PimapError, Result};
pub use types::*;
