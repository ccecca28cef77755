//! PIMAP Analyze - Windowed Metric Engine
//!
//! Evaluates registered metric computations over closed event-time windows
//! and writes the results to the metric store. Computations are pure
//! functions of the window bounds and its ordered samples, so re-evaluating
//! a window over the same inputs always yields the same metric.
//!
//! Key Features:
//! - Registry of named computations scoped to window kinds
//! - Per-metric isolation of errors and panics
//! - Bounded exponential backoff for transient store failures
//! - Content-versioned upserts that skip unchanged recomputations
//! - Built-in aggregates and objective mobility analysis
//!
//! @version 0.1.0
//! @author PIMAP Development Team

pub mod builtin;
pub mod engine;
pub mod mobility;
pub mod registry;
pub mod retry;

pub use builtin::{aggregate, register_from_config, AggregateFunction, FieldSelector};
pub use engine::{EngineStats, MetricEngine, MetricOutcome, MetricReport, WindowReport};
pub use mobility::{objective_mobility, MobilityParams};
pub use registry::{ComputeError, ComputeFn, MetricDescriptor, MetricRegistry};
pub use retry::{retry_with_backoff, Attempted, RetryPolicy};
