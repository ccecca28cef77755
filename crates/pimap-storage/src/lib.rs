//! PIMAP Storage - Sample and Metric Stores
//!
//! Durable storage for raw sensor samples and derived metrics. Both stores
//! keep an ordered in-memory index and, when a data directory is configured,
//! append every change to a segmented, checksummed record log that is
//! replayed on open.
//!
//! Key Features:
//! - Append-only sample store with idempotent writes
//! - Per-stream locking so streams ingest in parallel
//! - Metric store with upsert semantics keyed by metric identity
//! - Async read/write traits consumed by the metric engine
//!
//! @version 0.1.0
//! @author PIMAP Development Team

pub mod backend;
pub mod log;
pub mod metric_store;
pub mod sample_store;

pub use backend::{MetricSink, SampleSource};
pub use log::{LogRecord, LogRecordType, RecordLog, Recovery};
pub use metric_store::{MetricStore, MetricStoreStats, UpsertOutcome};
pub use sample_store::{SampleStore, SampleStoreStats, WriteOutcome};
