//! PIMAP Metric Engine
//!
//! Evaluates every applicable registered metric over a closed window and
//! writes the result, or an explicit failure marker, to the metric sink.
//!
//! Key Features:
//! - Window samples loaded once per evaluation and shared across metrics
//! - Content fingerprint (`inputs_version`) of window definition and samples
//! - Unchanged recomputations skip the write
//! - Per-metric isolation: errors and panics stay with their metric
//! - Transient store failures retried with bounded backoff
//! - Every store call bounded by the evaluation timeout
//!
//! @version 0.1.0
//! @author PIMAP Development Team

use crate::registry::{MetricDescriptor, MetricRegistry};
use crate::retry::{retry_with_backoff, RetryPolicy};
use parking_lot::RwLock;
use pimap_common::config::EngineConfig;
use pimap_common::utils::Fingerprinter;
use pimap_common::{
    InputsVersion, Metric, MetricFailure, MetricId, MetricKey, MetricRecord, MetricValue,
    PimapError, Result, Sample, WindowBounds,
};
use pimap_storage::{MetricSink, SampleSource, UpsertOutcome};
use pimap_streaming::ClosedWindow;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Reports
// =============================================================================

/// What happened to one metric of an evaluated window.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricOutcome {
    Written(UpsertOutcome),
    /// Stored metric already reflects these inputs.
    Unchanged,
    /// The computation produced no value for this window.
    NoValue,
    Failed(MetricFailure),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct MetricReport {
    pub metric_id: MetricId,
    pub outcome: MetricOutcome,
    pub attempts: u32,
}

/// Result of evaluating one closed window.
#[derive(Debug, Clone)]
pub struct WindowReport {
    pub window: ClosedWindow,
    pub sample_count: usize,
    pub inputs_version: Option<InputsVersion>,
    pub metrics: Vec<MetricReport>,
    /// Evaluation stopped early; the window must be released, not retired.
    pub cancelled: bool,
}

impl WindowReport {
    pub fn failures(&self) -> impl Iterator<Item = &MetricFailure> {
        self.metrics.iter().filter_map(|m| match &m.outcome {
            MetricOutcome::Failed(failure) => Some(failure),
            _ => None,
        })
    }

    pub fn outcome(&self, metric_id: &str) -> Option<&MetricOutcome> {
        self.metrics
            .iter()
            .find(|m| m.metric_id.as_str() == metric_id)
            .map(|m| &m.outcome)
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStats {
    pub windows_evaluated: u64,
    pub windows_cancelled: u64,
    pub metrics_written: u64,
    pub metrics_unchanged: u64,
    pub metrics_empty: u64,
    pub metrics_failed: u64,
    pub retries: u64,
}

// =============================================================================
// Metric Engine
// =============================================================================

/// Samples of a window in evaluation order with their fingerprint.
struct WindowInputs {
    samples: Vec<Sample>,
    version: InputsVersion,
}

pub struct MetricEngine {
    registry: Arc<MetricRegistry>,
    samples: Arc<dyn SampleSource>,
    metrics: Arc<dyn MetricSink>,
    retry: RetryPolicy,
    timeout: Duration,
    stats: RwLock<EngineStats>,
}

impl MetricEngine {
    pub fn new(
        registry: Arc<MetricRegistry>,
        samples: Arc<dyn SampleSource>,
        metrics: Arc<dyn MetricSink>,
    ) -> Self {
        Self::with_config(registry, samples, metrics, &EngineConfig::default())
    }

    pub fn with_config(
        registry: Arc<MetricRegistry>,
        samples: Arc<dyn SampleSource>,
        metrics: Arc<dyn MetricSink>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            registry,
            samples,
            metrics,
            retry: RetryPolicy::from_config(config),
            timeout: config.evaluation_timeout(),
            stats: RwLock::new(EngineStats::default()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<MetricRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.read().clone()
    }

    // -------------------------------------------------------------------------
    // Evaluation
    // -------------------------------------------------------------------------

    /// Evaluate all metrics applicable to the window kind, in metric id order.
    pub async fn evaluate(&self, window: &ClosedWindow, cancel: &CancellationToken) -> WindowReport {
        let descriptors = self.registry.applicable(window.kind);
        let inputs: OnceCell<WindowInputs> = OnceCell::new();
        let mut reports = Vec::with_capacity(descriptors.len());
        let mut cancelled = false;

        for descriptor in &descriptors {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let inputs_ref = &inputs;
            let attempted = retry_with_backoff(&self.retry, cancel, move |_| {
                self.evaluate_metric(descriptor, window, inputs_ref)
            })
            .await;

            if attempted.attempts > 1 {
                self.stats.write().retries += u64::from(attempted.attempts - 1);
            }

            let outcome = match attempted.result {
                Ok(outcome) => outcome,
                Err(PimapError::Cancelled) => {
                    cancelled = true;
                    reports.push(MetricReport {
                        metric_id: descriptor.id.clone(),
                        outcome: MetricOutcome::Cancelled,
                        attempts: attempted.attempts,
                    });
                    break;
                }
                Err(err) => {
                    let version = inputs.get().map(|i| i.version);
                    let failure = self
                        .record_failure(descriptor, window, err, attempted.attempts, version)
                        .await;
                    MetricOutcome::Failed(failure)
                }
            };

            self.count(&outcome);
            reports.push(MetricReport {
                metric_id: descriptor.id.clone(),
                outcome,
                attempts: attempted.attempts,
            });
        }

        {
            let mut stats = self.stats.write();
            if cancelled {
                stats.windows_cancelled += 1;
            } else {
                stats.windows_evaluated += 1;
            }
        }

        let loaded = inputs.get();
        tracing::debug!(
            window = %window.key,
            metrics = reports.len(),
            samples = loaded.map_or(0, |i| i.samples.len()),
            cancelled,
            "window evaluated"
        );

        WindowReport {
            window: window.clone(),
            sample_count: loaded.map_or(0, |i| i.samples.len()),
            inputs_version: loaded.map(|i| i.version),
            metrics: reports,
            cancelled,
        }
    }

    /// One attempt at one metric: load (cached), compute, compare, upsert.
    async fn evaluate_metric(
        &self,
        descriptor: &MetricDescriptor,
        window: &ClosedWindow,
        inputs: &OnceCell<WindowInputs>,
    ) -> Result<MetricOutcome> {
        let inputs = inputs.get_or_try_init(|| self.load(window)).await?;

        // An earlier record for the window, if any, is kept as is.
        let Some(value) = run_compute(descriptor, &window.bounds, &inputs.samples)? else {
            return Ok(MetricOutcome::NoValue);
        };

        let key = MetricKey::new(descriptor.id.clone(), window.key.scope.clone(), window.bounds);
        let existing = self.bounded("metric read", self.metrics.get(&key)).await?;
        if let Some(MetricRecord::Computed(current)) = &existing {
            if current.inputs_version == inputs.version && current.value == value {
                return Ok(MetricOutcome::Unchanged);
            }
        }

        let metric = Metric {
            metric_id: key.metric_id,
            scope: key.scope,
            window_start: key.window_start,
            window_end: key.window_end,
            value,
            inputs_version: inputs.version,
            sample_count: inputs.samples.len(),
        };
        let outcome = self
            .bounded("metric write", self.metrics.upsert(MetricRecord::Computed(metric)))
            .await?;
        Ok(MetricOutcome::Written(outcome))
    }

    /// Read every source stream of the window and merge by
    /// `(timestamp, stream, sequence)`.
    async fn load(&self, window: &ClosedWindow) -> Result<WindowInputs> {
        if !window.bounds.is_valid() {
            return Err(PimapError::MalformedWindow(format!(
                "{} has bounds {}",
                window.key, window.bounds
            )));
        }
        if window.sources.is_empty() {
            return Err(PimapError::MalformedWindow(format!(
                "{} has no source streams",
                window.key
            )));
        }

        let mut samples = Vec::new();
        for stream in &window.sources {
            let part = self
                .bounded(
                    "sample read",
                    self.samples
                        .read_range(stream, window.bounds.start, window.bounds.end),
                )
                .await?;
            samples.extend(part);
        }
        samples.sort_by(|a, b| {
            (a.timestamp, &a.stream_id, a.sequence).cmp(&(b.timestamp, &b.stream_id, b.sequence))
        });

        let version = fingerprint(window, &samples);
        Ok(WindowInputs { samples, version })
    }

    async fn bounded<T>(&self, operation: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(PimapError::Timeout(format!(
                "{} exceeded {:?}",
                operation, self.timeout
            ))),
        }
    }

    async fn record_failure(
        &self,
        descriptor: &MetricDescriptor,
        window: &ClosedWindow,
        err: PimapError,
        attempts: u32,
        inputs_version: Option<InputsVersion>,
    ) -> MetricFailure {
        tracing::error!(
            metric = %descriptor.id,
            window = %window.key,
            bounds = %window.bounds,
            attempts,
            error = %err,
            "metric evaluation failed"
        );

        let failure = MetricFailure {
            metric_id: descriptor.id.clone(),
            scope: window.key.scope.clone(),
            window_start: window.bounds.start,
            window_end: window.bounds.end,
            class: err.class(),
            error: err.to_string(),
            attempts,
            inputs_version,
        };

        let marker = MetricRecord::Failed(failure.clone());
        if let Err(write_err) = self.bounded("failure write", self.metrics.upsert(marker)).await {
            tracing::error!(
                metric = %descriptor.id,
                window = %window.key,
                error = %write_err,
                "could not record metric failure"
            );
        }
        failure
    }

    fn count(&self, outcome: &MetricOutcome) {
        let mut stats = self.stats.write();
        match outcome {
            MetricOutcome::Written(UpsertOutcome::Unchanged) | MetricOutcome::Unchanged => {
                stats.metrics_unchanged += 1
            }
            MetricOutcome::Written(_) => stats.metrics_written += 1,
            MetricOutcome::NoValue => stats.metrics_empty += 1,
            MetricOutcome::Failed(_) => stats.metrics_failed += 1,
            MetricOutcome::Cancelled => {}
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Fingerprint of the window definition and its ordered samples.
pub fn fingerprint(window: &ClosedWindow, samples: &[Sample]) -> InputsVersion {
    let mut hasher = Fingerprinter::new();
    hasher
        .write_str(window.key.scope.as_str())
        .write_str(&window.kind.to_string())
        .write_i64(window.bounds.start.as_micros())
        .write_i64(window.bounds.end.as_micros());
    for sample in samples {
        hasher
            .write_str(sample.stream_id.as_str())
            .write_i64(sample.timestamp.as_micros())
            .write_u64(sample.sequence)
            .write_u64(sample.value.len() as u64);
        for value in sample.value.as_slice() {
            hasher.write_f64(*value);
        }
    }
    InputsVersion(hasher.finish())
}

fn run_compute(
    descriptor: &MetricDescriptor,
    bounds: &WindowBounds,
    samples: &[Sample],
) -> Result<Option<MetricValue>> {
    let value = match catch_unwind(AssertUnwindSafe(|| (descriptor.compute)(bounds, samples))) {
        Ok(result) => result?,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            return Err(PimapError::Domain(format!(
                "{} panicked: {}",
                descriptor.id, message
            )));
        }
    };

    if let Some(value) = &value {
        let finite = match value {
            MetricValue::Scalar(v) => v.is_finite(),
            MetricValue::Vector(values) => values.iter().all(|v| v.is_finite()),
            MetricValue::Fields(fields) => fields.values().all(|v| v.is_finite()),
        };
        if !finite {
            return Err(PimapError::Domain(format!(
                "{} produced a non-finite value",
                descriptor.id
            )));
        }
    }
    Ok(value)
}

// =============================================================================
// Tests
// =============================================================================
