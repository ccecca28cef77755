//! PIMAP Metric Registry
//!
//! Named metric computations and the window kinds they apply to. A
//! computation receives the window bounds and the window's samples in
//! `(timestamp, stream, sequence)` order and must be pure: the same inputs
//! always produce the same value.
//!
//! @version 0.1.0
//! @author PIMAP Development Team

use parking_lot::RwLock;
use pimap_common::{MetricId, MetricValue, PimapError, Result, Sample, WindowBounds, WindowKind};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

// =============================================================================
// Compute Error
// =============================================================================

/// Failure raised by a metric computation. Always permanent.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ComputeError {
    #[error("{0}")]
    Domain(String),

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<ComputeError> for PimapError {
    fn from(err: ComputeError) -> Self {
        PimapError::Domain(err.to_string())
    }
}

/// A metric computation. `Ok(None)` means the window has no value for this
/// metric and nothing is written. A record stored by an earlier evaluation
/// of the same window is left in place, with the inputs version it was
/// computed from; the metric store has no delete.
pub type ComputeFn = Arc<
    dyn Fn(&WindowBounds, &[Sample]) -> std::result::Result<Option<MetricValue>, ComputeError>
        + Send
        + Sync,
>;

// =============================================================================
// Metric Descriptor
// =============================================================================

#[derive(Clone)]
pub struct MetricDescriptor {
    pub id: MetricId,
    /// Window kind the metric applies to; `None` applies to every kind.
    pub kind: Option<WindowKind>,
    pub compute: ComputeFn,
}

impl MetricDescriptor {
    pub fn applies_to(&self, kind: WindowKind) -> bool {
        self.kind.map_or(true, |k| k == kind)
    }
}

impl std::fmt::Debug for MetricDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricDescriptor")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Metric Registry
// =============================================================================

/// Thread-safe registry of metric computations, ordered by metric id.
pub struct MetricRegistry {
    metrics: RwLock<BTreeMap<MetricId, MetricDescriptor>>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self {
            metrics: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a computation for windows of `kind`.
    pub fn register<F>(&self, id: impl Into<MetricId>, kind: WindowKind, compute: F) -> Result<()>
    where
        F: Fn(&WindowBounds, &[Sample]) -> std::result::Result<Option<MetricValue>, ComputeError>
            + Send
            + Sync
            + 'static,
    {
        self.insert(id.into(), Some(kind), Arc::new(compute))
    }

    /// Register a computation for every window kind.
    pub fn register_any<F>(&self, id: impl Into<MetricId>, compute: F) -> Result<()>
    where
        F: Fn(&WindowBounds, &[Sample]) -> std::result::Result<Option<MetricValue>, ComputeError>
            + Send
            + Sync
            + 'static,
    {
        self.insert(id.into(), None, Arc::new(compute))
    }

    /// Register a prepared computation.
    pub fn register_fn(
        &self,
        id: impl Into<MetricId>,
        kind: Option<WindowKind>,
        compute: ComputeFn,
    ) -> Result<()> {
        self.insert(id.into(), kind, compute)
    }

    fn insert(&self, id: MetricId, kind: Option<WindowKind>, compute: ComputeFn) -> Result<()> {
        let mut metrics = self.metrics.write();
        if metrics.contains_key(&id) {
            return Err(PimapError::MetricAlreadyRegistered(id.to_string()));
        }
        tracing::debug!(metric = %id, ?kind, "metric registered");
        metrics.insert(id.clone(), MetricDescriptor { id, kind, compute });
        Ok(())
    }

    /// Swap in a corrected computation. Returns the previous descriptor.
    /// Windows evaluated afterwards use the new formula; stored metrics are
    /// only rewritten when their window is evaluated again.
    pub fn replace(
        &self,
        id: impl Into<MetricId>,
        kind: Option<WindowKind>,
        compute: ComputeFn,
    ) -> Option<MetricDescriptor> {
        let id = id.into();
        tracing::info!(metric = %id, "metric computation replaced");
        self.metrics
            .write()
            .insert(id.clone(), MetricDescriptor { id, kind, compute })
    }

    pub fn unregister(&self, id: &MetricId) -> Option<MetricDescriptor> {
        self.metrics.write().remove(id)
    }

    /// Descriptors applicable to `kind`, in metric id order.
    pub fn applicable(&self, kind: WindowKind) -> Vec<MetricDescriptor> {
        self.metrics
            .read()
            .values()
            .filter(|d| d.applies_to(kind))
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &MetricId) -> Option<MetricDescriptor> {
        self.metrics.read().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<MetricId> {
        self.metrics.read().keys().cloned().collect()
    }

    pub fn contains(&self, id: &MetricId) -> bool {
        self.metrics.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.metrics.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.read().is_empty()
    }
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
