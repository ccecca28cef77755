//! PIMAP Built-in Metrics
//!
//! Aggregate functions over one sample field (or the vector magnitude) and
//! the wiring that registers configured `[[metrics]]` entries.
//!
//! @version 0.1.0
//! @author PIMAP Development Team

use crate::mobility::{objective_mobility, MobilityParams};
use crate::registry::{ComputeError, ComputeFn, MetricRegistry};
use pimap_common::config::MetricDefinition;
use pimap_common::{MetricValue, PimapError, Result, Sample, WindowBounds};
use std::str::FromStr;
use std::sync::Arc;

pub const OBJECTIVE_MOBILITY: &str = "objective_mobility";

// =============================================================================
// Aggregate Function
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    Sum,
    Mean,
    Min,
    Max,
    Median,
    StdDev,
    Variance,
    Rms,
    First,
    Last,
    Range,
}

impl AggregateFunction {
    /// Apply the aggregation to values in window order.
    pub fn apply(&self, values: &[f64]) -> std::result::Result<f64, ComputeError> {
        match self {
            Self::Count => return Ok(values.len() as f64),
            Self::Sum => return Ok(values.iter().sum()),
            _ => {}
        }
        if values.is_empty() {
            return Err(ComputeError::InsufficientData(format!(
                "{} of an empty window",
                self
            )));
        }

        let n = values.len() as f64;
        Ok(match self {
            Self::Mean => values.iter().sum::<f64>() / n,
            Self::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Self::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Self::First => values[0],
            Self::Last => values[values.len() - 1],
            Self::Range => Self::Max.apply(values)? - Self::Min.apply(values)?,
            Self::Rms => (values.iter().map(|v| v * v).sum::<f64>() / n).sqrt(),
            Self::Median => {
                let mut sorted = values.to_vec();
                sorted.sort_by(f64::total_cmp);
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    (sorted[mid - 1] + sorted[mid]) / 2.0
                } else {
                    sorted[mid]
                }
            }
            Self::Variance => {
                let mean = Self::Mean.apply(values)?;
                values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n
            }
            Self::StdDev => Self::Variance.apply(values)?.sqrt(),
            Self::Count => n,
            Self::Sum => values.iter().sum(),
        })
    }
}

impl std::fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Mean => "mean",
            Self::Min => "min",
            Self::Max => "max",
            Self::Median => "median",
            Self::StdDev => "stddev",
            Self::Variance => "variance",
            Self::Rms => "rms",
            Self::First => "first",
            Self::Last => "last",
            Self::Range => "range",
        };
        f.write_str(name)
    }
}

impl FromStr for AggregateFunction {
    type Err = PimapError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "count" => Self::Count,
            "sum" => Self::Sum,
            "mean" | "avg" => Self::Mean,
            "min" => Self::Min,
            "max" => Self::Max,
            "median" => Self::Median,
            "stddev" => Self::StdDev,
            "variance" => Self::Variance,
            "rms" => Self::Rms,
            "first" => Self::First,
            "last" => Self::Last,
            "range" => Self::Range,
            other => {
                return Err(PimapError::Configuration(format!(
                    "unknown metric function: {}",
                    other
                )))
            }
        })
    }
}

// =============================================================================
// Field Selection
// =============================================================================

/// Which part of a sample value an aggregate reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSelector {
    Field(usize),
    Magnitude,
}

impl FieldSelector {
    pub fn select(&self, sample: &Sample) -> std::result::Result<f64, ComputeError> {
        match self {
            Self::Field(index) => sample.value.get(*index).ok_or_else(|| {
                ComputeError::InvalidInput(format!(
                    "{} has no field {}",
                    sample.key(),
                    index
                ))
            }),
            Self::Magnitude => Ok(sample.value.magnitude()),
        }
    }
}

impl From<Option<usize>> for FieldSelector {
    fn from(field: Option<usize>) -> Self {
        field.map_or(Self::Magnitude, Self::Field)
    }
}

/// Build an aggregate computation producing a scalar metric.
pub fn aggregate(function: AggregateFunction, selector: FieldSelector) -> ComputeFn {
    Arc::new(move |_bounds: &WindowBounds, samples: &[Sample]| {
        let values = samples
            .iter()
            .map(|s| selector.select(s))
            .collect::<std::result::Result<Vec<f64>, _>>()?;
        function.apply(&values).map(|v| Some(MetricValue::Scalar(v)))
    })
}

// =============================================================================
// Configuration
// =============================================================================

/// Register every configured metric definition.
pub fn register_from_config(registry: &MetricRegistry, definitions: &[MetricDefinition]) -> Result<()> {
    for definition in definitions {
        let compute = build(definition)?;
        registry.register_fn(definition.id.as_str(), definition.kind, compute)?;
        tracing::info!(
            metric = %definition.id,
            function = %definition.function,
            "configured metric registered"
        );
    }
    Ok(())
}

fn build(definition: &MetricDefinition) -> Result<ComputeFn> {
    if definition.function == OBJECTIVE_MOBILITY {
        let defaults = MobilityParams::default();
        return Ok(objective_mobility(MobilityParams {
            max_pressure: definition.max_pressure.unwrap_or(defaults.max_pressure),
            movement_threshold: definition
                .movement_threshold
                .unwrap_or(defaults.movement_threshold),
        }));
    }

    let function: AggregateFunction = definition.function.parse()?;
    Ok(aggregate(function, definition.field.into()))
}

// =============================================================================
// Tests
// =============================================================================
