//! PIMAP Objective Mobility
//!
//! Movement analysis for pressure bandage streams. Each sample is a 4x4 grid
//! of pressure readings in row-major order (`value[y * 4 + x]`). The grid is
//! normalized by the maximum pressure and reduced to three centroids over
//! fixed cell sets:
//!
//! ```text
//!   c0  c0  c0  c0
//!   c1  c0  c0  c2
//!   c1  c1  c2  c2
//!   c1  c1  c2  c2
//! ```
//!
//! Each centroid is `(mean x, mean y, mean pressure)` with cell coordinates
//! scaled to `[0, 1]`. The plane through the three centroids gives the tilt
//! of the body on the bandage as an x and a y angle in degrees. Large
//! sample-to-sample changes of those angles are counted as movements.
//!
//! Reference: S. Mansfield et al., "Objective Pressure Injury Risk Assessment
//! Using A Wearable Pressure Sensor", IEEE BIBM 2019.
//!
//! @version 0.1.0
//! @author PIMAP Development Team

use crate::registry::{ComputeError, ComputeFn};
use pimap_common::{MetricValue, Sample, WindowBounds};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const GRID_SIDE: usize = 4;
pub const GRID_CELLS: usize = GRID_SIDE * GRID_SIDE;

/// Cell coordinates (x, y) of each centroid.
const CENTROID_CELLS: [&[(usize, usize)]; 3] = [
    &[(0, 0), (1, 0), (2, 0), (3, 0), (2, 1), (3, 2)],
    &[(0, 1), (0, 2), (1, 2), (0, 3), (1, 3)],
    &[(3, 1), (2, 2), (3, 2), (2, 3), (3, 3), (2, 1)],
];

// =============================================================================
// Parameters
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MobilityParams {
    /// Pressure value mapped to 1.0.
    pub max_pressure: f64,
    /// Angle change in degrees per sample above which a movement is counted.
    pub movement_threshold: f64,
}

impl Default for MobilityParams {
    fn default() -> Self {
        Self {
            max_pressure: 100.0,
            movement_threshold: 2.0,
        }
    }
}

// =============================================================================
// Analysis
// =============================================================================

/// Build the `objective_mobility` computation.
///
/// Output fields: `x_angle` and `y_angle` (window means, degrees),
/// `max_xy_gradient` and `movements_per_min`.
pub fn objective_mobility(params: MobilityParams) -> ComputeFn {
    Arc::new(move |_bounds: &WindowBounds, samples: &[Sample]| {
        analyze(&params, samples).map(Some)
    })
}

fn analyze(params: &MobilityParams, samples: &[Sample]) -> Result<MetricValue, ComputeError> {
    if !(params.max_pressure.is_finite() && params.max_pressure > 0.0) {
        return Err(ComputeError::InvalidInput(format!(
            "max_pressure must be positive, got {}",
            params.max_pressure
        )));
    }
    if samples.len() < 2 {
        return Err(ComputeError::InsufficientData(format!(
            "mobility needs at least 2 samples, got {}",
            samples.len()
        )));
    }

    let mut x_angles = Vec::with_capacity(samples.len());
    let mut y_angles = Vec::with_capacity(samples.len());
    for sample in samples {
        let (x, y) = plane_angles(sample.value.as_slice(), params.max_pressure)?;
        x_angles.push(x);
        y_angles.push(y);
    }

    let first = samples[0].timestamp;
    let last = samples[samples.len() - 1].timestamp;
    let elapsed_secs = (last.as_micros() - first.as_micros()) as f64 / 1_000_000.0;
    if elapsed_secs <= 0.0 {
        return Err(ComputeError::Domain(
            "mobility window has zero elapsed time".to_string(),
        ));
    }

    let xy_gradient: Vec<f64> = gradient(&x_angles)
        .into_iter()
        .zip(gradient(&y_angles))
        .map(|(gx, gy)| gx.abs().max(gy.abs()))
        .collect();

    let movements = xy_gradient
        .iter()
        .filter(|g| **g > params.movement_threshold)
        .count();

    let mut fields = BTreeMap::new();
    fields.insert("x_angle".to_string(), mean(&x_angles));
    fields.insert("y_angle".to_string(), mean(&y_angles));
    fields.insert(
        "max_xy_gradient".to_string(),
        xy_gradient.iter().copied().fold(0.0, f64::max),
    );
    fields.insert(
        "movements_per_min".to_string(),
        60.0 * movements as f64 / elapsed_secs,
    );
    Ok(MetricValue::Fields(fields))
}

/// Tilt of the centroid plane of one pressure grid, as (x, y) degrees.
pub fn plane_angles(grid: &[f64], max_pressure: f64) -> Result<(f64, f64), ComputeError> {
    if grid.len() != GRID_CELLS {
        return Err(ComputeError::InvalidInput(format!(
            "pressure grid needs {} cells, got {}",
            GRID_CELLS,
            grid.len()
        )));
    }

    let [c0, c1, c2] = CENTROID_CELLS.map(|cells| centroid(grid, cells, max_pressure));
    let v0 = sub(c1, c0);
    let v1 = sub(c2, c0);
    let [a, b, c] = cross(v0, v1);
    if c == 0.0 {
        return Err(ComputeError::Domain("centroid plane is vertical".to_string()));
    }

    Ok(((-a / c).atan().to_degrees(), (-b / c).atan().to_degrees()))
}

fn centroid(grid: &[f64], cells: &[(usize, usize)], max_pressure: f64) -> [f64; 3] {
    let n = cells.len() as f64;
    let scale = (GRID_SIDE - 1) as f64;
    let (mut x, mut y, mut z) = (0.0, 0.0, 0.0);
    for &(cx, cy) in cells {
        x += cx as f64 / scale;
        y += cy as f64 / scale;
        z += grid[cy * GRID_SIDE + cx] / max_pressure;
    }
    [x / n, y / n, z / n]
}

fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn cross(u: [f64; 3], v: [f64; 3]) -> [f64; 3] {
    [
        u[1] * v[2] - u[2] * v[1],
        u[2] * v[0] - u[0] * v[2],
        u[0] * v[1] - u[1] * v[0],
    ]
}

/// Unit-spaced gradient: central differences inside, one-sided at the ends.
pub fn gradient(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    match n {
        0 => Vec::new(),
        1 => vec![0.0],
        _ => (0..n)
            .map(|i| {
                if i == 0 {
                    values[1] - values[0]
                } else if i == n - 1 {
                    values[n - 1] - values[n - 2]
                } else {
                    (values[i + 1] - values[i - 1]) / 2.0
                }
            })
            .collect(),
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

// =============================================================================
// Tests
// =============================================================================
