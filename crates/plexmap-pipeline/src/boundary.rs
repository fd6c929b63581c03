//! Density boundaries: high-percentile iso-contours of a density grid,
//! simplified and filtered by vertex count.

use crate::contour::{ContourTracer, ContourTracerKind};
use crate::simplify::simplify;
use crate::types::{AnalysisError, BoundaryPath, DensityGrid, validate_percentile};

/// Percentile of `values` with linear interpolation between the closest
/// ranks (`rank = p / 100 * (n - 1)`).
///
/// Returns `None` for an empty slice.
#[must_use]
pub fn percentile(values: &[f64], percentile: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(f64::total_cmp);

    #[allow(clippy::cast_precision_loss)]
    let rank = (percentile / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let lo = rank.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    #[allow(clippy::cast_precision_loss)]
    let frac = rank - lo as f64;
    Some((sorted[hi] - sorted[lo]).mul_add(frac, sorted[lo]))
}

/// Contour level for a density grid: the percentile of its strictly
/// positive samples, or `None` when there are none.
#[must_use]
pub fn boundary_level(density: &DensityGrid, pct: f64) -> Option<f64> {
    let positive: Vec<f64> = density
        .as_raw()
        .iter()
        .filter(|v| **v > 0.0)
        .map(|v| f64::from(*v))
        .collect();
    percentile(&positive, pct)
}

/// Extract boundary paths with the default contour tracer.
///
/// # Errors
///
/// See [`extract_boundary_with`].
pub fn extract_boundary(
    density: &DensityGrid,
    pct: f64,
    simplify_tolerance: f64,
    min_vertices: usize,
) -> Result<Vec<BoundaryPath>, AnalysisError> {
    extract_boundary_with(
        &ContourTracerKind::default(),
        density,
        pct,
        simplify_tolerance,
        min_vertices,
    )
}

/// Trace the iso-contours at the `pct` percentile of the positive density
/// samples, drop those with fewer than `min_vertices` vertices, simplify
/// the rest and drop again.
///
/// A grid without positive samples yields no paths.
///
/// # Errors
///
/// Returns [`AnalysisError::InvalidParameter`] for a percentile outside
/// `[0, 100]` or a negative tolerance.
pub fn extract_boundary_with(
    tracer: &impl ContourTracer,
    density: &DensityGrid,
    pct: f64,
    simplify_tolerance: f64,
    min_vertices: usize,
) -> Result<Vec<BoundaryPath>, AnalysisError> {
    validate_percentile(pct)?;
    if simplify_tolerance.is_nan() || simplify_tolerance < 0.0 {
        return Err(AnalysisError::InvalidParameter(format!(
            "simplify tolerance must be non-negative, got {simplify_tolerance}"
        )));
    }
    let Some(level) = boundary_level(density, pct) else {
        return Ok(Vec::new());
    };

    let paths = tracer
        .trace(density, level)
        .into_iter()
        .filter(|c| c.len() >= min_vertices)
        .map(|c| simplify(&c, simplify_tolerance))
        .filter(|c| c.len() >= min_vertices)
        .collect();
    Ok(paths)
}
