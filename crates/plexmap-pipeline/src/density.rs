//! Density maps of marker-positive cell populations.
//!
//! Positive cells' centroids become unit impulses on a zero grid, the grid
//! is Gaussian-smoothed, then scaled so the maximum is exactly 1.

use image::Luma;
use serde::{Deserialize, Serialize};

use crate::blur::gaussian_blur;
use crate::table::ObservationTable;
use crate::types::{AnalysisError, ColumnNames, DensityGrid, Dimensions, Point, validate_sigma};

/// Pixel coordinate of a centroid: rounded, then clipped to the image.
///
/// Returns `None` for non-finite coordinates or an empty image.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn centroid_pixel(point: Point, dimensions: Dimensions) -> Option<(u32, u32)> {
    if !(point.x.is_finite() && point.y.is_finite())
        || dimensions.width == 0
        || dimensions.height == 0
    {
        return None;
    }
    let col = point.x.round().clamp(0.0, f64::from(dimensions.width - 1)) as u32;
    let row = point.y.round().clamp(0.0, f64::from(dimensions.height - 1)) as u32;
    Some((col, row))
}

/// Unit impulses at every given centroid. Coincident centroids overwrite
/// rather than accumulate.
#[must_use]
pub fn impulse_grid(points: impl IntoIterator<Item = Point>, dimensions: Dimensions) -> DensityGrid {
    let mut grid = DensityGrid::new(dimensions.width, dimensions.height);
    for point in points {
        if let Some((col, row)) = centroid_pixel(point, dimensions) {
            grid.put_pixel(col, row, Luma([1.0]));
        }
    }
    grid
}

/// Scale a grid in place so its maximum becomes 1. All-zero grids are left
/// untouched.
pub fn normalize_to_unit_max(grid: &mut DensityGrid) {
    let max = grid.as_raw().iter().copied().fold(0.0_f32, f32::max);
    if max > 0.0 {
        for p in grid.pixels_mut() {
            p.0[0] = (p.0[0] / max).clamp(0.0, 1.0);
        }
    }
}

/// Density of `marker_column`-positive cells.
///
/// # Errors
///
/// Returns [`AnalysisError::MissingColumns`] when a centroid or the marker
/// column is absent, or [`AnalysisError::InvalidParameter`] for a negative
/// sigma.
pub fn estimate_density(
    table: &ObservationTable,
    marker_column: &str,
    dimensions: Dimensions,
    sigma: f64,
    columns: &ColumnNames,
) -> Result<DensityGrid, AnalysisError> {
    validate_sigma(sigma)?;
    table.require(&[
        columns.x_centroid.as_str(),
        columns.y_centroid.as_str(),
        marker_column,
    ])?;
    let centroids = table.centroids(columns)?;
    let flags = table.positive(marker_column)?;

    let positives = centroids
        .into_iter()
        .zip(flags)
        .filter_map(|(point, positive)| positive.then_some(point));
    let impulses = impulse_grid(positives, dimensions);

    let mut density = gaussian_blur(&impulses, sigma);
    normalize_to_unit_max(&mut density);
    Ok(density)
}

/// Axis-aligned pixel box `[x_min, x_max) x [y_min, y_max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewBox {
    pub x_min: u32,
    pub y_min: u32,
    pub x_max: u32,
    pub y_max: u32,
    /// Column of the densest pixel.
    pub peak_x: u32,
    /// Row of the densest pixel.
    pub peak_y: u32,
}

/// Box of half-size `margin` around the densest pixel, clipped to the grid.
///
/// Ties go to the first pixel in row-major order. Returns `None` for an
/// empty or all-zero grid.
#[must_use]
pub fn densest_region(density: &DensityGrid, margin: u32) -> Option<ViewBox> {
    let (w, h) = density.dimensions();
    let mut best: Option<(u32, u32, f32)> = None;
    for (x, y, p) in density.enumerate_pixels() {
        let v = p.0[0];
        if v > 0.0 && best.is_none_or(|(_, _, b)| v > b) {
            best = Some((x, y, v));
        }
    }
    let (x, y, _) = best?;
    Some(ViewBox {
        x_min: x.saturating_sub(margin),
        y_min: y.saturating_sub(margin),
        x_max: x.saturating_add(margin).min(w),
        y_max: y.saturating_add(margin).min(h),
        peak_x: x,
        peak_y: y,
    })
}
