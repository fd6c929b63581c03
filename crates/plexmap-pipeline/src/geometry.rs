//! Cell footprint reconstruction: ellipse parameters to a label image.
//!
//! Each observation row describes a cell as an ellipse (centroid, major and
//! minor axis lengths, orientation). The ellipse is approximated by a
//! regular polygon and rasterized; every pixel whose integer coordinate
//! lies inside or on the polygon is painted with the cell's identifier.
//!
//! Overlapping footprints are resolved first-writer-wins in table order: a
//! pixel claimed by an earlier row is never overwritten. This is a fixed
//! tie-break, not a z-order.

use std::f64::consts::TAU;

use geo::{BoundingRect, Coord, Intersects, LineString, Polygon};
use image::Luma;

use crate::table::ObservationTable;
use crate::types::{AnalysisConfig, AnalysisError, CellId, Dimensions, LabelImage, Point};

/// Minimum semi-axis length in pixels; degenerate cells still cover
/// their centroid.
pub const MIN_SEMI_AXIS: f64 = 1.0;

/// One cell's ellipse parameters, orientation in radians.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellEllipse {
    pub cell_id: CellId,
    pub center: Point,
    pub major_axis_length: f64,
    pub minor_axis_length: f64,
    pub orientation: f64,
}

impl CellEllipse {
    fn is_finite(&self) -> bool {
        self.center.x.is_finite()
            && self.center.y.is_finite()
            && self.major_axis_length.is_finite()
            && self.minor_axis_length.is_finite()
            && self.orientation.is_finite()
    }

    /// Boundary vertices, sampled at `vertex_count` evenly spaced angles.
    ///
    /// Semi-axes are clamped to [`MIN_SEMI_AXIS`].
    #[must_use]
    pub fn vertices(&self, vertex_count: usize) -> Vec<Point> {
        let a = (self.major_axis_length / 2.0).max(MIN_SEMI_AXIS);
        let b = (self.minor_axis_length / 2.0).max(MIN_SEMI_AXIS);
        let (sin_t, cos_t) = self.orientation.sin_cos();
        #[allow(clippy::cast_precision_loss)]
        let step = TAU / vertex_count as f64;
        (0..vertex_count)
            .map(|k| {
                #[allow(clippy::cast_precision_loss)]
                let (sin_a, cos_a) = (step * k as f64).sin_cos();
                let (u, v) = (a * cos_a, b * sin_a);
                Point::new(
                    self.center.x + u * cos_t - v * sin_t,
                    self.center.y + u * sin_t + v * cos_t,
                )
            })
            .collect()
    }
}

/// Read every row's ellipse parameters.
///
/// # Errors
///
/// Returns [`AnalysisError::MissingColumns`] naming every absent shape
/// column, or any identifier validation error from
/// [`ObservationTable::cell_ids`].
pub fn cell_ellipses(
    table: &ObservationTable,
    config: &AnalysisConfig,
) -> Result<Vec<CellEllipse>, AnalysisError> {
    let columns = &config.columns;
    table.require(&columns.numeric())?;

    let ids = table.cell_ids(columns)?;
    let xs = table.numeric(&columns.x_centroid)?;
    let ys = table.numeric(&columns.y_centroid)?;
    let major = table.numeric(&columns.major_axis_length)?;
    let minor = table.numeric(&columns.minor_axis_length)?;
    let theta = table.numeric(&columns.orientation)?;

    Ok((0..table.len())
        .map(|i| CellEllipse {
            cell_id: ids[i],
            center: Point::new(xs[i], ys[i]),
            major_axis_length: major[i],
            minor_axis_length: minor[i],
            orientation: if config.orientation_in_degrees {
                theta[i].to_radians()
            } else {
                theta[i]
            },
        })
        .collect())
}

/// Pixels covered by a polygon, clipped to the image.
///
/// A pixel `(col, row)` is covered when the point `(col, row)` lies inside
/// the polygon or on its boundary.
#[must_use]
pub fn rasterize_polygon(vertices: &[Point], dimensions: Dimensions) -> Vec<(u32, u32)> {
    if vertices.len() < 3 || dimensions.width == 0 || dimensions.height == 0 {
        return Vec::new();
    }
    let ring: LineString<f64> = vertices
        .iter()
        .map(|p| Coord { x: p.x, y: p.y })
        .collect();
    let polygon = Polygon::new(ring, vec![]);
    let Some(bounds) = polygon.bounding_rect() else {
        return Vec::new();
    };

    let Some((col_min, col_max)) = clip_span(bounds.min().x, bounds.max().x, dimensions.width)
    else {
        return Vec::new();
    };
    let Some((row_min, row_max)) = clip_span(bounds.min().y, bounds.max().y, dimensions.height)
    else {
        return Vec::new();
    };

    let mut pixels = Vec::new();
    for row in row_min..=row_max {
        for col in col_min..=col_max {
            let centre = geo::Point::new(f64::from(col), f64::from(row));
            if polygon.intersects(&centre) {
                pixels.push((col, row));
            }
        }
    }
    pixels
}

/// Integer range `[ceil(lo), floor(hi)]` intersected with `[0, extent)`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clip_span(lo: f64, hi: f64, extent: u32) -> Option<(u32, u32)> {
    let last = f64::from(extent - 1);
    let lo = lo.ceil().max(0.0);
    let hi = hi.floor().min(last);
    (lo <= hi).then(|| (lo as u32, hi as u32))
}

/// Paint each ellipse into a fresh label image, first writer wins.
#[must_use]
pub fn paint_labels(
    ellipses: &[CellEllipse],
    dimensions: Dimensions,
    vertex_count: usize,
) -> LabelImage {
    let mut labels = LabelImage::new(dimensions.width, dimensions.height);
    for ellipse in ellipses {
        if !ellipse.is_finite() {
            tracing::warn!(cell_id = ellipse.cell_id, "skipping cell with non-finite geometry");
            continue;
        }
        for (col, row) in rasterize_polygon(&ellipse.vertices(vertex_count), dimensions) {
            let pixel = labels.get_pixel_mut(col, row);
            if pixel.0[0] == 0 {
                *pixel = Luma([ellipse.cell_id]);
            }
        }
    }
    labels
}

/// Rebuild the label image for a whole observation table.
///
/// # Errors
///
/// Returns an [`AnalysisError`] when shape columns are missing or cell
/// identifiers are invalid.
pub fn rebuild_labels(
    table: &ObservationTable,
    dimensions: Dimensions,
    config: &AnalysisConfig,
) -> Result<LabelImage, AnalysisError> {
    let ellipses = cell_ellipses(table, config)?;
    Ok(paint_labels(&ellipses, dimensions, config.ellipse_vertices))
}
