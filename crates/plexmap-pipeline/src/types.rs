//! Shared types for the plexmap analysis pipeline.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Re-export `GrayImage` so downstream crates can reference mask rasters
/// without depending on `image` directly.
pub use image::GrayImage;

use image::{ImageBuffer, Luma};

/// Raster of cell identifiers. `0` is background; any other value is the
/// `cell_id` owning that pixel.
pub type LabelImage = ImageBuffer<Luma<u32>, Vec<u32>>;

/// Binary marker mask: every pixel is `0` or `1`.
pub type MaskImage = GrayImage;

/// Smoothed, normalized concentration of a marker-positive population.
/// Every value lies in `[0, 1]`.
pub type DensityGrid = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Identifier of one cell in the observation table.
pub type CellId = u32;

/// A 2D point in image coordinates.
///
/// Serialized as a `[row, col]` pair (that is, `[y, x]`) so persisted
/// paths and point sets follow the image axis convention.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    /// Horizontal position (column, pixels from left edge).
    pub x: f64,
    /// Vertical position (row, pixels from top edge).
    pub y: f64,
}

impl Point {
    /// Create a new point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Create a point from a `(row, col)` pair.
    #[must_use]
    pub const fn from_row_col(row: f64, col: f64) -> Self {
        Self { x: col, y: row }
    }

    /// Squared Euclidean distance to another point.
    #[must_use]
    pub fn distance_squared(self, other: Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx.mul_add(dx, dy * dy)
    }

    /// Euclidean distance to another point.
    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        self.distance_squared(other).sqrt()
    }
}

impl Serialize for Point {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        [self.y, self.x].serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Point {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let [row, col] = <[f64; 2]>::deserialize(deserializer)?;
        Ok(Self::from_row_col(row, col))
    }
}

/// An ordered sequence of vertices. Closed contours repeat their first
/// vertex at the end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Polyline(Vec<Point>);

impl Polyline {
    /// Create a new polyline from a vector of points.
    #[must_use]
    pub const fn new(points: Vec<Point>) -> Self {
        Self(points)
    }

    /// Returns `true` if the polyline has no points.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the number of points in the polyline.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the first and last vertices coincide.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.0.len() > 2 && self.0.first() == self.0.last()
    }

    /// Returns a slice of all points.
    #[must_use]
    pub fn points(&self) -> &[Point] {
        &self.0
    }

    /// Consumes the polyline and returns the underlying vector of points.
    #[must_use]
    pub fn into_points(self) -> Vec<Point> {
        self.0
    }
}

/// One iso-contour of a density grid, simplified.
pub type BoundaryPath = Polyline;

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels (number of columns).
    pub width: u32,
    /// Height in pixels (number of rows).
    pub height: u32,
}

impl Dimensions {
    /// Create new dimensions.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Total number of pixels.
    #[must_use]
    pub const fn pixel_count(self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Names of the observation-table columns the pipeline reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnNames {
    pub cell_id: String,
    pub x_centroid: String,
    pub y_centroid: String,
    pub major_axis_length: String,
    pub minor_axis_length: String,
    pub orientation: String,
}

impl ColumnNames {
    /// All configured numeric columns, in table-declaration order.
    #[must_use]
    pub fn numeric(&self) -> [&str; 6] {
        [
            &self.cell_id,
            &self.x_centroid,
            &self.y_centroid,
            &self.major_axis_length,
            &self.minor_axis_length,
            &self.orientation,
        ]
    }
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            cell_id: "CellID".to_owned(),
            x_centroid: "X_centroid".to_owned(),
            y_centroid: "Y_centroid".to_owned(),
            major_axis_length: "MajorAxisLength".to_owned(),
            minor_axis_length: "MinorAxisLength".to_owned(),
            orientation: "Orientation".to_owned(),
        }
    }
}

/// A named sub-population of neighbor cells, selected by a marker column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryMarker {
    /// Class name used in results (e.g. `immune`).
    pub name: String,
    /// Marker column deciding membership.
    pub column: String,
}

impl SecondaryMarker {
    #[must_use]
    pub fn new(name: &str, column: &str) -> Self {
        Self {
            name: name.to_owned(),
            column: column.to_owned(),
        }
    }
}

/// Configuration for the analysis pipeline.
///
/// All parameters have defaults matching the interactive viewer's
/// behaviour. Call [`validate`](Self::validate) before use when the
/// config comes from user input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Observation-table column names.
    pub columns: ColumnNames,

    /// Number of polygon vertices used to approximate each cell ellipse.
    pub ellipse_vertices: usize,

    /// Whether the orientation column is in degrees (radians otherwise).
    pub orientation_in_degrees: bool,

    /// Default Gaussian sigma for density maps, in pixels.
    pub density_sigma: f64,

    /// Default percentile (0-100) of positive density used as contour level.
    pub boundary_percentile: f64,

    /// Ramer-Douglas-Peucker tolerance for boundary simplification, in pixels.
    pub simplify_tolerance: f64,

    /// Boundary paths with fewer vertices than this are discarded.
    pub min_vertices: usize,

    /// Default neighborhood query radius, in pixels.
    pub neighborhood_radius: f64,

    /// Secondary marker classes reported for neighbor cells, in order.
    pub secondary_markers: Vec<SecondaryMarker>,

    /// Half-size of the box returned around the densest pixel.
    pub dense_region_margin: u32,
}

impl AnalysisConfig {
    pub const DEFAULT_ELLIPSE_VERTICES: usize = 36;
    pub const DEFAULT_DENSITY_SIGMA: f64 = 200.0;
    pub const DEFAULT_BOUNDARY_PERCENTILE: f64 = 95.0;
    pub const DEFAULT_SIMPLIFY_TOLERANCE: f64 = 4.0;
    pub const DEFAULT_MIN_VERTICES: usize = 20;
    pub const DEFAULT_NEIGHBORHOOD_RADIUS: f64 = 50.0;
    pub const DEFAULT_DENSE_REGION_MARGIN: u32 = 300;

    /// Check parameter ranges.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::InvalidParameter`] naming the first
    /// out-of-range field.
    pub fn validate(&self) -> Result<(), AnalysisError> {
        if self.ellipse_vertices < 3 {
            return Err(AnalysisError::InvalidParameter(format!(
                "ellipse_vertices must be at least 3, got {}",
                self.ellipse_vertices
            )));
        }
        validate_sigma(self.density_sigma)?;
        validate_percentile(self.boundary_percentile)?;
        validate_radius(self.neighborhood_radius)?;
        if !(self.simplify_tolerance >= 0.0 && self.simplify_tolerance.is_finite()) {
            return Err(AnalysisError::InvalidParameter(format!(
                "simplify_tolerance must be a non-negative number, got {}",
                self.simplify_tolerance
            )));
        }
        Ok(())
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            columns: ColumnNames::default(),
            ellipse_vertices: Self::DEFAULT_ELLIPSE_VERTICES,
            orientation_in_degrees: false,
            density_sigma: Self::DEFAULT_DENSITY_SIGMA,
            boundary_percentile: Self::DEFAULT_BOUNDARY_PERCENTILE,
            simplify_tolerance: Self::DEFAULT_SIMPLIFY_TOLERANCE,
            min_vertices: Self::DEFAULT_MIN_VERTICES,
            neighborhood_radius: Self::DEFAULT_NEIGHBORHOOD_RADIUS,
            secondary_markers: vec![
                SecondaryMarker::new("immune", "CD45_positive"),
                SecondaryMarker::new("B", "CD20_positive"),
                SecondaryMarker::new("T", "CD3E_positive"),
            ],
            dense_region_margin: Self::DEFAULT_DENSE_REGION_MARGIN,
        }
    }
}

/// Reject negative or non-finite smoothing sigmas.
///
/// # Errors
///
/// Returns [`AnalysisError::InvalidParameter`] when out of range.
pub fn validate_sigma(sigma: f64) -> Result<(), AnalysisError> {
    if sigma >= 0.0 && sigma.is_finite() {
        Ok(())
    } else {
        Err(AnalysisError::InvalidParameter(format!(
            "sigma must be a non-negative number, got {sigma}"
        )))
    }
}

/// Reject percentiles outside `[0, 100]`.
///
/// # Errors
///
/// Returns [`AnalysisError::InvalidParameter`] when out of range.
pub fn validate_percentile(percentile: f64) -> Result<(), AnalysisError> {
    if (0.0..=100.0).contains(&percentile) {
        Ok(())
    } else {
        Err(AnalysisError::InvalidParameter(format!(
            "percentile must be within [0, 100], got {percentile}"
        )))
    }
}

/// Reject negative or non-finite radii.
///
/// # Errors
///
/// Returns [`AnalysisError::InvalidParameter`] when out of range.
pub fn validate_radius(radius: f64) -> Result<(), AnalysisError> {
    if radius >= 0.0 && radius.is_finite() {
        Ok(())
    } else {
        Err(AnalysisError::InvalidParameter(format!(
            "radius must be a non-negative number, got {radius}"
        )))
    }
}

/// Domain errors raised by the analysis pipeline.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AnalysisError {
    /// The observation table lacks columns an operation requires.
    #[error("missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    /// A table cell could not be interpreted.
    #[error("invalid value {value:?} in column '{column}' at row {row}")]
    InvalidValue {
        column: String,
        row: usize,
        value: String,
    },

    /// Two rows share the same cell identifier.
    #[error("duplicate cell id {0}")]
    DuplicateCellId(CellId),

    /// A column's length disagrees with the table's row count.
    #[error("column '{column}' has {actual} values, expected {expected}")]
    ColumnLength {
        column: String,
        expected: usize,
        actual: usize,
    },

    /// A numeric parameter is out of range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}
