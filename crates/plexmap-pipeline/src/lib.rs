//! plexmap-pipeline: Pure spatial analysis of segmented multiplex images
//! (sans-IO).
//!
//! Turns a per-cell observation table into derived rasters and geometry:
//!
//! - [`geometry`]: cell ellipses rasterized into a label image
//! - [`mask`]: binary masks of marker-positive cells
//! - [`density`]: smoothed, normalized density of a positive population
//! - [`boundary`]: simplified iso-contours of a density grid
//! - [`neighborhood`]: radius neighbors, secondary classes and a Delaunay
//!   overlay around a reference population
//!
//! This crate has **no I/O dependencies** -- it operates on in-memory
//! tables and rasters and returns structured data. Persistence, caching
//! and dataset bookkeeping live in `plexmap-store`.

pub mod blur;
pub mod boundary;
pub mod contour;
pub mod density;
pub mod geometry;
pub mod marker;
pub mod mask;
pub mod neighborhood;
pub mod simplify;
pub mod table;
pub mod types;

pub use boundary::extract_boundary;
pub use contour::{ContourTracer, ContourTracerKind};
pub use density::{ViewBox, densest_region, estimate_density};
pub use geometry::rebuild_labels;
pub use marker::{MarkerValue, is_truthy};
pub use mask::build_mask;
pub use neighborhood::{
    NeighborhoodOutcome, NeighborhoodResult, NeighborhoodSummary, compute_neighborhood,
};
pub use table::{Column, ColumnMatch, ObservationTable};
pub use types::{
    AnalysisConfig, AnalysisError, BoundaryPath, CellId, ColumnNames, DensityGrid, Dimensions,
    LabelImage, MaskImage, Point, Polyline, SecondaryMarker,
};
