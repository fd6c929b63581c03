//! Per-dataset analysis service.
//!
//! A [`Workspace`] binds one resolved dataset (image dimensions, loaded
//! observation table, artifact directory) to an [`AnalysisConfig`] and an
//! [`ArtifactCache`]. Every operation goes through the cache, so repeated
//! requests are loads rather than recomputations.

use std::path::PathBuf;

use plexmap_pipeline::{
    AnalysisConfig, AnalysisError, BoundaryPath, ColumnMatch, DensityGrid, Dimensions, LabelImage,
    MaskImage, NeighborhoodOutcome, ObservationTable, ViewBox, densest_region, estimate_density,
    extract_boundary,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::cache::{ArtifactCache, ArtifactStore, CacheKey, CacheOrigin, Cached, FsStore};
use crate::error::StoreError;
use crate::registry::{DatasetContext, Registry};
use crate::source::{image_dimensions, image_stem, load_table};

/// Which dataset a request refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetTarget {
    Id(String),
    Paths {
        image: PathBuf,
        table: PathBuf,
        #[serde(default)]
        output_root: Option<PathBuf>,
    },
}

/// The artifact a request asks for. Omitted parameters fall back to the
/// workspace configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestedArtifact {
    Labels,
    Mask {
        marker: String,
    },
    Density {
        marker: String,
        #[serde(default)]
        sigma: Option<f64>,
    },
    Boundary {
        marker: String,
        #[serde(default)]
        sigma: Option<f64>,
        #[serde(default)]
        percentile: Option<f64>,
    },
    Neighborhood {
        marker: String,
        #[serde(default)]
        radius: Option<f64>,
    },
    DenseRegion {
        marker: String,
        #[serde(default)]
        sigma: Option<f64>,
        #[serde(default)]
        margin: Option<u32>,
    },
}

/// One derived-artifact invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRequest {
    pub target: DatasetTarget,
    pub artifact: RequestedArtifact,
    #[serde(default)]
    pub force_recompute: bool,
}

/// A derived artifact with its cache provenance.
#[derive(Debug, Clone, PartialEq)]
pub enum DerivedArtifact {
    Labels(Cached<LabelImage>),
    Mask(Cached<MaskImage>),
    Density(Cached<DensityGrid>),
    Boundary(Cached<Vec<BoundaryPath>>),
    Neighborhood(Cached<NeighborhoodOutcome>),
    DenseRegion(Cached<Option<ViewBox>>),
}

/// Compact, serializable description of a [`DerivedArtifact`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactReport {
    pub kind: &'static str,
    pub origin: CacheOrigin,
    pub location: String,
    pub detail: Value,
}

fn report<T>(kind: &'static str, cached: &Cached<T>, detail: Value) -> ArtifactReport {
    ArtifactReport {
        kind,
        origin: cached.origin,
        location: cached.location.clone(),
        detail,
    }
}

impl DerivedArtifact {
    #[must_use]
    pub fn report(&self) -> ArtifactReport {
        match self {
            Self::Labels(c) => {
                let labeled = c.value.as_raw().iter().filter(|v| **v != 0).count();
                let mut cells: Vec<u32> = c.value.as_raw().iter().copied().filter(|v| *v != 0).collect();
                cells.sort_unstable();
                cells.dedup();
                report(
                    "labels",
                    c,
                    json!({
                        "width": c.value.width(),
                        "height": c.value.height(),
                        "labeled_pixels": labeled,
                        "cells": cells.len(),
                    }),
                )
            }
            Self::Mask(c) => {
                let positive = c.value.as_raw().iter().filter(|v| **v != 0).count();
                report(
                    "mask",
                    c,
                    json!({
                        "width": c.value.width(),
                        "height": c.value.height(),
                        "positive_pixels": positive,
                    }),
                )
            }
            Self::Density(c) => {
                let max = c.value.as_raw().iter().copied().fold(0.0_f32, f32::max);
                let nonzero = c.value.as_raw().iter().filter(|v| **v > 0.0).count();
                report(
                    "density",
                    c,
                    json!({
                        "width": c.value.width(),
                        "height": c.value.height(),
                        "max": max,
                        "nonzero_pixels": nonzero,
                    }),
                )
            }
            Self::Boundary(c) => {
                let vertices: usize = c.value.iter().map(BoundaryPath::len).sum();
                report(
                    "boundary",
                    c,
                    json!({ "paths": c.value.len(), "vertices": vertices }),
                )
            }
            Self::Neighborhood(c) => {
                let detail = match &c.value {
                    NeighborhoodOutcome::Computed(result) => json!(result.summary()),
                    outcome @ NeighborhoodOutcome::NoReferenceCells { .. } => {
                        json!({ "message": outcome.describe() })
                    }
                };
                report("neighborhood", c, detail)
            }
            Self::DenseRegion(c) => report("dense_region", c, json!(c.value)),
        }
    }
}

/// Analysis operations over one dataset.
#[derive(Debug)]
pub struct Workspace<S> {
    image_stem: String,
    dimensions: Dimensions,
    table: ObservationTable,
    config: AnalysisConfig,
    cache: ArtifactCache<S>,
}

impl Workspace<FsStore> {
    /// Open a resolved dataset: read the image header for dimensions and
    /// load the observation table. Artifacts go under the context's output
    /// root.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid config or unreadable sources.
    pub fn open(context: &DatasetContext, config: AnalysisConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let dimensions = image_dimensions(&context.image_path)?;
        let table = load_table(&context.table_path, &config.columns)?;
        tracing::info!(
            image = %context.image_path.display(),
            width = dimensions.width,
            height = dimensions.height,
            cells = table.len(),
            "opened workspace"
        );
        Self::from_parts(
            &image_stem(&context.image_path),
            dimensions,
            table,
            config,
            FsStore::new(&context.output_root),
        )
    }
}

impl<S: ArtifactStore> Workspace<S> {
    /// Assemble a workspace from already-loaded inputs.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::InvalidParameter`] for an invalid config.
    pub fn from_parts(
        image_stem: &str,
        dimensions: Dimensions,
        table: ObservationTable,
        config: AnalysisConfig,
        store: S,
    ) -> Result<Self, StoreError> {
        config.validate()?;
        Ok(Self {
            image_stem: image_stem.to_owned(),
            dimensions,
            table,
            config,
            cache: ArtifactCache::new(store),
        })
    }

    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    #[must_use]
    pub const fn table(&self) -> &ObservationTable {
        &self.table
    }

    #[must_use]
    pub const fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    #[must_use]
    pub const fn store(&self) -> &S {
        self.cache.store()
    }

    /// Map a loosely typed marker name to a table column.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::MissingColumns`] when nothing matches, or
    /// [`StoreError::InvalidRequest`] listing the candidates when the name
    /// is ambiguous.
    pub fn resolve_marker(&self, query: &str) -> Result<String, StoreError> {
        match self.table.resolve_column(query) {
            ColumnMatch::Found(name) => Ok(name),
            ColumnMatch::NotFound => Err(AnalysisError::MissingColumns(vec![query.to_owned()]).into()),
            ColumnMatch::Ambiguous(candidates) => Err(StoreError::InvalidRequest(format!(
                "marker '{query}' is ambiguous: {}",
                candidates.join(", ")
            ))),
        }
    }

    fn same_size<P: image::Pixel>(&self, grid: &image::ImageBuffer<P, Vec<P::Subpixel>>) -> bool {
        grid.dimensions() == (self.dimensions.width, self.dimensions.height)
    }

    fn require_marker(&self, marker: &str) -> Result<(), StoreError> {
        Ok(self.table.require(&[marker])?)
    }

    /// Label image rebuilt from the cell ellipses.
    ///
    /// # Errors
    ///
    /// Returns an error if the table lacks the shape columns.
    pub fn labels(&self, force: bool) -> Result<Cached<LabelImage>, StoreError> {
        let key = CacheKey::labels(&self.image_stem);
        self.cache.get_or_compute(
            &key,
            force,
            |labels| self.same_size(labels),
            || {
                Ok(plexmap_pipeline::rebuild_labels(
                    &self.table,
                    self.dimensions,
                    &self.config,
                )?)
            },
        )
    }

    /// Mask of `marker`-positive cell footprints.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::MissingColumns`] for an unknown marker.
    pub fn mask(&self, marker: &str, force: bool) -> Result<Cached<MaskImage>, StoreError> {
        self.require_marker(marker)?;
        let key = CacheKey::mask(&self.image_stem, marker);
        self.cache.get_or_compute(
            &key,
            force,
            |mask| self.same_size(mask),
            || {
                let labels = self.labels(force)?;
                Ok(plexmap_pipeline::build_mask(
                    &labels.value,
                    &self.table,
                    marker,
                    &self.config.columns,
                )?)
            },
        )
    }

    /// Masks for several markers. Markers absent from the table are skipped
    /// with a warning.
    ///
    /// # Errors
    ///
    /// Propagates errors other than a missing marker column.
    pub fn marker_masks(
        &self,
        markers: &[&str],
        force: bool,
    ) -> Result<Vec<(String, Cached<MaskImage>)>, StoreError> {
        let mut masks = Vec::with_capacity(markers.len());
        for &marker in markers {
            if !self.table.has_column(marker) {
                tracing::warn!(marker, "marker column not found; skipping mask");
                continue;
            }
            masks.push((marker.to_owned(), self.mask(marker, force)?));
        }
        Ok(masks)
    }

    /// Normalized density of `marker`-positive cells.
    ///
    /// # Errors
    ///
    /// Returns an error for a missing column or a negative sigma.
    pub fn density(
        &self,
        marker: &str,
        sigma: f64,
        force: bool,
    ) -> Result<Cached<DensityGrid>, StoreError> {
        plexmap_pipeline::types::validate_sigma(sigma)?;
        self.require_marker(marker)?;
        let key = CacheKey::density(&self.image_stem, marker, sigma);
        self.cache.get_or_compute(
            &key,
            force,
            |density| self.same_size(density),
            || {
                Ok(estimate_density(
                    &self.table,
                    marker,
                    self.dimensions,
                    sigma,
                    &self.config.columns,
                )?)
            },
        )
    }

    /// Boundary paths of the `marker` density at `percentile`.
    ///
    /// # Errors
    ///
    /// Returns an error for a missing column or out-of-range parameters.
    pub fn boundary(
        &self,
        marker: &str,
        sigma: f64,
        percentile: f64,
        force: bool,
    ) -> Result<Cached<Vec<BoundaryPath>>, StoreError> {
        plexmap_pipeline::types::validate_percentile(percentile)?;
        plexmap_pipeline::types::validate_sigma(sigma)?;
        self.require_marker(marker)?;
        let key = CacheKey::boundary(&self.image_stem, marker, sigma, percentile);
        let min_vertices = self.config.min_vertices;
        self.cache.get_or_compute(
            &key,
            force,
            |paths: &Vec<BoundaryPath>| paths.iter().all(|p| p.len() >= min_vertices),
            || {
                let density = self.density(marker, sigma, force)?;
                Ok(extract_boundary(
                    &density.value,
                    percentile,
                    self.config.simplify_tolerance,
                    min_vertices,
                )?)
            },
        )
    }

    /// Neighborhood of the `marker` population within `radius`.
    ///
    /// # Errors
    ///
    /// Returns an error for missing coordinate or marker columns.
    pub fn neighborhood(
        &self,
        marker: &str,
        radius: f64,
        force: bool,
    ) -> Result<Cached<NeighborhoodOutcome>, StoreError> {
        plexmap_pipeline::types::validate_radius(radius)?;
        let key = CacheKey::neighborhood(&self.image_stem, marker, radius);
        let cells = self.table.len();
        self.cache.get_or_compute(
            &key,
            force,
            |outcome: &NeighborhoodOutcome| outcome.result().is_none_or(|r| r.points.len() == cells),
            || {
                Ok(plexmap_pipeline::compute_neighborhood(
                    &self.table,
                    marker,
                    radius,
                    &self.config,
                )?)
            },
        )
    }

    /// Box around the densest pixel of the `marker` density.
    ///
    /// Uses the configured margin when `margin` is `None`.
    ///
    /// # Errors
    ///
    /// See [`density`](Self::density).
    pub fn dense_region(
        &self,
        marker: &str,
        sigma: f64,
        margin: Option<u32>,
        force: bool,
    ) -> Result<Cached<Option<ViewBox>>, StoreError> {
        let margin = margin.unwrap_or(self.config.dense_region_margin);
        let density = self.density(marker, sigma, force)?;
        Ok(density.map(|grid| densest_region(&grid, margin)))
    }

    /// Serve one request against this workspace. The request's target is
    /// assumed to have been resolved to this dataset already.
    ///
    /// # Errors
    ///
    /// See the individual operations.
    pub fn derive(&self, request: &ArtifactRequest) -> Result<DerivedArtifact, StoreError> {
        let force = request.force_recompute;
        let config = &self.config;
        Ok(match &request.artifact {
            RequestedArtifact::Labels => DerivedArtifact::Labels(self.labels(force)?),
            RequestedArtifact::Mask { marker } => DerivedArtifact::Mask(self.mask(marker, force)?),
            RequestedArtifact::Density { marker, sigma } => DerivedArtifact::Density(
                self.density(marker, sigma.unwrap_or(config.density_sigma), force)?,
            ),
            RequestedArtifact::Boundary {
                marker,
                sigma,
                percentile,
            } => DerivedArtifact::Boundary(self.boundary(
                marker,
                sigma.unwrap_or(config.density_sigma),
                percentile.unwrap_or(config.boundary_percentile),
                force,
            )?),
            RequestedArtifact::Neighborhood { marker, radius } => DerivedArtifact::Neighborhood(
                self.neighborhood(marker, radius.unwrap_or(config.neighborhood_radius), force)?,
            ),
            RequestedArtifact::DenseRegion {
                marker,
                sigma,
                margin,
            } => DerivedArtifact::DenseRegion(self.dense_region(
                marker,
                sigma.unwrap_or(config.density_sigma),
                *margin,
                force,
            )?),
        })
    }
}

/// Resolve a request's target through `registry`, open its workspace and
/// derive the artifact.
///
/// # Errors
///
/// Returns any resolution, loading or analysis error.
pub fn serve_request(
    registry: &Registry,
    request: &ArtifactRequest,
    config: AnalysisConfig,
) -> Result<DerivedArtifact, StoreError> {
    let context = match &request.target {
        DatasetTarget::Id(id) => registry.get_dataset_paths(id)?,
        DatasetTarget::Paths {
            image,
            table,
            output_root,
        } => registry.resolve(None, Some(image), Some(table), output_root.as_deref())?,
    };
    Workspace::open(&context, config)?.derive(request)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cache::{MemoryStore, StoreStats};

    fn table() -> ObservationTable {
        ObservationTable::new()
            .with_numeric("CellID", vec![1.0, 2.0, 3.0])
            .unwrap()
            .with_numeric("X_centroid", vec![10.0, 14.0, 40.0])
            .unwrap()
            .with_numeric("Y_centroid", vec![10.0, 12.0, 30.0])
            .unwrap()
            .with_numeric("MajorAxisLength", vec![6.0, 6.0, 6.0])
            .unwrap()
            .with_numeric("MinorAxisLength", vec![4.0, 4.0, 4.0])
            .unwrap()
            .with_numeric("Orientation", vec![0.0, 0.5, 1.0])
            .unwrap()
            .with_markers("tumor_positive", vec![true, true, false])
            .unwrap()
            .with_markers("CD45_positive", vec!["no", "no", "yes"])
            .unwrap()
    }

    fn workspace() -> Workspace<MemoryStore> {
        Workspace::from_parts(
            "slide",
            Dimensions::new(50, 40),
            table(),
            AnalysisConfig::default(),
            MemoryStore::new(),
        )
        .unwrap()
    }

    #[test]
    fn labels_are_cached() {
        let ws = workspace();
        let first = ws.labels(false).unwrap();
        let second = ws.labels(false).unwrap();
        assert_eq!(first.origin, CacheOrigin::Computed);
        assert_eq!(second.origin, CacheOrigin::Cache);
        assert_eq!(first.value, second.value);
        assert_eq!(first.location, "memory://slide/slide_rebuilt_labels.tif");
    }

    #[test]
    fn mask_reuses_cached_labels() {
        let ws = workspace();
        ws.labels(false).unwrap();
        let mask = ws.mask("tumor_positive", false).unwrap();
        assert_eq!(mask.origin, CacheOrigin::Computed);
        assert_eq!(mask.value.get_pixel(10, 10).0[0], 1);
        assert_eq!(mask.value.get_pixel(40, 30).0[0], 0);
        // One load (labels), two saves (labels, mask).
        assert_eq!(ws.store().stats(), StoreStats { loads: 1, saves: 2 });
    }

    #[test]
    fn punctuation_variants_of_a_marker_are_cached_apart() {
        let table = table()
            .with_markers("CD8+", vec![true, false, false])
            .unwrap()
            .with_markers("CD8_", vec![false, false, false])
            .unwrap();
        let ws = Workspace::from_parts(
            "slide",
            Dimensions::new(50, 40),
            table,
            AnalysisConfig::default(),
            MemoryStore::new(),
        )
        .unwrap();
        let plus = ws.mask("CD8+", false).unwrap();
        let underscore = ws.mask("CD8_", false).unwrap();
        assert_eq!(underscore.origin, CacheOrigin::Computed);
        assert_ne!(plus.location, underscore.location);
        assert_eq!(plus.value.get_pixel(10, 10).0[0], 1);
        assert_eq!(underscore.value.get_pixel(10, 10).0[0], 0);
    }

    #[test]
    fn unknown_marker_fails_before_any_work() {
        let ws = workspace();
        let err = ws.mask("CD99", false).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Analysis(AnalysisError::MissingColumns(_))
        ));
        assert!(ws.store().is_empty());
    }

    #[test]
    fn marker_masks_skip_absent_columns() {
        let ws = workspace();
        let masks = ws
            .marker_masks(&["CD45_positive", "CD20_positive"], false)
            .unwrap();
        assert_eq!(masks.len(), 1);
        assert_eq!(masks[0].0, "CD45_positive");
    }

    #[test]
    fn forced_density_matches_cached() {
        let ws = workspace();
        let first = ws.density("tumor_positive", 5.0, false).unwrap();
        let forced = ws.density("tumor_positive", 5.0, true).unwrap();
        assert_eq!(forced.origin, CacheOrigin::Computed);
        assert_eq!(first.value, forced.value);
    }

    #[test]
    fn boundary_uses_density_cache() {
        let ws = workspace();
        ws.density("tumor_positive", 5.0, false).unwrap();
        let paths = ws.boundary("tumor_positive", 5.0, 50.0, false).unwrap();
        assert_eq!(paths.origin, CacheOrigin::Computed);
        assert!(paths.value.iter().all(|p| p.len() >= ws.config().min_vertices));
        let again = ws.boundary("tumor_positive", 5.0, 50.0, false).unwrap();
        assert_eq!(again.origin, CacheOrigin::Cache);
        assert_eq!(again.value, paths.value);
    }

    #[test]
    fn neighborhood_round_trips_through_cache() {
        let ws = workspace();
        let first = ws.neighborhood("tumor_positive", 50.0, false).unwrap();
        let second = ws.neighborhood("tumor_positive", 50.0, false).unwrap();
        assert_eq!(second.origin, CacheOrigin::Cache);
        assert_eq!(first.value, second.value);
        let result = second.value.result().unwrap();
        assert_eq!(result.neighbor, vec![false, false, true]);
    }

    #[test]
    fn dense_region_centers_on_positive_cells() {
        let ws = workspace();
        let region = ws.dense_region("tumor_positive", 2.0, Some(5), false).unwrap();
        let view = region.value.unwrap();
        assert!((10..=14).contains(&view.peak_x));
        assert!((10..=12).contains(&view.peak_y));
        assert_eq!(view.x_max - view.x_min, 10);
    }

    #[test]
    fn derive_fills_defaults_from_config() {
        let ws = workspace();
        let request: ArtifactRequest = serde_json::from_value(json!({
            "target": { "id": "demo" },
            "artifact": { "kind": "neighborhood", "marker": "tumor_positive" },
        }))
        .unwrap();
        assert!(!request.force_recompute);
        let derived = ws.derive(&request).unwrap();
        let report = derived.report();
        assert_eq!(report.kind, "neighborhood");
        assert_eq!(
            report.location,
            "memory://slide/slide_tumor_positive_neighborhood_yx_r50.json.gz"
        );
        assert_eq!(report.detail["reference"], 2);
    }

    #[test]
    fn resolve_marker_is_case_insensitive() {
        let ws = workspace();
        assert_eq!(ws.resolve_marker("TUMOR_POSITIVE").unwrap(), "tumor_positive");
        assert_eq!(ws.resolve_marker("cd45").unwrap(), "CD45_positive");
        assert!(matches!(
            ws.resolve_marker("positive"),
            Err(StoreError::InvalidRequest(_))
        ));
        assert!(matches!(
            ws.resolve_marker("CD8"),
            Err(StoreError::Analysis(AnalysisError::MissingColumns(_)))
        ));
    }
}
