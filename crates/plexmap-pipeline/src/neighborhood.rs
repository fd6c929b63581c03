//! Spatial neighborhoods of a reference cell population.
//!
//! Every cell lands in exactly one of three groups: the reference
//! population, its neighbors (cells within `radius` of any reference cell),
//! or other. Neighbors are further tagged by secondary marker classes,
//! which may overlap. A Delaunay triangulation over the reference cells
//! provides a connectivity overlay.
//!
//! Coordinates are kept in image axis order: `Point` serializes as
//! `[row, col]`, i.e. `[y, x]`.

use std::collections::BTreeSet;

use rstar::RTree;
use rstar::primitives::GeomWithData;
use serde::{Deserialize, Serialize};
use spade::{DelaunayTriangulation, Point2, Triangulation};

use crate::table::ObservationTable;
use crate::types::{AnalysisConfig, AnalysisError, Point, SecondaryMarker, validate_radius};

type IndexedPoint = GeomWithData<[f64; 2], usize>;

/// Neighbor cells carrying one secondary marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryClass {
    pub name: String,
    pub column: String,
    /// Per-cell membership; always a subset of the neighbor set.
    pub members: Vec<bool>,
}

/// Result of a neighborhood query. All masks are indexed by table row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborhoodResult {
    pub radius: f64,
    pub points: Vec<Point>,
    pub reference: Vec<bool>,
    pub neighbor: Vec<bool>,
    pub other: Vec<bool>,
    pub classes: Vec<SecondaryClass>,
    /// Unique undirected Delaunay edges over the reference cells.
    pub segments: Vec<[Point; 2]>,
}

/// Outcome of [`compute_neighborhood`]. An empty reference population is
/// a described result, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NeighborhoodOutcome {
    Computed(NeighborhoodResult),
    NoReferenceCells { marker: String },
}

impl NeighborhoodOutcome {
    /// The computed result, if any.
    #[must_use]
    pub const fn result(&self) -> Option<&NeighborhoodResult> {
        match self {
            Self::Computed(result) => Some(result),
            Self::NoReferenceCells { .. } => None,
        }
    }

    /// One-line human-readable description.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Computed(result) => result.summary().to_string(),
            Self::NoReferenceCells { marker } => {
                format!("no reference cells found for marker '{marker}'")
            }
        }
    }
}

/// Count of one secondary class and its share of the neighbor set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassCount {
    pub name: String,
    pub count: usize,
    pub fraction: f64,
}

/// Population counts of a [`NeighborhoodResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborhoodSummary {
    pub cells: usize,
    pub reference: usize,
    pub neighbors: usize,
    pub other: usize,
    pub classes: Vec<ClassCount>,
    pub edges: usize,
}

impl std::fmt::Display for NeighborhoodSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} reference, {} neighbors, {} other",
            self.reference, self.neighbors, self.other
        )?;
        for class in &self.classes {
            write!(
                f,
                ", {}: {} ({:.1}%)",
                class.name,
                class.count,
                class.fraction * 100.0
            )?;
        }
        write!(f, ", {} edges", self.edges)
    }
}

fn count(mask: &[bool]) -> usize {
    mask.iter().filter(|m| **m).count()
}

fn select(points: &[Point], mask: &[bool]) -> Vec<Point> {
    points
        .iter()
        .zip(mask)
        .filter_map(|(p, m)| m.then_some(*p))
        .collect()
}

impl NeighborhoodResult {
    #[must_use]
    pub fn reference_points(&self) -> Vec<Point> {
        select(&self.points, &self.reference)
    }

    #[must_use]
    pub fn neighbor_points(&self) -> Vec<Point> {
        select(&self.points, &self.neighbor)
    }

    #[must_use]
    pub fn other_points(&self) -> Vec<Point> {
        select(&self.points, &self.other)
    }

    /// Points of the secondary class called `name`.
    #[must_use]
    pub fn class_points(&self, name: &str) -> Option<Vec<Point>> {
        self.classes
            .iter()
            .find(|c| c.name == name)
            .map(|c| select(&self.points, &c.members))
    }

    #[must_use]
    pub fn summary(&self) -> NeighborhoodSummary {
        let neighbors = count(&self.neighbor);
        let classes = self
            .classes
            .iter()
            .map(|c| {
                let n = count(&c.members);
                #[allow(clippy::cast_precision_loss)]
                let fraction = if neighbors == 0 {
                    0.0
                } else {
                    n as f64 / neighbors as f64
                };
                ClassCount {
                    name: c.name.clone(),
                    count: n,
                    fraction,
                }
            })
            .collect();
        NeighborhoodSummary {
            cells: self.points.len(),
            reference: count(&self.reference),
            neighbors,
            other: count(&self.other),
            classes,
            edges: self.segments.len(),
        }
    }
}

/// Cells within `radius` (inclusive) of any reference cell, excluding the
/// reference cells themselves.
///
/// Cells with non-finite coordinates are neither indexed nor queried.
#[must_use]
pub fn neighbors_within(points: &[Point], reference: &[bool], radius: f64) -> Vec<bool> {
    let indexed: Vec<IndexedPoint> = points
        .iter()
        .enumerate()
        .filter(|(_, p)| p.x.is_finite() && p.y.is_finite())
        .map(|(i, p)| GeomWithData::new([p.y, p.x], i))
        .collect();
    let tree = RTree::bulk_load(indexed);

    let mut neighbor = vec![false; points.len()];
    let radius_sq = radius * radius;
    for (p, _) in points.iter().zip(reference).filter(|(_, r)| **r) {
        if !(p.x.is_finite() && p.y.is_finite()) {
            continue;
        }
        for hit in tree.locate_within_distance([p.y, p.x], radius_sq) {
            neighbor[hit.data] = true;
        }
    }
    for (n, r) in neighbor.iter_mut().zip(reference) {
        *n &= !*r;
    }
    neighbor
}

/// Unique undirected Delaunay edges over `points`, as point pairs.
///
/// Fewer than three points, or all collinear, give no edges. Duplicate
/// points collapse onto their first occurrence.
#[must_use]
pub fn delaunay_segments(points: &[Point]) -> Vec<[Point; 2]> {
    if points.len() < 3 {
        return Vec::new();
    }
    let mut triangulation: DelaunayTriangulation<Point2<f64>> = DelaunayTriangulation::new();
    // Vertex index -> position in `points`.
    let mut origin: Vec<usize> = Vec::with_capacity(points.len());
    for (i, p) in points.iter().enumerate() {
        match triangulation.insert(Point2::new(p.y, p.x)) {
            Ok(handle) if handle.index() == origin.len() => origin.push(i),
            Ok(_) => {}
            Err(err) => tracing::warn!(index = i, ?err, "point skipped in triangulation"),
        }
    }

    let mut edges: BTreeSet<(usize, usize)> = BTreeSet::new();
    for face in triangulation.inner_faces() {
        let [a, b, c] = face.vertices().map(|v| origin[v.fix().index()]);
        for (u, v) in [(a, b), (b, c), (c, a)] {
            edges.insert((u.min(v), u.max(v)));
        }
    }
    edges
        .into_iter()
        .map(|(u, v)| [points[u], points[v]])
        .collect()
}

/// Classify every cell relative to the `reference_marker` population.
///
/// Secondary classes come from `config.secondary_markers`; a class whose
/// column is absent from the table is empty.
///
/// # Errors
///
/// Returns [`AnalysisError::MissingColumns`] when a centroid column or the
/// reference marker is absent, or [`AnalysisError::InvalidParameter`] for a
/// negative radius.
pub fn compute_neighborhood(
    table: &ObservationTable,
    reference_marker: &str,
    radius: f64,
    config: &AnalysisConfig,
) -> Result<NeighborhoodOutcome, AnalysisError> {
    validate_radius(radius)?;
    let columns = &config.columns;
    table.require(&[
        columns.x_centroid.as_str(),
        columns.y_centroid.as_str(),
        reference_marker,
    ])?;

    let points = table.centroids(columns)?;
    let reference = table.positive(reference_marker)?;
    let n_reference = count(&reference);
    tracing::info!(marker = reference_marker, n_reference, "reference cells");
    if n_reference == 0 {
        tracing::warn!(marker = reference_marker, "no reference cells");
        return Ok(NeighborhoodOutcome::NoReferenceCells {
            marker: reference_marker.to_owned(),
        });
    }

    let neighbor = neighbors_within(&points, &reference, radius);
    let other: Vec<bool> = reference
        .iter()
        .zip(&neighbor)
        .map(|(r, n)| !(*r || *n))
        .collect();
    let classes = config
        .secondary_markers
        .iter()
        .map(|marker| secondary_class(table, marker, &neighbor))
        .collect::<Result<Vec<_>, _>>()?;

    let segments = if n_reference >= 3 {
        delaunay_segments(&select(&points, &reference))
    } else {
        tracing::warn!(n_reference, "too few reference cells for triangulation");
        Vec::new()
    };

    let result = NeighborhoodResult {
        radius,
        points,
        reference,
        neighbor,
        other,
        classes,
        segments,
    };
    tracing::info!(radius, summary = %result.summary(), "neighborhood computed");
    Ok(NeighborhoodOutcome::Computed(result))
}

fn secondary_class(
    table: &ObservationTable,
    marker: &SecondaryMarker,
    neighbor: &[bool],
) -> Result<SecondaryClass, AnalysisError> {
    let members = if table.has_column(&marker.column) {
        table
            .positive(&marker.column)?
            .into_iter()
            .zip(neighbor)
            .map(|(m, n)| m && *n)
            .collect()
    } else {
        tracing::debug!(column = %marker.column, "secondary marker column absent");
        vec![false; neighbor.len()]
    };
    Ok(SecondaryClass {
        name: marker.name.clone(),
        column: marker.column.clone(),
        members,
    })
}
