//! Contour tracing: extract iso-level polylines from a density grid.
//!
//! This module defines the [`ContourTracer`] trait for pluggable contour
//! tracing algorithms and the [`ContourTracerKind`] enum for selecting
//! which algorithm to use at runtime.
//!
//! Coordinates follow the grid: `x` is the column and `y` the row, with
//! sample `(row, col)` located at integer coordinates. Closed contours
//! repeat their first vertex at the end; contours that reach the grid
//! border stay open.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::types::{DensityGrid, Point, Polyline};

/// Selects which contour tracing algorithm to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContourTracerKind {
    /// Marching squares with linear interpolation along cell edges.
    ///
    /// Saddle cells keep the low corners connected, so two diagonal high
    /// corners produce two separate segments.
    #[default]
    MarchingSquares,
}

/// Trait for contour tracing strategies.
///
/// Input: a scalar grid and an iso-level.
/// Output: the level-set polylines, one per connected contour.
pub trait ContourTracer {
    /// Trace the contours of `grid` at `level`.
    fn trace(&self, grid: &DensityGrid, level: f64) -> Vec<Polyline>;
}

impl ContourTracer for ContourTracerKind {
    fn trace(&self, grid: &DensityGrid, level: f64) -> Vec<Polyline> {
        match *self {
            Self::MarchingSquares => marching_squares(grid, level),
        }
    }
}

/// Identity of a grid edge crossed by the contour.
///
/// `Horizontal(r, c)` joins samples `(r, c)` and `(r, c + 1)`;
/// `Vertical(r, c)` joins `(r, c)` and `(r + 1, c)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum EdgeKey {
    Horizontal(u32, u32),
    Vertical(u32, u32),
}

/// A crossing node with its (at most two) neighbors.
struct Node {
    point: Point,
    links: Vec<EdgeKey>,
}

/// Fraction along `a -> b` where the value reaches `level`.
fn interpolate(a: f64, b: f64, level: f64) -> f64 {
    let span = b - a;
    if span == 0.0 { 0.5 } else { (level - a) / span }
}

fn marching_squares(grid: &DensityGrid, level: f64) -> Vec<Polyline> {
    let (w, h) = grid.dimensions();
    if w < 2 || h < 2 || !level.is_finite() {
        return Vec::new();
    }
    let value = |col: u32, row: u32| f64::from(grid.get_pixel(col, row).0[0]);

    let mut nodes: BTreeMap<EdgeKey, Node> = BTreeMap::new();
    let mut link = |a: (EdgeKey, Point), b: (EdgeKey, Point)| {
        for ((key, point), other) in [(a, b.0), (b, a.0)] {
            nodes
                .entry(key)
                .or_insert_with(|| Node {
                    point,
                    links: Vec::with_capacity(2),
                })
                .links
                .push(other);
        }
    };

    for r in 0..h - 1 {
        for c in 0..w - 1 {
            let ul = value(c, r);
            let ur = value(c + 1, r);
            let ll = value(c, r + 1);
            let lr = value(c + 1, r + 1);
            if ![ul, ur, ll, lr].iter().all(|v| v.is_finite()) {
                continue;
            }
            let case = u8::from(ul > level)
                | (u8::from(ur > level) << 1)
                | (u8::from(ll > level) << 2)
                | (u8::from(lr > level) << 3);
            if case == 0 || case == 15 {
                continue;
            }

            let (rf, cf) = (f64::from(r), f64::from(c));
            let top = (
                EdgeKey::Horizontal(r, c),
                Point::new(cf + interpolate(ul, ur, level), rf),
            );
            let bottom = (
                EdgeKey::Horizontal(r + 1, c),
                Point::new(cf + interpolate(ll, lr, level), rf + 1.0),
            );
            let left = (
                EdgeKey::Vertical(r, c),
                Point::new(cf, rf + interpolate(ul, ll, level)),
            );
            let right = (
                EdgeKey::Vertical(r, c + 1),
                Point::new(cf + 1.0, rf + interpolate(ur, lr, level)),
            );

            match case {
                1 | 14 => link(top, left),
                2 | 13 => link(top, right),
                3 | 12 => link(left, right),
                4 | 11 => link(left, bottom),
                5 | 10 => link(top, bottom),
                7 | 8 => link(right, bottom),
                6 => {
                    link(top, right);
                    link(left, bottom);
                }
                9 => {
                    link(top, left);
                    link(right, bottom);
                }
                _ => {}
            }
        }
    }

    assemble(&nodes)
}

/// Chain linked crossings into polylines. Open chains start from their
/// lowest-keyed endpoint; remaining cycles are closed explicitly.
fn assemble(nodes: &BTreeMap<EdgeKey, Node>) -> Vec<Polyline> {
    let mut visited: BTreeSet<EdgeKey> = BTreeSet::new();
    let mut paths = Vec::new();

    let endpoints = nodes
        .iter()
        .filter(|(_, n)| n.links.len() == 1)
        .map(|(k, _)| *k);
    let starts: Vec<EdgeKey> = endpoints.chain(nodes.keys().copied()).collect();

    for start in starts {
        if visited.contains(&start) {
            continue;
        }
        let mut points = Vec::new();
        let mut current = Some(start);
        while let Some(key) = current {
            visited.insert(key);
            let Some(node) = nodes.get(&key) else { break };
            points.push(node.point);
            current = node.links.iter().copied().find(|k| !visited.contains(k));
        }
        let closes = nodes
            .get(&start)
            .is_some_and(|n| n.links.len() == 2)
            && points.len() > 2;
        if closes {
            points.push(points[0]);
        }
        if points.len() >= 2 {
            paths.push(Polyline::new(points));
        }
    }
    paths
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use image::Luma;

    fn grid_from(rows: &[&[f32]]) -> DensityGrid {
        let h = u32::try_from(rows.len()).unwrap();
        let w = u32::try_from(rows[0].len()).unwrap();
        DensityGrid::from_fn(w, h, |x, y| Luma([rows[y as usize][x as usize]]))
    }

    #[test]
    fn default_is_marching_squares() {
        assert_eq!(
            ContourTracerKind::default(),
            ContourTracerKind::MarchingSquares
        );
    }

    #[test]
    fn flat_grid_has_no_contours() {
        let g = DensityGrid::new(10, 10);
        assert!(ContourTracerKind::MarchingSquares.trace(&g, 0.5).is_empty());
    }

    #[test]
    fn tiny_grid_has_no_contours() {
        let g = grid_from(&[&[1.0, 0.0, 1.0]]);
        assert!(ContourTracerKind::MarchingSquares.trace(&g, 0.5).is_empty());
    }

    #[test]
    fn single_peak_gives_closed_diamond() {
        let g = grid_from(&[
            &[0.0, 0.0, 0.0],
            &[0.0, 1.0, 0.0],
            &[0.0, 0.0, 0.0],
        ]);
        let paths = ContourTracerKind::MarchingSquares.trace(&g, 0.5);
        assert_eq!(paths.len(), 1);
        let path = &paths[0];
        assert!(path.is_closed());
        assert_eq!(path.len(), 5);
        // Crossings sit halfway between the peak and its 4-neighbors.
        let mut interior: Vec<(f64, f64)> = path.points()[..4]
            .iter()
            .map(|p| (p.x, p.y))
            .collect();
        interior.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(
            interior,
            vec![(0.5, 1.0), (1.0, 0.5), (1.0, 1.5), (1.5, 1.0)]
        );
    }

    #[test]
    fn interpolation_is_linear() {
        let g = grid_from(&[&[0.0, 1.0], &[0.0, 1.0]]);
        let paths = ContourTracerKind::MarchingSquares.trace(&g, 0.25);
        assert_eq!(paths.len(), 1);
        let path = &paths[0];
        assert!(!path.is_closed());
        for p in path.points() {
            assert!((p.x - 0.25).abs() < 1e-12);
        }
    }

    #[test]
    fn ridge_touching_border_stays_open() {
        let g = grid_from(&[
            &[0.0, 1.0, 0.0],
            &[0.0, 1.0, 0.0],
            &[0.0, 1.0, 0.0],
        ]);
        let paths = ContourTracerKind::MarchingSquares.trace(&g, 0.5);
        assert_eq!(paths.len(), 2);
        for path in &paths {
            assert!(!path.is_closed());
            assert_eq!(path.len(), 3);
        }
    }

    #[test]
    fn saddle_separates_high_corners() {
        let g = grid_from(&[&[1.0, 0.0], &[0.0, 1.0]]);
        let paths = ContourTracerKind::MarchingSquares.trace(&g, 0.5);
        assert_eq!(paths.len(), 2);
    }

    #[test]
    fn two_peaks_give_two_contours() {
        let mut g = DensityGrid::new(12, 6);
        g.put_pixel(2, 2, Luma([1.0]));
        g.put_pixel(8, 3, Luma([1.0]));
        let paths = ContourTracerKind::MarchingSquares.trace(&g, 0.5);
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().all(Polyline::is_closed));
    }

    #[test]
    fn tracing_is_deterministic() {
        let g = DensityGrid::from_fn(20, 20, |x, y| {
            let dx = f64::from(x) - 9.5;
            let dy = f64::from(y) - 9.5;
            #[allow(clippy::cast_possible_truncation)]
            let v = (-(dx * dx + dy * dy) / 30.0).exp() as f32;
            Luma([v])
        });
        let a = ContourTracerKind::MarchingSquares.trace(&g, 0.3);
        let b = ContourTracerKind::MarchingSquares.trace(&g, 0.3);
        assert_eq!(a, b);
        assert_eq!(a.len(), 1);
        assert!(a[0].is_closed());
    }
}
