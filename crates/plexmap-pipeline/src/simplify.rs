//! Path simplification using the Ramer-Douglas-Peucker algorithm.
//!
//! Reduces point count in boundary paths by removing points that are
//! within a given tolerance of the chord between retained neighbors.
//! Endpoints are always kept, so closed contours stay closed.
//!
//! The recursion is driven by an explicit stack: contours traced from
//! large density grids can run to hundreds of thousands of vertices.

use crate::types::{Point, Polyline};

/// Simplify a single polyline using the Ramer-Douglas-Peucker algorithm.
///
/// Points within `tolerance` pixels of the chord between their retained
/// neighbors are removed. A tolerance of 0.0 removes only exactly
/// collinear points.
///
/// Polylines with fewer than 3 points are returned unchanged.
#[must_use = "returns the simplified polyline"]
pub fn simplify(polyline: &Polyline, tolerance: f64) -> Polyline {
    let points = polyline.points();
    if points.len() < 3 {
        return polyline.clone();
    }

    let mut kept = vec![false; points.len()];
    kept[0] = true;
    kept[points.len() - 1] = true;

    let mut spans = vec![(0, points.len() - 1)];
    while let Some((start, end)) = spans.pop() {
        if end <= start + 1 {
            continue;
        }
        let (max_idx, max_dist) = farthest_from_chord(points, start, end);
        if max_dist > tolerance {
            kept[max_idx] = true;
            spans.push((start, max_idx));
            spans.push((max_idx, end));
        }
    }

    let simplified: Vec<Point> = points
        .iter()
        .zip(&kept)
        .filter(|&(_, k)| *k)
        .map(|(&p, _)| p)
        .collect();

    Polyline::new(simplified)
}

/// Simplify multiple polylines, applying RDP to each independently.
#[must_use = "returns the simplified polylines"]
pub fn simplify_paths(polylines: &[Polyline], tolerance: f64) -> Vec<Polyline> {
    polylines.iter().map(|pl| simplify(pl, tolerance)).collect()
}

/// Index and distance of the interior point farthest from the chord
/// `points[start] -> points[end]`.
fn farthest_from_chord(points: &[Point], start: usize, end: usize) -> (usize, f64) {
    let mut max_dist = 0.0;
    let mut max_idx = start;
    for (i, &p) in points.iter().enumerate().take(end).skip(start + 1) {
        let d = perpendicular_distance(p, points[start], points[end]);
        if d > max_dist {
            max_dist = d;
            max_idx = i;
        }
    }
    (max_idx, max_dist)
}

/// Perpendicular distance from point `p` to the line defined by `a` and `b`.
///
/// When `a` and `b` coincide (a closed contour's endpoints), returns the
/// distance from `p` to `a`.
fn perpendicular_distance(p: Point, a: Point, b: Point) -> f64 {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let length_sq = dx.mul_add(dx, dy * dy);

    if length_sq == 0.0 {
        return p.distance(a);
    }

    let cross = dx.mul_add(a.y - p.y, -(dy * (a.x - p.x)));
    cross.abs() / length_sq.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_ring(side: usize) -> Polyline {
        // Closed ring walking the perimeter of a side x side square, one
        // vertex per unit step.
        #[allow(clippy::cast_precision_loss)]
        let s = side as f64;
        let mut pts = Vec::new();
        for i in 0..side {
            #[allow(clippy::cast_precision_loss)]
            let t = i as f64;
            pts.push(Point::new(t, 0.0));
        }
        for i in 0..side {
            #[allow(clippy::cast_precision_loss)]
            let t = i as f64;
            pts.push(Point::new(s, t));
        }
        for i in 0..side {
            #[allow(clippy::cast_precision_loss)]
            let t = i as f64;
            pts.push(Point::new(s - t, s));
        }
        for i in 0..side {
            #[allow(clippy::cast_precision_loss)]
            let t = i as f64;
            pts.push(Point::new(0.0, s - t));
        }
        pts.push(Point::new(0.0, 0.0));
        Polyline::new(pts)
    }

    #[test]
    fn short_polylines_unchanged() {
        assert!(simplify(&Polyline::new(vec![]), 1.0).is_empty());
        let two = Polyline::new(vec![Point::new(0.0, 0.0), Point::new(10.0, 0.0)]);
        assert_eq!(simplify(&two, 1.0), two);
    }

    #[test]
    fn zero_tolerance_keeps_bends() {
        let pl = Polyline::new(vec![
            Point::new(0.0, 0.0),
            Point::new(1.0, 0.1),
            Point::new(2.0, 0.0),
            Point::new(3.0, 0.05),
            Point::new(4.0, 0.0),
        ]);
        assert_eq!(simplify(&pl, 0.0).len(), 5);
    }

    #[test]
    fn collinear_points_collapse_to_endpoints() {
        let pl = Polyline::new(vec![
            Point::new(0.0, 0.0),
            Point::new(1.0, 1.0),
            Point::new(2.0, 2.0),
            Point::new(3.0, 3.0),
            Point::new(4.0, 4.0),
        ]);
        let result = simplify(&pl, 0.1);
        assert_eq!(
            result.points(),
            &[Point::new(0.0, 0.0), Point::new(4.0, 4.0)]
        );
    }

    #[test]
    fn tolerance_decides_zigzag_peaks() {
        let pl = Polyline::new(vec![
            Point::new(0.0, 0.0),
            Point::new(2.0, 5.0),
            Point::new(4.0, 0.0),
            Point::new(6.0, 5.0),
            Point::new(8.0, 0.0),
        ]);
        assert_eq!(simplify(&pl, 1.0).len(), 5);
        assert_eq!(simplify(&pl, 10.0).len(), 2);
    }

    #[test]
    fn closed_ring_reduces_to_corners() {
        let ring = square_ring(10);
        assert!(ring.is_closed());
        let result = simplify(&ring, 0.5);
        assert!(result.is_closed());
        // Four corners plus the repeated start.
        assert_eq!(result.len(), 5);
    }

    #[test]
    fn long_path_does_not_exhaust_the_stack() {
        #[allow(clippy::cast_precision_loss)]
        let pts: Vec<Point> = (0..200_000)
            .map(|i| Point::new(i as f64, if i % 2 == 0 { 0.0 } else { 3.0 }))
            .collect();
        let result = simplify(&Polyline::new(pts), 1.0);
        assert!(result.len() > 100_000);
        assert_eq!(result.points()[0], Point::new(0.0, 0.0));
        assert_eq!(result.points()[result.len() - 1], Point::new(199_999.0, 3.0));
    }

    #[test]
    fn simplify_paths_applies_to_each() {
        let polylines = vec![
            Polyline::new(vec![
                Point::new(0.0, 0.0),
                Point::new(1.0, 1.0),
                Point::new(2.0, 2.0),
            ]),
            Polyline::new(vec![
                Point::new(0.0, 0.0),
                Point::new(1.0, 5.0),
                Point::new(2.0, 0.0),
            ]),
        ];
        let results = simplify_paths(&polylines, 0.5);
        assert_eq!(results[0].len(), 2);
        assert_eq!(results[1].len(), 3);
    }

    #[test]
    fn perpendicular_distance_diagonal_segment() {
        let d = perpendicular_distance(
            Point::new(2.0, -1.0),
            Point::new(0.0, 0.0),
            Point::new(4.0, 2.0),
        );
        let expected = 8.0 / 20.0_f64.sqrt();
        assert!((d - expected).abs() < 1e-10, "got {d}, expected {expected}");
    }

    #[test]
    fn perpendicular_distance_coincident_endpoints() {
        let d = perpendicular_distance(
            Point::new(3.0, 4.0),
            Point::new(0.0, 0.0),
            Point::new(0.0, 0.0),
        );
        assert!((d - 5.0).abs() < 1e-10);
    }
}
