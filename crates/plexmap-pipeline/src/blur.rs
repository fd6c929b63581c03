//! Gaussian smoothing of floating-point grids.
//!
//! Density maps need full `f32` precision and a mirror boundary, so the
//! filter is implemented here as a separable 1D convolution applied to
//! rows and then columns. The kernel is truncated at
//! [`TRUNCATE`] standard deviations and normalized to unit sum.
//!
//! Lines are convolved in scatter form: only non-zero samples contribute,
//! which keeps point-impulse grids (mostly zeros) cheap to smooth.

use crate::types::DensityGrid;

/// Kernel half-width in standard deviations.
pub const TRUNCATE: f64 = 4.0;

/// Normalized 1D Gaussian kernel of length `2 * radius + 1`.
///
/// The radius is `TRUNCATE * sigma + 0.5` truncated to an integer, so
/// exact halves round up. Non-positive sigma yields the identity kernel
/// `[1.0]`.
#[must_use]
pub fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    if sigma <= 0.0 || !sigma.is_finite() {
        return vec![1.0];
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let radius = TRUNCATE.mul_add(sigma, 0.5) as usize;
    let denom = 2.0 * sigma * sigma;
    let mut kernel: Vec<f64> = (0..=2 * radius)
        .map(|i| {
            #[allow(clippy::cast_precision_loss)]
            let d = i as f64 - radius as f64;
            (-(d * d) / denom).exp()
        })
        .collect();
    let sum: f64 = kernel.iter().sum();
    for w in &mut kernel {
        *w /= sum;
    }
    kernel
}

/// Map an index on the padded line back into `[0, n)` by mirror
/// reflection about the edges (`d c b a | a b c d | d c b a`).
#[must_use]
pub fn reflect_index(index: isize, n: usize) -> usize {
    #[allow(clippy::cast_possible_wrap)]
    let period = 2 * n as isize;
    let i = index.rem_euclid(period);
    #[allow(clippy::cast_sign_loss)]
    let i = i as usize;
    if i < n { i } else { period as usize - 1 - i }
}

/// Convolve one line with a symmetric kernel, writing into `out`.
///
/// `src` and `out` must have equal length.
pub fn convolve_line(src: &[f64], kernel: &[f64], out: &mut [f64]) {
    debug_assert_eq!(src.len(), out.len());
    out.fill(0.0);
    let n = src.len();
    if n == 0 {
        return;
    }
    let radius = kernel.len() / 2;
    #[allow(clippy::cast_possible_wrap)]
    let (n_i, r_i) = (n as isize, radius as isize);

    // Padded sample p (in -r..n+r) reads src[reflect(p)] and feeds
    // out[p - t] for every kernel offset t in -r..=r.
    for p in -r_i..n_i + r_i {
        let value = src[reflect_index(p, n)];
        if value == 0.0 {
            continue;
        }
        let lo = (p - r_i).max(0);
        let hi = (p + r_i).min(n_i - 1);
        for i in lo..=hi {
            #[allow(clippy::cast_sign_loss)]
            let w = kernel[(p - i + r_i) as usize];
            #[allow(clippy::cast_sign_loss)]
            let slot = &mut out[i as usize];
            *slot = w.mul_add(value, *slot);
        }
    }
}

/// Apply a Gaussian blur to a density grid.
///
/// Non-positive sigma values return the grid unchanged.
#[must_use = "returns the blurred grid"]
pub fn gaussian_blur(grid: &DensityGrid, sigma: f64) -> DensityGrid {
    if sigma <= 0.0 || !sigma.is_finite() {
        return grid.clone();
    }
    let kernel = gaussian_kernel(sigma);
    let (w, h) = (grid.width() as usize, grid.height() as usize);
    if w == 0 || h == 0 {
        return grid.clone();
    }

    let mut data: Vec<f64> = grid.as_raw().iter().map(|&v| f64::from(v)).collect();

    // Rows.
    let mut line = vec![0.0; w];
    for row in data.chunks_exact_mut(w) {
        if row.iter().all(|&v| v == 0.0) {
            continue;
        }
        convolve_line(row, &kernel, &mut line);
        row.copy_from_slice(&line);
    }

    // Columns.
    let mut column = vec![0.0; h];
    let mut smoothed = vec![0.0; h];
    for x in 0..w {
        for (y, slot) in column.iter_mut().enumerate() {
            *slot = data[y * w + x];
        }
        if column.iter().all(|&v| v == 0.0) {
            continue;
        }
        convolve_line(&column, &kernel, &mut smoothed);
        for (y, &v) in smoothed.iter().enumerate() {
            data[y * w + x] = v;
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    let raw: Vec<f32> = data.into_iter().map(|v| v as f32).collect();
    DensityGrid::from_raw(grid.width(), grid.height(), raw).unwrap_or_else(|| grid.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn impulse(w: u32, h: u32, x: u32, y: u32) -> DensityGrid {
        let mut g = DensityGrid::new(w, h);
        g.put_pixel(x, y, image::Luma([1.0]));
        g
    }

    #[test]
    fn kernel_is_normalized_and_symmetric() {
        let k = gaussian_kernel(2.0);
        assert_eq!(k.len(), 17);
        assert!((k.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        for i in 0..k.len() / 2 {
            assert!((k[i] - k[k.len() - 1 - i]).abs() < 1e-15);
        }
        assert!(k[8] > k[7]);
    }

    #[test]
    fn kernel_radius_truncates_after_adding_half() {
        // 4 * 0.1 + 0.5 = 0.9
        assert_eq!(gaussian_kernel(0.1), vec![1.0]);
        // 4 * 0.3 + 0.5 = 1.7
        assert_eq!(gaussian_kernel(0.3).len(), 3);
        // 4 * 0.375 + 0.5 = 2.0
        assert_eq!(gaussian_kernel(0.375).len(), 5);
    }

    #[test]
    fn zero_sigma_kernel_is_identity() {
        assert_eq!(gaussian_kernel(0.0), vec![1.0]);
        assert_eq!(gaussian_kernel(-3.0), vec![1.0]);
    }

    #[test]
    fn reflect_index_mirrors_edges() {
        assert_eq!(reflect_index(-1, 4), 0);
        assert_eq!(reflect_index(-2, 4), 1);
        assert_eq!(reflect_index(4, 4), 3);
        assert_eq!(reflect_index(5, 4), 2);
        assert_eq!(reflect_index(2, 4), 2);
        // Multiple reflections for kernels wider than the line.
        assert_eq!(reflect_index(9, 4), 1);
        assert_eq!(reflect_index(-9, 4), 0);
    }

    #[test]
    fn line_convolution_preserves_mass() {
        let kernel = gaussian_kernel(1.5);
        let mut src = vec![0.0; 30];
        src[15] = 2.0;
        let mut out = vec![0.0; 30];
        convolve_line(&src, &kernel, &mut out);
        assert!((out.iter().sum::<f64>() - 2.0).abs() < 1e-9);
        assert!(out[15] > out[14] && out[14] > out[13]);
        assert!((out[14] - out[16]).abs() < 1e-12);
    }

    #[test]
    fn line_convolution_keeps_mass_at_the_edge() {
        // Mirror boundary folds mass back in rather than losing it.
        let kernel = gaussian_kernel(3.0);
        let mut src = vec![0.0; 10];
        src[0] = 1.0;
        let mut out = vec![0.0; 10];
        convolve_line(&src, &kernel, &mut out);
        assert!((out.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn zero_sigma_returns_identical_grid() {
        let g = impulse(5, 5, 2, 2);
        assert_eq!(gaussian_blur(&g, 0.0), g);
        assert_eq!(gaussian_blur(&g, -1.0), g);
    }

    #[test]
    fn blur_spreads_impulse_symmetrically() {
        let g = gaussian_blur(&impulse(21, 21, 10, 10), 2.0);
        let center = g.get_pixel(10, 10).0[0];
        let left = g.get_pixel(8, 10).0[0];
        let right = g.get_pixel(12, 10).0[0];
        let up = g.get_pixel(10, 8).0[0];
        assert!(center > left);
        assert!((left - right).abs() < 1e-7);
        assert!((left - up).abs() < 1e-7);
        let total: f32 = g.as_raw().iter().sum();
        assert!((total - 1.0).abs() < 1e-4);
    }

    #[test]
    fn output_dimensions_preserved() {
        let g = gaussian_blur(&DensityGrid::new(17, 31), 1.4);
        assert_eq!((g.width(), g.height()), (17, 31));
    }

    #[test]
    fn kernel_wider_than_grid_is_handled() {
        let g = gaussian_blur(&impulse(3, 2, 0, 0), 50.0);
        assert!(g.as_raw().iter().all(|v| v.is_finite() && *v > 0.0));
    }
}
