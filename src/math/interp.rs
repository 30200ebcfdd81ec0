//! Interpolation and integration on tabulated curves.
//!
//! Two interpolation flavors are needed:
//!
//! - `interp_conserve`: flux-conserving resampling. Each output sample is the mean
//!   of the piecewise-linear source curve over that sample's bin, so narrow
//!   features (emission lines) keep their integrated flux when the output grid is
//!   coarser than the source grid.
//! - `interp_linear`: plain point sampling with end clamping, used for priors and
//!   for summing templates on a shared grid.
//!
//! All source abscissae are assumed sorted ascending.

/// Resample `(src_wave, src_flux)` onto `wave` conserving flux.
///
/// Bin edges are the midpoints between neighboring output samples, with the
/// first and last bins mirrored about their centers. The source is treated as
/// zero outside its own support.
pub fn interp_conserve(wave: &[f64], src_wave: &[f64], src_flux: &[f64]) -> Vec<f64> {
    let n = wave.len();
    if n == 0 || src_wave.is_empty() || src_wave.len() != src_flux.len() {
        return vec![0.0; n];
    }
    if same_grid(wave, src_wave) {
        return src_flux.to_vec();
    }
    if n == 1 {
        return vec![linear_or_zero(wave[0], src_wave, src_flux)];
    }

    let edges = bin_edges(wave);
    edges
        .windows(2)
        .map(|e| {
            let width = e[1] - e[0];
            if width <= 0.0 {
                return 0.0;
            }
            integrate_linear(src_wave, src_flux, e[0], e[1]) / width
        })
        .collect()
}

/// Edges of the bins centered on each sample of `wave` (length `n + 1`).
pub fn bin_edges(wave: &[f64]) -> Vec<f64> {
    let n = wave.len();
    let mut edges = Vec::with_capacity(n + 1);
    if n == 0 {
        return edges;
    }
    if n == 1 {
        edges.push(wave[0]);
        edges.push(wave[0]);
        return edges;
    }
    edges.push(wave[0] - 0.5 * (wave[1] - wave[0]));
    for w in wave.windows(2) {
        edges.push(0.5 * (w[0] + w[1]));
    }
    edges.push(wave[n - 1] + 0.5 * (wave[n - 1] - wave[n - 2]));
    edges
}

/// Exact integral of the piecewise-linear curve `(x, y)` over `[lo, hi]`,
/// treating the curve as zero outside `[x[0], x[last]]`.
pub fn integrate_linear(x: &[f64], y: &[f64], lo: f64, hi: f64) -> f64 {
    if x.is_empty() {
        return 0.0;
    }
    let a = lo.max(x[0]);
    let b = hi.min(x[x.len() - 1]);
    if !(b > a) {
        return 0.0;
    }

    let start = x.partition_point(|&v| v <= a);
    let mut prev_x = a;
    let mut prev_y = linear_or_zero(a, x, y);
    let mut total = 0.0;
    for k in start..x.len() {
        if x[k] >= b {
            break;
        }
        total += 0.5 * (prev_y + y[k]) * (x[k] - prev_x);
        prev_x = x[k];
        prev_y = y[k];
    }
    let end_y = linear_or_zero(b, x, y);
    total + 0.5 * (prev_y + end_y) * (b - prev_x)
}

/// Linear interpolation with the end values held constant outside the table.
pub fn interp_linear(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    if xp.is_empty() {
        return f64::NAN;
    }
    let last = xp.len() - 1;
    if x <= xp[0] {
        return fp[0];
    }
    if x >= xp[last] {
        return fp[last];
    }
    segment(x, xp, fp)
}

/// Vectorized [`interp_linear`].
pub fn interp_linear_many(x: &[f64], xp: &[f64], fp: &[f64]) -> Vec<f64> {
    x.iter().map(|&v| interp_linear(v, xp, fp)).collect()
}

/// Trapezoid-rule integral of `y` sampled at `x`.
pub fn trapz(y: &[f64], x: &[f64]) -> f64 {
    x.windows(2)
        .zip(y.windows(2))
        .map(|(xw, yw)| 0.5 * (yw[0] + yw[1]) * (xw[1] - xw[0]))
        .sum()
}

/// Median spacing of a sampled grid (0 for fewer than two samples).
pub fn median_step(x: &[f64]) -> f64 {
    let mut steps: Vec<f64> = x.windows(2).map(|w| w[1] - w[0]).collect();
    if steps.is_empty() {
        return 0.0;
    }
    steps.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = steps.len() / 2;
    if steps.len() % 2 == 1 {
        steps[mid]
    } else {
        0.5 * (steps[mid - 1] + steps[mid])
    }
}

fn linear_or_zero(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    let last = xp.len() - 1;
    if x < xp[0] || x > xp[last] {
        return 0.0;
    }
    if x == xp[last] {
        return fp[last];
    }
    segment(x, xp, fp)
}

fn segment(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    let hi = xp.partition_point(|&v| v <= x).clamp(1, xp.len() - 1);
    let lo = hi - 1;
    let dx = xp[hi] - xp[lo];
    if dx <= 0.0 {
        return fp[lo];
    }
    let u = (x - xp[lo]) / dx;
    fp[lo] + u * (fp[hi] - fp[lo])
}

fn same_grid(a: &[f64], b: &[f64]) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b.iter())
            .all(|(x, y)| (x - y).abs() <= 1e-9 * x.abs().max(1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resampling_onto_the_source_grid_is_identity() {
        let wave: Vec<f64> = (0..50).map(|i| 1.0e4 + 20.0 * i as f64).collect();
        let flux: Vec<f64> = wave.iter().map(|w| (w / 700.0).sin() + 2.0).collect();

        let once = interp_conserve(&wave, &wave, &flux);
        let twice = interp_conserve(&wave, &wave, &once);
        for ((a, b), f) in once.iter().zip(twice.iter()).zip(flux.iter()) {
            assert!((a - f).abs() < 1e-12);
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn narrow_top_hat_keeps_integrated_flux_on_coarse_grid() {
        // Fine source grid with a 30 A wide top hat at 12000 A.
        let src_wave: Vec<f64> = (0..=400).map(|i| 11_900.0 + 0.5 * i as f64).collect();
        let src_flux: Vec<f64> = src_wave
            .iter()
            .map(|&w| if (11_985.0..=12_015.0).contains(&w) { 3.0 } else { 0.0 })
            .collect();
        let total_in = trapz(&src_flux, &src_wave);

        let coarse: Vec<f64> = (0..40).map(|i| 11_500.0 + 23.0 * i as f64).collect();
        let out = interp_conserve(&coarse, &src_wave, &src_flux);
        let edges = bin_edges(&coarse);
        let total_out: f64 = out
            .iter()
            .zip(edges.windows(2))
            .map(|(f, e)| f * (e[1] - e[0]))
            .sum();

        assert!((total_in - total_out).abs() < 1e-9 * total_in.abs().max(1.0));
        assert!(out.iter().filter(|v| **v > 0.0).count() <= 3);
    }

    #[test]
    fn resampling_outside_source_support_is_zero() {
        let out = interp_conserve(&[100.0, 110.0, 120.0], &[500.0, 600.0], &[1.0, 1.0]);
        assert_eq!(out, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn linear_interpolation_clamps_at_the_ends() {
        let xp = [0.0, 1.0, 2.0];
        let fp = [10.0, 20.0, 40.0];
        assert_eq!(interp_linear(-5.0, &xp, &fp), 10.0);
        assert_eq!(interp_linear(5.0, &xp, &fp), 40.0);
        assert!((interp_linear(1.5, &xp, &fp) - 30.0).abs() < 1e-12);
    }

    #[test]
    fn median_step_of_uniform_grid() {
        let x: Vec<f64> = (0..10).map(|i| 3.0 * i as f64).collect();
        assert!((median_step(&x) - 3.0).abs() < 1e-12);
        assert!((trapz(&[1.0; 10], &x) - 27.0).abs() < 1e-12);
    }
}
