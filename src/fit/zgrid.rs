//! Redshift scan: coarse grid, iterative refinement, final line fit.
//!
//! The scan is a small state machine:
//!
//! ```text
//! CoarseScan -> Refine(1..=6) -> Finalize -> Done
//! ```
//!
//! Grid points are only ever added. Each refinement level centers a
//! ±4-step logarithmic grid on the best point of the previous level, with the
//! step shrinking by 2.02 per level. Grid evaluations are independent and run
//! in parallel.

use log::{debug, info};
use rayon::prelude::*;

use crate::domain::{FitMode, Prior};
use crate::error::AppError;
use crate::fit::joint::{JointFitter, ZFit};
use crate::fit::scale::ScaleMinimizer;
use crate::math::{argmin, log_zgrid, trapz};
use crate::spectrum::TemplateStore;

pub const REFINE_ITERATIONS: usize = 6;
pub const REFINE_FACTOR: f64 = 2.02;
pub const REFINE_HALF_WIDTH: f64 = 4.0;

/// Chi-squared excess at which `area25` saturates.
pub const AREA_CLIP: f64 = 25.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ScanOptions {
    /// Coarse step in `ln(1+z)`.
    pub dz0: f64,
    pub z_min: f64,
    pub z_max: f64,
    pub prior: Option<Prior>,
    /// Outlier rejection threshold in sigma; `None` disables it.
    pub outlier_threshold: Option<f64>,
    pub mode: FitMode,
    /// Scale polynomial order, photometry-joint mode only.
    pub scale_order: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            dz0: 0.005,
            z_min: 0.4,
            z_max: 3.4,
            prior: None,
            outlier_threshold: None,
            mode: FitMode::Spectra,
            scale_order: 0,
        }
    }
}

/// Outcome of a completed scan.
#[derive(Debug, Clone)]
pub struct ScanResult {
    /// Sorted redshifts.
    pub z: Vec<f64>,
    /// Chi-squared at `z`, prior included.
    pub chi2: Vec<f64>,
    /// Prior at `z`, when one was supplied.
    pub prior: Option<Vec<f64>>,
    pub z_best: f64,
    /// Individual-line fit at `z_best`, with uncertainties.
    pub best: ZFit,
    /// Degrees of freedom after outlier rejection.
    pub dof: usize,
    pub area25: f64,
    pub outliers_masked: usize,
    /// Scale polynomial shared by every grid point in combined mode.
    pub scale: Option<Vec<f64>>,
}

impl ScanResult {
    pub fn chi2_min(&self) -> f64 {
        self.chi2.iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn chi2_max(&self) -> f64 {
        self.chi2.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }
}

#[derive(Debug)]
enum ScanState {
    CoarseScan,
    Refine { level: usize, center: f64 },
    Finalize,
    Done(Box<ScanResult>),
}

struct Scan<'a> {
    store: &'a dyn TemplateStore,
    opts: &'a ScanOptions,
    minimizer: &'a dyn ScaleMinimizer,
    z: Vec<f64>,
    chi2: Vec<f64>,
    scale: Option<Vec<f64>>,
}

/// Run the full scan. The fit mask of `fitter` is narrowed permanently when
/// outlier rejection is enabled.
pub fn fit_zgrid(
    fitter: &mut JointFitter,
    store: &dyn TemplateStore,
    opts: &ScanOptions,
    minimizer: &dyn ScaleMinimizer,
) -> Result<ScanResult, AppError> {
    if !(opts.dz0.is_finite() && opts.dz0 > 0.0) {
        return Err(AppError::input(format!("Redshift step must be > 0, got {}.", opts.dz0)));
    }
    if opts.mode == FitMode::Combined && !fitter.has_photometry() {
        return Err(AppError::input("Combined fit mode requires photometry."));
    }
    if let Some(prior) = &opts.prior {
        prior.validate()?;
    }

    let mut scan = Scan {
        store,
        opts,
        minimizer,
        z: Vec::new(),
        chi2: Vec::new(),
        scale: None,
    };
    let mut state = ScanState::CoarseScan;
    loop {
        state = match state {
            ScanState::CoarseScan => {
                let grid = log_zgrid(opts.z_min, opts.z_max, opts.dz0)?;
                let chi2 = scan.evaluate(fitter, &grid)?;
                scan.extend(&grid, &chi2);
                let center = scan.best_of(&grid, &chi2)?;
                ScanState::Refine { level: 1, center }
            }
            ScanState::Refine { level, center } if level <= REFINE_ITERATIONS => {
                let grid = refine_grid(center, opts.dz0, level)?;
                let chi2 = scan.evaluate(fitter, &grid)?;
                scan.extend(&grid, &chi2);
                let center = scan.best_of(&grid, &chi2)?;
                debug!("refine {level}: center z={center:.5}");
                ScanState::Refine { level: level + 1, center }
            }
            ScanState::Refine { .. } => ScanState::Finalize,
            ScanState::Finalize => ScanState::Done(Box::new(scan.finalize(fitter)?)),
            ScanState::Done(result) => return Ok(*result),
        };
    }
}

/// Grid of refinement level `level` (1-based) around `center`, with step
/// `dz0 / 2.02^level`.
pub fn refine_grid(center: f64, dz0: f64, level: usize) -> Result<Vec<f64>, AppError> {
    let dz = dz0 / REFINE_FACTOR.powi(level as i32);
    log_zgrid(center - REFINE_HALF_WIDTH * dz, center + REFINE_HALF_WIDTH * dz, dz)
}

impl Scan<'_> {
    /// Chi-squared at each grid point, in grid order.
    fn evaluate(&mut self, fitter: &JointFitter, grid: &[f64]) -> Result<Vec<f64>, AppError> {
        if grid.is_empty() {
            return Err(AppError::insufficient("Empty redshift grid."));
        }
        let chi2: Vec<f64> = match self.opts.mode {
            FitMode::Spectra => {
                let templates = self.store.complexes();
                grid.par_iter()
                    .map(|&z| fitter.fit_at_z(z, templates, false).map(|f| f.chi2))
                    .collect::<Result<Vec<_>, _>>()?
            }
            FitMode::Combined => {
                let order = self.opts.scale_order;
                let mut start = 0;
                let mut out = Vec::with_capacity(grid.len());
                if self.scale.is_none() {
                    let first = fitter.fit_combined_at_z(grid[0], order, None, self.minimizer, false)?;
                    self.scale = first.scale.clone();
                    out.push(first.chi2);
                    start = 1;
                }
                let scale = self.scale.as_deref();
                let rest = grid[start..]
                    .par_iter()
                    .map(|&z| fitter.fit_combined_at_z(z, order, scale, self.minimizer, false).map(|f| f.chi2))
                    .collect::<Result<Vec<_>, _>>()?;
                out.extend(rest);
                out
            }
        };
        for (z, c) in grid.iter().zip(chi2.iter()) {
            debug!("z={z:.5} chi2={c:.3}");
        }
        Ok(chi2)
    }

    fn extend(&mut self, grid: &[f64], chi2: &[f64]) {
        self.z.extend_from_slice(grid);
        self.chi2.extend_from_slice(chi2);
    }

    fn prior_at(&self, z: f64) -> f64 {
        self.opts.prior.as_ref().map_or(0.0, |p| p.at(z))
    }

    /// Redshift of the lowest `chi2 + prior` within one grid level.
    fn best_of(&self, grid: &[f64], chi2: &[f64]) -> Result<f64, AppError> {
        let total: Vec<f64> = grid.iter().zip(chi2.iter()).map(|(&z, &c)| c + self.prior_at(z)).collect();
        argmin(&total)
            .map(|i| grid[i])
            .ok_or_else(|| AppError::numerical("Chi-squared is non-finite over the whole grid."))
    }

    fn finalize(&mut self, fitter: &mut JointFitter) -> Result<ScanResult, AppError> {
        let mut pairs: Vec<(f64, f64)> = self.z.iter().copied().zip(self.chi2.iter().copied()).collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
        pairs.dedup_by(|a, b| a.0 == b.0);

        let z: Vec<f64> = pairs.iter().map(|p| p.0).collect();
        let prior: Option<Vec<f64>> = self.opts.prior.as_ref().map(|p| z.iter().map(|&zi| p.at(zi)).collect());
        let chi2: Vec<f64> = match &prior {
            Some(pz) => pairs.iter().zip(pz.iter()).map(|(p, q)| p.1 + q).collect(),
            None => pairs.iter().map(|p| p.1).collect(),
        };

        let ibest = argmin(&chi2).ok_or_else(|| AppError::numerical("No finite chi-squared in the redshift scan."))?;
        let z_best = z[ibest];
        let best = fitter.fit_at_z(z_best, self.store.lines(), true)?;

        let outliers_masked = match self.opts.outlier_threshold {
            Some(threshold) if threshold > 0.0 => mask_outliers(fitter, &best, threshold),
            _ => 0,
        };

        let area25 = area_under_curve_fraction(&z, &chi2);
        info!(
            "Best redshift z={z_best:.5} chi2={:.2} dof={} area25={area25:.3}",
            best.chi2,
            fitter.dof()
        );

        Ok(ScanResult {
            z,
            chi2,
            prior,
            z_best,
            best,
            dof: fitter.dof(),
            area25,
            outliers_masked,
            scale: self.scale.take(),
        })
    }
}

/// Permanently mask spectroscopic pixels with `residual · √ivar >= threshold`.
fn mask_outliers(fitter: &mut JointFitter, fit: &ZFit, threshold: f64) -> usize {
    let n_spec = fitter.n_spec();
    let keep: Vec<bool> = (0..fitter.len())
        .map(|i| {
            if i >= n_spec {
                return true;
            }
            let resid = fitter.scif()[i] - fit.model[i] - fit.background[i];
            resid * fitter.sivarf()[i] < threshold
        })
        .collect();
    let removed = fitter.narrow_fit_mask(&keep);
    info!("Outlier mask: {removed} pixels above {threshold} sigma");
    removed
}

/// `1 - ∫ clip(chi2 - chi2_min, 0, 25) dz / ∫ 25 dz`.
pub fn area_under_curve_fraction(z: &[f64], chi2: &[f64]) -> f64 {
    if z.len() < 2 {
        return 0.0;
    }
    let min = chi2.iter().copied().filter(|c| c.is_finite()).fold(f64::INFINITY, f64::min);
    let clipped: Vec<f64> = chi2.iter().map(|c| (c - min).clamp(0.0, AREA_CLIP)).collect();
    let reference = vec![AREA_CLIP; z.len()];
    let denom = trapz(&reference, z);
    if denom <= 0.0 {
        return 0.0;
    }
    1.0 - trapz(&clipped, z) / denom
}
