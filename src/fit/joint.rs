//! Joint fitting system over all exposures (and optional photometry).
//!
//! Every exposure's flattened pixels are copied into one contiguous arena. The
//! slice table maps each exposure to its range; photometry, when present, sits
//! after the last slice. For a trial redshift the fitter builds one design row
//! per template, stacks the per-exposure background indicator rows above them
//! and solves
//!
//! ```text
//! min ‖ (Aᵀ c - (d + pedestal)) · √ivar ‖²   subject to   c ≥ 0
//! ```
//!
//! over the fit mask. The additive pedestal keeps small or negative
//! backgrounds reachable under the non-negativity constraint and is removed
//! from the recovered background afterwards.

use std::ops::Range;
use std::sync::Arc;

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};

use crate::error::AppError;
use crate::exposure::ExposureUnit;
use crate::fit::photometry::{PhotometricCatalog, PhotometryBlock};
use crate::fit::scale::{ScaleMinimizer, initial_scale, poly_scale};
use crate::math::{covariance_std_errors, nnls};
use crate::spectrum::{IgmTransmission, Template};

/// Additive data offset removed again from the fitted background.
pub const PEDESTAL: f64 = 0.04;

/// IGM transmission is applied above this redshift when photometry is fit.
pub const IGM_REDSHIFT: f64 = 7.0;

/// Options for assembling the joint system.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JointOptions {
    /// `false` fits individual position angles and masks their overlaps.
    pub fit_stacks: bool,
    /// Overlap masking threshold, in units of the pixel sigma.
    pub overlap_threshold: f64,
    /// Joint inverse-variance floor, as a fraction of its maximum.
    pub min_ivar: f64,
}

impl Default for JointOptions {
    fn default() -> Self {
        Self {
            fit_stacks: true,
            overlap_threshold: 3.0,
            min_ivar: 0.01,
        }
    }
}

/// Fit at one redshift.
#[derive(Debug, Clone, PartialEq)]
pub struct ZFit {
    pub z: f64,
    pub chi2: f64,
    /// Background over the joint vector (zero on photometry).
    pub background: Vec<f64>,
    /// Template model over the joint vector.
    pub model: Vec<f64>,
    /// One coefficient per exposure background.
    pub background_coeffs: Vec<f64>,
    /// One coefficient per template.
    pub coeffs: Vec<f64>,
    /// Standard errors matching `coeffs`; zero unless requested.
    pub errors: Vec<f64>,
    /// Scale polynomial used, photometry-joint fits only.
    pub scale: Option<Vec<f64>>,
}

struct Photometry {
    catalog: Arc<dyn PhotometricCatalog>,
    block: PhotometryBlock,
}

pub struct JointFitter {
    exposures: Vec<ExposureUnit>,
    slices: Vec<Range<usize>>,
    coverage: Vec<Option<(f64, f64)>>,
    n_spec: usize,
    scif: Vec<f64>,
    ivarf: Vec<f64>,
    sivarf: Vec<f64>,
    wavef: Vec<f64>,
    weightf: Vec<f64>,
    fit_mask: Vec<bool>,
    dof: usize,
    background_design: DMatrix<f64>,
    photometry: Option<Photometry>,
    igm: Option<Arc<dyn IgmTransmission>>,
}

impl JointFitter {
    /// Build the joint system. Degenerate exposures are dropped; at least one
    /// usable exposure must remain.
    pub fn new(
        exposures: Vec<ExposureUnit>,
        opts: &JointOptions,
        catalog: Option<Arc<dyn PhotometricCatalog>>,
        igm: Option<Arc<dyn IgmTransmission>>,
    ) -> Result<Self, AppError> {
        let mut exposures: Vec<ExposureUnit> = exposures
            .into_iter()
            .filter(|e| {
                let degenerate = e.is_degenerate();
                if degenerate {
                    warn!("Excluding exposure {}: degenerate dispersion kernel.", e.tag());
                }
                !degenerate
            })
            .collect();
        if exposures.is_empty() {
            return Err(AppError::insufficient("No usable exposures to fit."));
        }

        if !opts.fit_stacks {
            mask_drizzle_overlaps(&mut exposures, opts.overlap_threshold)?;
        }

        let mut slices = Vec::with_capacity(exposures.len());
        let mut scif = Vec::new();
        let mut ivarf = Vec::new();
        let mut wavef = Vec::new();
        let mut weightf = Vec::new();
        let mut fit_mask = Vec::new();
        for e in &exposures {
            let start = scif.len();
            scif.extend_from_slice(e.sci());
            wavef.extend_from_slice(e.wavef());
            weightf.extend_from_slice(e.weight());
            fit_mask.extend_from_slice(e.fit_mask());
            ivarf.extend(e.ivar().iter().zip(e.weight().iter()).map(|(v, w)| v * w));
            slices.push(start..scif.len());
        }
        let n_spec = scif.len();

        let ivar_max = ivarf
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(f64::NEG_INFINITY, f64::max);
        for (m, v) in fit_mask.iter_mut().zip(ivarf.iter()) {
            *m &= *v >= opts.min_ivar * ivar_max;
        }

        let background_design = DMatrix::from_fn(exposures.len(), n_spec, |e, i| {
            if slices[e].contains(&i) { 1.0 } else { 0.0 }
        });
        let coverage = exposures.iter().map(ExposureUnit::coverage).collect();

        let photometry = match catalog {
            Some(catalog) => match PhotometryBlock::from_catalog(catalog.as_ref()) {
                Some(block) => {
                    for (f, e) in block.flux().iter().zip(block.error().iter()) {
                        scif.push(*f);
                        ivarf.push(1.0 / (e * e));
                    }
                    wavef.extend_from_slice(block.wave());
                    weightf.extend(std::iter::repeat_n(1.0, block.len()));
                    fit_mask.extend(std::iter::repeat_n(true, block.len()));
                    info!("Joint fit includes {} photometric bands.", block.len());
                    Some(Photometry { catalog, block })
                }
                None => {
                    warn!("Photometric catalog has no observed bands; fitting spectra only.");
                    None
                }
            },
            None => None,
        };

        let sivarf = ivarf.iter().map(|v| v.sqrt()).collect();
        let mut fitter = Self {
            exposures,
            slices,
            coverage,
            n_spec,
            scif,
            ivarf,
            sivarf,
            wavef,
            weightf,
            fit_mask,
            dof: 0,
            background_design,
            photometry,
            igm,
        };
        fitter.dof = fitter.weighted_dof();
        if fitter.fit_mask.iter().all(|m| !m) {
            return Err(AppError::insufficient("No unmasked pixels in the joint system."));
        }
        Ok(fitter)
    }

    pub fn exposures(&self) -> &[ExposureUnit] {
        &self.exposures
    }

    /// Range of each exposure in the joint vector, in exposure order.
    pub fn slices(&self) -> &[Range<usize>] {
        &self.slices
    }

    /// Length of the spectroscopic part of the joint vector.
    pub fn n_spec(&self) -> usize {
        self.n_spec
    }

    pub fn n_phot(&self) -> usize {
        self.photometry.as_ref().map_or(0, |p| p.block.len())
    }

    pub fn len(&self) -> usize {
        self.scif.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scif.is_empty()
    }

    pub fn has_photometry(&self) -> bool {
        self.photometry.is_some()
    }

    pub fn scif(&self) -> &[f64] {
        &self.scif
    }

    /// Weighted inverse variance.
    pub fn ivarf(&self) -> &[f64] {
        &self.ivarf
    }

    pub fn sivarf(&self) -> &[f64] {
        &self.sivarf
    }

    pub fn wavef(&self) -> &[f64] {
        &self.wavef
    }

    pub fn fit_mask(&self) -> &[bool] {
        &self.fit_mask
    }

    pub fn dof(&self) -> usize {
        self.dof
    }

    /// Background indicator rows `(exposures × spectroscopic pixels)`.
    pub fn background_design(&self) -> &DMatrix<f64> {
        &self.background_design
    }

    /// Remove pixels where `keep` is false from the joint and per-exposure
    /// masks, then recompute the degrees of freedom.
    pub fn narrow_fit_mask(&mut self, keep: &[bool]) -> usize {
        let mut removed = 0;
        for (m, &k) in self.fit_mask.iter_mut().zip(keep.iter()) {
            if *m && !k {
                *m = false;
                removed += 1;
            }
        }
        for (e, range) in self.exposures.iter_mut().zip(self.slices.iter()) {
            e.narrow_fit_mask(&keep[range.clone()]);
        }
        self.dof = self.weighted_dof();
        removed
    }

    fn weighted_dof(&self) -> usize {
        self.fit_mask
            .iter()
            .zip(self.weightf.iter())
            .filter(|(m, _)| **m)
            .map(|(_, w)| w)
            .sum::<f64>() as usize
    }

    /// Spectra-only fit of `templates` at redshift `z`. Photometry, if
    /// loaded, is left out of both the design and the chi-squared.
    pub fn fit_at_z(&self, z: f64, templates: &[Template], uncertainties: bool) -> Result<ZFit, AppError> {
        let design = self.template_design(z, templates, false)?;
        let mut mask = self.fit_mask.clone();
        for m in mask.iter_mut().skip(self.n_spec) {
            *m = false;
        }
        self.solve(z, &design, &mask, None, uncertainties)
    }

    /// Joint fit of spectra and photometry with the catalog's templates.
    ///
    /// With `scale = None` the scale polynomial of the given order is fit
    /// first with `minimizer`; otherwise the supplied coefficients are used.
    pub fn fit_combined_at_z(
        &self,
        z: f64,
        order: usize,
        scale: Option<&[f64]>,
        minimizer: &dyn ScaleMinimizer,
        uncertainties: bool,
    ) -> Result<ZFit, AppError> {
        let phot = self
            .photometry
            .as_ref()
            .ok_or_else(|| AppError::input("Combined fit requires photometry."))?;
        let templates = phot.catalog.templates();
        let design = self.template_design(z, templates, true)?;

        let p = match scale {
            Some(p) => p.to_vec(),
            None => {
                let objective =
                    |p: &[f64]| -> Result<f64, AppError> { Ok(self.solve(z, &design, &self.fit_mask, Some(p), false)?.chi2) };
                minimizer.minimize(&objective, &initial_scale(order))?
            }
        };
        self.solve(z, &design, &self.fit_mask, Some(&p), uncertainties)
    }

    /// Template rows `(templates × joint pixels)` at redshift `z`.
    fn template_design(&self, z: f64, templates: &[Template], with_phot: bool) -> Result<DMatrix<f64>, AppError> {
        if !(z.is_finite() && z > -1.0) {
            return Err(AppError::input(format!("Invalid redshift z={z}.")));
        }
        let mut design = DMatrix::zeros(templates.len(), self.len());
        let apply_igm = with_phot && z > IGM_REDSHIFT;

        for (t, template) in templates.iter().enumerate() {
            let (wave, mut flux) = template.redshifted(z);
            if apply_igm {
                if let Some(igm) = &self.igm {
                    match igm.transmission(z, &wave) {
                        Ok(tr) => flux.iter_mut().zip(tr.iter()).for_each(|(f, t)| *f *= t),
                        Err(e) => debug!("IGM transmission failed at z={z:.4}, using unity: {e}"),
                    }
                }
            }
            let (lo, hi) = (wave[0], wave[wave.len() - 1]);

            for ((unit, range), cov) in self.exposures.iter().zip(self.slices.iter()).zip(self.coverage.iter()) {
                let Some((cmin, cmax)) = *cov else {
                    continue;
                };
                if lo > cmax || hi < cmin {
                    continue;
                }
                let model = unit.compute_model(Some((&wave, &flux)));
                for (k, v) in model.iter().enumerate() {
                    design[(t, range.start + k)] = *v;
                }
            }
        }

        if with_phot {
            if let Some(phot) = &self.photometry {
                let igm = if apply_igm { self.igm.as_deref() } else { None };
                let a = phot.block.design(phot.catalog.as_ref(), z, igm)?;
                if a.nrows() != templates.len() {
                    return Err(AppError::input(format!(
                        "Photometric design has {} templates, expected {}.",
                        a.nrows(),
                        templates.len()
                    )));
                }
                for t in 0..templates.len() {
                    for k in 0..phot.block.len() {
                        design[(t, self.n_spec + k)] = a[(t, k)];
                    }
                }
            }
        }
        Ok(design)
    }

    /// Weighted NNLS over `mask` with background rows stacked above
    /// `templates`.
    fn solve(
        &self,
        z: f64,
        templates: &DMatrix<f64>,
        mask: &[bool],
        scale: Option<&[f64]>,
        uncertainties: bool,
    ) -> Result<ZFit, AppError> {
        let n = self.len();
        let nbg = self.exposures.len();
        let ntemp = templates.nrows();

        let pix: Vec<usize> = (0..n).filter(|&i| mask[i]).collect();
        if pix.is_empty() {
            return Err(AppError::insufficient("No unmasked pixels to fit."));
        }

        let scale_at: Vec<f64> = (0..n)
            .map(|i| match scale {
                Some(p) if i < self.n_spec => poly_scale(p, self.wavef[i]),
                _ => 1.0,
            })
            .collect();
        let component = |c: usize, i: usize| -> f64 {
            if c < nbg {
                if i < self.n_spec { self.background_design[(c, i)] } else { 0.0 }
            } else {
                templates[(c - nbg, i)] * scale_at[i]
            }
        };

        // Components with nothing under the mask stay out of the solve.
        let active: Vec<usize> = (0..nbg + ntemp)
            .filter(|&c| pix.iter().any(|&i| component(c, i) != 0.0))
            .collect();
        if active.is_empty() {
            return Err(AppError::insufficient(format!("No model component overlaps the data at z={z:.4}.")));
        }

        let a = DMatrix::from_fn(pix.len(), active.len(), |r, k| {
            let i = pix[r];
            component(active[k], i) * self.sivarf[i]
        });
        let b = DVector::from_iterator(
            pix.len(),
            pix.iter().map(|&i| {
                let pedestal = if i < self.n_spec { PEDESTAL } else { 0.0 };
                (self.scif[i] + pedestal) * self.sivarf[i]
            }),
        );

        let solution = nnls(&a, &b)?;
        let mut coeffs_all = vec![0.0; nbg + ntemp];
        for (k, &c) in active.iter().enumerate() {
            coeffs_all[c] = solution.x[k];
        }

        let mut errors_all = vec![0.0; nbg + ntemp];
        if uncertainties {
            match covariance_std_errors(&a) {
                Some(se) => {
                    for (k, &c) in active.iter().enumerate() {
                        errors_all[c] = se[k];
                    }
                }
                None => warn!("Singular covariance at z={z:.5}; reporting zero uncertainties."),
            }
        }

        let mut background = vec![0.0; n];
        for (e, range) in self.slices.iter().enumerate() {
            for b in &mut background[range.clone()] {
                *b = coeffs_all[e] - PEDESTAL;
            }
        }
        let mut model = vec![0.0; n];
        for t in 0..ntemp {
            let c = coeffs_all[nbg + t];
            if c == 0.0 {
                continue;
            }
            for (i, m) in model.iter_mut().enumerate() {
                *m += c * templates[(t, i)] * scale_at[i];
            }
        }

        let chi2: f64 = pix
            .iter()
            .map(|&i| {
                let r = (self.scif[i] - model[i] - background[i]) * self.sivarf[i];
                r * r
            })
            .sum();

        Ok(ZFit {
            z,
            chi2,
            background,
            model,
            background_coeffs: coeffs_all[..nbg].to_vec(),
            coeffs: coeffs_all[nbg..].to_vec(),
            errors: errors_all[nbg..].to_vec(),
            scale: scale.map(<[f64]>::to_vec),
        })
    }
}

/// Mask pixels that exceed the per-pixel minimum over all exposures of the
/// same grism by more than `threshold` sigma. Exposures of one grism must
/// share a shape.
pub fn mask_drizzle_overlaps(exposures: &mut [ExposureUnit], threshold: f64) -> Result<(), AppError> {
    let mut grisms: Vec<String> = Vec::new();
    for e in exposures.iter() {
        if !grisms.contains(&e.tag().grism) {
            grisms.push(e.tag().grism.clone());
        }
    }

    for grism in grisms {
        let members: Vec<usize> = (0..exposures.len())
            .filter(|&i| exposures[i].tag().grism == grism)
            .collect();
        let size = exposures[members[0]].size();
        if members.iter().any(|&i| exposures[i].size() != size) {
            return Err(AppError::input(format!(
                "Exposures of grism {grism} have different shapes; cannot mask overlaps."
            )));
        }

        let mut min_sci = vec![0.0; size];
        for (n, &idx) in members.iter().enumerate() {
            let e = &exposures[idx];
            for (i, m) in min_sci.iter_mut().enumerate() {
                if !e.fit_mask()[i] {
                    continue;
                }
                let s = e.sci()[i];
                *m = if n == 0 || *m == 0.0 { s } else { m.min(s) };
            }
        }

        for &idx in &members {
            let e = &mut exposures[idx];
            let keep: Vec<bool> = (0..size)
                .map(|i| e.sci()[i] - min_sci[i] < threshold / e.sivar()[i])
                .collect();
            let removed = e.narrow_fit_mask(&keep);
            info!("Overlap mask {}: {removed} pixels", e.tag());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic::gaussian_kernel;
    use crate::exposure::{ExposureData, ExposureOptions, ExposureTag, LinearWavelength};
    use crate::fit::photometry::{Band, Passband, TabulatedCatalog};
    use crate::fit::scale::NelderMeadMinimizer;
    use crate::spectrum::Calibration;

    fn exposure(tag: ExposureTag, sci: impl Fn(&ExposureUnit) -> Vec<f64>) -> ExposureUnit {
        let (ny, nx) = (12, 50);
        let wave = LinearWavelength {
            crpix1: 1.0,
            crval1: 1.1e4,
            cd1_1: 46.5,
        }
        .wavelengths(nx);
        let mut data = ExposureData {
            tag,
            shape: (ny, nx),
            sci: vec![0.0; ny * nx],
            wht: vec![1.0e4; ny * nx],
            contam: None,
            kernel: gaussian_kernel(ny, 12, 1.5, 1.0),
            wave,
            calibration: Calibration::Flambda,
        };
        let clean = ExposureUnit::new(data.clone(), &ExposureOptions::default()).unwrap();
        data.sci = sci(&clean);
        ExposureUnit::new(
            data,
            &ExposureOptions {
                sys_err: 0.0,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn flat_template() -> Template {
        Template::new("continuum flat", vec![1000.0, 20_000.0], vec![1.0, 1.0]).unwrap()
    }

    #[test]
    fn flat_template_recovers_unit_coefficient() {
        // The rest-frame template is flat at 1, observed at 1/(1+z).
        let z = 0.5;
        let e = exposure(ExposureTag::stack("G141"), |u| u.flat().iter().map(|f| f / (1.0 + z)).collect());
        let fitter = JointFitter::new(vec![e], &JointOptions::default(), None, None).unwrap();
        let fit = fitter.fit_at_z(z, &[flat_template()], true).unwrap();
        assert!((fit.coeffs[0] - 1.0).abs() < 1e-6, "coeff {}", fit.coeffs[0]);
        assert!(fit.chi2 < 1e-6, "chi2 {}", fit.chi2);
        assert!(fit.background.iter().all(|b| b.abs() < 1e-6));
        assert!(fit.errors[0] > 0.0);
    }

    #[test]
    fn negative_background_is_recovered_through_the_pedestal() {
        let e = exposure(ExposureTag::stack("G141"), |u| u.flat().iter().map(|f| 2.0 * f - 0.01).collect());
        let fitter = JointFitter::new(vec![e], &JointOptions::default(), None, None).unwrap();
        let fit = fitter.fit_at_z(0.0, &[flat_template()], false).unwrap();
        assert!((fit.coeffs[0] - 2.0).abs() < 1e-6);
        assert!((fit.background[0] + 0.01).abs() < 1e-6);
    }

    #[test]
    fn background_rows_partition_the_spectroscopic_vector() {
        let units = vec![
            exposure(ExposureTag::with_pa("G141", "111"), |u| u.flat().to_vec()),
            exposure(ExposureTag::with_pa("G141", "203"), |u| u.flat().to_vec()),
            exposure(ExposureTag::stack("G102"), |u| u.flat().to_vec()),
        ];
        let fitter = JointFitter::new(units, &JointOptions::default(), None, None).unwrap();
        let abg = fitter.background_design();
        assert_eq!(abg.shape(), (3, fitter.n_spec()));
        for i in 0..fitter.n_spec() {
            let column: Vec<f64> = (0..3).map(|e| abg[(e, i)]).collect();
            assert_eq!(column.iter().sum::<f64>(), 1.0, "pixel {i}");
            assert!(column.iter().all(|v| *v == 0.0 || *v == 1.0));
        }
        let mut expected_start = 0;
        for r in fitter.slices() {
            assert_eq!(r.start, expected_start);
            expected_start = r.end;
        }
        assert_eq!(expected_start, fitter.n_spec());
    }

    #[test]
    fn template_outside_coverage_gets_zero_coefficient() {
        let e = exposure(ExposureTag::stack("G141"), |u| u.flat().to_vec());
        let fitter = JointFitter::new(vec![e], &JointOptions::default(), None, None).unwrap();
        let blue = Template::new("line far blue", vec![2000.0, 2010.0, 2020.0], vec![0.0, 1.0, 0.0]).unwrap();
        let fit = fitter.fit_at_z(0.0, &[flat_template(), blue], true).unwrap();
        assert_eq!(fit.coeffs.len(), 2);
        assert_eq!(fit.coeffs[1], 0.0);
        assert_eq!(fit.errors[1], 0.0);
    }

    #[test]
    fn degenerate_exposures_are_excluded() {
        let good = exposure(ExposureTag::stack("G141"), |u| u.flat().to_vec());
        let (ny, nx) = (4, 8);
        let bad = ExposureUnit::new(
            ExposureData {
                tag: ExposureTag::stack("G102"),
                shape: (ny, nx),
                sci: vec![0.0; ny * nx],
                wht: vec![1.0; ny * nx],
                contam: None,
                kernel: crate::spectrum::Kernel::new(4, 4, vec![0.0; 16]).unwrap(),
                wave: (0..nx).map(|i| 8000.0 + 25.0 * i as f64).collect(),
                calibration: Calibration::Flambda,
            },
            &ExposureOptions::default(),
        )
        .unwrap();
        let fitter = JointFitter::new(vec![bad, good], &JointOptions::default(), None, None).unwrap();
        assert_eq!(fitter.exposures().len(), 1);
        assert_eq!(fitter.exposures()[0].tag().grism, "G141");
    }

    #[test]
    fn overlap_masking_removes_pixels_brighter_than_the_other_angle() {
        let hot = 5 * 50 + 25;
        let a = exposure(ExposureTag::with_pa("G141", "111"), |u| {
            let mut s = u.flat().to_vec();
            s[hot] += 1.0;
            s
        });
        let b = exposure(ExposureTag::with_pa("G141", "203"), |u| u.flat().to_vec());
        assert!(a.fit_mask()[hot]);
        let opts = JointOptions {
            fit_stacks: false,
            ..Default::default()
        };
        let fitter = JointFitter::new(vec![a, b], &opts, None, None).unwrap();
        assert!(!fitter.exposures()[0].fit_mask()[hot]);
        assert!(fitter.exposures()[1].fit_mask()[hot]);
        assert!(!fitter.fit_mask()[hot]);
    }

    #[test]
    fn narrowing_updates_dof_and_exposure_masks() {
        let e = exposure(ExposureTag::stack("G141"), |u| u.flat().to_vec());
        let mut fitter = JointFitter::new(vec![e], &JointOptions::default(), None, None).unwrap();
        let before = fitter.dof();
        let first = fitter.fit_mask().iter().position(|&m| m).unwrap();
        let mut keep = vec![true; fitter.len()];
        keep[first] = false;
        assert_eq!(fitter.narrow_fit_mask(&keep), 1);
        assert_eq!(fitter.dof(), before - 1);
        assert!(!fitter.exposures()[0].fit_mask()[first]);
    }

    /// Two boxcar bands observing a flat rest-frame f_λ of 1 at redshift `z`.
    fn flat_catalog(z: f64) -> Arc<dyn PhotometricCatalog> {
        let bands = [9000.0, 16_000.0]
            .iter()
            .enumerate()
            .map(|(i, &c)| Band {
                name: format!("b{i}"),
                flux: 1.0 / (1.0 + z),
                error: 0.001,
                wavelength: c,
                passband: Passband {
                    wave: vec![c - 500.0, c - 499.0, c + 499.0, c + 500.0],
                    throughput: vec![0.0, 1.0, 1.0, 0.0],
                },
            })
            .collect();
        Arc::new(TabulatedCatalog {
            bands,
            not_observed_threshold: -90.0,
            templates: vec![flat_template()],
        })
    }

    fn combined_fitter(z: f64, spec_scale: f64, background: f64, igm: Option<Arc<dyn IgmTransmission>>) -> JointFitter {
        let e = exposure(ExposureTag::stack("G141"), |u| {
            u.flat().iter().map(|f| spec_scale * f / (1.0 + z) + background).collect()
        });
        JointFitter::new(vec![e], &JointOptions::default(), Some(flat_catalog(z)), igm).unwrap()
    }

    struct Unavailable;

    impl IgmTransmission for Unavailable {
        fn transmission(&self, z: f64, _obs_wave: &[f64]) -> Result<Vec<f64>, AppError> {
            Err(AppError::numerical(format!("no forest model at z={z}")))
        }
    }

    struct Quarter;

    impl IgmTransmission for Quarter {
        fn transmission(&self, _z: f64, obs_wave: &[f64]) -> Result<Vec<f64>, AppError> {
            Ok(vec![0.25; obs_wave.len()])
        }
    }

    #[test]
    fn fixed_scale_multiplies_templates_but_not_backgrounds() {
        let z = 0.5;
        let fitter = combined_fitter(z, 2.0, 0.03, None);
        assert_eq!(fitter.n_phot(), 2);

        let fit = fitter
            .fit_combined_at_z(z, 0, Some(&[20.0]), &NelderMeadMinimizer::default(), true)
            .unwrap();
        assert!((fit.coeffs[0] - 1.0).abs() < 1e-4, "coeff {}", fit.coeffs[0]);
        assert!((fit.background[0] - 0.03).abs() < 1e-4, "background {}", fit.background[0]);
        assert!(fit.chi2 < 1e-3, "chi2 {}", fit.chi2);
        assert_eq!(fit.scale, Some(vec![20.0]));
    }

    #[test]
    fn photometric_rows_carry_no_background_or_pedestal() {
        let z = 0.5;
        let fitter = combined_fitter(z, 1.0, 0.0, None);
        let fit = fitter
            .fit_combined_at_z(z, 0, Some(&[10.0]), &NelderMeadMinimizer::default(), false)
            .unwrap();
        let n = fitter.n_spec();
        assert!(fit.background[n..].iter().all(|b| *b == 0.0));
        for k in 0..fitter.n_phot() {
            let resid = fitter.scif()[n + k] - fit.model[n + k];
            assert!(resid.abs() < 1e-5, "band {k} residual {resid}");
        }
    }

    #[test]
    fn scale_is_optimized_against_photometry() {
        let z = 0.5;
        let fitter = combined_fitter(z, 2.0, 0.0, None);
        let fit = fitter
            .fit_combined_at_z(z, 0, None, &NelderMeadMinimizer::default(), false)
            .unwrap();
        let p = fit.scale.clone().unwrap();
        assert_eq!(p.len(), 1);
        assert!((poly_scale(&p, 1.2e4) - 2.0).abs() < 0.01, "scale {p:?}");
        assert!((fit.coeffs[0] - 1.0).abs() < 0.01, "coeff {}", fit.coeffs[0]);
    }

    #[test]
    fn failing_igm_falls_back_to_unit_transmission() {
        let z = 7.5;
        let reference = combined_fitter(z, 1.0, 0.0, None)
            .fit_combined_at_z(z, 0, Some(&[10.0]), &NelderMeadMinimizer::default(), false)
            .unwrap();
        let fallback = combined_fitter(z, 1.0, 0.0, Some(Arc::new(Unavailable)))
            .fit_combined_at_z(z, 0, Some(&[10.0]), &NelderMeadMinimizer::default(), false)
            .unwrap();
        assert_eq!(fallback.coeffs, reference.coeffs);
        assert_eq!(fallback.chi2, reference.chi2);
        assert!((fallback.coeffs[0] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn igm_attenuates_spectra_and_photometry_alike() {
        let z = 7.5;
        let fit = combined_fitter(z, 1.0, 0.0, Some(Arc::new(Quarter)))
            .fit_combined_at_z(z, 0, Some(&[10.0]), &NelderMeadMinimizer::default(), false)
            .unwrap();
        assert!((fit.coeffs[0] - 4.0).abs() < 1e-3, "coeff {}", fit.coeffs[0]);
        assert!(fit.chi2 < 1e-3, "chi2 {}", fit.chi2);

        // Below the IGM redshift the transmission is not consulted.
        let low = combined_fitter(0.5, 1.0, 0.0, Some(Arc::new(Quarter)))
            .fit_combined_at_z(0.5, 0, Some(&[10.0]), &NelderMeadMinimizer::default(), false)
            .unwrap();
        assert!((low.coeffs[0] - 1.0).abs() < 1e-4, "coeff {}", low.coeffs[0]);
    }
}
