//! A single stacked 2D grism spectrum.
//!
//! Construction does all the per-pixel bookkeeping once:
//!
//! - inflate the inverse variance with a fractional systematic error
//! - derive contamination weights
//! - build the dispersion design matrix and the flat reference model
//! - compute the fit mask
//!
//! After construction the unit is read-only except for [`ExposureUnit::narrow_fit_mask`],
//! which can only remove pixels from the fit.

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::spectrum::{Calibration, DispersionModel, Kernel};

/// Grism plus optional position angle, written `G141` or `G141,111`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExposureTag {
    pub grism: String,
    pub position_angle: Option<String>,
}

impl ExposureTag {
    pub fn stack(grism: impl Into<String>) -> Self {
        Self {
            grism: grism.into(),
            position_angle: None,
        }
    }

    pub fn with_pa(grism: impl Into<String>, pa: impl Into<String>) -> Self {
        Self {
            grism: grism.into(),
            position_angle: Some(pa.into()),
        }
    }

    /// Parse `"G141"` or `"G141,111"`.
    pub fn parse(version: &str) -> Self {
        match version.split_once(',') {
            Some((g, pa)) => Self::with_pa(g.trim(), pa.trim()),
            None => Self::stack(version.trim()),
        }
    }
}

impl std::fmt::Display for ExposureTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.position_angle {
            Some(pa) => write!(f, "{},{}", self.grism, pa),
            None => write!(f, "{}", self.grism),
        }
    }
}

/// Linear wavelength solution `λ(i) = (i + 1 - CRPIX1) * CD1_1 + CRVAL1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearWavelength {
    pub crpix1: f64,
    pub crval1: f64,
    pub cd1_1: f64,
}

impl LinearWavelength {
    pub fn wavelengths(&self, naxis1: usize) -> Vec<f64> {
        (0..naxis1)
            .map(|i| (i as f64 + 1.0 - self.crpix1) * self.cd1_1 + self.crval1)
            .collect()
    }
}

/// Raw inputs for one exposure, as read from the stack file.
#[derive(Debug, Clone)]
pub struct ExposureData {
    pub tag: ExposureTag,
    /// `(rows, cols)`.
    pub shape: (usize, usize),
    pub sci: Vec<f64>,
    /// Inverse variance.
    pub wht: Vec<f64>,
    pub contam: Option<Vec<f64>>,
    pub kernel: Kernel,
    /// One wavelength per column.
    pub wave: Vec<f64>,
    pub calibration: Calibration,
}

/// Per-exposure masking and weighting options.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureOptions {
    /// Fractional systematic error added in quadrature to the variance.
    pub sys_err: f64,
    /// Fit only pixels where the flat model exceeds this fraction of its maximum.
    pub mask_min: f64,
    /// Contamination down-weighting strength.
    pub fcontam: f64,
    /// Fit only pixels whose inverse variance exceeds this fraction of the maximum.
    pub min_ivar: f64,
}

impl Default for ExposureOptions {
    fn default() -> Self {
        Self {
            sys_err: 0.02,
            mask_min: 0.1,
            fcontam: 1.0,
            min_ivar: 0.001,
        }
    }
}

/// Optimally extracted 1D spectrum.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub wave: Vec<f64>,
    pub flux: Vec<f64>,
    pub rms: Vec<f64>,
}

/// One stacked 2D spectrum ready for fitting.
#[derive(Debug, Clone)]
pub struct ExposureUnit {
    tag: ExposureTag,
    shape: (usize, usize),
    calibration: Calibration,
    sci: Vec<f64>,
    ivar_raw: Vec<f64>,
    ivar: Vec<f64>,
    sivar: Vec<f64>,
    contam: Vec<f64>,
    weight: Vec<f64>,
    wavef: Vec<f64>,
    kernel_sum: f64,
    model: DispersionModel,
    flat: Vec<f64>,
    fit_mask: Vec<bool>,
    dof: usize,
}

impl ExposureUnit {
    pub fn new(data: ExposureData, opts: &ExposureOptions) -> Result<Self, AppError> {
        let (ny, nx) = data.shape;
        let size = ny * nx;
        if size == 0 {
            return Err(AppError::input(format!("Exposure {} has an empty image.", data.tag)));
        }
        for (label, len) in [("SCI", data.sci.len()), ("WHT", data.wht.len())] {
            if len != size {
                return Err(AppError::input(format!(
                    "Exposure {} {label} has {len} pixels, expected {size}.",
                    data.tag
                )));
            }
        }
        if data.wave.len() != nx {
            return Err(AppError::input(format!(
                "Exposure {} has {} wavelengths for {nx} columns.",
                data.tag,
                data.wave.len()
            )));
        }
        if let Some(c) = &data.contam {
            if c.len() != size {
                return Err(AppError::input(format!(
                    "Exposure {} CONTAM has {} pixels, expected {size}.",
                    data.tag,
                    c.len()
                )));
            }
        }

        let ivar: Vec<f64> = data
            .sci
            .iter()
            .zip(data.wht.iter())
            .map(|(&f, &w)| {
                let sys = opts.sys_err * f;
                1.0 / (1.0 / w + sys * sys)
            })
            .collect();
        let sivar: Vec<f64> = ivar.iter().map(|v| v.sqrt()).collect();

        let contam: Vec<f64> = match &data.contam {
            Some(c) => c.iter().map(|v| v.abs()).collect(),
            None => vec![0.0; size],
        };
        let weight: Vec<f64> = contam
            .iter()
            .zip(data.wht.iter())
            .map(|(&c, &w)| (-opts.fcontam * c * w.sqrt()).exp())
            .collect();

        let wavef: Vec<f64> = (0..size).map(|i| data.wave[i % nx]).collect();

        let kernel = data.kernel.normalized();
        let kernel_sum = kernel.sum();
        let model = DispersionModel::new(data.wave, data.shape, &kernel, &data.calibration)?;
        let flat = model.evaluate(None);

        let ivar_max = finite_max(&ivar);
        let mut fit_mask: Vec<bool> = (0..size)
            .map(|i| ivar[i] > opts.min_ivar * ivar_max && data.sci[i].is_finite() && ivar[i].is_finite())
            .collect();

        let elec: Vec<f64> = if data.calibration.is_flambda() {
            let wmax = finite_max(&data.wht);
            flat.iter().zip(data.wht.iter()).map(|(f, w)| f * w / wmax).collect()
        } else {
            flat.clone()
        };
        let elec_max = finite_max(&elec);
        for (m, e) in fit_mask.iter_mut().zip(elec.iter()) {
            *m &= *e > opts.mask_min * elec_max;
        }
        let dof = fit_mask.iter().filter(|&&m| m).count();

        Ok(Self {
            tag: data.tag,
            shape: data.shape,
            calibration: data.calibration,
            sci: data.sci,
            ivar_raw: data.wht,
            ivar,
            sivar,
            contam,
            weight,
            wavef,
            kernel_sum,
            model,
            flat,
            fit_mask,
            dof,
        })
    }

    pub fn tag(&self) -> &ExposureTag {
        &self.tag
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    pub fn size(&self) -> usize {
        self.shape.0 * self.shape.1
    }

    pub fn is_flambda(&self) -> bool {
        self.calibration.is_flambda()
    }

    /// Column wavelengths.
    pub fn wave(&self) -> &[f64] {
        self.model.wave()
    }

    /// Wavelength of every pixel (column wavelength broadcast over rows).
    pub fn wavef(&self) -> &[f64] {
        &self.wavef
    }

    pub fn sci(&self) -> &[f64] {
        &self.sci
    }

    pub fn ivar_raw(&self) -> &[f64] {
        &self.ivar_raw
    }

    /// Systematic-error-inflated inverse variance.
    pub fn ivar(&self) -> &[f64] {
        &self.ivar
    }

    pub fn sivar(&self) -> &[f64] {
        &self.sivar
    }

    pub fn contam(&self) -> &[f64] {
        &self.contam
    }

    pub fn weight(&self) -> &[f64] {
        &self.weight
    }

    pub fn flat(&self) -> &[f64] {
        &self.flat
    }

    pub fn fit_mask(&self) -> &[bool] {
        &self.fit_mask
    }

    pub fn dof(&self) -> usize {
        self.dof
    }

    pub fn sensitivity(&self) -> Option<&[f64]> {
        self.model.sensitivity()
    }

    /// A degenerate kernel (empty or non-finite) leaves nothing to fit.
    pub fn is_degenerate(&self) -> bool {
        !self.kernel_sum.is_finite() || !self.flat.iter().sum::<f64>().is_finite()
    }

    /// Predicted flattened image for an observed-frame spectrum, or the flat
    /// reference model for `None`.
    pub fn compute_model(&self, spectrum: Option<(&[f64], &[f64])>) -> Vec<f64> {
        self.model.evaluate(spectrum)
    }

    /// Wavelength range of the columns that carry any inverse variance.
    pub fn coverage(&self) -> Option<(f64, f64)> {
        let (ny, nx) = self.shape;
        let wave = self.wave();
        let mut range: Option<(f64, f64)> = None;
        for c in 0..nx {
            let total: f64 = (0..ny).map(|r| self.ivar[r * nx + c]).filter(|v| v.is_finite()).sum();
            if total > 0.0 {
                range = Some(match range {
                    None => (wave[c], wave[c]),
                    Some((lo, hi)) => (lo.min(wave[c]), hi.max(wave[c])),
                });
            }
        }
        range
    }

    /// Remove pixels from the fit where `keep` is false. Pixels already
    /// excluded stay excluded. Returns the number of newly masked pixels.
    pub fn narrow_fit_mask(&mut self, keep: &[bool]) -> usize {
        let mut removed = 0;
        for (m, &k) in self.fit_mask.iter_mut().zip(keep.iter()) {
            if *m && !k {
                *m = false;
                removed += 1;
            }
        }
        self.dof -= removed;
        removed
    }

    /// Optimally weighted 1D extraction of a flattened image, using the flat
    /// model as the spatial profile.
    ///
    /// With `bin > 1` the flux is boxcar-averaged and the variance boxcar-summed
    /// (weights `1/bin²`) over `bin` columns, sampled at the bin centers.
    pub fn optimal_extract(&self, data: &[f64], bin: usize) -> Result<Extraction, AppError> {
        let (ny, nx) = self.shape;
        if data.len() != ny * nx {
            return Err(AppError::input(format!(
                "Cannot extract {} pixels from exposure {} with {} pixels.",
                data.len(),
                self.tag,
                ny * nx
            )));
        }

        let mut flux = vec![0.0; nx];
        let mut var = vec![0.0; nx];
        for c in 0..nx {
            let flat_sum: f64 = (0..ny).map(|r| self.flat[r * nx + c]).sum();
            let mut num = 0.0;
            let mut den = 0.0;
            for r in 0..ny {
                let i = r * nx + c;
                let prof = self.flat[i] / flat_sum;
                num += prof * data[i] * self.ivar[i];
                den += prof * prof * self.ivar[i];
            }
            let v = 1.0 / den;
            if v == 0.0 || !v.is_finite() {
                continue;
            }
            flux[c] = num / den;
            var[c] = v;
        }

        let wave = self.wave();
        if bin <= 1 {
            return Ok(Extraction {
                wave: wave.to_vec(),
                rms: var.iter().map(|v| v.sqrt()).collect(),
                flux,
            });
        }

        let w = 1.0 / bin as f64;
        let flux_b = boxcar(&flux, bin, w);
        let var_b = boxcar(&var, bin, w * w);
        let centers = (bin / 2..nx).step_by(bin);
        Ok(Extraction {
            wave: centers.clone().map(|c| wave[c]).collect(),
            flux: centers.clone().map(|c| flux_b[c]).collect(),
            rms: centers.map(|c| var_b[c].sqrt()).collect(),
        })
    }
}

/// Centered running sum with constant weight `w` and mirrored edges
/// (`d c b a | a b c d | d c b a`).
fn boxcar(values: &[f64], width: usize, w: f64) -> Vec<f64> {
    let n = values.len() as isize;
    let center = (width / 2) as isize;
    (0..n)
        .map(|i| {
            let start = i + center - (width as isize - 1);
            (start..=i + center)
                .map(|k| values[reflect(k, n)] * w)
                .sum()
        })
        .collect()
}

fn reflect(mut k: isize, n: isize) -> usize {
    loop {
        if k < 0 {
            k = -k - 1;
        } else if k >= n {
            k = 2 * n - k - 1;
        } else {
            return k as usize;
        }
    }
}

fn finite_max(values: &[f64]) -> f64 {
    values
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f64::NEG_INFINITY, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic::gaussian_kernel;

    fn flat_exposure(contam: Option<Vec<f64>>) -> ExposureUnit {
        let (ny, nx) = (10, 40);
        let wave = LinearWavelength {
            crpix1: 1.0,
            crval1: 1.1e4,
            cd1_1: 46.5,
        }
        .wavelengths(nx);
        let data = ExposureData {
            tag: ExposureTag::stack("G141"),
            shape: (ny, nx),
            sci: vec![0.0; ny * nx],
            wht: vec![100.0; ny * nx],
            contam,
            kernel: gaussian_kernel(ny, 10, 1.5, 1.0),
            wave,
            calibration: Calibration::Flambda,
        };
        ExposureUnit::new(data, &ExposureOptions::default()).unwrap()
    }

    #[test]
    fn short_wavelength_grid_is_an_input_error() {
        let (ny, nx) = (4, 8);
        let data = ExposureData {
            tag: ExposureTag::stack("G141"),
            shape: (ny, nx),
            sci: vec![0.0; ny * nx],
            wht: vec![1.0; ny * nx],
            contam: None,
            kernel: gaussian_kernel(ny, 4, 1.0, 1.0),
            wave: (0..nx - 1).map(|i| 1.1e4 + 46.5 * i as f64).collect(),
            calibration: Calibration::Flambda,
        };
        let err = ExposureUnit::new(data, &ExposureOptions::default()).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn wavelength_solution_uses_one_based_reference_pixel() {
        let w = LinearWavelength {
            crpix1: 2.0,
            crval1: 1.0e4,
            cd1_1: 10.0,
        }
        .wavelengths(3);
        assert_eq!(w, vec![9990.0, 10_000.0, 10_010.0]);
    }

    #[test]
    fn tag_round_trips_through_version_string() {
        let tag = ExposureTag::parse("G141,111");
        assert_eq!(tag, ExposureTag::with_pa("G141", "111"));
        assert_eq!(tag.to_string(), "G141,111");
        assert_eq!(ExposureTag::parse("G102").to_string(), "G102");
    }

    #[test]
    fn optimal_extraction_of_flat_model_is_unity_in_the_interior() {
        let e = flat_exposure(None);
        let ex = e.optimal_extract(e.flat(), 0).unwrap();
        let nx = e.shape().1;
        for c in 5..nx - 5 {
            assert!((ex.flux[c] - 1.0).abs() < 1e-10, "column {c}: {}", ex.flux[c]);
            assert!(ex.rms[c] > 0.0);
        }
    }

    #[test]
    fn binned_extraction_samples_bin_centers() {
        let e = flat_exposure(None);
        let ex = e.optimal_extract(e.flat(), 4).unwrap();
        assert_eq!(ex.wave.len(), 10);
        assert_eq!(ex.wave[0], e.wave()[2]);
        assert!((ex.flux[4] - 1.0).abs() < 1e-10);
        // Averaging four equal variances divides the variance by four.
        let single = e.optimal_extract(e.flat(), 0).unwrap();
        assert!((ex.rms[4] - single.rms[18] / 2.0).abs() < 1e-10);
    }

    #[test]
    fn fit_mask_follows_the_trace() {
        let e = flat_exposure(None);
        let (ny, nx) = e.shape();
        let mask = e.fit_mask();
        // Center row of an interior column is on the trace, the outer rows are not.
        assert!(mask[(ny / 2) * nx + nx / 2]);
        assert!(!mask[nx / 2]);
        assert_eq!(e.dof(), mask.iter().filter(|&&m| m).count());
    }

    #[test]
    fn contamination_down_weights_pixels() {
        let (ny, nx) = (10, 40);
        let mut contam = vec![0.0; ny * nx];
        contam[5 * nx + 20] = 0.1;
        let e = flat_exposure(Some(contam));
        assert!((e.weight()[5 * nx + 20] - (-1.0f64).exp()).abs() < 1e-12);
        assert_eq!(e.weight()[0], 1.0);
    }

    #[test]
    fn fit_mask_never_widens() {
        let mut e = flat_exposure(None);
        let before = e.fit_mask().to_vec();
        let mut keep = vec![true; before.len()];
        let first = before.iter().position(|&m| m).unwrap();
        keep[first] = false;

        let removed = e.narrow_fit_mask(&keep);
        assert_eq!(removed, 1);
        assert!(!e.fit_mask()[first]);
        for (b, a) in before.iter().zip(e.fit_mask()) {
            assert!(!*a || *b);
        }

        // Re-allowing every pixel cannot restore anything.
        e.narrow_fit_mask(&vec![true; before.len()]);
        assert!(!e.fit_mask()[first]);
    }

    #[test]
    fn zero_kernel_is_degenerate() {
        let (ny, nx) = (4, 8);
        let data = ExposureData {
            tag: ExposureTag::stack("G102"),
            shape: (ny, nx),
            sci: vec![0.0; ny * nx],
            wht: vec![1.0; ny * nx],
            contam: None,
            kernel: Kernel::new(4, 4, vec![0.0; 16]).unwrap(),
            wave: (0..nx).map(|i| 8000.0 + 25.0 * i as f64).collect(),
            calibration: Calibration::Flambda,
        };
        let e = ExposureUnit::new(data, &ExposureOptions::default()).unwrap();
        assert!(e.is_degenerate());
    }
}
