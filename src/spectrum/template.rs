//! Spectral templates and the template store capability.
//!
//! A template is a rest-frame `(wavelength, flux density)` curve. Two sets are
//! used by a redshift fit:
//!
//! - *complexes*: continuum templates plus blended emission-line groups, used
//!   while scanning the redshift grid
//! - *lines*: continuum templates plus one template per individual line, used
//!   for the final fit that measures line fluxes
//!
//! Emission-line templates are recognized by the `line` name prefix
//! (e.g. `"line Ha"`); their fitted coefficient is the line flux because each
//! line template integrates to unity.

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::math::{interp_conserve, interp_linear};

/// Name prefix of emission-line templates.
pub const LINE_PREFIX: &str = "line";

/// Speed of light in km/s.
const C_KMS: f64 = 2.99792458e5;

/// FWHM to Gaussian sigma.
const FWHM_TO_SIGMA: f64 = 1.0 / 2.354_820_045;

/// A rest-frame spectral template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub wave: Vec<f64>,
    pub flux: Vec<f64>,
}

impl Template {
    pub fn new(name: impl Into<String>, wave: Vec<f64>, flux: Vec<f64>) -> Result<Self, AppError> {
        let t = Self {
            name: name.into(),
            wave,
            flux,
        };
        t.validate()?;
        Ok(t)
    }

    /// Check that the template is non-empty, consistent and sorted.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.wave.is_empty() || self.wave.len() != self.flux.len() {
            return Err(AppError::input(format!(
                "Template '{}' has {} wavelengths and {} fluxes.",
                self.name,
                self.wave.len(),
                self.flux.len()
            )));
        }
        if self.wave.windows(2).any(|w| !(w[1] > w[0])) {
            return Err(AppError::input(format!(
                "Template '{}' wavelengths must be strictly increasing.",
                self.name
            )));
        }
        Ok(())
    }

    pub fn is_line(&self) -> bool {
        self.name.starts_with(LINE_PREFIX)
    }

    /// Line label without the `line ` prefix (`"line Ha"` -> `"Ha"`).
    pub fn line_label(&self) -> &str {
        self.name
            .strip_prefix(LINE_PREFIX)
            .map(str::trim_start)
            .unwrap_or(&self.name)
    }

    pub fn wave_min(&self) -> f64 {
        self.wave[0]
    }

    pub fn wave_max(&self) -> f64 {
        self.wave[self.wave.len() - 1]
    }

    /// Observed-frame `(wave * (1+z), flux / (1+z))`.
    pub fn redshifted(&self, z: f64) -> (Vec<f64>, Vec<f64>) {
        let zp1 = 1.0 + z;
        (
            self.wave.iter().map(|w| w * zp1).collect(),
            self.flux.iter().map(|f| f / zp1).collect(),
        )
    }

    pub fn scaled(&self, scalar: f64) -> Template {
        Template {
            name: self.name.clone(),
            wave: self.wave.clone(),
            flux: self.flux.iter().map(|f| f * scalar).collect(),
        }
    }

    /// Sum of two templates on the union of their wavelength grids, each
    /// linearly interpolated with end values held constant.
    pub fn plus(&self, other: &Template) -> Template {
        let mut wave: Vec<f64> = self.wave.iter().chain(other.wave.iter()).copied().collect();
        wave.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        wave.dedup();
        let flux = wave
            .iter()
            .map(|&w| interp_linear(w, &self.wave, &self.flux) + interp_linear(w, &other.wave, &other.flux))
            .collect();
        Template {
            name: self.name.clone(),
            wave,
            flux,
        }
    }
}

/// Source of the two template sets.
pub trait TemplateStore: Send + Sync {
    /// Continuum + blended line complexes (redshift scan).
    fn complexes(&self) -> &[Template];

    /// Continuum + individual lines (final line measurements).
    fn lines(&self) -> &[Template];

    /// Flux-conserving resampling of the named template onto `grid`.
    fn resample(&self, name: &str, grid: &[f64]) -> Result<Vec<f64>, AppError> {
        let t = self
            .complexes()
            .iter()
            .chain(self.lines().iter())
            .find(|t| t.name == name)
            .ok_or_else(|| AppError::input(format!("Unknown template '{name}'.")))?;
        Ok(interp_conserve(grid, &t.wave, &t.flux))
    }
}

/// In-memory template store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateLibrary {
    pub complexes: Vec<Template>,
    pub lines: Vec<Template>,
}

impl TemplateLibrary {
    pub fn new(complexes: Vec<Template>, lines: Vec<Template>) -> Result<Self, AppError> {
        for t in complexes.iter().chain(lines.iter()) {
            t.validate()?;
        }
        Ok(Self { complexes, lines })
    }
}

impl TemplateStore for TemplateLibrary {
    fn complexes(&self) -> &[Template] {
        &self.complexes
    }

    fn lines(&self) -> &[Template] {
        &self.lines
    }
}

/// Emission-line FWHM (km/s) matched to the resolution of each grism.
pub fn line_fwhm_for_grism(grism: &str) -> f64 {
    match grism {
        "G141" => 1100.0,
        "G800L" => 1400.0,
        "G280" => 1500.0,
        "GRISM" => 350.0,
        _ => 700.0,
    }
}

/// Individual lines: label and `(rest wavelength, relative strength)` components.
const INDIVIDUAL_LINES: &[(&str, &[(f64, f64)])] = &[
    ("SIII", &[(9068.6, 0.41), (9530.6, 1.0)]),
    ("SII", &[(6718.29, 1.0), (6732.67, 0.75)]),
    ("Ha", &[(6564.61, 1.0)]),
    ("OI-6302", &[(6302.046, 1.0), (6365.535, 0.33)]),
    ("OIII", &[(5008.24, 1.0), (4960.295, 0.335)]),
    ("Hb", &[(4862.68, 1.0)]),
    ("OIII-4363", &[(4364.436, 1.0)]),
    ("Hg", &[(4341.68, 1.0)]),
    ("Hd", &[(4102.892, 1.0)]),
    ("NeIII", &[(3869.87, 1.0)]),
    ("OII", &[(3727.092, 1.0), (3729.875, 1.0)]),
    ("MgII", &[(2799.117, 1.0)]),
];

/// Blended complexes, built from nominal ratios of the individual lines.
const LINE_COMPLEXES: &[(&str, &[(f64, f64)])] = &[
    (
        "Ha+NII+SII+SIII+He",
        &[
            (6564.61, 1.0),
            (6585.27, 0.3),
            (6549.86, 0.1),
            (6718.29, 0.1),
            (6732.67, 0.075),
            (9068.6, 0.02),
            (9530.6, 0.05),
            (5877.2, 0.035),
        ],
    ),
    (
        "OIII+Hb+Hg+Hd",
        &[
            (5008.24, 1.0),
            (4960.295, 0.335),
            (4862.68, 0.286),
            (4341.68, 0.134),
            (4102.892, 0.074),
        ],
    ),
    ("OII+Ne", &[(3727.092, 0.5), (3729.875, 0.5), (3869.87, 0.12)]),
    ("MgII", &[(2799.117, 1.0)]),
];

/// Generate the complex and individual-line template sets for `grism`.
///
/// Lines are Gaussians with the grism's FWHM, normalized so each template
/// integrates to unit flux. Both sets share two smooth continuum templates
/// (flat and red power-law `f_λ`).
pub fn make_templates(grism: &str) -> Result<TemplateLibrary, AppError> {
    let fwhm = line_fwhm_for_grism(grism);
    let continuum = continuum_templates()?;

    let mut complexes = continuum.clone();
    for (label, comps) in LINE_COMPLEXES {
        complexes.push(gaussian_line(&format!("{LINE_PREFIX} {label}"), comps, fwhm)?);
    }

    let mut lines = continuum;
    for (label, comps) in INDIVIDUAL_LINES {
        lines.push(gaussian_line(&format!("{LINE_PREFIX} {label}"), comps, fwhm)?);
    }

    TemplateLibrary::new(complexes, lines)
}

fn continuum_templates() -> Result<Vec<Template>, AppError> {
    let n = 2000;
    let (lo, hi) = (500.0f64.ln(), 3.0e4f64.ln());
    let wave: Vec<f64> = (0..n)
        .map(|i| (lo + (hi - lo) * i as f64 / (n - 1) as f64).exp())
        .collect();
    let flat = vec![1.0; n];
    let red: Vec<f64> = wave.iter().map(|w| (w / 5000.0).powf(1.5)).collect();
    Ok(vec![
        Template::new("continuum flat", wave.clone(), flat)?,
        Template::new("continuum red", wave, red)?,
    ])
}

/// Sum of Gaussian components with total integrated flux 1.
pub fn gaussian_line(name: &str, components: &[(f64, f64)], fwhm_kms: f64) -> Result<Template, AppError> {
    if components.is_empty() || !(fwhm_kms > 0.0) {
        return Err(AppError::input(format!("Invalid line template definition '{name}'.")));
    }
    let sigmas: Vec<f64> = components
        .iter()
        .map(|(l0, _)| l0 * fwhm_kms / C_KMS * FWHM_TO_SIGMA)
        .collect();
    let sig_min = sigmas.iter().copied().fold(f64::INFINITY, f64::min);
    let lo = components
        .iter()
        .zip(sigmas.iter())
        .map(|((l0, _), s)| l0 - 10.0 * s)
        .fold(f64::INFINITY, f64::min);
    let hi = components
        .iter()
        .zip(sigmas.iter())
        .map(|((l0, _), s)| l0 + 10.0 * s)
        .fold(f64::NEG_INFINITY, f64::max);

    let step = sig_min / 5.0;
    let n = ((hi - lo) / step).ceil() as usize + 1;
    let wave: Vec<f64> = (0..n).map(|i| lo + step * i as f64).collect();

    let total: f64 = components.iter().map(|(_, a)| a).sum();
    let flux: Vec<f64> = wave
        .iter()
        .map(|&w| {
            components
                .iter()
                .zip(sigmas.iter())
                .map(|((l0, amp), s)| {
                    let u = (w - l0) / s;
                    amp / total * (-0.5 * u * u).exp() / (s * (2.0 * std::f64::consts::PI).sqrt())
                })
                .sum()
        })
        .collect();

    Template::new(name, wave, flux)
}
