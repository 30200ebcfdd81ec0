//! Shared domain types.
//!
//! These types are kept lightweight and serializable so they can be used
//! in-memory during fitting and written to the output record as-is.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::math::interp_linear;
use crate::spectrum::Template;

/// Which data enter the redshift scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FitMode {
    /// Grism spectra only, with the template store's complexes.
    Spectra,
    /// Spectra plus photometry, with the catalog's templates and a
    /// polynomial scale between the two.
    Combined,
}

impl FitMode {
    pub fn display_name(self) -> &'static str {
        match self {
            FitMode::Spectra => "spectra",
            FitMode::Combined => "spectra+photometry",
        }
    }
}

/// Chi-squared prior tabulated on a redshift grid. Linearly interpolated and
/// held constant beyond its ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prior {
    pub z: Vec<f64>,
    pub chi2: Vec<f64>,
}

impl Prior {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.z.is_empty() || self.z.len() != self.chi2.len() {
            return Err(AppError::input(format!(
                "Prior needs matching non-empty z/chi2 arrays (got {} and {}).",
                self.z.len(),
                self.chi2.len()
            )));
        }
        if self.z.windows(2).any(|w| !(w[1] > w[0])) {
            return Err(AppError::input("Prior redshifts must be strictly increasing."));
        }
        if self.chi2.iter().any(|c| !c.is_finite()) {
            return Err(AppError::input("Prior chi2 values must be finite."));
        }
        Ok(())
    }

    pub fn at(&self, z: f64) -> f64 {
        interp_linear(z, &self.z, &self.chi2)
    }
}

/// Identity of the fitted source, from the stack's primary header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub id: String,
    pub ra: f64,
    pub dec: f64,
}

/// Flux, uncertainty and rest-frame equivalent width of one emission line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineMeasurement {
    /// Position in the line template set.
    pub index: usize,
    pub name: String,
    pub flux: f64,
    pub error: f64,
    pub ew: f64,
}

/// Coefficient of one template in the final fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coefficient {
    pub name: String,
    pub value: f64,
    pub error: f64,
}

/// The chi-squared curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZGridTable {
    pub z: Vec<f64>,
    pub chi2: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior: Option<Vec<f64>>,
}

/// Record header keywords.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct RecordMeta {
    pub id: String,
    pub ra: f64,
    pub dec: f64,
    pub z: f64,
    pub chimin: f64,
    pub chimax: f64,
    pub dof: usize,
    pub area25: f64,
    pub fitter: String,
    #[serde(rename = "HASPRIOR")]
    pub has_prior: bool,
    pub mode: FitMode,
    #[serde(rename = "NOUTLIER")]
    pub outliers_masked: usize,
    pub created: DateTime<Utc>,
}

/// 2D image keyed like the input stack: extension name plus version tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageExtension {
    pub name: String,
    pub version: String,
    /// `[rows, cols]`.
    pub shape: [usize; 2],
    pub data: Vec<f64>,
}

/// Optimal 1D extraction of one exposure's cleaned data and best-fit model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedSpectrum {
    pub version: String,
    pub wave: Vec<f64>,
    pub flux: Vec<f64>,
    pub rms: Vec<f64>,
    pub model: Vec<f64>,
}

/// Everything a downstream renderer needs from one fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZFitRecord {
    pub tool: String,
    pub meta: RecordMeta,
    pub zfit: ZGridTable,
    pub lines: Vec<LineMeasurement>,
    pub coeffs: Vec<Coefficient>,
    pub background_coeffs: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<Vec<f64>>,
    /// Best-fit rest-frame continuum and full (continuum + lines) spectra.
    pub templates_1d: Vec<Template>,
    pub images: Vec<ImageExtension>,
    pub spectra: Vec<ExtractedSpectrum>,
}

impl ZFitRecord {
    pub fn line(&self, name: &str) -> Option<&LineMeasurement> {
        self.lines.iter().find(|l| l.name == name)
    }

    pub fn image(&self, name: &str, version: &str) -> Option<&ImageExtension> {
        self.images.iter().find(|i| i.name == name && i.version == version)
    }
}

/// A full run's configuration as understood by the pipeline.
///
/// This is derived from CLI flags (plus defaults).
#[derive(Debug, Clone, PartialEq)]
pub struct FitConfig {
    pub stack_path: PathBuf,
    /// Template file; generated for the first grism when absent.
    pub templates_path: Option<PathBuf>,
    pub photometry_path: Option<PathBuf>,
    pub prior_path: Option<PathBuf>,
    pub output: Option<PathBuf>,

    pub sys_err: f64,
    pub mask_min: f64,
    pub fcontam: f64,
    pub min_ivar: f64,

    /// Fit one stacked exposure per grism rather than one per position angle.
    pub fit_stacks: bool,
    pub position_angles: Option<Vec<String>>,
    /// Explicit `GRISM[,PA]` versions to load.
    pub extensions: Option<Vec<String>>,
    pub overlap_threshold: f64,

    pub dz0: f64,
    pub z_min: f64,
    pub z_max: f64,
    pub outlier_threshold: Option<f64>,
    pub mode: FitMode,
    pub scale_order: usize,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            stack_path: PathBuf::new(),
            templates_path: None,
            photometry_path: None,
            prior_path: None,
            output: None,
            sys_err: 0.02,
            mask_min: 0.1,
            fcontam: 1.0,
            min_ivar: 0.01,
            fit_stacks: true,
            position_angles: None,
            extensions: None,
            overlap_threshold: 3.0,
            dz0: 0.005,
            z_min: 0.4,
            z_max: 3.4,
            outlier_threshold: None,
            mode: FitMode::Spectra,
            scale_order: 0,
        }
    }
}
