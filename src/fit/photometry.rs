//! Broad-band photometry appended to the joint system.
//!
//! The catalog is an external collaborator: it knows the band fluxes and how to
//! turn rest-frame templates into synthetic photometry at a given redshift.
//! [`PhotometryBlock`] keeps only the bands that were actually observed.

use log::debug;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::math::{interp_linear, trapz};
use crate::spectrum::{IgmTransmission, Template};

/// Speed of light in Å/s, for f_ν ↔ f_λ.
pub const C_ANGSTROM: f64 = 2.99792458e18;

/// Photometric catalog capability for one object.
pub trait PhotometricCatalog: Send + Sync {
    fn n_bands(&self) -> usize;

    fn flux(&self, band: usize) -> f64;

    fn error(&self, band: usize) -> f64;

    /// Pivot wavelength of the band, Å.
    fn central_wavelength(&self, band: usize) -> f64;

    /// Fluxes at or below this value mean "not observed".
    fn not_observed_threshold(&self) -> f64;

    /// Rest-frame templates the catalog convolves.
    fn templates(&self) -> &[Template];

    /// Synthetic photometry `(templates × bands)` at redshift `z`, in the
    /// catalog's f_ν convention. Multiplying by `c / λ_c² · (1+z)` gives
    /// observed-frame f_λ on the spectroscopic scale.
    ///
    /// When `igm` is given the redshifted templates are attenuated by it
    /// before convolution; a failed transmission counts as unity.
    fn filter_convolve(&self, z: f64, igm: Option<&dyn IgmTransmission>) -> Result<DMatrix<f64>, AppError>;
}

/// The observed subset of a catalog's bands.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotometryBlock {
    bands: Vec<usize>,
    flux: Vec<f64>,
    error: Vec<f64>,
    wave: Vec<f64>,
}

impl PhotometryBlock {
    /// Keep bands with finite flux above the not-observed threshold and a
    /// finite positive error. `None` when no band survives.
    pub fn from_catalog(catalog: &dyn PhotometricCatalog) -> Option<Self> {
        let threshold = catalog.not_observed_threshold();
        let bands: Vec<usize> = (0..catalog.n_bands())
            .filter(|&b| {
                let f = catalog.flux(b);
                let e = catalog.error(b);
                f.is_finite() && e.is_finite() && e > 0.0 && f > threshold
            })
            .collect();
        if bands.is_empty() {
            return None;
        }
        Some(Self {
            flux: bands.iter().map(|&b| catalog.flux(b)).collect(),
            error: bands.iter().map(|&b| catalog.error(b)).collect(),
            wave: bands.iter().map(|&b| catalog.central_wavelength(b)).collect(),
            bands,
        })
    }

    pub fn len(&self) -> usize {
        self.bands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    pub fn bands(&self) -> &[usize] {
        &self.bands
    }

    pub fn flux(&self) -> &[f64] {
        &self.flux
    }

    pub fn error(&self) -> &[f64] {
        &self.error
    }

    pub fn wave(&self) -> &[f64] {
        &self.wave
    }

    /// Photometric design `(templates × observed bands)` in f_λ.
    pub fn design(
        &self,
        catalog: &dyn PhotometricCatalog,
        z: f64,
        igm: Option<&dyn IgmTransmission>,
    ) -> Result<DMatrix<f64>, AppError> {
        let tempfilt = catalog.filter_convolve(z, igm)?;
        if tempfilt.ncols() != catalog.n_bands() {
            return Err(AppError::input(format!(
                "Filter convolution returned {} bands, catalog has {}.",
                tempfilt.ncols(),
                catalog.n_bands()
            )));
        }
        let zp1 = 1.0 + z;
        Ok(DMatrix::from_fn(tempfilt.nrows(), self.bands.len(), |t, k| {
            let lc = self.wave[k];
            tempfilt[(t, self.bands[k])] * C_ANGSTROM / (lc * lc) * zp1
        }))
    }
}

/// Filter transmission curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passband {
    pub wave: Vec<f64>,
    pub throughput: Vec<f64>,
}

/// One catalog band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub name: String,
    pub flux: f64,
    pub error: f64,
    pub wavelength: f64,
    pub passband: Passband,
}

/// Catalog read from disk: band fluxes, filter curves and the templates to
/// convolve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabulatedCatalog {
    pub bands: Vec<Band>,
    #[serde(default = "default_not_observed")]
    pub not_observed_threshold: f64,
    pub templates: Vec<Template>,
}

fn default_not_observed() -> f64 {
    -90.0
}

impl TabulatedCatalog {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.templates.is_empty() {
            return Err(AppError::input("Photometric catalog has no templates."));
        }
        for t in &self.templates {
            t.validate()?;
        }
        for b in &self.bands {
            let p = &b.passband;
            if p.wave.len() < 2 || p.wave.len() != p.throughput.len() {
                return Err(AppError::input(format!("Band '{}' has an invalid passband.", b.name)));
            }
            if !(b.wavelength.is_finite() && b.wavelength > 0.0) {
                return Err(AppError::input(format!("Band '{}' has no central wavelength.", b.name)));
            }
        }
        Ok(())
    }
}

impl PhotometricCatalog for TabulatedCatalog {
    fn n_bands(&self) -> usize {
        self.bands.len()
    }

    fn flux(&self, band: usize) -> f64 {
        self.bands[band].flux
    }

    fn error(&self, band: usize) -> f64 {
        self.bands[band].error
    }

    fn central_wavelength(&self, band: usize) -> f64 {
        self.bands[band].wavelength
    }

    fn not_observed_threshold(&self) -> f64 {
        self.not_observed_threshold
    }

    fn templates(&self) -> &[Template] {
        &self.templates
    }

    fn filter_convolve(&self, z: f64, igm: Option<&dyn IgmTransmission>) -> Result<DMatrix<f64>, AppError> {
        if !(z.is_finite() && z > -1.0) {
            return Err(AppError::input(format!("Cannot convolve filters at z={z}.")));
        }
        let zp1 = 1.0 + z;
        let mut out = DMatrix::zeros(self.templates.len(), self.bands.len());
        for (t, tmpl) in self.templates.iter().enumerate() {
            let (w, mut f) = tmpl.redshifted(z);
            if let Some(igm) = igm {
                match igm.transmission(z, &w) {
                    Ok(tr) => f.iter_mut().zip(tr.iter()).for_each(|(v, t)| *v *= t),
                    Err(e) => debug!("IGM transmission failed at z={z:.4}, using unity: {e}"),
                }
            }
            for (b, band) in self.bands.iter().enumerate() {
                let p = &band.passband;
                let norm = trapz(&p.throughput, &p.wave);
                if norm <= 0.0 {
                    continue;
                }
                let weighted: Vec<f64> = p
                    .wave
                    .iter()
                    .zip(p.throughput.iter())
                    .map(|(&x, &tr)| {
                        let inside = x >= w[0] && x <= w[w.len() - 1];
                        if inside { interp_linear(x, &w, &f) * tr } else { 0.0 }
                    })
                    .collect();
                let flam = trapz(&weighted, &p.wave) / norm;
                let lc = band.wavelength;
                out[(t, b)] = flam * lc * lc / C_ANGSTROM / zp1;
            }
        }
        Ok(out)
    }
}
