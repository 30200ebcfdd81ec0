//! Intergalactic-medium transmission.
//!
//! Only matters for very high redshift sources, where the Lyman-series forest
//! suppresses flux blueward of Lyα. Callers treat any error as unit
//! transmission.

use crate::error::AppError;

/// Transmission of the intergalactic medium along the line of sight.
pub trait IgmTransmission: Send + Sync {
    /// Fractional transmission at each observed-frame wavelength for a source
    /// at redshift `z`.
    fn transmission(&self, z: f64, obs_wave: &[f64]) -> Result<Vec<f64>, AppError>;
}

/// Lyman-series rest wavelengths (Lyα..Lyδ) and forest coefficients.
const LYMAN_SERIES: [(f64, f64); 4] = [
    (1215.67, 3.6e-3),
    (1025.72, 1.7e-3),
    (972.537, 1.2e-3),
    (949.743, 9.3e-4),
];

const LYMAN_LIMIT: f64 = 911.75;

/// Power-law Lyman-series forest opacity (Madau 1995), with the flux fully
/// absorbed blueward of the redshifted Lyman limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct MadauForest;

impl IgmTransmission for MadauForest {
    fn transmission(&self, z: f64, obs_wave: &[f64]) -> Result<Vec<f64>, AppError> {
        if !(z.is_finite() && z >= 0.0) {
            return Err(AppError::input(format!("IGM transmission undefined for z={z}.")));
        }
        let zp1 = 1.0 + z;
        obs_wave
            .iter()
            .map(|&w| {
                if !w.is_finite() {
                    return Err(AppError::input("Non-finite wavelength in IGM transmission."));
                }
                if w < LYMAN_LIMIT * zp1 {
                    return Ok(0.0);
                }
                let tau: f64 = LYMAN_SERIES
                    .iter()
                    .filter(|(l, _)| w < l * zp1)
                    .map(|(l, a)| a * (w / l).powf(3.46))
                    .sum();
                Ok((-tau).exp())
            })
            .collect()
    }
}
