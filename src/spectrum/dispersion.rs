//! Dispersion model: 1D spectrum -> predicted 2D grism pixels.
//!
//! A stacked grism spectrum is rectified so that detector column `j` samples a
//! single wavelength `λ_j`. Monochromatic light at `λ_j` lands on the detector
//! with the spatial profile of the kernel, centered on column `j`. The model is
//! therefore linear in the 1D spectrum:
//!
//! ```text
//! pixels = Dᵀ · f(λ)
//! ```
//!
//! where row `j` of the design matrix `D` (`ncols × npix`) is the kernel placed
//! around column `j`. Kernel columns that would fall off either edge of the
//! detector are dropped rather than wrapped.
//!
//! For exposures that are not delivered in absolute flux density, each row is
//! additionally scaled by the instrument sensitivity at `λ_j` times the pixel
//! width and the `1e-17` flux unit.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::math::{interp_conserve, median_step};

/// Flux unit of the sensitivity-calibrated design matrix.
const SENSITIVITY_FLUX_UNIT: f64 = 1e-17;

/// Spatial trace profile, stored row-major (`rows × cols`).
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Kernel {
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self, AppError> {
        if rows == 0 || cols == 0 || data.len() != rows * cols {
            return Err(AppError::input(format!(
                "Kernel data length {} does not match shape {rows}x{cols}.",
                data.len()
            )));
        }
        Ok(Self { rows, cols, data })
    }

    /// Kernel with entries `f(row, col)`.
    pub fn from_fn(rows: usize, cols: usize, f: impl Fn(usize, usize) -> f64) -> Self {
        let data = (0..rows)
            .flat_map(|r| (0..cols).map(move |c| (r, c)))
            .map(|(r, c)| f(r, c))
            .collect();
        Self { rows, cols, data }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    pub fn at(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    /// Copy scaled to unit sum. An empty or non-finite kernel yields non-finite
    /// entries, which later marks the owning exposure as degenerate.
    pub fn normalized(&self) -> Self {
        let total = self.sum();
        Self {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().map(|v| v / total).collect(),
        }
    }
}

/// Tabulated instrument sensitivity curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivityCurve {
    pub wavelength: Vec<f64>,
    pub sensitivity: Vec<f64>,
}

/// How detector counts relate to flux density.
#[derive(Debug, Clone, PartialEq)]
pub enum Calibration {
    /// Pixels are already in flux-density units.
    Flambda,
    /// Pixels need the sensitivity curve applied to the model.
    Sensitivity(SensitivityCurve),
}

impl Calibration {
    pub fn is_flambda(&self) -> bool {
        matches!(self, Calibration::Flambda)
    }
}

/// Precomputed per-column design matrix for one exposure.
#[derive(Debug, Clone)]
pub struct DispersionModel {
    shape: (usize, usize),
    wave: Vec<f64>,
    design: DMatrix<f64>,
    sensitivity: Option<Vec<f64>>,
}

impl DispersionModel {
    /// Build the design matrix for an `(nrows, ncols)` image sampled at `wave`
    /// (one wavelength per column).
    ///
    /// The kernel must span every detector row; its columns are centered on
    /// the dispersed column with offset `kernel.cols() / 2`.
    pub fn new(
        wave: Vec<f64>,
        shape: (usize, usize),
        kernel: &Kernel,
        calibration: &Calibration,
    ) -> Result<Self, AppError> {
        let (ny, nx) = shape;
        if wave.len() != nx {
            return Err(AppError::input(format!(
                "Wavelength grid has {} samples but the image has {nx} columns.",
                wave.len()
            )));
        }
        if kernel.rows() != ny {
            return Err(AppError::input(format!(
                "Kernel has {} rows but the image has {ny} rows.",
                kernel.rows()
            )));
        }

        let half = (kernel.cols() / 2) as isize;
        let mut design = DMatrix::<f64>::zeros(nx, ny * nx);
        for j in 0..nx {
            for k in 0..kernel.cols() {
                let c = j as isize + k as isize - half;
                if c < 0 || c >= nx as isize {
                    continue;
                }
                let c = c as usize;
                for r in 0..ny {
                    design[(j, r * nx + c)] += kernel.at(r, k);
                }
            }
        }

        let sensitivity = match calibration {
            Calibration::Flambda => None,
            Calibration::Sensitivity(curve) => {
                let step = median_step(&wave);
                let sens: Vec<f64> = interp_conserve(&wave, &curve.wavelength, &curve.sensitivity)
                    .into_iter()
                    .map(|s| s * step * SENSITIVITY_FLUX_UNIT)
                    .collect();
                for (j, s) in sens.iter().enumerate() {
                    design.row_mut(j).scale_mut(*s);
                }
                Some(sens)
            }
        };

        Ok(Self {
            shape,
            wave,
            design,
            sensitivity,
        })
    }

    /// Predicted flattened image for a 1D spectrum `(wave, flux)`.
    ///
    /// `None` evaluates a flat spectrum (unit flux density at every column),
    /// the reference model used for masking and optimal extraction.
    pub fn evaluate(&self, spectrum: Option<(&[f64], &[f64])>) -> Vec<f64> {
        let fl = match spectrum {
            None => vec![1.0; self.wave.len()],
            Some((w, f)) => interp_conserve(&self.wave, w, f),
        };
        self.design
            .tr_mul(&DVector::from_vec(fl))
            .iter()
            .copied()
            .collect()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    pub fn wave(&self) -> &[f64] {
        &self.wave
    }

    pub fn design(&self) -> &DMatrix<f64> {
        &self.design
    }

    /// Per-column sensitivity scale, when the exposure is not in flux density.
    pub fn sensitivity(&self) -> Option<&[f64]> {
        self.sensitivity.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn box_kernel(rows: usize, cols: usize) -> Kernel {
        Kernel::new(rows, cols, vec![1.0; rows * cols]).unwrap().normalized()
    }

    #[test]
    fn interior_columns_carry_the_whole_kernel() {
        let (ny, nx) = (4, 12);
        let wave: Vec<f64> = (0..nx).map(|i| 1.0e4 + 25.0 * i as f64).collect();
        let model = DispersionModel::new(wave, (ny, nx), &box_kernel(4, 4), &Calibration::Flambda).unwrap();

        for j in 0..nx {
            let row_sum: f64 = model.design().row(j).iter().sum();
            // Offsets -2..=1 around the dispersed column.
            if (2..=nx - 2).contains(&j) {
                assert!((row_sum - 1.0).abs() < 1e-12, "column {j} sum {row_sum}");
            } else {
                assert!(row_sum < 1.0, "edge column {j} must be truncated");
            }
        }
    }

    #[test]
    fn kernel_is_truncated_at_the_edges_not_wrapped() {
        let (ny, nx) = (2, 6);
        let wave: Vec<f64> = (0..nx).map(|i| i as f64).collect();
        let kernel = Kernel::new(2, 2, vec![0.1, 0.2, 0.3, 0.4]).unwrap();
        let model = DispersionModel::new(wave, (ny, nx), &kernel, &Calibration::Flambda).unwrap();
        let d = model.design();

        // Column 0: kernel column 0 would fall on detector column -1.
        assert_eq!(d[(0, 0)], 0.2);
        assert_eq!(d[(0, nx)], 0.4);
        assert_eq!(d[(0, nx - 1)], 0.0);
        // Column 3 spans detector columns 2 and 3.
        assert_eq!(d[(3, 2)], 0.1);
        assert_eq!(d[(3, 3)], 0.2);
        assert_eq!(d[(3, nx + 2)], 0.3);
    }

    #[test]
    fn flat_spectrum_matches_evaluate_none() {
        let (ny, nx) = (4, 10);
        let wave: Vec<f64> = (0..nx).map(|i| 1.1e4 + 40.0 * i as f64).collect();
        let model = DispersionModel::new(wave.clone(), (ny, nx), &box_kernel(4, 4), &Calibration::Flambda).unwrap();
        let flat = model.evaluate(None);
        let ones = vec![1.0; nx];
        let explicit = model.evaluate(Some((&wave, &ones)));
        for (a, b) in flat.iter().zip(explicit.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
        assert_eq!(flat.len(), ny * nx);
    }

    #[test]
    fn sensitivity_scales_each_column() {
        let (ny, nx) = (2, 8);
        let wave: Vec<f64> = (0..nx).map(|i| 1.0e4 + 10.0 * i as f64).collect();
        let curve = SensitivityCurve {
            wavelength: vec![9_000.0, 12_000.0],
            sensitivity: vec![2.0e17, 2.0e17],
        };
        let model = DispersionModel::new(wave, (ny, nx), &box_kernel(2, 2), &Calibration::Sensitivity(curve)).unwrap();
        let sens = model.sensitivity().unwrap();
        for s in sens {
            assert!((s - 20.0).abs() < 1e-9);
        }
        let row_sum: f64 = model.design().row(4).iter().sum();
        assert!((row_sum - 20.0).abs() < 1e-9);
    }

    #[test]
    fn kernel_rows_must_match_image_rows() {
        let wave = vec![1.0, 2.0, 3.0];
        let err = DispersionModel::new(wave, (5, 3), &box_kernel(4, 4), &Calibration::Flambda).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
