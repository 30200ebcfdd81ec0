//! Redshift grid generation.
//!
//! Redshift grids are uniform in `ln(1 + z)`, so a step `dz` corresponds to a
//! constant fractional step `Δz / (1 + z)`. This matches the resolution of a
//! grism spectrum, whose pixels are roughly uniform in `Δλ / λ` over the
//! wavelengths of interest.

use crate::error::AppError;

/// Redshifts `exp(ln(1+zmin) + i*dz) - 1` for `i = 0, 1, ...` strictly below
/// `ln(1+zmax)` (the upper end is excluded).
pub fn log_zgrid(zmin: f64, zmax: f64, dz: f64) -> Result<Vec<f64>, AppError> {
    if !(zmin.is_finite() && zmax.is_finite() && zmax > zmin && zmin > -1.0) {
        return Err(AppError::input(format!(
            "Invalid redshift range: zmin={zmin}, zmax={zmax} (must be finite, > -1 and zmax>zmin)."
        )));
    }
    if !(dz.is_finite() && dz > 0.0) {
        return Err(AppError::input(format!("Invalid redshift step dz={dz} (must be > 0).")));
    }

    let start = (1.0 + zmin).ln();
    let stop = (1.0 + zmax).ln();
    let steps = ((stop - start) / dz).ceil() as usize;

    let mut out = Vec::with_capacity(steps);
    for i in 0..steps {
        let lz = start + dz * i as f64;
        if lz >= stop {
            break;
        }
        out.push(lz.exp() - 1.0);
    }
    Ok(out)
}

/// Index of the smallest finite value (ties resolve to the lowest index).
pub fn argmin(values: &[f64]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, v) in values.iter().enumerate() {
        if !v.is_finite() {
            continue;
        }
        match best {
            Some(b) if values[b] <= *v => {}
            _ => best = Some(i),
        }
    }
    best
}
