//! Dense least-squares helpers.
//!
//! The fitting problems here are tall and thin: thousands of weighted pixels,
//! a dozen or so columns (one per background term and template). Rows are
//! already scaled by `sqrt(ivar)` by the caller, so these are ordinary least
//! squares problems.
//!
//! SVD is used for the unconstrained sub-problems inside NNLS; the parameter
//! covariance comes from inverting the normal matrix `XᵀX`.

use nalgebra::{DMatrix, DVector};

/// Solve a least squares problem using SVD.
///
/// Returns `None` if the system is too ill-conditioned to solve robustly.
pub fn solve_least_squares(x: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
    let svd = x.clone().svd(true, true);

    // Template columns can be nearly collinear (overlapping line complexes),
    // so loosen the singular value cutoff before giving up.
    for &tol in &[1e-10, 1e-8, 1e-6] {
        if let Ok(beta) = svd.solve(y, tol) {
            if beta.iter().all(|v| v.is_finite()) {
                return Some(beta);
            }
        }
    }

    None
}

/// Standard errors `sqrt(diag((XᵀX)⁻¹))` for a weighted design `X`.
///
/// Returns `None` when `XᵀX` is singular or the inverse has a non-positive or
/// non-finite diagonal.
pub fn covariance_std_errors(x: &DMatrix<f64>) -> Option<Vec<f64>> {
    let normal = x.tr_mul(x);
    let covar = normal.try_inverse()?;
    let diag = covar.diagonal();
    if diag.iter().any(|v| !(v.is_finite() && *v >= 0.0)) {
        return None;
    }
    Some(diag.iter().map(|v| v.sqrt()).collect())
}
