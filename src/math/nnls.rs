//! Non-negative least squares (Lawson–Hanson active set).
//!
//! ```text
//! minimize ||A x - b||²  subject to  x >= 0
//! ```
//!
//! The passive set grows one column at a time (the column with the largest
//! positive gradient). Each unconstrained sub-problem on the passive columns
//! is solved with [`solve_least_squares`]; if it produces non-positive values
//! the iterate is moved back along the segment to the feasible boundary and the
//! offending columns return to the active set.

use nalgebra::{DMatrix, DVector};

use crate::error::AppError;
use crate::math::solve_least_squares;

/// Result of an NNLS solve.
#[derive(Debug, Clone)]
pub struct NnlsSolution {
    pub x: DVector<f64>,
    /// `||A x - b||`.
    pub residual_norm: f64,
    pub iterations: usize,
}

/// Solve `min ||A x - b||` with `x >= 0`.
///
/// Fails with a numerical error if the inputs are not finite, if a
/// sub-problem cannot be solved, or if the iteration limit (`3 * ncols`, at
/// least 50) is reached.
pub fn nnls(a: &DMatrix<f64>, b: &DVector<f64>) -> Result<NnlsSolution, AppError> {
    let (m, n) = a.shape();
    if b.len() != m {
        return Err(AppError::input(format!(
            "NNLS dimension mismatch: A has {m} rows, b has {} entries.",
            b.len()
        )));
    }
    if a.iter().chain(b.iter()).any(|v| !v.is_finite()) {
        return Err(AppError::numerical("NNLS input contains non-finite values."));
    }
    if n == 0 {
        return Ok(NnlsSolution {
            x: DVector::zeros(0),
            residual_norm: b.norm(),
            iterations: 0,
        });
    }

    let max_iter = (3 * n).max(50);
    let norm1 = a
        .column_iter()
        .map(|c| c.iter().map(|v| v.abs()).sum::<f64>())
        .fold(0.0, f64::max);
    let tol = 10.0 * f64::EPSILON * norm1 * m.max(n) as f64;

    let mut x = DVector::<f64>::zeros(n);
    let mut passive = vec![false; n];
    let mut w = a.tr_mul(&(b - a * &x));
    let mut iterations = 0usize;

    loop {
        let next = (0..n)
            .filter(|&j| !passive[j] && w[j] > tol)
            .max_by(|&i, &j| w[i].partial_cmp(&w[j]).unwrap_or(std::cmp::Ordering::Equal));
        let Some(j) = next else {
            break;
        };
        passive[j] = true;

        let mut s = solve_passive(a, b, &passive)?;
        if s[j] <= 0.0 {
            // Gradient and sub-problem disagree (rounding); freeze this column
            // until the next gradient refresh.
            passive[j] = false;
            w[j] = 0.0;
            continue;
        }

        loop {
            iterations += 1;
            if iterations > max_iter {
                return Err(AppError::numerical(format!(
                    "NNLS did not converge within {max_iter} iterations."
                )));
            }

            let infeasible: Vec<usize> = (0..n).filter(|&i| passive[i] && s[i] <= 0.0).collect();
            if infeasible.is_empty() {
                x = s;
                break;
            }

            let alpha = infeasible
                .iter()
                .map(|&i| x[i] / (x[i] - s[i]))
                .fold(f64::INFINITY, f64::min);
            x += (&s - &x) * alpha;

            for i in 0..n {
                if passive[i] && x[i] <= tol {
                    passive[i] = false;
                    x[i] = 0.0;
                }
            }
            if !passive.iter().any(|&p| p) {
                break;
            }
            s = solve_passive(a, b, &passive)?;
        }

        w = a.tr_mul(&(b - a * &x));
    }

    let residual_norm = (b - a * &x).norm();
    Ok(NnlsSolution {
        x,
        residual_norm,
        iterations,
    })
}

/// Unconstrained least squares restricted to the passive columns; inactive
/// entries of the returned vector are zero.
fn solve_passive(a: &DMatrix<f64>, b: &DVector<f64>, passive: &[bool]) -> Result<DVector<f64>, AppError> {
    let idx: Vec<usize> = (0..passive.len()).filter(|&i| passive[i]).collect();
    let sub = a.select_columns(&idx);
    let z = solve_least_squares(&sub, b)
        .ok_or_else(|| AppError::numerical("NNLS sub-problem is too ill-conditioned to solve."))?;

    let mut out = DVector::<f64>::zeros(passive.len());
    for (k, &i) in idx.iter().enumerate() {
        out[i] = z[k];
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nnls_matches_least_squares_when_unconstrained_solution_is_positive() {
        let a = DMatrix::from_row_slice(4, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0, 1.0, 3.0]);
        let b = DVector::from_row_slice(&[1.0, 3.0, 5.0, 7.0]);
        let sol = nnls(&a, &b).unwrap();
        assert!((sol.x[0] - 1.0).abs() < 1e-10);
        assert!((sol.x[1] - 2.0).abs() < 1e-10);
        assert!(sol.residual_norm < 1e-10);
    }

    #[test]
    fn nnls_clips_negative_coefficients() {
        // Unconstrained solution of y = 4 - x has a negative slope.
        let a = DMatrix::from_row_slice(4, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0, 1.0, 3.0]);
        let b = DVector::from_row_slice(&[4.0, 3.0, 2.0, 1.0]);
        let sol = nnls(&a, &b).unwrap();
        assert!(sol.x.iter().all(|v| *v >= 0.0));
        assert_eq!(sol.x[1], 0.0);
        assert!((sol.x[0] - 2.5).abs() < 1e-10);
    }

    #[test]
    fn nnls_of_all_negative_target_is_zero() {
        let a = DMatrix::from_row_slice(3, 2, &[1.0, 0.5, 1.0, 0.2, 1.0, 0.1]);
        let b = DVector::from_row_slice(&[-1.0, -2.0, -3.0]);
        let sol = nnls(&a, &b).unwrap();
        assert!(sol.x.iter().all(|v| *v == 0.0));
        assert!((sol.residual_norm - b.norm()).abs() < 1e-12);
    }

    #[test]
    fn nnls_rejects_non_finite_input() {
        let a = DMatrix::from_row_slice(2, 1, &[1.0, f64::NAN]);
        let b = DVector::from_row_slice(&[1.0, 1.0]);
        assert_eq!(nnls(&a, &b).unwrap_err().exit_code(), 4);
    }
}
