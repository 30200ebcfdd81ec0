//! Polynomial scaling of the spectra relative to photometry.
//!
//! The scale polynomial is evaluated on a normalized wavelength
//! `x = (λ - 1e4) / 1000` with coefficients stored ten times larger than their
//! effect (`scale = Σ p_k / 10 · x^k`), so a constant unit scale is `p = [10]`.
//! Its coefficients are found by minimizing the NNLS chi-squared, which is
//! nested inside the objective.

use std::sync::Mutex;

use argmin::core::{CostFunction, Error, Executor, State};
use argmin::solver::neldermead::NelderMead;

use crate::error::AppError;

/// Initial value of the constant scale coefficient.
pub const SCALE_COEFF_UNITY: f64 = 10.0;

/// Multiplicative spectroscopic scale at wavelength `wave`.
pub fn poly_scale(coeffs: &[f64], wave: f64) -> f64 {
    let x = (wave - 1.0e4) / 1000.0;
    coeffs.iter().rev().fold(0.0, |acc, p| acc * x + p / 10.0)
}

/// Starting coefficients for a polynomial of the given order.
pub fn initial_scale(order: usize) -> Vec<f64> {
    let mut p = vec![0.0; order + 1];
    p[0] = SCALE_COEFF_UNITY;
    p
}

/// Pluggable unconstrained minimizer.
pub trait ScaleMinimizer: Send + Sync {
    fn minimize(
        &self,
        objective: &(dyn Fn(&[f64]) -> Result<f64, AppError> + Sync),
        init: &[f64],
    ) -> Result<Vec<f64>, AppError>;
}

/// Gradient-free simplex search via `argmin`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NelderMeadMinimizer {
    /// Offset of each initial simplex vertex along one coefficient axis.
    pub step: f64,
    pub sd_tolerance: f64,
    pub max_iters: u64,
}

impl Default for NelderMeadMinimizer {
    fn default() -> Self {
        Self {
            step: 1.0,
            sd_tolerance: 1e-4,
            max_iters: 500,
        }
    }
}

/// Objective adapter. argmin unwraps cost errors while building the simplex,
/// so the first objective failure is stored here and the vertex is ranked as
/// infinitely bad instead.
struct ScaleCost<'a> {
    objective: &'a (dyn Fn(&[f64]) -> Result<f64, AppError> + Sync),
    failure: Mutex<Option<AppError>>,
}

impl ScaleCost<'_> {
    fn take_failure(&self) -> Option<AppError> {
        match self.failure.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl CostFunction for ScaleCost<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, p: &Self::Param) -> Result<Self::Output, Error> {
        match (self.objective)(p.as_slice()) {
            // Non-finite chi-squared ranks below every finite vertex.
            Ok(chi2) => Ok(if chi2.is_finite() { chi2 } else { f64::MAX }),
            Err(e) => {
                let mut slot = match self.failure.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                slot.get_or_insert(e);
                Ok(f64::INFINITY)
            }
        }
    }
}

impl ScaleMinimizer for NelderMeadMinimizer {
    fn minimize(
        &self,
        objective: &(dyn Fn(&[f64]) -> Result<f64, AppError> + Sync),
        init: &[f64],
    ) -> Result<Vec<f64>, AppError> {
        if init.is_empty() {
            return Err(AppError::input("Scale polynomial needs at least one coefficient."));
        }
        let mut simplex = vec![init.to_vec()];
        for k in 0..init.len() {
            let mut v = init.to_vec();
            v[k] += self.step;
            simplex.push(v);
        }

        let solver = NelderMead::new(simplex)
            .with_sd_tolerance(self.sd_tolerance)
            .map_err(|e| AppError::numerical(format!("Scale optimizer setup failed: {e}")))?;
        let cost = ScaleCost {
            objective,
            failure: Mutex::new(None),
        };
        let result = Executor::new(cost, solver)
            .configure(|state| state.max_iters(self.max_iters))
            .run()
            .map_err(|e| AppError::numerical(format!("Scale optimization failed: {e}")))?;
        if let Some(failure) = result.problem.problem.as_ref().and_then(ScaleCost::take_failure) {
            return Err(failure);
        }

        let state = result.state();
        let best = state
            .get_best_param()
            .cloned()
            .ok_or_else(|| AppError::numerical("Scale optimizer returned no parameters."))?;
        log::debug!(
            "scale fit: p={best:?} chi2={:.3} iters={}",
            state.get_best_cost(),
            state.get_iter()
        );
        Ok(best)
    }
}
