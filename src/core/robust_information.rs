//! Reweighting of an edge's quadratic form by its robust kernel.

use nalgebra::{DMatrix, DVector};
use std::fmt;

/// How the kernel derivatives enter the Hessian approximation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RobustInformation {
    /// `W = ρ'·Ω`. Every component of the edge shares the scalar weight `ρ'`.
    #[default]
    FirstOrder,
    /// `W = ρ'·Ω + 2ρ''·(Ωr)(Ωr)ᵀ` when `ρ' + 2ρ''·e > 0`, otherwise first order.
    SecondOrder,
}

impl fmt::Display for RobustInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RobustInformation::FirstOrder => write!(f, "first order"),
            RobustInformation::SecondOrder => write!(f, "second order"),
        }
    }
}

/// Weighted quadratic form of a single edge.
#[derive(Debug, Clone)]
pub struct WeightedError {
    /// Effective information `W` used for the Hessian blocks
    pub information: DMatrix<f64>,
    /// `ρ'·Ω·r`, the gradient contribution is `−Jᵀ` times this
    pub weighted_error: DVector<f64>,
}

impl RobustInformation {
    /// Scalars `(w, c)` of the weighted information `W = w·Ω + c·(Ωr)(Ωr)ᵀ`.
    ///
    /// `rho` is the kernel evaluated at `squared_error = rᵀΩr`; pass `None` for
    /// edges without a kernel. The gradient uses `w` alone.
    pub fn coefficients(&self, squared_error: f64, rho: Option<[f64; 3]>) -> (f64, f64) {
        let Some([_, rho1, rho2]) = rho else {
            return (1.0, 0.0);
        };
        if *self == RobustInformation::SecondOrder && rho1 + 2.0 * rho2 * squared_error > 0.0 {
            (rho1, 2.0 * rho2)
        } else {
            (rho1, 0.0)
        }
    }

    /// Build the weighted quadratic form for `error` with information `omega`.
    pub fn weigh(
        &self,
        omega: &DMatrix<f64>,
        error: &DVector<f64>,
        squared_error: f64,
        rho: Option<[f64; 3]>,
    ) -> WeightedError {
        let (weight, outer) = self.coefficients(squared_error, rho);
        let omega_error = omega * error;
        let mut information = omega * weight;
        if outer != 0.0 {
            information += (&omega_error * omega_error.transpose()) * outer;
        }
        WeightedError {
            information,
            weighted_error: omega_error * weight,
        }
    }
}
