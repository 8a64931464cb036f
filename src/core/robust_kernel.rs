//! Robust kernels for outlier-tolerant edge weighting.
//!
//! A robust kernel replaces the squared error `e = rᵀΩr` of an edge by `ρ(e)`. The
//! optimizer evaluates `[ρ(e), ρ'(e), ρ''(e)]` once per edge and rescales the edge's
//! contribution to the linear system with them (see
//! [`RobustInformation`](crate::core::RobustInformation)).
//!
//! Every kernel is parameterized by a positive width `delta` that marks where the
//! kernel departs from the quadratic. Note that the input is the *squared* error, so a
//! kernel with width `delta` treats `e <= delta²` as inlier.
//!
//! # Available kernels
//!
//! | Kernel | ρ(e) for outliers | ρ'(e) → ∞ |
//! |--------|-------------------|-----------|
//! | [`HuberKernel`] | linear in √e | `delta/√e` |
//! | [`PseudoHuberKernel`] | smooth Huber | `→ 0` |
//! | [`CauchyKernel`] | logarithmic | `→ 0` |
//! | [`GemanMcClureKernel`] | bounded | `→ 0` |
//! | [`WelschKernel`] | bounded, exponential | `→ 0` |
//! | [`FairKernel`] | linear minus log | `→ 0` |
//! | [`TukeyKernel`] | constant beyond delta | `0` |
//! | [`SaturatedKernel`] | constant beyond delta² | `0` |
//! | [`DcsKernel`] | dynamic covariance scaling | `→ 0` |
//! | [`ScaleDeltaKernel`] | rescaled inner kernel | inner |
//!
//! # Example
//!
//! ```
//! use graph_optimizer::core::robust_kernel::{HuberKernel, RobustKernel};
//! # fn example() -> Result<(), graph_optimizer::core::CoreError> {
//! let huber = HuberKernel::new(1.0)?;
//!
//! // Inlier: unchanged
//! assert_eq!(huber.robustify(0.5), [0.5, 1.0, 0.0]);
//!
//! // Outlier: linear growth, weight below one
//! let [rho, weight, _] = huber.robustify(4.0);
//! assert_eq!(rho, 3.0);
//! assert_eq!(weight, 0.5);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use crate::core::{CoreError, CoreResult};
use std::fmt;

/// A robust cost function of the squared error.
pub trait RobustKernel: Send + Sync + fmt::Debug {
    /// Evaluate `[ρ(e), ρ'(e), ρ''(e)]` for the squared error `e`.
    fn robustify(&self, squared_error: f64) -> [f64; 3];

    /// Current kernel width.
    fn delta(&self) -> f64;

    /// Change the kernel width; rejects non-positive and non-finite values.
    fn set_delta(&mut self, delta: f64) -> CoreResult<()>;

    /// Registry name of the kernel.
    fn name(&self) -> &'static str;
}

fn validate_delta(name: &str, delta: f64) -> CoreResult<f64> {
    if !delta.is_finite() || delta <= 0.0 {
        return Err(CoreError::RobustKernel(format!(
            "{} kernel width must be positive and finite, got {}",
            name, delta
        ))
        .log());
    }
    Ok(delta)
}

macro_rules! delta_kernel {
    ($(#[$meta:meta])* $kernel:ident, $name:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq)]
        pub struct $kernel {
            delta: f64,
        }

        impl $kernel {
            pub fn new(delta: f64) -> CoreResult<Self> {
                Ok(Self {
                    delta: validate_delta($name, delta)?,
                })
            }
        }

        impl RobustKernel for $kernel {
            fn robustify(&self, squared_error: f64) -> [f64; 3] {
                self.evaluate(squared_error)
            }

            fn delta(&self) -> f64 {
                self.delta
            }

            fn set_delta(&mut self, delta: f64) -> CoreResult<()> {
                self.delta = validate_delta($name, delta)?;
                Ok(())
            }

            fn name(&self) -> &'static str {
                $name
            }
        }
    };
}

delta_kernel!(
    /// Huber kernel: quadratic up to `delta²`, then `2·delta·√e − delta²`.
    ///
    /// ```text
    /// e <= δ²:  ρ = e,              ρ' = 1,      ρ'' = 0
    /// e >  δ²:  ρ = 2δ√e − δ²,     ρ' = δ/√e,   ρ'' = −ρ'/(2e)
    /// ```
    HuberKernel,
    "Huber"
);

impl HuberKernel {
    fn evaluate(&self, e: f64) -> [f64; 3] {
        let dsqr = self.delta * self.delta;
        if e <= dsqr {
            [e, 1.0, 0.0]
        } else {
            let sqrte = e.sqrt();
            let rho1 = self.delta / sqrte;
            [2.0 * sqrte * self.delta - dsqr, rho1, -0.5 * rho1 / e]
        }
    }
}

delta_kernel!(
    /// Pseudo-Huber kernel, a smooth approximation of Huber.
    ///
    /// ```text
    /// ρ = 2δ²(√(1 + e/δ²) − 1)
    /// ```
    PseudoHuberKernel,
    "PseudoHuber"
);

impl PseudoHuberKernel {
    fn evaluate(&self, e: f64) -> [f64; 3] {
        let dsqr = self.delta * self.delta;
        let dsqr_reci = 1.0 / dsqr;
        let aux1 = dsqr_reci * e + 1.0;
        let aux2 = aux1.sqrt();
        let rho1 = 1.0 / aux2;
        [2.0 * dsqr * (aux2 - 1.0), rho1, -0.5 * dsqr_reci * rho1 / aux1]
    }
}

delta_kernel!(
    /// Cauchy (Lorentzian) kernel: `ρ = δ² ln(1 + e/δ²)`.
    CauchyKernel,
    "Cauchy"
);

impl CauchyKernel {
    fn evaluate(&self, e: f64) -> [f64; 3] {
        let dsqr = self.delta * self.delta;
        let dsqr_reci = 1.0 / dsqr;
        let aux = dsqr_reci * e + 1.0;
        let rho1 = 1.0 / aux;
        [dsqr * aux.ln(), rho1, -dsqr_reci * rho1 * rho1]
    }
}

delta_kernel!(
    /// Geman-McClure kernel: `ρ = e·δ/(δ + e)`.
    ///
    /// Unlike the other kernels the width enters unsquared.
    GemanMcClureKernel,
    "GemanMcClure"
);

impl GemanMcClureKernel {
    fn evaluate(&self, e: f64) -> [f64; 3] {
        let aux = self.delta / (self.delta + e);
        let rho1 = aux * aux;
        [e * aux, rho1, -2.0 * rho1 * aux]
    }
}

delta_kernel!(
    /// Welsch (Leclerc) kernel: `ρ = δ²(1 − exp(−e/δ²))`.
    WelschKernel,
    "Welsch"
);

impl WelschKernel {
    fn evaluate(&self, e: f64) -> [f64; 3] {
        let dsqr = self.delta * self.delta;
        let aux = (-e / dsqr).exp();
        [dsqr * (1.0 - aux), aux, -aux / dsqr]
    }
}

delta_kernel!(
    /// Fair kernel: `ρ = 2δ²(√e/δ − ln(1 + √e/δ))`.
    FairKernel,
    "Fair"
);

impl FairKernel {
    fn evaluate(&self, e: f64) -> [f64; 3] {
        if e == 0.0 {
            // ρ'' diverges at the origin
            return [0.0, 1.0, 0.0];
        }
        let sqrte = e.sqrt();
        let aux = sqrte / self.delta;
        [
            2.0 * self.delta * self.delta * (aux - aux.ln_1p()),
            1.0 / (1.0 + aux),
            -0.5 / (sqrte * (1.0 + aux)),
        ]
    }
}

delta_kernel!(
    /// Tukey biweight kernel. Saturates at `δ²/3` for `√e > δ`, where it stops
    /// contributing to the linear system altogether.
    TukeyKernel,
    "Tukey"
);

impl TukeyKernel {
    fn evaluate(&self, e: f64) -> [f64; 3] {
        let delta2 = self.delta * self.delta;
        if e.sqrt() <= self.delta {
            let aux = 1.0 - e / delta2;
            [delta2 * (1.0 - aux.powi(3)) / 3.0, aux * aux, -2.0 * aux / delta2]
        } else {
            [delta2 / 3.0, 0.0, 0.0]
        }
    }
}

delta_kernel!(
    /// Saturated kernel: quadratic up to `δ²`, constant afterwards.
    SaturatedKernel,
    "Saturated"
);

impl SaturatedKernel {
    fn evaluate(&self, e: f64) -> [f64; 3] {
        let dsqr = self.delta * self.delta;
        if e <= dsqr {
            [e, 1.0, 0.0]
        } else {
            [dsqr, 0.0, 0.0]
        }
    }
}

delta_kernel!(
    /// Dynamic covariance scaling. The width acts as the `φ` parameter and the
    /// scale `s = min(1, 2φ/(φ + e))` multiplies the squared error as `s²`.
    ///
    /// ```text
    /// e <= φ:  ρ = e,                ρ' = 1,                  ρ'' = 0
    /// e >  φ:  ρ = 4φ²e/(φ + e)²,    ρ' = 4φ²(φ − e)/(φ + e)³, ρ'' = −8φ²(2φ − e)/(φ + e)⁴
    /// ```
    ///
    /// `ρ` is redescending past `φ`, so `ρ'` turns negative there.
    DcsKernel,
    "DCS"
);

impl DcsKernel {
    fn evaluate(&self, e: f64) -> [f64; 3] {
        let phi = self.delta;
        let scale = 2.0 * phi / (phi + e);
        if scale >= 1.0 {
            [e, 1.0, 0.0]
        } else {
            let phi_sqr = phi * phi;
            [
                scale * scale * e,
                4.0 * phi_sqr * (phi - e) / (phi + e).powi(3),
                -8.0 * phi_sqr * (2.0 * phi - e) / (phi + e).powi(4),
            ]
        }
    }
}

/// Wraps another kernel and evaluates it on `e/δ²`, scaling the result back.
///
/// Lets a unit-width kernel be reused at any width. Without an inner kernel the
/// wrapper behaves like plain least squares.
#[derive(Debug)]
pub struct ScaleDeltaKernel {
    delta: f64,
    inner: Option<Box<dyn RobustKernel>>,
}

impl ScaleDeltaKernel {
    pub fn new(delta: f64) -> CoreResult<Self> {
        Ok(Self {
            delta: validate_delta("ScaleDelta", delta)?,
            inner: None,
        })
    }

    pub fn with_kernel(mut self, kernel: impl RobustKernel + 'static) -> Self {
        self.inner = Some(Box::new(kernel));
        self
    }

    pub fn kernel(&self) -> Option<&dyn RobustKernel> {
        self.inner.as_deref()
    }
}

impl RobustKernel for ScaleDeltaKernel {
    fn robustify(&self, squared_error: f64) -> [f64; 3] {
        match &self.inner {
            Some(kernel) => {
                let dsqr = self.delta * self.delta;
                let [rho0, rho1, rho2] = kernel.robustify(squared_error / dsqr);
                [dsqr * rho0, rho1, rho2 / dsqr]
            }
            None => [squared_error, 1.0, 0.0],
        }
    }

    fn delta(&self) -> f64 {
        self.delta
    }

    fn set_delta(&mut self, delta: f64) -> CoreResult<()> {
        self.delta = validate_delta("ScaleDelta", delta)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ScaleDelta"
    }
}
