//! Per-iteration statistics recorded by the batch driver.

use std::fmt::{self, Display, Formatter};
use tracing::debug;
use web_time::Duration;

/// Kind of step taken by the Dogleg algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepType {
    GaussNewton,
    SteepestDescent,
    Dogleg,
}

impl Display for StepType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StepType::GaussNewton => write!(f, "GN"),
            StepType::SteepestDescent => write!(f, "SD"),
            StepType::Dogleg => write!(f, "DL"),
        }
    }
}

/// What happened during one driver iteration.
#[derive(Debug, Clone, Default)]
pub struct BatchStatistics {
    /// Iteration number (0-indexed)
    pub iteration: usize,
    pub num_vertices: usize,
    pub num_edges: usize,
    /// Active chi2 after the iteration
    pub chi2: f64,
    /// Active robust chi2 after the iteration
    pub robust_chi2: f64,
    /// Norm of the last applied update
    pub step_norm: f64,
    /// Whether the iteration changed the estimate
    pub accepted: bool,
    /// Levenberg-Marquardt damping at the end of the iteration
    pub levenberg_lambda: Option<f64>,
    /// Dogleg trust region radius at the end of the iteration
    pub trust_radius: Option<f64>,
    pub step_type: Option<StepType>,
    /// Damped solves (LM) or step attempts (Dogleg)
    pub trials: usize,
    /// Summed over all solves of the iteration, 0 for direct solvers
    pub linear_solver_iterations: usize,
    pub time_linearize: Duration,
    pub time_linear_solve: Duration,
    pub time_iteration: Duration,
}

impl BatchStatistics {
    pub fn new(iteration: usize) -> Self {
        Self {
            iteration,
            ..Self::default()
        }
    }

    pub fn print_header() {
        debug!(
            "{:>4}  {:>13}  {:>13}  {:>10}  {:>10}  {:>10}  {:>4}  {:>6}  {:>7}  {:>11}  {:>6}",
            "iter",
            "chi2",
            "robust_chi2",
            "|step|",
            "lambda",
            "radius",
            "step",
            "trials",
            "ls_iter",
            "iter_time",
            "status"
        );
    }

    pub fn print_line(&self) {
        let optional = |value: Option<f64>| {
            value.map_or_else(|| "-".to_string(), |v| format!("{:.2e}", v))
        };
        let status = if self.accepted { "✓" } else { "✗" };

        debug!(
            "{:>4}  {:>13.6e}  {:>13.6e}  {:>10.2e}  {:>10}  {:>10}  {:>4}  {:>6}  {:>7}  {:>9.2}ms  {:>6}",
            self.iteration,
            self.chi2,
            self.robust_chi2,
            self.step_norm,
            optional(self.levenberg_lambda),
            optional(self.trust_radius),
            self.step_type.map_or_else(|| "-".to_string(), |s| s.to_string()),
            self.trials,
            self.linear_solver_iterations,
            self.time_iteration.as_secs_f64() * 1000.0,
            status
        );
    }
}
