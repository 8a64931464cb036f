//! Levenberg-Marquardt algorithm implementation.
//!
//! The Levenberg-Marquardt (LM) method solves the damped normal equations at each
//! iteration:
//!
//! ```text
//! (H + λI)·Δx = b
//! ```
//!
//! ## Damping Parameter Strategy
//!
//! - **λ → 0** (small damping): Behaves like Gauss-Newton with fast quadratic convergence
//! - **λ → ∞** (large damping): Behaves like gradient descent with guaranteed descent direction
//!
//! On the first iteration λ starts at `tau · max(diag(H))` unless a user value is
//! configured.
//!
//! ## Step Acceptance and Damping Update
//!
//! Every trial backs up the estimates, solves the damped system, applies the step and
//! evaluates the robust chi2. The gain ratio is
//!
//! ```text
//! ρ = (χ²_old − χ²_new) / (Δxᵀ(λΔx + b) + 1e-3)
//! ```
//!
//! - If `ρ > 0` and the new chi2 is finite: the step is kept and
//!   `λ ← λ · max(1/3, min(2/3, 1 − (2ρ − 1)³))`, `ν ← 2`
//! - Otherwise the estimates are restored and `λ ← λ·ν`, `ν ← 2ν`
//!
//! A failed linear solve counts as a rejected trial. The trial loop ends after an
//! accepted step, after `max_trials` rejected ones, when `ρ` is exactly zero or when
//! a stop is requested. The algorithm terminates when the trials were exhausted
//! without success, when `ρ` was exactly zero or when λ overflowed.

use crate::core::{ActiveSubset, OptimizableGraph, RobustInformation};
use crate::linalg::LinearSolverType;
use crate::optimizer::{
    ActiveProblem, BlockSolver, OptimizationAlgorithm, OptimizerResult, OptimizerType,
    StepOutcome, TerminationReason,
};
use nalgebra::DVector;
use tracing::{debug, warn};
use web_time::Instant;

/// Configuration parameters for the Levenberg-Marquardt optimizer.
#[derive(Clone, Debug)]
pub struct LevenbergMarquardtConfig {
    /// Type of linear solver for the linear systems
    pub linear_solver_type: LinearSolverType,
    /// How robust kernels enter the Hessian
    pub robust_information: RobustInformation,
    /// Initial λ. When `None`, λ starts at `tau · max(diag(H))`.
    pub user_lambda_init: Option<f64>,
    /// Scale of the automatic initial λ
    pub tau: f64,
    /// Rejected trials allowed per iteration
    pub max_trials_after_failure: usize,
}

impl Default for LevenbergMarquardtConfig {
    fn default() -> Self {
        Self {
            linear_solver_type: LinearSolverType::default(),
            robust_information: RobustInformation::default(),
            user_lambda_init: None,
            // Small enough to start close to Gauss-Newton on well-conditioned problems
            tau: 1e-5,
            // Ten rejections raise λ by 2^55 from its last value
            max_trials_after_failure: 10,
        }
    }
}

impl LevenbergMarquardtConfig {
    /// Create a new Levenberg-Marquardt configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the linear solver type
    pub fn with_linear_solver_type(mut self, linear_solver_type: LinearSolverType) -> Self {
        self.linear_solver_type = linear_solver_type;
        self
    }

    pub fn with_robust_information(mut self, robust_information: RobustInformation) -> Self {
        self.robust_information = robust_information;
        self
    }

    /// Set the initial damping parameter.
    pub fn with_user_lambda_init(mut self, lambda: f64) -> Self {
        self.user_lambda_init = Some(lambda);
        self
    }

    pub fn with_tau(mut self, tau: f64) -> Self {
        self.tau = tau;
        self
    }

    /// Set the number of rejected trials allowed per iteration.
    pub fn with_max_trials_after_failure(mut self, max_trials: usize) -> Self {
        self.max_trials_after_failure = max_trials;
        self
    }

    /// Print configuration parameters (debug level logging)
    pub fn print_configuration(&self) {
        debug!(
            "Configuration:\n  Solver:             Levenberg-Marquardt\n  Linear solver:      {}\n  Robust information: {}\n  Damping Parameters:\n  Initial lambda:     {}\n  Tau:                {:.2e}\n  Max trials:         {}",
            self.linear_solver_type,
            self.robust_information,
            self.user_lambda_init
                .map_or_else(|| "auto".to_string(), |l| format!("{:.2e}", l)),
            self.tau,
            self.max_trials_after_failure
        );
    }
}

/// Levenberg-Marquardt solver for nonlinear least squares optimization.
#[derive(Debug)]
pub struct LevenbergMarquardt {
    config: LevenbergMarquardtConfig,
    block_solver: BlockSolver,
    current_lambda: f64,
    ni: f64,
    levenberg_iterations: usize,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self::new()
    }
}

impl LevenbergMarquardt {
    /// Create a new Levenberg-Marquardt solver with default configuration.
    pub fn new() -> Self {
        Self::with_config(LevenbergMarquardtConfig::default())
    }

    /// Create a new Levenberg-Marquardt solver with the given configuration.
    pub fn with_config(config: LevenbergMarquardtConfig) -> Self {
        let block_solver = BlockSolver::new(config.linear_solver_type)
            .with_robust_information(config.robust_information);
        Self {
            config,
            block_solver,
            current_lambda: -1.0,
            ni: 2.0,
            levenberg_iterations: 0,
        }
    }

    pub fn config(&self) -> &LevenbergMarquardtConfig {
        &self.config
    }

    /// Damping at the end of the last iteration, negative before the first one.
    pub fn current_lambda(&self) -> f64 {
        self.current_lambda
    }

    /// Damped solves performed in the last iteration.
    pub fn levenberg_iterations(&self) -> usize {
        self.levenberg_iterations
    }

    fn initial_lambda(&self) -> f64 {
        match self.config.user_lambda_init {
            Some(lambda) => lambda,
            None => self.config.tau * self.block_solver.max_diagonal(),
        }
    }

    /// Denominator of the gain ratio, `Δxᵀ(λΔx + b)` plus a small offset.
    fn predicted_reduction(&self, x: &DVector<f64>) -> f64 {
        let b = self.block_solver.gradient();
        x.dot(&(x * self.current_lambda + b)) + 1e-3
    }
}

/// Multiplicative λ update after an accepted step.
fn lambda_decrease_factor(rho: f64) -> f64 {
    let alpha = 1.0 - (2.0 * rho - 1.0).powi(3);
    alpha.min(2.0 / 3.0).max(1.0 / 3.0)
}

impl OptimizationAlgorithm for LevenbergMarquardt {
    fn optimizer_type(&self) -> OptimizerType {
        OptimizerType::LevenbergMarquardt
    }

    fn init(&mut self, graph: &OptimizableGraph, subset: &ActiveSubset) -> OptimizerResult<()> {
        self.current_lambda = -1.0;
        self.ni = 2.0;
        self.levenberg_iterations = 0;
        self.block_solver.build_structure(graph, subset)
    }

    fn solve(
        &mut self,
        iteration: usize,
        problem: &mut ActiveProblem<'_>,
    ) -> OptimizerResult<StepOutcome> {
        let start = Instant::now();
        problem.compute_active_errors()?;
        let current_chi = problem.active_robust_chi2();
        self.block_solver.build_system(problem.graph, problem.subset)?;
        problem.stats.time_linearize = start.elapsed();

        if iteration == 0 || self.current_lambda < 0.0 {
            self.current_lambda = self.initial_lambda();
            self.ni = 2.0;
        }

        let mut rho = 0.0;
        let mut accepted = false;
        let mut trials = 0;
        let solve_start = Instant::now();
        loop {
            problem.push()?;
            self.block_solver.set_lambda(self.current_lambda);
            let step = match self.block_solver.solve() {
                Ok((x, info)) => {
                    problem.stats.linear_solver_iterations += info.iterations;
                    problem.update(&x)?;
                    Some(x)
                }
                Err(err) if err.is_linear_solve_failure() => {
                    warn!(
                        "Damped system not solvable at lambda {:.3e}: {}",
                        self.current_lambda, err
                    );
                    None
                }
                Err(err) => {
                    self.block_solver.restore_diagonal()?;
                    problem.pop()?;
                    return Err(err);
                }
            };
            self.block_solver.restore_diagonal()?;
            trials += 1;

            problem.compute_active_errors()?;
            let temp_chi = match step {
                Some(_) => problem.active_robust_chi2(),
                None => f64::INFINITY,
            };
            let scale = match &step {
                Some(x) => self.predicted_reduction(x),
                None => 1.0,
            };
            rho = (current_chi - temp_chi) / scale;

            if rho > 0.0 && temp_chi.is_finite() {
                self.current_lambda *= lambda_decrease_factor(rho);
                self.ni = 2.0;
                problem.discard_top()?;
                accepted = true;
            } else {
                self.current_lambda *= self.ni;
                self.ni *= 2.0;
                problem.pop()?;
            }

            let keep_trying = !accepted
                && rho != 0.0
                && trials < self.config.max_trials_after_failure
                && !problem.stop.is_stopped();
            if !keep_trying {
                break;
            }
        }
        problem.stats.time_linear_solve = solve_start.elapsed();
        self.levenberg_iterations = trials;

        problem.stats.accepted = accepted;
        problem.stats.trials = trials;
        problem.stats.levenberg_lambda = Some(self.current_lambda);

        if !self.current_lambda.is_finite() {
            warn!("Levenberg-Marquardt damping overflowed");
            return Ok(StepOutcome::Terminate(TerminationReason::DampingNotFinite));
        }
        if rho == 0.0 {
            return Ok(StepOutcome::Terminate(TerminationReason::NoReduction));
        }
        if !accepted && trials >= self.config.max_trials_after_failure {
            return Ok(StepOutcome::Terminate(TerminationReason::TrialsExhausted));
        }
        Ok(StepOutcome::Continue)
    }

    fn print_configuration(&self) {
        self.config.print_configuration();
    }

    fn block_solver(&self) -> &BlockSolver {
        &self.block_solver
    }

    fn block_solver_mut(&mut self) -> &mut BlockSolver {
        &mut self.block_solver
    }
}
