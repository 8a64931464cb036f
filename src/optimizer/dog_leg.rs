//! Dog Leg trust region optimization algorithm implementation.
//!
//! Powell's Dog Leg method constructs a piecewise linear path within a spherical trust
//! region of radius Δ, connecting the current estimate, the steepest descent point
//! and the Gauss-Newton point.
//!
//! ## Step Selection Strategy
//!
//! With `b = −g` the right-hand side of the normal equations:
//!
//! ```text
//! α    = bᵀb / bᵀHb
//! h_sd = α·b
//! h_gn = H⁻¹b
//! ```
//!
//! **Case 1: GN step inside trust region** (`||h_gn|| ≤ Δ`): `h = h_gn`
//!
//! **Case 2: steepest descent outside trust region** (`||h_sd|| ≥ Δ`):
//! `h = (Δ / ||h_sd||) · h_sd`
//!
//! **Case 3: Dog leg interpolation**: `h = h_sd + β·(h_gn − h_sd)` with β chosen so
//! that `||h|| = Δ`.
//!
//! ## Trust Region Management
//!
//! ```text
//! ρ = (χ²_old − χ²_new) / (2bᵀh − hᵀHh)
//! ```
//!
//! A step with `ρ > 0` is kept. Independently of acceptance,
//! **good step** (`ρ > 0.75`): `Δ ← max(Δ, 3·||h||)`,
//! **poor step** (`ρ < 0.25`): `Δ ← Δ/2`.
//!
//! ## Damping of an indefinite Hessian
//!
//! The Gauss-Newton point is computed once per iteration. As long as every solve has
//! succeeded, `H` is used undamped. After the first failure the algorithm keeps
//! solving `(H + λI)` for the rest of the run, raising λ by `lambda_factor` (tenfold by
//! default) on failure and lowering it after success. λ beyond its upper bound aborts
//! the optimization. An iteration without a solvable system after
//! `max_trials_after_failure` attempts terminates with
//! [`TerminationReason::TrialsExhausted`].

use crate::core::{ActiveSubset, OptimizableGraph, RobustInformation};
use crate::linalg::LinearSolverType;
use crate::optimizer::{
    ActiveProblem, BlockSolver, OptimizationAlgorithm, OptimizerError, OptimizerResult,
    OptimizerType, StepOutcome, StepType, TerminationReason,
};
use nalgebra::DVector;
use tracing::{debug, warn};
use web_time::Instant;

/// Lower bound of the damping added to an indefinite Hessian
const MIN_LAMBDA: f64 = 1e-12;
/// Upper bound of the damping added to an indefinite Hessian
const MAX_LAMBDA: f64 = 1e3;

/// Configuration parameters for the Dog Leg optimizer.
#[derive(Clone, Debug)]
pub struct DogLegConfig {
    /// Type of linear solver for the linear systems
    pub linear_solver_type: LinearSolverType,
    /// How robust kernels enter the Hessian
    pub robust_information: RobustInformation,
    /// Initial trust region radius. May be infinite.
    pub initial_radius: f64,
    /// Step attempts per iteration
    pub max_trials_after_failure: usize,
    /// Initial damping once the Hessian turned out not to be positive definite
    pub initial_lambda: f64,
    /// Factor by which the damping is raised after a failed solve
    pub lambda_factor: f64,
}

impl Default for DogLegConfig {
    fn default() -> Self {
        Self {
            linear_solver_type: LinearSolverType::default(),
            robust_information: RobustInformation::default(),
            // Large initial radius: the first iterations are plain Gauss-Newton steps
            initial_radius: 1e4,
            max_trials_after_failure: 100,
            initial_lambda: 1e-7,
            lambda_factor: 10.0,
        }
    }
}

impl DogLegConfig {
    /// Create a new Dog Leg configuration with default values.
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

    /// Set the initial trust region radius.
    pub fn with_initial_radius(mut self, radius: f64) -> Self {
        self.initial_radius = radius;
        self
    }

    pub fn with_max_trials_after_failure(mut self, max_trials: usize) -> Self {
        self.max_trials_after_failure = max_trials;
        self
    }

    /// Set the damping used once the Hessian is found indefinite.
    ///
    /// `initial_lambda` must be finite and strictly positive. `lambda_factor` must be
    /// finite and greater than 1: after a failed solve λ is multiplied by it, after a
    /// successful one λ is divided by `lambda_factor / 2`. λ is kept within
    /// `[1e-12, 1e3]`, and exceeding the upper bound aborts the optimization.
    ///
    /// # Errors
    /// Returns [`OptimizerError::InvalidParameters`] for values outside these ranges.
    pub fn with_damping(
        mut self,
        initial_lambda: f64,
        lambda_factor: f64,
    ) -> OptimizerResult<Self> {
        validate_damping(initial_lambda, lambda_factor)?;
        self.initial_lambda = initial_lambda;
        self.lambda_factor = lambda_factor;
        Ok(self)
    }

    /// Check every parameter, including those set directly on the public fields.
    pub fn validate(&self) -> OptimizerResult<()> {
        if self.initial_radius.is_nan() || self.initial_radius <= 0.0 {
            return Err(OptimizerError::InvalidParameters(format!(
                "initial trust region radius must be positive, got {}",
                self.initial_radius
            ))
            .log());
        }
        if self.max_trials_after_failure == 0 {
            return Err(OptimizerError::InvalidParameters(
                "max_trials_after_failure must be at least 1".to_string(),
            )
            .log());
        }
        validate_damping(self.initial_lambda, self.lambda_factor)
    }

    /// Print configuration parameters (debug level logging)
    pub fn print_configuration(&self) {
        debug!(
            "Configuration:\n  Solver:             Dog Leg\n  Linear solver:      {}\n  Robust information: {}\n  Trust Region:\n  Initial radius:     {:.2e}\n  Max trials:         {}\n  Damping Parameters:\n  Initial lambda:     {:.2e}\n  Lambda factor:      {:.2}\n  Damping range:      [{:.2e}, {:.2e}]",
            self.linear_solver_type,
            self.robust_information,
            self.initial_radius,
            self.max_trials_after_failure,
            self.initial_lambda,
            self.lambda_factor,
            MIN_LAMBDA,
            MAX_LAMBDA
        );
    }
}

fn validate_damping(initial_lambda: f64, lambda_factor: f64) -> OptimizerResult<()> {
    if !(initial_lambda.is_finite() && initial_lambda > 0.0) {
        return Err(OptimizerError::InvalidParameters(format!(
            "initial lambda must be finite and positive, got {}",
            initial_lambda
        ))
        .log());
    }
    if !(lambda_factor.is_finite() && lambda_factor > 1.0) {
        return Err(OptimizerError::InvalidParameters(format!(
            "lambda factor must be finite and greater than 1, got {}",
            lambda_factor
        ))
        .log());
    }
    Ok(())
}

/// Combine the Gauss-Newton step `h_gn` and the steepest descent step `alpha · b`
/// into the dog leg step for trust region `radius`.
pub fn compute_dogleg_step(
    b: &DVector<f64>,
    alpha: f64,
    h_gn: &DVector<f64>,
    radius: f64,
) -> (DVector<f64>, StepType) {
    let h_gn_norm = h_gn.norm();
    if h_gn_norm <= radius {
        return (h_gn.clone(), StepType::GaussNewton);
    }

    let h_sd = b * alpha;
    let h_sd_norm = h_sd.norm();
    if h_sd_norm >= radius {
        return (h_sd * (radius / h_sd_norm), StepType::SteepestDescent);
    }

    let diff = h_gn - &h_sd;
    let c = h_sd.dot(&diff);
    let diff_squared_norm = diff.norm_squared();
    let slack = radius * radius - h_sd.norm_squared();
    let discriminant = (c * c + diff_squared_norm * slack).sqrt();
    let beta = if c <= 0.0 {
        (-c + discriminant) / diff_squared_norm
    } else {
        slack / (c + discriminant)
    };
    (&h_sd + diff * beta, StepType::Dogleg)
}

/// Dog Leg solver for nonlinear least squares optimization.
#[derive(Debug)]
pub struct DogLeg {
    config: DogLegConfig,
    block_solver: BlockSolver,
    radius: f64,
    current_lambda: f64,
    was_pd_in_all_iterations: bool,
    last_step: Option<StepType>,
}

impl Default for DogLeg {
    fn default() -> Self {
        Self::new()
    }
}

impl DogLeg {
    /// Create a new Dog Leg solver with default configuration.
    pub fn new() -> Self {
        Self::with_config(DogLegConfig::default())
    }

    /// Create a new Dog Leg solver with the given configuration.
    pub fn with_config(config: DogLegConfig) -> Self {
        let block_solver = BlockSolver::new(config.linear_solver_type)
            .with_robust_information(config.robust_information);
        Self {
            radius: config.initial_radius,
            current_lambda: config.initial_lambda,
            config,
            block_solver,
            was_pd_in_all_iterations: true,
            last_step: None,
        }
    }

    pub fn config(&self) -> &DogLegConfig {
        &self.config
    }

    /// Current trust region radius.
    pub fn radius(&self) -> f64 {
        self.radius
    }

    /// Whether every linear solve so far succeeded without damping.
    pub fn was_pd_in_all_iterations(&self) -> bool {
        self.was_pd_in_all_iterations
    }

    pub fn last_step(&self) -> Option<StepType> {
        self.last_step
    }

    /// Gauss-Newton point, damping the Hessian once it has been found indefinite.
    ///
    /// At most `max_trials_after_failure` solves are attempted. Returns `None` when
    /// all of them failed or a stop was requested in between.
    fn gauss_newton_step(
        &mut self,
        problem: &mut ActiveProblem<'_>,
    ) -> OptimizerResult<Option<DVector<f64>>> {
        for attempt in 0..self.config.max_trials_after_failure {
            if attempt > 0 && problem.stop.is_stopped() {
                return Ok(None);
            }
            let damped = !self.was_pd_in_all_iterations;
            if damped {
                self.block_solver.set_lambda(self.current_lambda);
            }
            let result = self.block_solver.solve();
            if damped {
                self.block_solver.restore_diagonal()?;
            }

            let step = match result {
                Ok((x, info)) => {
                    problem.stats.linear_solver_iterations += info.iterations;
                    Some(x)
                }
                Err(err) if err.is_linear_solve_failure() => None,
                Err(err) => return Err(err),
            };
            self.was_pd_in_all_iterations = self.was_pd_in_all_iterations && step.is_some();
            if !self.was_pd_in_all_iterations {
                if step.is_some() {
                    self.current_lambda =
                        (self.current_lambda / (0.5 * self.config.lambda_factor)).max(MIN_LAMBDA);
                } else {
                    self.current_lambda *= self.config.lambda_factor;
                    if self.current_lambda > MAX_LAMBDA {
                        let lambda = self.current_lambda;
                        self.current_lambda = MAX_LAMBDA;
                        return Err(OptimizerError::DampingOverflow {
                            lambda,
                            max_lambda: MAX_LAMBDA,
                        }
                        .log());
                    }
                    debug!("Hessian not positive definite, damping with {:.3e}", self.current_lambda);
                }
            }
            if step.is_some() {
                return Ok(step);
            }
        }
        warn!(
            "No Gauss-Newton step after {} damped solves",
            self.config.max_trials_after_failure
        );
        Ok(None)
    }
}

impl OptimizationAlgorithm for DogLeg {
    fn optimizer_type(&self) -> OptimizerType {
        OptimizerType::DogLeg
    }

    fn init(&mut self, graph: &OptimizableGraph, subset: &ActiveSubset) -> OptimizerResult<()> {
        self.config.validate()?;
        self.radius = self.config.initial_radius;
        self.current_lambda = self.config.initial_lambda;
        self.was_pd_in_all_iterations = true;
        self.last_step = None;
        self.block_solver.build_structure(graph, subset)
    }

    fn solve(
        &mut self,
        _iteration: usize,
        problem: &mut ActiveProblem<'_>,
    ) -> OptimizerResult<StepOutcome> {
        let start = Instant::now();
        problem.compute_active_errors()?;
        let current_chi = problem.active_robust_chi2();
        self.block_solver.build_system(problem.graph, problem.subset)?;
        problem.stats.time_linearize = start.elapsed();

        let solve_start = Instant::now();
        let b = self.block_solver.gradient().clone();
        let hb = self.block_solver.hessian().mul_symmetric_vector(&b)?;
        let b_hb = b.dot(&hb);
        let alpha = if b_hb > 0.0 {
            b.norm_squared() / b_hb
        } else {
            0.0
        };

        let Some(h_gn) = self.gauss_newton_step(problem)? else {
            problem.stats.time_linear_solve = solve_start.elapsed();
            problem.stats.accepted = false;
            problem.stats.trust_radius = Some(self.radius);
            if problem.stop.is_stopped() {
                return Ok(StepOutcome::Continue);
            }
            return Ok(StepOutcome::Terminate(TerminationReason::TrialsExhausted));
        };

        let mut accepted = false;
        let mut tries = 0;
        while !accepted && tries < self.config.max_trials_after_failure {
            tries += 1;
            let (step, step_type) = compute_dogleg_step(&b, alpha, &h_gn, self.radius);
            self.last_step = Some(step_type);

            let h_step = self.block_solver.hessian().mul_symmetric_vector(&step)?;
            let mut linear_gain = 2.0 * b.dot(&step) - h_step.dot(&step);
            if linear_gain.abs() < 1e-12 {
                linear_gain = 1e-12;
            }

            problem.push()?;
            problem.update(&step)?;
            problem.compute_active_errors()?;
            let new_chi = problem.active_robust_chi2();
            let rho = (current_chi - new_chi) / linear_gain;

            if rho > 0.0 {
                problem.discard_top()?;
                accepted = true;
            } else {
                problem.pop()?;
            }

            if rho > 0.75 {
                self.radius = self.radius.max(3.0 * step.norm());
            } else if rho < 0.25 {
                self.radius *= 0.5;
            }
        }
        problem.stats.time_linear_solve = solve_start.elapsed();

        problem.stats.accepted = accepted;
        problem.stats.trials = tries;
        problem.stats.trust_radius = Some(self.radius);
        problem.stats.step_type = self.last_step;

        if self.radius.is_nan() {
            warn!("Trust region radius became NaN");
            return Ok(StepOutcome::Terminate(TerminationReason::InvalidTrustRegion));
        }
        if !accepted {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::robust_kernel::DcsKernel;
    use crate::core::{GraphEdge, Selection};
    use crate::optimizer::{BatchStatistics, StopToken, compute_active_errors};
    use crate::types::slam2d::{EdgeSE2, Se2, VertexSE2};
    use nalgebra::{Matrix3, dvector};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_gauss_newton_step_inside_region() {
        let b = dvector![1.0, 0.0];
        let h_gn = dvector![0.3, 0.4];
        let (step, step_type) = compute_dogleg_step(&b, 0.1, &h_gn, 1.0);
        assert_eq!(step_type, StepType::GaussNewton);
        assert_eq!(step, h_gn);

        let (step, step_type) = compute_dogleg_step(&b, 0.1, &h_gn, f64::INFINITY);
        assert_eq!(step_type, StepType::GaussNewton);
        assert_eq!(step, h_gn);
    }

    #[test]
    fn test_steepest_descent_clipped_to_radius() {
        let b = dvector![3.0, 4.0];
        let h_gn = dvector![10.0, 0.0];
        let (step, step_type) = compute_dogleg_step(&b, 1.0, &h_gn, 2.0);
        assert_eq!(step_type, StepType::SteepestDescent);
        assert!((step.norm() - 2.0).abs() < 1e-12);
        assert!((step - dvector![1.2, 1.6]).norm() < 1e-12);
    }

    #[test]
    fn test_interpolated_step_on_boundary() {
        for h_gn in [dvector![4.0, 0.0], dvector![-3.0, 2.0]] {
            let b = dvector![1.0, 1.0];
            let (step, step_type) = compute_dogleg_step(&b, 0.5, &h_gn, 1.5);
            assert_eq!(step_type, StepType::Dogleg);
            assert!((step.norm() - 1.5).abs() < 1e-9);
        }
    }

    fn prepared_graph() -> Result<(OptimizableGraph, ActiveSubset), Box<dyn std::error::Error>> {
        let mut graph = OptimizableGraph::new();
        graph.add_vertex(0, VertexSE2::new(Se2::identity()))?;
        graph.add_vertex(1, VertexSE2::new(Se2::new(0.8, 0.3, 0.1)))?;
        graph.add_vertex(2, VertexSE2::new(Se2::new(2.3, -0.2, -0.1)))?;
        graph.set_fixed(0, true)?;
        let step = Se2::new(1.0, 0.0, 0.0);
        let info = Matrix3::identity();
        graph.add_edge(GraphEdge::new(vec![0, 1], EdgeSE2::new(step, info)))?;
        graph.add_edge(GraphEdge::new(vec![1, 2], EdgeSE2::new(step, info)))?;

        let subset = ActiveSubset::build(&graph, &Selection::default())?;
        let mut workspace = std::mem::take(graph.jacobian_workspace_mut());
        workspace.update_size_for_graph(&graph);
        *graph.jacobian_workspace_mut() = workspace;
        compute_active_errors(&mut graph, &subset)?;
        Ok((graph, subset))
    }

    #[test]
    fn test_infinite_radius_takes_gauss_newton_steps() -> TestResult {
        let (mut graph, subset) = prepared_graph()?;
        let mut algorithm =
            DogLeg::with_config(DogLegConfig::new().with_initial_radius(f64::INFINITY));
        algorithm.init(&graph, &subset)?;

        let stop = StopToken::new();
        for i in 0..5 {
            let mut stats = BatchStatistics::new(i);
            let mut problem = ActiveProblem {
                graph: &mut graph,
                subset: &subset,
                stop: &stop,
                stats: &mut stats,
            };
            let outcome = algorithm.solve(i, &mut problem)?;
            if outcome != StepOutcome::Continue {
                break;
            }
            assert_eq!(stats.step_type, Some(StepType::GaussNewton));
        }
        assert!(algorithm.was_pd_in_all_iterations());
        compute_active_errors(&mut graph, &subset)?;
        assert!(crate::optimizer::active_chi2(&graph, &subset) < 1e-12);
        Ok(())
    }

    #[test]
    fn test_small_radius_limits_step() -> TestResult {
        let (mut graph, subset) = prepared_graph()?;
        let mut algorithm = DogLeg::with_config(DogLegConfig::new().with_initial_radius(0.01));
        algorithm.init(&graph, &subset)?;

        let before = graph.vertex(1).ok_or("vertex 1 missing")?.estimate();
        let stop = StopToken::new();
        let mut stats = BatchStatistics::new(0);
        let mut problem = ActiveProblem {
            graph: &mut graph,
            subset: &subset,
            stop: &stop,
            stats: &mut stats,
        };
        algorithm.solve(0, &mut problem)?;
        assert!(stats.accepted);
        assert_ne!(stats.step_type, Some(StepType::GaussNewton));
        let after = graph.vertex(1).ok_or("vertex 1 missing")?.estimate();
        assert!((after - before).norm() <= 0.01 + 1e-12);
        Ok(())
    }

    /// One edge far in the outlier region of a DCS kernel: ρ' < 0 makes the
    /// Hessian negative definite.
    fn indefinite_graph() -> Result<(OptimizableGraph, ActiveSubset), Box<dyn std::error::Error>> {
        let mut graph = OptimizableGraph::new();
        graph.add_vertex(0, VertexSE2::new(Se2::identity()))?;
        graph.add_vertex(1, VertexSE2::new(Se2::new(10.0, 0.0, 0.0)))?;
        graph.set_fixed(0, true)?;
        let edge = GraphEdge::new(vec![0, 1], EdgeSE2::new(Se2::identity(), Matrix3::identity()))
            .with_robust_kernel(DcsKernel::new(1.0)?);
        graph.add_edge(edge)?;

        let subset = ActiveSubset::build(&graph, &Selection::default())?;
        let mut workspace = std::mem::take(graph.jacobian_workspace_mut());
        workspace.update_size_for_graph(&graph);
        *graph.jacobian_workspace_mut() = workspace;
        compute_active_errors(&mut graph, &subset)?;
        Ok((graph, subset))
    }

    #[test]
    fn test_damping_attempts_are_bounded() -> TestResult {
        let (mut graph, subset) = indefinite_graph()?;
        let config = DogLegConfig::new()
            .with_damping(1e-7, 10.0)?
            .with_max_trials_after_failure(3);
        let mut algorithm = DogLeg::with_config(config);
        algorithm.init(&graph, &subset)?;

        let before = graph.vertex(1).ok_or("vertex 1 missing")?.estimate();
        let stop = StopToken::new();
        let mut stats = BatchStatistics::new(0);
        let mut problem = ActiveProblem {
            graph: &mut graph,
            subset: &subset,
            stop: &stop,
            stats: &mut stats,
        };
        let outcome = algorithm.solve(0, &mut problem)?;
        assert_eq!(outcome, StepOutcome::Terminate(TerminationReason::TrialsExhausted));
        assert!(!stats.accepted);
        assert!(!algorithm.was_pd_in_all_iterations());
        // undamped, then 1e-6 and 1e-5
        assert!((algorithm.current_lambda - 1e-4).abs() < 1e-12);
        let after = graph.vertex(1).ok_or("vertex 1 missing")?.estimate();
        assert_eq!(after, before);
        Ok(())
    }

    #[test]
    fn test_stop_request_ends_damping() -> TestResult {
        let (mut graph, subset) = indefinite_graph()?;
        let mut algorithm = DogLeg::with_config(DogLegConfig::new());
        algorithm.init(&graph, &subset)?;

        let stop = StopToken::new();
        stop.stop();
        let mut stats = BatchStatistics::new(0);
        let mut problem = ActiveProblem {
            graph: &mut graph,
            subset: &subset,
            stop: &stop,
            stats: &mut stats,
        };
        let outcome = algorithm.solve(0, &mut problem)?;
        assert_eq!(outcome, StepOutcome::Continue);
        assert!(!stats.accepted);
        // a single undamped attempt before the stop is noticed
        assert!((algorithm.current_lambda - 1e-6).abs() < 1e-15);
        Ok(())
    }

    #[test]
    fn test_invalid_damping_rejected() -> TestResult {
        for (initial_lambda, lambda_factor) in [
            (1e-7, 1.0),
            (1e-7, 0.5),
            (1e-7, f64::INFINITY),
            (0.0, 10.0),
            (-1.0, 10.0),
            (f64::NAN, 10.0),
        ] {
            let result = DogLegConfig::new().with_damping(initial_lambda, lambda_factor);
            assert!(matches!(result, Err(OptimizerError::InvalidParameters(_))));
        }

        let (graph, subset) = prepared_graph()?;
        let mut config = DogLegConfig::new();
        config.lambda_factor = 1.0;
        let result = DogLeg::with_config(config).init(&graph, &subset);
        assert!(matches!(result, Err(OptimizerError::InvalidParameters(_))));

        let mut config = DogLegConfig::new();
        config.initial_lambda = 0.0;
        assert!(DogLeg::with_config(config).init(&graph, &subset).is_err());

        let config = DogLegConfig::new().with_max_trials_after_failure(0);
        assert!(DogLeg::with_config(config).init(&graph, &subset).is_err());
        Ok(())
    }
}
