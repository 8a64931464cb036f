//! Optimization algorithms and the batch driver.
//!
//! Every iteration follows the same protocol: the algorithm asks its
//! [`BlockSolver`] to linearize the active edges into the block Hessian, solves,
//! decides whether to keep the step, and reports a [`StepOutcome`]. The
//! [`SparseOptimizer`] runs the iterations, recomputes chi2 and decides when to stop.
//!
//! - Gauss-Newton
//! - Levenberg-Marquardt
//! - Dogleg (Powell's trust region method)

use crate::core::{ActiveSubset, CoreError, OptimizableGraph, VertexId};
use crate::linalg::{LinAlgError, LinearSolverType};
use nalgebra::DVector;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::{
    fmt,
    fmt::{Display, Formatter},
};
use thiserror::Error;
use tracing::error;
use web_time::Duration;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

pub mod block_solver;
pub mod dog_leg;
pub mod gauss_newton;
pub mod levenberg_marquardt;
pub mod sparse_optimizer;
pub mod statistics;

pub use block_solver::BlockSolver;
pub use dog_leg::{DogLeg, DogLegConfig};
pub use gauss_newton::{GaussNewton, GaussNewtonConfig};
pub use levenberg_marquardt::{LevenbergMarquardt, LevenbergMarquardtConfig};
pub use sparse_optimizer::{ConnectivityPolicy, DriverConfig, GaugePolicy, SparseOptimizer};
pub use statistics::{BatchStatistics, StepType};

/// Type of optimization algorithm to use
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerType {
    /// Levenberg-Marquardt algorithm (robust, adaptive damping)
    #[default]
    LevenbergMarquardt,
    /// Gauss-Newton algorithm (fast convergence, may be unstable)
    GaussNewton,
    /// Dog Leg algorithm (trust region method)
    DogLeg,
}

impl Display for OptimizerType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerType::LevenbergMarquardt => write!(f, "Levenberg-Marquardt"),
            OptimizerType::GaussNewton => write!(f, "Gauss-Newton"),
            OptimizerType::DogLeg => write!(f, "Dog Leg"),
        }
    }
}

/// Optimizer-specific error types
#[derive(Debug, Clone, Error)]
pub enum OptimizerError {
    /// The linear system could not be solved (singular or not positive definite)
    #[error("Linear system solve failed: {0}")]
    LinearSolveFailed(#[source] LinAlgError),

    /// Linear algebra operation failed for a structural reason
    #[error("Linear algebra error: {0}")]
    LinAlg(#[from] LinAlgError),

    /// Graph or active subset error
    #[error("Graph error: {0}")]
    Core(#[from] CoreError),

    /// The active subset has no vertices to optimize
    #[error("No active vertices to optimize")]
    NoVertices,

    /// `optimize` called before `initialize_optimization`
    #[error("Optimizer not initialized, call initialize_optimization first")]
    NotInitialized,

    #[error("No optimization algorithm configured")]
    NoAlgorithm,

    #[error("No linear solver configured")]
    NoLinearSolver,

    /// Invalid optimization parameters provided
    #[error("Invalid optimization parameters: {0}")]
    InvalidParameters(String),

    /// Numerical instability detected (NaN, Inf in chi2 or updates)
    #[error("Numerical instability detected: {0}")]
    NumericalInstability(String),

    /// Dogleg's defensive damping exceeded its upper bound
    #[error("Damping parameter became too large: {lambda:.6e} > {max_lambda:.6e}")]
    DampingOverflow { lambda: f64, max_lambda: f64 },
}

impl OptimizerError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the error it was derived from
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }

    /// Whether the error is a numerical breakdown of the linear solve, which damped
    /// algorithms recover from.
    pub fn is_linear_solve_failure(&self) -> bool {
        matches!(self, OptimizerError::LinearSolveFailed(_))
    }
}

/// Result type for optimizer operations
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Why an algorithm gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Every retry of the iteration was rejected
    TrialsExhausted,
    /// The gain ratio was exactly zero
    NoReduction,
    /// The Levenberg-Marquardt damping overflowed
    DampingNotFinite,
    /// The trust region radius became NaN
    InvalidTrustRegion,
}

impl Display for TerminationReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::TrialsExhausted => write!(f, "trials exhausted"),
            TerminationReason::NoReduction => write!(f, "no reduction"),
            TerminationReason::DampingNotFinite => write!(f, "damping not finite"),
            TerminationReason::InvalidTrustRegion => write!(f, "invalid trust region"),
        }
    }
}

/// Outcome of a single algorithm iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Terminate(TerminationReason),
}

/// Status of an optimization process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimizationStatus {
    /// An iteration left chi2 exactly unchanged
    Converged,
    /// Maximum number of iterations reached
    MaxIterationsReached,
    /// Relative chi2 improvement fell below the configured tolerance
    Chi2ToleranceReached,
    /// Chi2 fell below the configured threshold
    MinChi2Reached,
    /// The stop token was set
    UserTerminated,
    /// Timeout reached
    Timeout,
    /// The algorithm could not make progress
    AlgorithmTerminated(TerminationReason),
    /// NaN or Inf detected in chi2
    InvalidNumericalValues,
}

impl Display for OptimizationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationStatus::Converged => write!(f, "Converged"),
            OptimizationStatus::MaxIterationsReached => write!(f, "Maximum iterations reached"),
            OptimizationStatus::Chi2ToleranceReached => write!(f, "Chi2 tolerance reached"),
            OptimizationStatus::MinChi2Reached => write!(f, "Minimum chi2 threshold reached"),
            OptimizationStatus::UserTerminated => write!(f, "User terminated"),
            OptimizationStatus::Timeout => write!(f, "Timeout"),
            OptimizationStatus::AlgorithmTerminated(reason) => {
                write!(f, "Algorithm terminated: {reason}")
            }
            OptimizationStatus::InvalidNumericalValues => {
                write!(f, "Invalid numerical values (NaN/Inf) detected")
            }
        }
    }
}

/// Result of [`SparseOptimizer::optimize`].
#[derive(Debug, Clone)]
pub struct SolverResult {
    pub status: OptimizationStatus,
    /// Iterations actually performed
    pub iterations: usize,
    pub initial_chi2: f64,
    /// Chi2 after the last iteration. When the status is
    /// [`OptimizationStatus::InvalidNumericalValues`] this is the chi2 of the previous
    /// iteration (or `initial_chi2`), the last finite value; the estimates in the graph
    /// are those of the failed iteration. The non-finite chi2 itself is in the last
    /// entry of `statistics`.
    pub final_chi2: f64,
    pub elapsed_time: Duration,
    pub statistics: Vec<BatchStatistics>,
}

impl Display for SolverResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Status:     {}", self.status)?;
        writeln!(f, "Iterations: {}", self.iterations)?;
        writeln!(f, "Chi2:")?;
        writeln!(f, "  Initial:   {:.6e}", self.initial_chi2)?;
        writeln!(f, "  Final:     {:.6e}", self.final_chi2)?;
        writeln!(
            f,
            "  Reduction: {:.6e} ({:.2}%)",
            self.initial_chi2 - self.final_chi2,
            100.0 * (self.initial_chi2 - self.final_chi2) / self.initial_chi2.max(1e-12)
        )?;
        write!(
            f,
            "Time:       {:.2}ms",
            self.elapsed_time.as_secs_f64() * 1000.0
        )
    }
}

/// Cooperative cancellation flag shared between the driver and whoever wants to stop it.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    flag: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request termination after the current iteration.
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// The graph and active subset an algorithm works on during one iteration.
#[derive(Debug)]
pub struct ActiveProblem<'a> {
    pub graph: &'a mut OptimizableGraph,
    pub subset: &'a ActiveSubset,
    pub stop: &'a StopToken,
    /// Statistics of the running iteration
    pub stats: &'a mut BatchStatistics,
}

impl ActiveProblem<'_> {
    /// Recompute and cache the error of every active edge.
    pub fn compute_active_errors(&mut self) -> OptimizerResult<()> {
        compute_active_errors(self.graph, self.subset)
    }

    /// Sum of the cached `eᵀΩe` over active edges.
    pub fn active_chi2(&self) -> f64 {
        active_chi2(self.graph, self.subset)
    }

    /// Sum of the cached robust chi2 over active edges.
    pub fn active_robust_chi2(&self) -> f64 {
        active_robust_chi2(self.graph, self.subset)
    }

    /// Save the estimates of all vertices in the linear system.
    pub fn push(&mut self) -> OptimizerResult<()> {
        Ok(self.graph.push(&self.subset.indexed_ids())?)
    }

    pub fn pop(&mut self) -> OptimizerResult<()> {
        Ok(self.graph.pop(&self.subset.indexed_ids())?)
    }

    pub fn discard_top(&mut self) -> OptimizerResult<()> {
        Ok(self.graph.discard_top(&self.subset.indexed_ids())?)
    }

    /// Apply the solution of the linear system through each vertex's `oplus`.
    pub fn update(&mut self, x: &DVector<f64>) -> OptimizerResult<()> {
        if x.len() != self.subset.dimension() {
            return Err(OptimizerError::InvalidParameters(format!(
                "update has {} entries, system dimension is {}",
                x.len(),
                self.subset.dimension()
            ))
            .log());
        }
        for indexed in self.subset.indexed_vertices() {
            let vertex = self
                .graph
                .vertex_mut(indexed.id)
                .ok_or_else(|| CoreError::VertexNotFound { id: indexed.id }.log())?;
            vertex.oplus(&x.as_slice()[indexed.offset..indexed.offset + indexed.dimension]);
        }
        self.stats.step_norm = x.norm();
        Ok(())
    }
}

pub(crate) fn compute_active_errors(
    graph: &mut OptimizableGraph,
    subset: &ActiveSubset,
) -> OptimizerResult<()> {
    let evaluated: &OptimizableGraph = graph;

    #[cfg(feature = "parallel")]
    let errors: Vec<_> = subset
        .edges()
        .par_iter()
        .map(|id| evaluated.evaluate_error(*id))
        .collect();

    #[cfg(not(feature = "parallel"))]
    let errors: Vec<_> = subset
        .edges()
        .iter()
        .map(|id| evaluated.evaluate_error(*id))
        .collect();

    for (id, error) in subset.edges().iter().zip(errors) {
        let error = error?;
        graph
            .edge_mut(*id)
            .ok_or_else(|| CoreError::EdgeNotFound { id: *id }.log())?
            .set_error(error)?;
    }
    Ok(())
}

pub(crate) fn active_chi2(graph: &OptimizableGraph, subset: &ActiveSubset) -> f64 {
    subset
        .edges()
        .iter()
        .filter_map(|id| graph.edge(*id))
        .map(|edge| edge.chi2())
        .sum()
}

pub(crate) fn active_robust_chi2(graph: &OptimizableGraph, subset: &ActiveSubset) -> f64 {
    subset
        .edges()
        .iter()
        .filter_map(|id| graph.edge(*id))
        .map(|edge| edge.robust_chi2())
        .sum()
}

/// Iterative algorithm driven by [`SparseOptimizer`].
pub trait OptimizationAlgorithm: Send + fmt::Debug {
    fn optimizer_type(&self) -> OptimizerType;

    /// Prepare for a new active subset: build the Hessian structure and reset state.
    fn init(&mut self, graph: &OptimizableGraph, subset: &ActiveSubset) -> OptimizerResult<()>;

    /// Run one iteration. Numerical breakdown the algorithm cannot recover from is
    /// returned as `Err`.
    fn solve(
        &mut self,
        iteration: usize,
        problem: &mut ActiveProblem<'_>,
    ) -> OptimizerResult<StepOutcome>;

    /// Dump the configuration at debug level.
    fn print_configuration(&self);

    fn block_solver(&self) -> &BlockSolver;

    fn block_solver_mut(&mut self) -> &mut BlockSolver;
}

/// Create an algorithm with its default configuration and the given linear solver.
pub fn create_algorithm(
    optimizer_type: OptimizerType,
    linear_solver_type: LinearSolverType,
) -> Box<dyn OptimizationAlgorithm> {
    match optimizer_type {
        OptimizerType::GaussNewton => Box::new(GaussNewton::with_config(
            GaussNewtonConfig::new().with_linear_solver_type(linear_solver_type),
        )),
        OptimizerType::LevenbergMarquardt => Box::new(LevenbergMarquardt::with_config(
            LevenbergMarquardtConfig::new().with_linear_solver_type(linear_solver_type),
        )),
        OptimizerType::DogLeg => Box::new(DogLeg::with_config(
            DogLegConfig::new().with_linear_solver_type(linear_solver_type),
        )),
    }
}

/// Per-vertex marginal covariance, as returned by [`SparseOptimizer::compute_marginals`].
pub type Marginals = Vec<(VertexId, nalgebra::DMatrix<f64>)>;

pub(crate) fn linear_solve_error(error: LinAlgError) -> OptimizerError {
    match error {
        LinAlgError::SingularMatrix | LinAlgError::FactorizationFailed(_) => {
            OptimizerError::LinearSolveFailed(error)
        }
        other => OptimizerError::LinAlg(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optimizer_type_display() {
        assert_eq!(OptimizerType::LevenbergMarquardt.to_string(), "Levenberg-Marquardt");
        assert_eq!(OptimizerType::GaussNewton.to_string(), "Gauss-Newton");
        assert_eq!(OptimizerType::DogLeg.to_string(), "Dog Leg");
    }

    #[test]
    fn test_status_display() {
        let status = OptimizationStatus::AlgorithmTerminated(TerminationReason::TrialsExhausted);
        assert_eq!(status.to_string(), "Algorithm terminated: trials exhausted");
        assert_eq!(OptimizationStatus::Converged.to_string(), "Converged");
    }

    #[test]
    fn test_stop_token_is_shared_between_clones() {
        let token = StopToken::new();
        let remote = token.clone();
        assert!(!token.is_stopped());
        remote.stop();
        assert!(token.is_stopped());
        token.reset();
        assert!(!remote.is_stopped());
    }

    #[test]
    fn test_breakdown_classification() {
        assert!(linear_solve_error(LinAlgError::SingularMatrix).is_linear_solve_failure());
        assert!(
            linear_solve_error(LinAlgError::FactorizationFailed("x".into()))
                .is_linear_solve_failure()
        );
        assert!(
            !linear_solve_error(LinAlgError::Unsupported("x".into())).is_linear_solve_failure()
        );
    }

    #[test]
    fn test_factory_builds_requested_algorithm() {
        for optimizer_type in [
            OptimizerType::GaussNewton,
            OptimizerType::LevenbergMarquardt,
            OptimizerType::DogLeg,
        ] {
            let algorithm = create_algorithm(optimizer_type, LinearSolverType::Pcg);
            assert_eq!(algorithm.optimizer_type(), optimizer_type);
        }
    }
}
