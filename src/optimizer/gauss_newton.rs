//! Gauss-Newton algorithm implementation.
//!
//! Each iteration linearizes the active edges at the current estimate, solves the
//! normal equations
//!
//! ```text
//! H·Δx = b        H = Σ Jᵀ W J,  b = −Σ Jᵀ ρ' Ω e
//! ```
//!
//! and applies `Δx` through every vertex's `oplus` unconditionally. There is no
//! damping and no step control, so Gauss-Newton converges quadratically close to
//! the minimum but may diverge from a poor initial guess. A singular `H` is
//! reported as an error and leaves the estimate untouched.

use crate::core::{ActiveSubset, OptimizableGraph, RobustInformation};
use crate::linalg::LinearSolverType;
use crate::optimizer::{
    ActiveProblem, BlockSolver, OptimizationAlgorithm, OptimizerResult, OptimizerType,
    StepOutcome,
};
use tracing::debug;
use web_time::Instant;

/// Configuration parameters for the Gauss-Newton optimizer.
#[derive(Clone, Debug, Default)]
pub struct GaussNewtonConfig {
    /// Type of linear solver for the linear systems
    pub linear_solver_type: LinearSolverType,
    /// How robust kernels enter the Hessian
    pub robust_information: RobustInformation,
}

impl GaussNewtonConfig {
    /// Create a new Gauss-Newton configuration with default values.
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

    /// Print configuration parameters (debug level logging)
    pub fn print_configuration(&self) {
        debug!(
            "Configuration:\n  Solver:             Gauss-Newton\n  Linear solver:      {}\n  Robust information: {}",
            self.linear_solver_type, self.robust_information
        );
    }
}

/// Gauss-Newton solver for nonlinear least squares optimization.
#[derive(Debug)]
pub struct GaussNewton {
    config: GaussNewtonConfig,
    block_solver: BlockSolver,
}

impl Default for GaussNewton {
    fn default() -> Self {
        Self::new()
    }
}

impl GaussNewton {
    /// Create a new Gauss-Newton solver with default configuration.
    pub fn new() -> Self {
        Self::with_config(GaussNewtonConfig::default())
    }

    /// Create a new Gauss-Newton solver with the given configuration.
    pub fn with_config(config: GaussNewtonConfig) -> Self {
        let block_solver = BlockSolver::new(config.linear_solver_type)
            .with_robust_information(config.robust_information);
        Self {
            config,
            block_solver,
        }
    }

    pub fn config(&self) -> &GaussNewtonConfig {
        &self.config
    }
}

impl OptimizationAlgorithm for GaussNewton {
    fn optimizer_type(&self) -> OptimizerType {
        OptimizerType::GaussNewton
    }

    fn init(&mut self, graph: &OptimizableGraph, subset: &ActiveSubset) -> OptimizerResult<()> {
        self.block_solver.build_structure(graph, subset)
    }

    fn solve(
        &mut self,
        _iteration: usize,
        problem: &mut ActiveProblem<'_>,
    ) -> OptimizerResult<StepOutcome> {
        let start = Instant::now();
        self.block_solver.build_system(problem.graph, problem.subset)?;
        problem.stats.time_linearize = start.elapsed();

        let start = Instant::now();
        let (x, info) = self.block_solver.solve()?;
        problem.stats.time_linear_solve = start.elapsed();
        problem.stats.linear_solver_iterations = info.iterations;

        problem.update(&x)?;
        problem.stats.accepted = true;
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
    use crate::core::{GraphEdge, Selection};
    use crate::optimizer::{BatchStatistics, OptimizerError, StopToken, compute_active_errors};
    use crate::types::euclidean::{EdgeVectorDifference, VectorVertex};
    use nalgebra::{DMatrix, Vector2, dvector};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn run_iteration(
        algorithm: &mut GaussNewton,
        graph: &mut OptimizableGraph,
    ) -> OptimizerResult<StepOutcome> {
        let subset = ActiveSubset::build(graph, &Selection::default())?;
        let mut workspace = std::mem::take(graph.jacobian_workspace_mut());
        workspace.update_size_for_graph(graph);
        *graph.jacobian_workspace_mut() = workspace;
        compute_active_errors(graph, &subset)?;
        algorithm.init(graph, &subset)?;

        let stop = StopToken::new();
        let mut stats = BatchStatistics::new(0);
        let mut problem = ActiveProblem {
            graph,
            subset: &subset,
            stop: &stop,
            stats: &mut stats,
        };
        algorithm.solve(0, &mut problem)
    }

    #[test]
    fn test_linear_problem_solved_in_one_step() -> TestResult {
        let mut graph = OptimizableGraph::new();
        graph.add_vertex(0, VectorVertex::<2>::new(Vector2::zeros()))?;
        graph.add_vertex(1, VectorVertex::<2>::new(Vector2::new(3.0, -4.0)))?;
        graph.set_fixed(0, true)?;
        graph.add_edge(GraphEdge::new(
            vec![0, 1],
            EdgeVectorDifference::new(dvector![1.0, 2.0], DMatrix::identity(2, 2))?,
        ))?;

        let mut algorithm = GaussNewton::new();
        assert_eq!(run_iteration(&mut algorithm, &mut graph)?, StepOutcome::Continue);
        let x1 = graph
            .vertex_as::<VectorVertex<2>>(1)
            .ok_or("vertex 1 missing")?;
        assert!((x1.value() - Vector2::new(1.0, 2.0)).norm() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_gauge_freedom_fails_without_update() -> TestResult {
        let mut graph = OptimizableGraph::new();
        graph.add_vertex(0, VectorVertex::<2>::new(Vector2::zeros()))?;
        graph.add_vertex(1, VectorVertex::<2>::new(Vector2::new(3.0, -4.0)))?;
        graph.add_edge(GraphEdge::new(
            vec![0, 1],
            EdgeVectorDifference::new(dvector![1.0, 2.0], DMatrix::identity(2, 2))?,
        ))?;

        let mut algorithm = GaussNewton::new();
        let result = run_iteration(&mut algorithm, &mut graph);
        assert!(matches!(result, Err(OptimizerError::LinearSolveFailed(_))));
        let x1 = graph
            .vertex_as::<VectorVertex<2>>(1)
            .ok_or("vertex 1 missing")?;
        assert_eq!(*x1.value(), Vector2::new(3.0, -4.0));
        Ok(())
    }
}
