//! Batch driver.
//!
//! [`SparseOptimizer`] owns the graph and an optimization algorithm. It selects the
//! active subset, applies the gauge and connectivity policies, runs iterations until a
//! stop condition holds and records [`BatchStatistics`] for every iteration.

use crate::core::{ActiveSubset, CoreError, EdgeId, OptimizableGraph, Selection, VertexId};
use crate::linalg::LinearSolverType;
use crate::optimizer::{
    ActiveProblem, BatchStatistics, Marginals, OptimizationAlgorithm, OptimizationStatus,
    OptimizerError, OptimizerResult, OptimizerType, SolverResult, StepOutcome, StopToken,
    active_chi2, active_robust_chi2, compute_active_errors, create_algorithm,
};
use std::collections::BTreeSet;
use tracing::{Level, debug, info, warn};
use web_time::{Duration, Instant};

/// What to do when nothing anchors the active subset.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum GaugePolicy {
    /// Fix the vertex chosen by [`ActiveSubset::find_gauge`] and warn
    #[default]
    AutoFix,
    /// Fail with [`CoreError::GaugeFreedom`]
    Fail,
    /// Optimize anyway; the linear solves will most likely break down
    Ignore,
}

/// What to do with active vertices not connected to any anchor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityPolicy {
    /// Enumerate them in a warning
    #[default]
    Warn,
    /// Fail with [`CoreError::DisconnectedGraph`]
    Fail,
}

/// Stop conditions and initialization policies of the driver.
#[derive(Clone, Debug, Default)]
pub struct DriverConfig {
    /// Stop when `chi2_prev / chi2 − 1` falls in `[0, tolerance)`
    pub chi2_tolerance: Option<f64>,
    /// Stop when chi2 falls below this value
    pub min_chi2: Option<f64>,
    /// Wall-clock budget, checked before every iteration
    pub timeout: Option<Duration>,
    pub gauge_policy: GaugePolicy,
    pub connectivity_policy: ConnectivityPolicy,
}

impl DriverConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the relative chi2 improvement below which the optimization stops
    pub fn with_chi2_tolerance(mut self, tolerance: f64) -> Self {
        self.chi2_tolerance = Some(tolerance);
        self
    }

    /// Set minimum chi2 cutoff for early termination.
    pub fn with_min_chi2(mut self, min_chi2: f64) -> Self {
        self.min_chi2 = Some(min_chi2);
        self
    }

    /// Set the timeout duration
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_gauge_policy(mut self, gauge_policy: GaugePolicy) -> Self {
        self.gauge_policy = gauge_policy;
        self
    }

    pub fn with_connectivity_policy(mut self, connectivity_policy: ConnectivityPolicy) -> Self {
        self.connectivity_policy = connectivity_policy;
        self
    }

    /// Print configuration parameters (debug level logging)
    pub fn print_configuration(&self) {
        debug!(
            "Driver:\n  Chi2 tolerance:     {:?}\n  Min chi2:           {:?}\n  Timeout:            {:?}\n  Gauge policy:       {:?}\n  Connectivity:       {:?}",
            self.chi2_tolerance,
            self.min_chi2,
            self.timeout,
            self.gauge_policy,
            self.connectivity_policy
        );
    }
}

#[derive(Debug)]
pub struct SparseOptimizer {
    graph: OptimizableGraph,
    algorithm: Option<Box<dyn OptimizationAlgorithm>>,
    config: DriverConfig,
    subset: Option<ActiveSubset>,
    stop: StopToken,
    statistics: Vec<BatchStatistics>,
    unreachable: Vec<VertexId>,
}

impl SparseOptimizer {
    /// Driver over `graph` without an algorithm.
    pub fn new(graph: OptimizableGraph) -> Self {
        Self {
            graph,
            algorithm: None,
            config: DriverConfig::default(),
            subset: None,
            stop: StopToken::new(),
            statistics: Vec::new(),
            unreachable: Vec::new(),
        }
    }

    /// Driver with a default-configured algorithm of the given types.
    pub fn with_algorithm_type(
        graph: OptimizableGraph,
        optimizer_type: OptimizerType,
        linear_solver_type: LinearSolverType,
    ) -> Self {
        Self::new(graph).with_algorithm(create_algorithm(optimizer_type, linear_solver_type))
    }

    pub fn with_algorithm(mut self, algorithm: Box<dyn OptimizationAlgorithm>) -> Self {
        self.set_algorithm(algorithm);
        self
    }

    pub fn with_config(mut self, config: DriverConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the algorithm. The optimization has to be initialized again.
    pub fn set_algorithm(&mut self, algorithm: Box<dyn OptimizationAlgorithm>) {
        self.algorithm = Some(algorithm);
        self.subset = None;
    }

    pub fn algorithm(&self) -> Option<&dyn OptimizationAlgorithm> {
        self.algorithm.as_deref()
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut DriverConfig {
        &mut self.config
    }

    pub fn graph(&self) -> &OptimizableGraph {
        &self.graph
    }

    /// Mutable access to the graph. Invalidates the active subset.
    pub fn graph_mut(&mut self) -> &mut OptimizableGraph {
        self.subset = None;
        &mut self.graph
    }

    pub fn into_graph(self) -> OptimizableGraph {
        self.graph
    }

    pub fn active_subset(&self) -> Option<&ActiveSubset> {
        self.subset.as_ref()
    }

    /// Handle that stops [`Self::optimize`] after the current iteration.
    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    /// Statistics of the last [`Self::optimize`] call.
    pub fn batch_statistics(&self) -> &[BatchStatistics] {
        &self.statistics
    }

    /// Active vertices found unreachable from any anchor by the last initialization.
    pub fn unreachable_vertices(&self) -> &[VertexId] {
        &self.unreachable
    }

    /// Optimize every edge of level 0.
    pub fn initialize_optimization(&mut self) -> OptimizerResult<()> {
        self.initialize(Selection::default())
    }

    pub fn initialize_optimization_at_level(&mut self, level: usize) -> OptimizerResult<()> {
        self.initialize(Selection::Level(level))
    }

    /// Optimize the edges of `level` whose vertices all belong to `ids`.
    pub fn initialize_optimization_with_vertices(
        &mut self,
        ids: impl IntoIterator<Item = VertexId>,
        level: usize,
    ) -> OptimizerResult<()> {
        self.initialize(Selection::Vertices {
            ids: ids.into_iter().collect(),
            level,
        })
    }

    /// Optimize exactly the given edges, whatever their level.
    pub fn initialize_optimization_with_edges(
        &mut self,
        ids: impl IntoIterator<Item = EdgeId>,
    ) -> OptimizerResult<()> {
        let ids: BTreeSet<EdgeId> = ids.into_iter().collect();
        self.initialize(Selection::Edges(ids))
    }

    fn initialize(&mut self, selection: Selection) -> OptimizerResult<()> {
        self.subset = None;
        self.statistics.clear();
        self.unreachable.clear();
        if self.algorithm.is_none() {
            return Err(OptimizerError::NoAlgorithm.log());
        }

        let mut subset = ActiveSubset::build(&self.graph, &selection)?;
        if subset.vertices().is_empty() {
            return Err(OptimizerError::NoVertices.log());
        }

        if subset.gauge_freedom(&self.graph) {
            match self.config.gauge_policy {
                GaugePolicy::AutoFix => {
                    if let Some(id) = subset.find_gauge(&self.graph) {
                        warn!("Gauge freedom detected, fixing vertex {}", id);
                        self.graph.set_fixed(id, true)?;
                        subset = ActiveSubset::build(&self.graph, &selection)?;
                    }
                }
                GaugePolicy::Fail => {
                    return Err(CoreError::GaugeFreedom(
                        "no active vertex is fixed or carries an absolute prior".to_string(),
                    )
                    .log()
                    .into());
                }
                GaugePolicy::Ignore => debug!("Gauge freedom detected and ignored"),
            }
        }

        let unreachable = subset.unreachable_vertices(&self.graph);
        if !unreachable.is_empty() {
            match self.config.connectivity_policy {
                ConnectivityPolicy::Warn => warn!(
                    "{} active vertices are not connected to any fixed vertex: {:?}",
                    unreachable.len(),
                    unreachable
                ),
                ConnectivityPolicy::Fail => {
                    return Err(CoreError::DisconnectedGraph { unreachable }.log().into());
                }
            }
        }
        self.unreachable = unreachable;

        let mut workspace = std::mem::take(self.graph.jacobian_workspace_mut());
        workspace.update_size_for_graph(&self.graph);
        *self.graph.jacobian_workspace_mut() = workspace;

        compute_active_errors(&mut self.graph, &subset)?;
        if let Some(algorithm) = self.algorithm.as_mut() {
            algorithm.init(&self.graph, &subset)?;
        }
        self.subset = Some(subset);
        Ok(())
    }

    /// Recompute the errors of the active edges.
    pub fn compute_active_errors(&mut self) -> OptimizerResult<()> {
        let subset = self
            .subset
            .as_ref()
            .ok_or_else(|| OptimizerError::NotInitialized.log())?;
        compute_active_errors(&mut self.graph, subset)
    }

    /// Chi2 of the active edges from the cached errors.
    pub fn active_chi2(&self) -> OptimizerResult<f64> {
        let subset = self
            .subset
            .as_ref()
            .ok_or_else(|| OptimizerError::NotInitialized.log())?;
        Ok(active_chi2(&self.graph, subset))
    }

    pub fn active_robust_chi2(&self) -> OptimizerResult<f64> {
        let subset = self
            .subset
            .as_ref()
            .ok_or_else(|| OptimizerError::NotInitialized.log())?;
        Ok(active_robust_chi2(&self.graph, subset))
    }

    /// Run at most `max_iterations` iterations on the initialized subset.
    pub fn optimize(&mut self, max_iterations: usize) -> OptimizerResult<SolverResult> {
        let subset = self
            .subset
            .as_ref()
            .ok_or_else(|| OptimizerError::NotInitialized.log())?;
        let algorithm = self
            .algorithm
            .as_mut()
            .ok_or_else(|| OptimizerError::NoAlgorithm.log())?;

        let start = Instant::now();
        self.statistics.clear();
        compute_active_errors(&mut self.graph, subset)?;
        let initial_chi2 = active_chi2(&self.graph, subset);

        if tracing::enabled!(Level::DEBUG) {
            algorithm.print_configuration();
            self.config.print_configuration();
            BatchStatistics::print_header();
        }

        let mut status = OptimizationStatus::MaxIterationsReached;
        let mut last_chi2 = initial_chi2;
        let mut iterations = 0;
        for iteration in 0..max_iterations {
            if self.stop.is_stopped() {
                status = OptimizationStatus::UserTerminated;
                break;
            }
            if let Some(timeout) = self.config.timeout
                && start.elapsed() >= timeout
            {
                status = OptimizationStatus::Timeout;
                break;
            }

            let iteration_start = Instant::now();
            let mut stats = BatchStatistics::new(iteration);
            stats.num_vertices = subset.vertices().len();
            stats.num_edges = subset.edges().len();
            let outcome = {
                let mut problem = ActiveProblem {
                    graph: &mut self.graph,
                    subset,
                    stop: &self.stop,
                    stats: &mut stats,
                };
                algorithm.solve(iteration, &mut problem)?
            };
            iterations += 1;

            compute_active_errors(&mut self.graph, subset)?;
            let chi2 = active_chi2(&self.graph, subset);
            stats.chi2 = chi2;
            stats.robust_chi2 = active_robust_chi2(&self.graph, subset);
            stats.time_iteration = iteration_start.elapsed();
            stats.print_line();
            self.statistics.push(stats);

            if !chi2.is_finite() {
                status = OptimizationStatus::InvalidNumericalValues;
                break;
            }
            if let StepOutcome::Terminate(reason) = outcome {
                status = OptimizationStatus::AlgorithmTerminated(reason);
                last_chi2 = chi2;
                break;
            }
            if let Some(min_chi2) = self.config.min_chi2
                && chi2 < min_chi2
            {
                status = OptimizationStatus::MinChi2Reached;
                last_chi2 = chi2;
                break;
            }
            if chi2 == last_chi2 {
                status = OptimizationStatus::Converged;
                break;
            }
            if let Some(tolerance) = self.config.chi2_tolerance {
                let gain = last_chi2 / chi2 - 1.0;
                if (0.0..tolerance).contains(&gain) {
                    status = OptimizationStatus::Chi2ToleranceReached;
                    last_chi2 = chi2;
                    break;
                }
            }
            last_chi2 = chi2;
        }

        let result = SolverResult {
            status,
            iterations,
            initial_chi2,
            final_chi2: last_chi2,
            elapsed_time: start.elapsed(),
            statistics: self.statistics.clone(),
        };
        info!(
            "{} finished: {} after {} iterations, chi2 {:.6e} -> {:.6e} in {:.2}ms",
            algorithm.optimizer_type(),
            result.status,
            result.iterations,
            result.initial_chi2,
            result.final_chi2,
            result.elapsed_time.as_secs_f64() * 1000.0
        );
        Ok(result)
    }

    /// Marginal covariances of free active vertices, linearized at the current
    /// estimates.
    pub fn compute_marginals(&mut self, ids: &[VertexId]) -> OptimizerResult<Marginals> {
        let subset = self
            .subset
            .as_ref()
            .ok_or_else(|| OptimizerError::NotInitialized.log())?;
        let algorithm = self
            .algorithm
            .as_mut()
            .ok_or_else(|| OptimizerError::NoAlgorithm.log())?;
        compute_active_errors(&mut self.graph, subset)?;
        let block_solver = algorithm.block_solver_mut();
        block_solver.build_system(&self.graph, subset)?;
        block_solver.marginals(subset, ids)
    }
}
