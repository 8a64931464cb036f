//! Assembly of the block Hessian and gradient from the active edges.
//!
//! For every active edge with error `e`, information `Ω` and Jacobians `J_i`:
//!
//! ```text
//! H_ij += J_iᵀ W J_j        (upper block triangle only)
//! b_i  -= J_iᵀ ρ' Ω e
//! ```
//!
//! where `W` is the robust information of the edge (see [`RobustInformation`]).
//! Vertices that are fixed own no block; their Jacobians are never computed.
//! Marginalized vertices own the trailing blocks and are eliminated through the
//! Schur complement before the linear solve.
//!
//! Linearization writes straight into preallocated memory. [`BlockSolver::build_structure`]
//! sizes one [`EdgeScratch`] per worker from the graph's Jacobian workspace, and every
//! [`BlockSolver::build_system`] reuses them. With the `parallel` feature and enough
//! edges, each worker accumulates its share of the edges into its own copy of the
//! system, and the copies are summed afterwards.

use crate::core::{
    ActiveSubset, CoreError, EdgeId, JacobianWorkspace, OptimizableGraph, RobustInformation,
    Vertex, VertexId,
};
use crate::linalg::{
    LinearSolveInfo, LinearSolver, LinearSolverType, SchurComplement, SparseBlockMatrix,
    create_linear_solver,
};
use crate::optimizer::{Marginals, OptimizerError, OptimizerResult, linear_solve_error};
use nalgebra::{DMatrix, DVector};
use tracing::debug;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Edges per worker below which linearization stays on the calling thread.
#[cfg(feature = "parallel")]
const MIN_EDGES_PER_WORKER: usize = 64;

/// Scratch memory for linearizing one edge at a time: the Jacobian blocks `Jᵢ`, the
/// products `JᵢᵀW` and the weighted error `Ωe`, sized for the largest edge.
#[derive(Debug, Clone)]
struct EdgeScratch {
    jacobians: JacobianWorkspace,
    weighted_jacobians: JacobianWorkspace,
    omega_error: DVector<f64>,
    jt_omega_error: DVector<f64>,
    indices: Vec<Option<usize>>,
    fixed: Vec<bool>,
}

impl EdgeScratch {
    /// Scratch for the sizes recorded in `template`. `None` when nothing was recorded.
    fn allocate(template: &JacobianWorkspace) -> Option<Self> {
        let mut jacobians = template.clone();
        if !jacobians.allocate() {
            return None;
        }
        let max_dimension = jacobians.max_dimension();
        let max_num_vertices = jacobians.max_num_vertices();
        Some(Self {
            weighted_jacobians: jacobians.clone(),
            jacobians,
            omega_error: DVector::zeros(max_dimension),
            jt_omega_error: DVector::zeros(max_dimension),
            indices: Vec::with_capacity(max_num_vertices),
            fixed: Vec::with_capacity(max_num_vertices),
        })
    }

    /// Linearize `edges` at the current estimates and add them into `hessian` and `b`.
    fn accumulate(
        &mut self,
        graph: &OptimizableGraph,
        subset: &ActiveSubset,
        edges: &[EdgeId],
        robust_information: RobustInformation,
        hessian: &mut SparseBlockMatrix<DMatrix<f64>>,
        b: &mut DVector<f64>,
    ) -> OptimizerResult<()> {
        let mut vertices: Vec<&dyn Vertex> = Vec::with_capacity(self.indices.capacity());
        for &edge_id in edges {
            let edge = graph
                .edge(edge_id)
                .ok_or_else(|| CoreError::EdgeNotFound { id: edge_id }.log())?;
            vertices.clear();
            self.indices.clear();
            self.fixed.clear();
            for &id in edge.vertex_ids() {
                vertices.push(
                    graph
                        .vertex(id)
                        .ok_or_else(|| CoreError::VertexNotFound { id }.log())?,
                );
                let index = subset.hessian_index(id);
                self.indices.push(index);
                self.fixed.push(index.is_none());
            }

            self.jacobians.set_zero();
            edge.edge()
                .linearize_oplus(&vertices, &self.fixed, &mut self.jacobians)?;

            let rows = edge.dimension();
            let chi2 = edge.chi2();
            let rho = edge.robust_kernel().map(|kernel| kernel.robustify(chi2));
            let (weight, outer) = robust_information.coefficients(chi2, rho);
            let omega = edge.edge().information();
            let mut omega_error = self.omega_error.rows_mut(0, rows);
            omega_error.gemv(1.0, omega, edge.error(), 0.0);

            // b_i -= w·Jᵢᵀ Ω e and JᵢᵀW = w·JᵢᵀΩ + c·(JᵢᵀΩe)(Ωe)ᵀ
            for (slot, vertex) in vertices.iter().enumerate() {
                let Some(index) = self.indices[slot] else { continue };
                let cols = vertex.dimension();
                let ji = self.jacobians.jacobian(slot, rows, cols)?;
                let base = hessian.row_base_of_block(index);
                b.rows_mut(base, cols).gemv_tr(-weight, &ji, &omega_error, 1.0);

                let mut jt_w = self.weighted_jacobians.jacobian_mut(slot, cols, rows)?;
                jt_w.gemm_tr(weight, &ji, omega, 0.0);
                if outer != 0.0 {
                    let mut jt_omega_error = self.jt_omega_error.rows_mut(0, cols);
                    jt_omega_error.gemv_tr(1.0, &ji, &omega_error, 0.0);
                    jt_w.ger(outer, &jt_omega_error, &omega_error, 1.0);
                }
            }

            // H_rc += (J_rᵀW) J_c with r the smaller block index
            for i in 0..vertices.len() {
                let Some(hi) = self.indices[i] else { continue };
                for j in i..vertices.len() {
                    let Some(hj) = self.indices[j] else { continue };
                    let (row_slot, col_slot) = if hi <= hj { (i, j) } else { (j, i) };
                    let jt_w = self.weighted_jacobians.jacobian(
                        row_slot,
                        vertices[row_slot].dimension(),
                        rows,
                    )?;
                    let jc = self
                        .jacobians
                        .jacobian(col_slot, rows, vertices[col_slot].dimension())?;
                    let block = hessian.block_mut(hi.min(hj), hi.max(hj)).ok_or_else(|| {
                        OptimizerError::InvalidParameters(format!(
                            "Hessian block ({}, {}) missing, rebuild the structure",
                            hi.min(hj),
                            hi.max(hj)
                        ))
                        .log()
                    })?;
                    block.gemm(1.0, &jt_w, &jc, 1.0);
                }
            }
        }
        Ok(())
    }
}

/// A linearization worker with its own copy of the system.
#[cfg(feature = "parallel")]
#[derive(Debug, Clone)]
struct PartialSystem {
    scratch: EdgeScratch,
    hessian: SparseBlockMatrix<DMatrix<f64>>,
    b: DVector<f64>,
}

#[derive(Debug)]
pub struct BlockSolver {
    linear_solver: Option<Box<dyn LinearSolver>>,
    robust_information: RobustInformation,
    hessian: SparseBlockMatrix<DMatrix<f64>>,
    b: DVector<f64>,
    diagonal_backup: Vec<f64>,
    num_free_blocks: usize,
    scratch: Option<EdgeScratch>,
    #[cfg(feature = "parallel")]
    partials: Vec<PartialSystem>,
}

impl Default for BlockSolver {
    fn default() -> Self {
        Self::new(LinearSolverType::default())
    }
}

impl BlockSolver {
    pub fn new(linear_solver_type: LinearSolverType) -> Self {
        Self::with_linear_solver(Some(create_linear_solver(linear_solver_type)))
    }

    /// Block solver around a custom backend. `None` makes every solve fail with
    /// [`OptimizerError::NoLinearSolver`].
    pub fn with_linear_solver(linear_solver: Option<Box<dyn LinearSolver>>) -> Self {
        Self {
            linear_solver,
            robust_information: RobustInformation::default(),
            hessian: SparseBlockMatrix::square(Vec::new()),
            b: DVector::zeros(0),
            diagonal_backup: Vec::new(),
            num_free_blocks: 0,
            scratch: None,
            #[cfg(feature = "parallel")]
            partials: Vec::new(),
        }
    }

    pub fn with_robust_information(mut self, robust_information: RobustInformation) -> Self {
        self.robust_information = robust_information;
        self
    }

    pub fn robust_information(&self) -> RobustInformation {
        self.robust_information
    }

    pub fn set_robust_information(&mut self, robust_information: RobustInformation) {
        self.robust_information = robust_information;
    }

    pub fn linear_solver_type(&self) -> Option<LinearSolverType> {
        self.linear_solver.as_ref().map(|s| s.solver_type())
    }

    pub fn set_linear_solver(&mut self, linear_solver: Option<Box<dyn LinearSolver>>) {
        self.linear_solver = linear_solver;
    }

    /// Allocate the block structure for `subset`: one diagonal block per indexed
    /// vertex and one off-diagonal block per pair of indexed vertices sharing an edge.
    ///
    /// Also allocates the linearization scratch, so the graph's Jacobian workspace
    /// must already be sized for the active edges.
    pub fn build_structure(
        &mut self,
        graph: &OptimizableGraph,
        subset: &ActiveSubset,
    ) -> OptimizerResult<()> {
        let mut hessian = SparseBlockMatrix::square(subset.block_indices());
        for k in 0..hessian.num_block_cols() {
            hessian.add_block(k, k)?;
        }
        for edge_id in subset.edges() {
            let edge = graph
                .edge(*edge_id)
                .ok_or_else(|| CoreError::EdgeNotFound { id: *edge_id }.log())?;
            let indices: Vec<usize> = edge
                .vertex_ids()
                .iter()
                .filter_map(|id| subset.hessian_index(*id))
                .collect();
            for (i, hi) in indices.iter().enumerate() {
                for hj in &indices[i + 1..] {
                    hessian.add_block((*hi).min(*hj), (*hi).max(*hj))?;
                }
            }
        }

        debug!(
            "Hessian structure: {} block columns, {} blocks, {} non-zeros",
            hessian.num_block_cols(),
            hessian.non_zero_blocks(),
            hessian.non_zeros()
        );
        self.scratch = EdgeScratch::allocate(graph.jacobian_workspace());
        if self.scratch.is_none() && !subset.is_empty() {
            return Err(CoreError::Workspace(
                "Jacobian workspace has no size, initialize the optimization first".to_string(),
            )
            .log()
            .into());
        }

        #[cfg(feature = "parallel")]
        {
            let workers = rayon::current_num_threads()
                .min(subset.edges().len() / MIN_EDGES_PER_WORKER);
            self.partials = match &self.scratch {
                Some(scratch) if workers > 1 => {
                    let partial = PartialSystem {
                        scratch: scratch.clone(),
                        hessian: hessian.clone(),
                        b: DVector::zeros(subset.dimension()),
                    };
                    vec![partial; workers]
                }
                _ => Vec::new(),
            };
        }

        self.hessian = hessian;
        self.b = DVector::zeros(subset.dimension());
        self.diagonal_backup.clear();
        self.num_free_blocks = subset.num_free_blocks();
        if let Some(solver) = self.linear_solver.as_mut() {
            solver.init();
        }
        Ok(())
    }

    /// Linearize every active edge at the current estimates and accumulate `H` and `b`.
    ///
    /// Uses the errors cached on the edges, so they must be current. Reuses the
    /// scratch memory allocated by [`Self::build_structure`].
    pub fn build_system(
        &mut self,
        graph: &OptimizableGraph,
        subset: &ActiveSubset,
    ) -> OptimizerResult<()> {
        self.hessian.set_zero();
        self.b.fill(0.0);
        let edges = subset.edges();
        if edges.is_empty() {
            return Ok(());
        }
        let robust_information = self.robust_information;

        #[cfg(feature = "parallel")]
        {
            if !self.partials.is_empty() {
                let chunk_size = edges.len().div_ceil(self.partials.len());
                self.partials
                    .par_iter_mut()
                    .zip(edges.par_chunks(chunk_size))
                    .try_for_each(|(partial, chunk)| {
                        partial.hessian.set_zero();
                        partial.b.fill(0.0);
                        partial.scratch.accumulate(
                            graph,
                            subset,
                            chunk,
                            robust_information,
                            &mut partial.hessian,
                            &mut partial.b,
                        )
                    })?;
                let used = edges.len().div_ceil(chunk_size);
                for partial in &self.partials[..used] {
                    self.hessian.add_matrix(&partial.hessian)?;
                    self.b += &partial.b;
                }
                return Ok(());
            }
        }

        let scratch = self.scratch.as_mut().ok_or_else(|| {
            OptimizerError::from(
                CoreError::Workspace(
                    "no linearization scratch, build the structure first".to_string(),
                )
                .log(),
            )
        })?;
        scratch.accumulate(
            graph,
            subset,
            edges,
            robust_information,
            &mut self.hessian,
            &mut self.b,
        )
    }

    /// Number of linearization workers holding their own copy of the system. Zero
    /// when every edge is linearized on the calling thread.
    pub fn num_partial_systems(&self) -> usize {
        #[cfg(feature = "parallel")]
        {
            self.partials.len()
        }
        #[cfg(not(feature = "parallel"))]
        {
            0
        }
    }

    /// Add `lambda` to the diagonal of `H`, remembering the undamped diagonal.
    pub fn set_lambda(&mut self, lambda: f64) {
        self.diagonal_backup = self.hessian.diagonal_values();
        self.hessian.add_to_diagonal(lambda);
    }

    /// Undo the last [`Self::set_lambda`].
    pub fn restore_diagonal(&mut self) -> OptimizerResult<()> {
        if self.diagonal_backup.is_empty() {
            return Ok(());
        }
        self.hessian.set_diagonal_values(&self.diagonal_backup)?;
        self.diagonal_backup.clear();
        Ok(())
    }

    /// Solve `H x = b`, eliminating marginalized blocks first when there are any.
    pub fn solve(&mut self) -> OptimizerResult<(DVector<f64>, LinearSolveInfo)> {
        let solver = self
            .linear_solver
            .as_mut()
            .ok_or_else(|| OptimizerError::NoLinearSolver.log())?;

        if self.num_free_blocks == self.hessian.num_block_cols() {
            let mut x = DVector::zeros(self.b.len());
            let info = solver
                .solve(&self.hessian, &mut x, &self.b)
                .map_err(linear_solve_error)?;
            return Ok((x, info));
        }

        let schur = SchurComplement::eliminate(&self.hessian, &self.b, self.num_free_blocks)
            .map_err(linear_solve_error)?;
        let mut xp = DVector::zeros(schur.free_dimension());
        let info = if schur.free_dimension() > 0 {
            solver
                .solve(&schur.reduced, &mut xp, &schur.rhs)
                .map_err(linear_solve_error)?
        } else {
            LinearSolveInfo::default()
        };
        let x = schur
            .back_substitute(&self.hessian, &self.b, &xp)
            .map_err(linear_solve_error)?;
        Ok((x, info))
    }

    /// Marginal covariances of free vertices from the current `H`.
    pub fn marginals(
        &mut self,
        subset: &ActiveSubset,
        ids: &[VertexId],
    ) -> OptimizerResult<Marginals> {
        let mut blocks = Vec::with_capacity(ids.len());
        for id in ids {
            let index = subset.hessian_index(*id).ok_or_else(|| {
                OptimizerError::InvalidParameters(format!(
                    "vertex {} has no block in the linear system",
                    id
                ))
                .log()
            })?;
            if index >= self.num_free_blocks {
                return Err(OptimizerError::InvalidParameters(format!(
                    "vertex {} is marginalized, covariance is only available for free vertices",
                    id
                ))
                .log());
            }
            let indexed = &subset.indexed_vertices()[index];
            blocks.push((indexed.offset, indexed.dimension));
        }

        let solver = self
            .linear_solver
            .as_mut()
            .ok_or_else(|| OptimizerError::NoLinearSolver.log())?;
        let covariances = if self.num_free_blocks == self.hessian.num_block_cols() {
            solver.marginals(&self.hessian, &blocks)
        } else {
            let schur = SchurComplement::eliminate(&self.hessian, &self.b, self.num_free_blocks)
                .map_err(linear_solve_error)?;
            solver.marginals(&schur.reduced, &blocks)
        }
        .map_err(linear_solve_error)?;

        Ok(ids.iter().copied().zip(covariances).collect())
    }

    /// Upper block triangle of the current (possibly damped) Hessian.
    pub fn hessian(&self) -> &SparseBlockMatrix<DMatrix<f64>> {
        &self.hessian
    }

    /// Right-hand side `b = −Σ Jᵀ ρ' Ω e`.
    pub fn gradient(&self) -> &DVector<f64> {
        &self.b
    }

    pub fn max_diagonal(&self) -> f64 {
        self.hessian
            .diagonal_values()
            .iter()
            .fold(0.0_f64, |acc, v| acc.max(v.abs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{GraphEdge, Selection, VertexState};
    use crate::optimizer::compute_active_errors;
    use crate::types::euclidean::{EdgeVectorDifference, EdgeVectorPrior, VectorVertex};
    use nalgebra::{Vector2, dvector};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// x0 fixed at the origin, x1 and x2 chained by difference edges, x2 also
    /// tied to x0.
    fn chain() -> Result<OptimizableGraph, Box<dyn std::error::Error>> {
        let mut graph = OptimizableGraph::new();
        graph.add_vertex(0, VectorVertex::<2>::new(Vector2::zeros()))?;
        graph.add_vertex(1, VectorVertex::<2>::new(Vector2::new(0.5, 0.1)))?;
        graph.add_vertex(2, VectorVertex::<2>::new(Vector2::new(1.5, -0.2)))?;
        graph.set_fixed(0, true)?;
        let info = DMatrix::identity(2, 2) * 2.0;
        graph.add_edge(GraphEdge::new(
            vec![0, 1],
            EdgeVectorDifference::new(dvector![1.0, 0.0], info.clone())?,
        ))?;
        graph.add_edge(GraphEdge::new(
            vec![1, 2],
            EdgeVectorDifference::new(dvector![1.0, 0.0], info.clone())?,
        ))?;
        graph.add_edge(GraphEdge::new(
            vec![0, 2],
            EdgeVectorDifference::new(dvector![2.0, 0.0], info)?,
        ))?;
        Ok(graph)
    }

    fn prepare(
        graph: &mut OptimizableGraph,
    ) -> Result<(ActiveSubset, BlockSolver), Box<dyn std::error::Error>> {
        let subset = ActiveSubset::build(graph, &Selection::default())?;
        let mut workspace = std::mem::take(graph.jacobian_workspace_mut());
        workspace.update_size_for_graph(graph);
        *graph.jacobian_workspace_mut() = workspace;
        compute_active_errors(graph, &subset)?;
        let mut solver = BlockSolver::default();
        solver.build_structure(graph, &subset)?;
        solver.build_system(graph, &subset)?;
        Ok((subset, solver))
    }

    #[test]
    fn test_structure_skips_fixed_vertices() -> TestResult {
        let mut graph = chain()?;
        let (_, solver) = prepare(&mut graph)?;
        let h = solver.hessian();
        assert_eq!(h.num_block_cols(), 2);
        assert_eq!(h.non_zero_blocks(), 3);
        assert!(h.block(0, 1).is_some());
        assert!(h.block(1, 0).is_none());
        Ok(())
    }

    #[test]
    fn test_system_matches_hand_assembly() -> TestResult {
        let mut graph = chain()?;
        let (_, solver) = prepare(&mut graph)?;

        // H = Jᵀ Ω J with Ω = 2I over the stacked Jacobian of the three edges
        let dense = solver.hessian().to_dense(true);
        let expected = DMatrix::from_row_slice(
            4,
            4,
            &[
                4.0, 0.0, -2.0, 0.0, //
                0.0, 4.0, 0.0, -2.0, //
                -2.0, 0.0, 4.0, 0.0, //
                0.0, -2.0, 0.0, 4.0,
            ],
        );
        assert!((dense - expected).norm() < 1e-12);

        // errors: e01 = (-0.5, 0.1), e12 = (0, -0.3), e02 = (-0.5, -0.2)
        let b = solver.gradient();
        let expected_b = dvector![
            -2.0 * (-0.5 - 0.0),
            -2.0 * (0.1 + 0.3),
            -2.0 * (0.0 - 0.5),
            -2.0 * (-0.3 - 0.2)
        ];
        assert!((b - expected_b).norm() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_solution_reaches_minimum_of_linear_problem() -> TestResult {
        let mut graph = chain()?;
        let (subset, mut solver) = prepare(&mut graph)?;
        let (x, info) = solver.solve()?;
        assert_eq!(info.iterations, 0);

        let mut stats = crate::optimizer::BatchStatistics::default();
        let stop = crate::optimizer::StopToken::new();
        let mut problem = crate::optimizer::ActiveProblem {
            graph: &mut graph,
            subset: &subset,
            stop: &stop,
            stats: &mut stats,
        };
        problem.update(&x)?;
        problem.compute_active_errors()?;
        assert!(problem.active_chi2() < 1e-18);
        Ok(())
    }

    #[test]
    fn test_lambda_is_restored() -> TestResult {
        let mut graph = chain()?;
        let (_, mut solver) = prepare(&mut graph)?;
        let before = solver.hessian().diagonal_values();
        solver.set_lambda(3.0);
        assert!((solver.hessian().diagonal_values()[0] - before[0] - 3.0).abs() < 1e-12);
        solver.restore_diagonal()?;
        assert_eq!(solver.hessian().diagonal_values(), before);
        Ok(())
    }

    #[test]
    fn test_schur_path_matches_full_solve() -> TestResult {
        let mut graph = chain()?;
        let (_, mut full) = prepare(&mut graph)?;
        let (x_full, _) = full.solve()?;

        let mut graph = chain()?;
        // x1 only touches x0 (fixed) and x2, so it can be marginalized
        graph.set_vertex_state(1, VertexState::Marginalized)?;
        let (subset, mut reduced) = prepare(&mut graph)?;
        assert!(subset.has_marginalized());
        let (x_schur, _) = reduced.solve()?;

        // the marginalized block comes last
        let x1 = subset.hessian_index(1).ok_or("x1 not indexed")?;
        let x2 = subset.hessian_index(2).ok_or("x2 not indexed")?;
        assert_eq!((x1, x2), (1, 0));
        assert!((x_schur.rows(2, 2) - x_full.rows(0, 2)).norm() < 1e-9);
        assert!((x_schur.rows(0, 2) - x_full.rows(2, 2)).norm() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_marginals_of_free_vertex() -> TestResult {
        let mut graph = chain()?;
        let (subset, mut solver) = prepare(&mut graph)?;
        let marginals = solver.marginals(&subset, &[2])?;
        let dense_inverse = solver
            .hessian()
            .to_dense(true)
            .try_inverse()
            .ok_or("singular")?;
        let (id, covariance) = &marginals[0];
        assert_eq!(*id, 2);
        assert!((covariance - dense_inverse.view((2, 2), (2, 2))).norm() < 1e-9);

        assert!(solver.marginals(&subset, &[0]).is_err());
        Ok(())
    }

    #[test]
    fn test_missing_linear_solver() -> TestResult {
        let mut graph = chain()?;
        let (_, mut solver) = prepare(&mut graph)?;
        solver.set_linear_solver(None);
        assert!(matches!(solver.solve(), Err(OptimizerError::NoLinearSolver)));
        Ok(())
    }

    #[test]
    fn test_prior_only_touches_diagonal() -> TestResult {
        let mut graph = OptimizableGraph::new();
        graph.add_vertex(0, VectorVertex::<2>::new(Vector2::new(1.0, 1.0)))?;
        graph.add_edge(GraphEdge::new(
            vec![0],
            EdgeVectorPrior::new(dvector![0.0, 0.0], DMatrix::identity(2, 2))?,
        ))?;
        let (_, solver) = prepare(&mut graph)?;
        assert_eq!(solver.hessian().non_zero_blocks(), 1);
        assert!((solver.gradient() - dvector![-1.0, -1.0]).norm() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_scratch_reused_across_builds() -> TestResult {
        let mut graph = chain()?;
        let (subset, mut solver) = prepare(&mut graph)?;
        let first = solver.hessian().to_dense(true);
        let buffer = solver
            .scratch
            .as_ref()
            .map(|scratch| scratch.omega_error.as_ptr())
            .ok_or("no scratch")?;

        graph.vertex_mut(2).ok_or("x2 missing")?.oplus(&[0.3, -0.1]);
        compute_active_errors(&mut graph, &subset)?;
        solver.build_system(&graph, &subset)?;
        let moved = solver.gradient().clone();
        let reused = solver
            .scratch
            .as_ref()
            .map(|scratch| scratch.omega_error.as_ptr())
            .ok_or("no scratch")?;
        assert_eq!(buffer, reused);
        // linear edges: H does not depend on the estimates
        assert!((solver.hessian().to_dense(true) - first).norm() < 1e-12);

        let mut fresh = BlockSolver::default();
        fresh.build_structure(&graph, &subset)?;
        fresh.build_system(&graph, &subset)?;
        assert!((fresh.gradient() - moved).norm() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_missing_workspace_size_is_reported() -> TestResult {
        let mut graph = chain()?;
        let subset = ActiveSubset::build(&graph, &Selection::default())?;
        graph.jacobian_workspace_mut().reset();
        let mut solver = BlockSolver::default();
        assert!(matches!(
            solver.build_structure(&graph, &subset),
            Err(OptimizerError::Core(CoreError::Workspace(_)))
        ));
        Ok(())
    }

    #[test]
    fn test_partial_systems_match_single_scratch() -> TestResult {
        let mut graph = OptimizableGraph::new();
        let n = 400;
        for i in 0..n {
            let estimate = Vector2::new(i as f64 + 0.1 * (i % 7) as f64, 0.05 * (i % 5) as f64);
            graph.add_vertex(i, VectorVertex::<2>::new(estimate))?;
        }
        graph.set_fixed(0, true)?;
        let info = DMatrix::from_row_slice(2, 2, &[2.0, 0.3, 0.3, 1.0]);
        for i in 1..n {
            graph.add_edge(GraphEdge::new(
                vec![i - 1, i],
                EdgeVectorDifference::new(dvector![1.0, 0.0], info.clone())?,
            ))?;
            if i >= 3 {
                graph.add_edge(GraphEdge::new(
                    vec![i - 3, i],
                    EdgeVectorDifference::new(dvector![3.0, 0.0], info.clone())?,
                ))?;
            }
        }

        let (subset, mut solver) = prepare(&mut graph)?;
        let hessian = solver.hessian().to_dense(true);
        let gradient = solver.gradient().clone();

        #[cfg(feature = "parallel")]
        solver.partials.clear();
        assert_eq!(solver.num_partial_systems(), 0);
        solver.build_system(&graph, &subset)?;
        assert!((solver.hessian().to_dense(true) - hessian).norm() < 1e-9);
        assert!((solver.gradient() - gradient).norm() < 1e-9);
        Ok(())
    }
}
