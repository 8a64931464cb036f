pub mod block_matrix;
pub mod cholesky;
pub mod pcg;
pub mod schur;

use nalgebra::{DMatrix, DVector};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;
use tracing::error;

pub use block_matrix::{CompressedColumn, MatrixBlock, SparseBlockMatrix};
pub use cholesky::SparseCholeskySolver;
pub use pcg::{PcgConfig, PcgSolver};
pub use schur::SchurComplement;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolverType {
    #[default]
    SparseCholesky,
    Pcg,
}

impl Display for LinearSolverType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LinearSolverType::SparseCholesky => write!(f, "Sparse Cholesky"),
            LinearSolverType::Pcg => write!(f, "PCG"),
        }
    }
}

/// Linear algebra specific error types
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Matrix factorization failed (symbolic or numeric)
    #[error("Matrix factorization failed: {0}")]
    FactorizationFailed(String),

    /// Singular or not positive definite matrix
    #[error("Singular matrix detected (matrix is not invertible)")]
    SingularMatrix,

    /// Failed to create sparse matrix from triplets
    #[error("Failed to create sparse matrix: {0}")]
    SparseMatrixCreation(String),

    #[error("Block index ({row}, {col}) out of range for a {block_rows}x{block_cols} block grid")]
    InvalidBlockIndex {
        row: usize,
        col: usize,
        block_rows: usize,
        block_cols: usize,
    },

    #[error("Block has shape {actual:?}, expected {expected:?}")]
    BlockDimensionMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("Vector has length {actual}, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Operation not provided by this backend
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl LinAlgError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the error reported by faer or nalgebra
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// What a backend reports about a successful solve.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinearSolveInfo {
    /// Iterations used by an iterative backend, 0 for direct factorizations
    pub iterations: usize,
}

/// Backend solving `A x = b` for a symmetric positive definite `A` given by its
/// upper block triangle.
pub trait LinearSolver: Send + fmt::Debug {
    fn solver_type(&self) -> LinearSolverType;

    /// Forget cached state such as symbolic factorizations. Called whenever the
    /// structure of the system may have changed.
    fn init(&mut self);

    /// Solve `A x = b`, writing the solution into `x`.
    ///
    /// # Errors
    /// `SingularMatrix` or `FactorizationFailed` on numerical breakdown.
    fn solve(
        &mut self,
        a: &SparseBlockMatrix<DMatrix<f64>>,
        x: &mut DVector<f64>,
        b: &DVector<f64>,
    ) -> LinAlgResult<LinearSolveInfo>;

    /// Diagonal blocks of `A⁻¹` for the given `(offset, dimension)` ranges.
    fn marginals(
        &mut self,
        _a: &SparseBlockMatrix<DMatrix<f64>>,
        _blocks: &[(usize, usize)],
    ) -> LinAlgResult<Vec<DMatrix<f64>>> {
        Err(LinAlgError::Unsupported(format!(
            "{} does not provide marginal covariances",
            self.solver_type()
        ))
        .log())
    }
}

/// Create a linear solver backend.
pub fn create_linear_solver(solver_type: LinearSolverType) -> Box<dyn LinearSolver> {
    match solver_type {
        LinearSolverType::SparseCholesky => Box::new(SparseCholeskySolver::new()),
        LinearSolverType::Pcg => Box::new(PcgSolver::new(PcgConfig::default())),
    }
}
