use faer::{
    Mat, Side,
    linalg::solvers::Solve,
    sparse::SparseColMat,
    sparse::linalg::solvers::{Llt, SymbolicLlt},
};
use nalgebra::{DMatrix, DVector};

use crate::linalg::{
    LinAlgError, LinAlgResult, LinearSolveInfo, LinearSolver, LinearSolverType, SparseBlockMatrix,
};

/// Sparse Cholesky (LLᵀ) backend built on faer.
#[derive(Debug, Clone, Default)]
pub struct SparseCholeskySolver {
    /// Numeric factor of the last successful solve, kept for marginal queries.
    factorizer: Option<Llt<usize, f64>>,

    /// Symbolic factorization reused while the sparsity pattern stays the same.
    /// `SymbolicLlt` is reference counted, cloning it is O(1).
    symbolic_factorization: Option<SymbolicLlt<usize>>,

    /// Column pointers and row indices the symbolic factorization was computed for.
    pattern: Option<(Vec<usize>, Vec<usize>)>,
}

impl SparseCholeskySolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a numeric factor is available.
    pub fn is_factorized(&self) -> bool {
        self.factorizer.is_some()
    }

    fn factorize(&mut self, a: &SparseBlockMatrix<DMatrix<f64>>) -> LinAlgResult<()> {
        let ccs = a.fill_ccs(true);
        let pattern = (ccs.col_ptr, ccs.row_idx);
        if self.pattern.as_ref() != Some(&pattern) {
            self.symbolic_factorization = None;
            self.pattern = Some(pattern);
        }

        let hessian: SparseColMat<usize, f64> = a.to_symmetric_faer()?;

        let sym = if let Some(ref cached_sym) = self.symbolic_factorization {
            cached_sym.clone()
        } else {
            let new_sym = SymbolicLlt::try_new(hessian.symbolic(), Side::Lower).map_err(|e| {
                LinAlgError::FactorizationFailed(
                    "Symbolic Cholesky decomposition failed".to_string(),
                )
                .log_with_source(e)
            })?;
            self.symbolic_factorization = Some(new_sym.clone());
            new_sym
        };

        self.factorizer = None;
        let cholesky = Llt::try_new_with_symbolic(sym, hessian.as_ref(), Side::Lower)
            .map_err(|e| LinAlgError::SingularMatrix.log_with_source(e))?;
        self.factorizer = Some(cholesky);
        Ok(())
    }
}

impl LinearSolver for SparseCholeskySolver {
    fn solver_type(&self) -> LinearSolverType {
        LinearSolverType::SparseCholesky
    }

    fn init(&mut self) {
        self.factorizer = None;
        self.symbolic_factorization = None;
        self.pattern = None;
    }

    fn solve(
        &mut self,
        a: &SparseBlockMatrix<DMatrix<f64>>,
        x: &mut DVector<f64>,
        b: &DVector<f64>,
    ) -> LinAlgResult<LinearSolveInfo> {
        let n = a.cols();
        if b.len() != n {
            return Err(LinAlgError::DimensionMismatch {
                expected: n,
                actual: b.len(),
            }
            .log());
        }
        if n == 0 {
            *x = DVector::zeros(0);
            return Ok(LinearSolveInfo::default());
        }

        self.factorize(a)?;
        let factor = self.factorizer.as_ref().ok_or(LinAlgError::SingularMatrix)?;

        let rhs = Mat::from_fn(n, 1, |i, _| b[i]);
        let solution = factor.solve(&rhs);
        let result = DVector::from_fn(n, |i, _| solution[(i, 0)]);
        if result.iter().any(|v| !v.is_finite()) {
            return Err(LinAlgError::SingularMatrix.log());
        }
        *x = result;
        Ok(LinearSolveInfo::default())
    }

    fn marginals(
        &mut self,
        a: &SparseBlockMatrix<DMatrix<f64>>,
        blocks: &[(usize, usize)],
    ) -> LinAlgResult<Vec<DMatrix<f64>>> {
        let n = a.cols();
        self.factorize(a)?;
        let factor = self.factorizer.as_ref().ok_or(LinAlgError::SingularMatrix)?;

        blocks
            .iter()
            .map(|&(offset, dim)| {
                if offset + dim > n {
                    return Err(LinAlgError::DimensionMismatch {
                        expected: n,
                        actual: offset + dim,
                    }
                    .log());
                }
                // Columns offset..offset+dim of the inverse
                let unit = Mat::from_fn(n, dim, |i, j| if i == offset + j { 1.0 } else { 0.0 });
                let columns = factor.solve(&unit);
                Ok(DMatrix::from_fn(dim, dim, |i, j| columns[(offset + i, j)]))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f64 = 1e-10;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// Upper block triangle of a 5x5 SPD matrix with blocks of size 2 and 3.
    fn spd_system() -> LinAlgResult<SparseBlockMatrix<DMatrix<f64>>> {
        let mut a = SparseBlockMatrix::square(vec![2, 5]);
        *a.add_block(0, 0)? = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        *a.add_block(0, 1)? = DMatrix::from_row_slice(2, 3, &[1.0, 0.0, 0.5, 0.0, 1.0, 0.0]);
        *a.add_block(1, 1)? =
            DMatrix::from_row_slice(3, 3, &[5.0, 1.0, 0.0, 1.0, 6.0, 1.0, 0.0, 1.0, 7.0]);
        Ok(a)
    }

    #[test]
    fn test_solver_creation() {
        let solver = SparseCholeskySolver::new();
        assert!(!solver.is_factorized());
        assert_eq!(solver.solver_type(), LinearSolverType::SparseCholesky);
    }

    #[test]
    fn test_solve_matches_dense() -> TestResult {
        let a = spd_system()?;
        let b = DVector::from_vec(vec![1.0, -2.0, 0.5, 3.0, -1.0]);
        let mut solver = SparseCholeskySolver::new();
        let mut x = DVector::zeros(5);
        let info = solver.solve(&a, &mut x, &b)?;
        assert_eq!(info.iterations, 0);

        let dense = a.to_dense(true);
        let residual = &dense * &x - &b;
        assert!(residual.norm() < TOLERANCE);
        assert!(solver.is_factorized());
        Ok(())
    }

    #[test]
    fn test_symbolic_pattern_caching() -> TestResult {
        let mut a = spd_system()?;
        let b = DVector::from_vec(vec![1.0, 0.0, 0.0, 0.0, 1.0]);
        let mut solver = SparseCholeskySolver::new();
        let mut x1 = DVector::zeros(5);
        solver.solve(&a, &mut x1, &b)?;
        assert!(solver.symbolic_factorization.is_some());

        // Same pattern, new values
        a.add_to_diagonal(1.0);
        let mut x2 = DVector::zeros(5);
        solver.solve(&a, &mut x2, &b)?;
        let residual = a.to_dense(true) * &x2 - &b;
        assert!(residual.norm() < TOLERANCE);
        assert!((x1 - x2).norm() > TOLERANCE);

        solver.init();
        assert!(solver.symbolic_factorization.is_none());
        Ok(())
    }

    #[test]
    fn test_singular_matrix() -> TestResult {
        let mut a: SparseBlockMatrix = SparseBlockMatrix::square(vec![2]);
        *a.add_block(0, 0)? = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]);
        let b = DVector::from_vec(vec![1.0, 1.0]);
        let mut solver = SparseCholeskySolver::new();
        let mut x = DVector::zeros(2);
        assert!(solver.solve(&a, &mut x, &b).is_err());
        assert!(!solver.is_factorized());
        Ok(())
    }

    #[test]
    fn test_empty_system() -> TestResult {
        let a: SparseBlockMatrix = SparseBlockMatrix::square(vec![]);
        let mut solver = SparseCholeskySolver::new();
        let mut x = DVector::zeros(0);
        solver.solve(&a, &mut x, &DVector::zeros(0))?;
        assert_eq!(x.len(), 0);
        Ok(())
    }

    #[test]
    fn test_marginals_match_dense_inverse() -> TestResult {
        let a = spd_system()?;
        let mut solver = SparseCholeskySolver::new();
        let marginals = solver.marginals(&a, &[(0, 2), (2, 3)])?;
        let inverse = a
            .to_dense(true)
            .try_inverse()
            .ok_or("test matrix must be invertible")?;

        assert_eq!(marginals.len(), 2);
        assert!((&marginals[0] - inverse.view((0, 0), (2, 2))).norm() < TOLERANCE);
        assert!((&marginals[1] - inverse.view((2, 2), (3, 3))).norm() < TOLERANCE);
        assert!(solver.marginals(&a, &[(4, 2)]).is_err());
        Ok(())
    }
}
