//! Preconditioned conjugate gradients on the block Hessian.
//!
//! The system matrix is never assembled in scalar form: products use
//! [`SparseBlockMatrix::multiply_symmetric_upper_triangle`] and the preconditioner is the
//! inverse of each diagonal block (block Jacobi).

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::linalg::{
    LinAlgError, LinAlgResult, LinearSolveInfo, LinearSolver, LinearSolverType, SparseBlockMatrix,
};

/// Iterations between recomputing the residual from scratch.
const RESIDUAL_REFRESH_INTERVAL: usize = 50;

#[derive(Debug, Clone)]
pub struct PcgConfig {
    /// Relative reduction of the preconditioned residual
    pub tolerance: f64,
    /// Iteration cap, `None` means the system dimension
    pub max_iterations: Option<usize>,
    /// Carry the final residual of one solve over as the floor of the next
    pub absolute_tolerance: bool,
}

impl Default for PcgConfig {
    fn default() -> Self {
        Self {
            // Reduce the preconditioned residual by six orders of magnitude
            tolerance: 1e-6,
            // One iteration per unknown
            max_iterations: None,
            // Warm start from the previous residual
            absolute_tolerance: true,
        }
    }
}

impl PcgConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    pub fn with_absolute_tolerance(mut self, absolute_tolerance: bool) -> Self {
        self.absolute_tolerance = absolute_tolerance;
        self
    }

    pub fn print_configuration(&self) {
        debug!(
            "PCG: tolerance {:.2e}, max iterations {}, absolute tolerance {}",
            self.tolerance,
            self.max_iterations
                .map_or_else(|| "dimension".to_string(), |n| n.to_string()),
            self.absolute_tolerance
        );
    }
}

#[derive(Debug, Clone)]
pub struct PcgSolver {
    config: PcgConfig,
    /// Half the preconditioned residual norm reached by the last solve, negative before
    /// the first one
    residual: f64,
}

impl PcgSolver {
    pub fn new(config: PcgConfig) -> Self {
        Self {
            config,
            residual: -1.0,
        }
    }

    pub fn config(&self) -> &PcgConfig {
        &self.config
    }

    pub fn residual(&self) -> f64 {
        self.residual
    }

    fn block_jacobi(
        a: &SparseBlockMatrix<DMatrix<f64>>,
    ) -> LinAlgResult<Vec<(usize, DMatrix<f64>)>> {
        (0..a.num_block_cols())
            .map(|c| {
                let block = a.block(c, c).ok_or(LinAlgError::SingularMatrix)?;
                let inverse = match block.clone().cholesky() {
                    Some(llt) => llt.inverse(),
                    None => block
                        .clone()
                        .try_inverse()
                        .ok_or(LinAlgError::SingularMatrix)?,
                };
                Ok((a.col_base_of_block(c), inverse))
            })
            .collect()
    }

    fn precondition(preconditioner: &[(usize, DMatrix<f64>)], r: &DVector<f64>) -> DVector<f64> {
        let mut out = DVector::zeros(r.len());
        for (base, inverse) in preconditioner {
            let dim = inverse.nrows();
            let product = inverse * r.rows(*base, dim);
            out.rows_mut(*base, dim).copy_from(&product);
        }
        out
    }
}

impl Default for PcgSolver {
    fn default() -> Self {
        Self::new(PcgConfig::default())
    }
}

impl LinearSolver for PcgSolver {
    fn solver_type(&self) -> LinearSolverType {
        LinearSolverType::Pcg
    }

    fn init(&mut self) {
        self.residual = -1.0;
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
        let preconditioner = Self::block_jacobi(a).map_err(|e| e.log())?;

        let mut solution = DVector::zeros(n);
        let mut r = b.clone();
        let mut d = Self::precondition(&preconditioner, &r);
        let mut dn = r.dot(&d);
        let mut d0 = self.config.tolerance * dn;
        if self.config.absolute_tolerance && self.residual > 0.0 && self.residual > d0 {
            d0 = self.residual;
        }

        let max_iterations = self.config.max_iterations.unwrap_or(n);
        let mut iteration = 0;
        while iteration < max_iterations && dn > d0 {
            let q = a.mul_symmetric_vector(&d)?;
            let dq = d.dot(&q);
            if dq == 0.0 {
                break;
            }
            if dq < 0.0 || !dq.is_finite() {
                return Err(LinAlgError::SingularMatrix.log());
            }
            let alpha = dn / dq;
            solution.axpy(alpha, &d, 1.0);

            if iteration % RESIDUAL_REFRESH_INTERVAL == 0 {
                r = b - a.mul_symmetric_vector(&solution)?;
            } else {
                r.axpy(-alpha, &q, 1.0);
            }

            let s = Self::precondition(&preconditioner, &r);
            let dold = dn;
            dn = r.dot(&s);
            let beta = dn / dold;
            d = s + d * beta;
            iteration += 1;
        }

        if dn > d0 {
            debug!(
                "PCG stopped after {} iterations with residual {:.3e} (target {:.3e})",
                iteration, dn, d0
            );
        }
        self.residual = 0.5 * dn;
        *x = solution;
        Ok(LinearSolveInfo {
            iterations: iteration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::SparseCholeskySolver;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// Tridiagonal SPD chain with 2x2 blocks.
    fn chain_system(blocks: usize) -> LinAlgResult<SparseBlockMatrix<DMatrix<f64>>> {
        let indices = (1..=blocks).map(|i| 2 * i).collect();
        let mut a = SparseBlockMatrix::square(indices);
        for i in 0..blocks {
            *a.add_block(i, i)? = DMatrix::from_row_slice(2, 2, &[4.0, 0.5, 0.5, 3.0]);
            if i + 1 < blocks {
                *a.add_block(i, i + 1)? = DMatrix::from_row_slice(2, 2, &[-1.0, 0.0, 0.2, -1.0]);
            }
        }
        Ok(a)
    }

    #[test]
    fn test_config_builder() {
        let config = PcgConfig::new()
            .with_tolerance(1e-9)
            .with_max_iterations(7)
            .with_absolute_tolerance(false);
        assert_eq!(config.tolerance, 1e-9);
        assert_eq!(config.max_iterations, Some(7));
        assert!(!config.absolute_tolerance);
        assert!(PcgConfig::default().absolute_tolerance);
    }

    #[test]
    fn test_pcg_agrees_with_cholesky() -> TestResult {
        let a = chain_system(6)?;
        let b = DVector::from_fn(12, |i, _| (i as f64 * 0.7).sin());

        let mut cholesky = SparseCholeskySolver::new();
        let mut expected = DVector::zeros(12);
        cholesky.solve(&a, &mut expected, &b)?;

        let mut pcg = PcgSolver::new(
            PcgConfig::new()
                .with_tolerance(1e-20)
                .with_absolute_tolerance(false),
        );
        let mut x = DVector::zeros(12);
        let info = pcg.solve(&a, &mut x, &b)?;
        assert!(info.iterations > 0 && info.iterations <= 12);
        assert!((x - expected).norm() < 1e-8);
        Ok(())
    }

    #[test]
    fn test_block_diagonal_system_needs_one_iteration() -> TestResult {
        let mut a: SparseBlockMatrix = SparseBlockMatrix::square(vec![2, 4]);
        *a.add_block(0, 0)? = DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 1.0, 2.0]);
        *a.add_block(1, 1)? = DMatrix::from_row_slice(2, 2, &[5.0, 0.0, 0.0, 1.0]);
        let b = DVector::from_vec(vec![3.0, 3.0, 5.0, 1.0]);

        let mut pcg = PcgSolver::default();
        let mut x = DVector::zeros(4);
        let info = pcg.solve(&a, &mut x, &b)?;
        assert_eq!(info.iterations, 1);
        assert!((x - DVector::from_vec(vec![1.0, 1.0, 1.0, 1.0])).norm() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_warm_start_floor_persists_until_init() -> TestResult {
        let a = chain_system(4)?;
        let b = DVector::from_element(8, 1.0);
        let mut pcg = PcgSolver::default();
        let mut x = DVector::zeros(8);
        pcg.solve(&a, &mut x, &b)?;
        assert!(pcg.residual() >= 0.0);

        // Solving the same system again starts below the floor
        let info = pcg.solve(&a, &mut x, &b)?;
        assert!(info.iterations <= 8);

        pcg.init();
        assert!(pcg.residual() < 0.0);
        Ok(())
    }

    #[test]
    fn test_missing_diagonal_block_is_singular() -> TestResult {
        let mut a: SparseBlockMatrix = SparseBlockMatrix::square(vec![1, 2]);
        *a.add_block(0, 0)? = DMatrix::from_element(1, 1, 1.0);
        let mut pcg = PcgSolver::default();
        let mut x = DVector::zeros(2);
        let result = pcg.solve(&a, &mut x, &DVector::from_vec(vec![1.0, 1.0]));
        assert!(matches!(result, Err(LinAlgError::SingularMatrix)));
        Ok(())
    }
}
