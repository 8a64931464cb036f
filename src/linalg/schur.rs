//! Schur complement elimination of marginalized blocks.
//!
//! The Hessian is laid out with the free (pose) blocks first and the marginalized
//! (landmark) blocks after them:
//!
//! ```text
//! | Hpp  Hpl | |xp|   |bp|
//! | Hlp  Hll | |xl| = |bl|
//! ```
//!
//! `Hll` must be block diagonal, which holds as long as no edge connects two
//! marginalized vertices. The reduced system is `S xp = r` with
//! `S = Hpp − Hpl Hll⁻¹ Hlp` and `r = bp − Hpl Hll⁻¹ bl`; the eliminated unknowns follow
//! from `xl = Hll⁻¹ (bl − Hlp xp)`.

use nalgebra::{DMatrix, DVector};

use crate::linalg::{LinAlgError, LinAlgResult, SparseBlockMatrix};

#[derive(Debug, Clone)]
pub struct SchurComplement {
    /// Upper block triangle of `S`
    pub reduced: SparseBlockMatrix<DMatrix<f64>>,
    /// `bp − Hpl Hll⁻¹ bl`
    pub rhs: DVector<f64>,
    num_free_blocks: usize,
    free_dimension: usize,
    /// `Hll⁻¹` per marginalized block
    ll_inverses: Vec<DMatrix<f64>>,
}

fn invert_spd_block(block: &DMatrix<f64>) -> LinAlgResult<DMatrix<f64>> {
    match block.clone().cholesky() {
        Some(llt) => Ok(llt.inverse()),
        None => Err(LinAlgError::SingularMatrix.log()),
    }
}

impl SchurComplement {
    /// Eliminate the blocks `num_free_blocks..` of `h` (upper block triangle) from
    /// `h x = b`.
    pub fn eliminate(
        h: &SparseBlockMatrix<DMatrix<f64>>,
        b: &DVector<f64>,
        num_free_blocks: usize,
    ) -> LinAlgResult<Self> {
        if b.len() != h.cols() {
            return Err(LinAlgError::DimensionMismatch {
                expected: h.cols(),
                actual: b.len(),
            }
            .log());
        }
        let num_blocks = h.num_block_cols();
        if num_free_blocks > num_blocks {
            return Err(LinAlgError::InvalidBlockIndex {
                row: num_free_blocks,
                col: num_free_blocks,
                block_rows: num_blocks,
                block_cols: num_blocks,
            }
            .log());
        }

        let free_indices = h.col_block_indices()[..num_free_blocks].to_vec();
        let free_dimension = free_indices.last().copied().unwrap_or(0);
        let mut reduced = SparseBlockMatrix::square(free_indices);
        for c in 0..num_free_blocks {
            for (r, block) in h.column_blocks(c) {
                if r <= c {
                    reduced.accumulate_block(r, c, block)?;
                }
            }
        }
        let mut rhs = b.rows(0, free_dimension).into_owned();

        let mut ll_inverses = Vec::with_capacity(num_blocks - num_free_blocks);
        for l in num_free_blocks..num_blocks {
            for (r, _) in h.column_blocks(l) {
                if r >= num_free_blocks && r != l {
                    return Err(LinAlgError::Unsupported(format!(
                        "marginalized blocks {} and {} are coupled",
                        r, l
                    ))
                    .log());
                }
            }
            let ll = h.block(l, l).ok_or(LinAlgError::SingularMatrix)?;
            let ll_inv = invert_spd_block(ll)?;

            let couplings: Vec<(usize, &DMatrix<f64>)> = h
                .column_blocks(l)
                .filter(|(r, _)| *r < num_free_blocks)
                .collect();

            let bl = b.rows(h.col_base_of_block(l), h.cols_of_block(l));
            let ll_inv_bl = &ll_inv * bl;
            for (i, (pi, h_il)) in couplings.iter().enumerate() {
                // H_il Hll⁻¹, reused for every partner block
                let h_il_inv = *h_il * &ll_inv;

                let base = reduced.row_base_of_block(*pi);
                let dim = h_il.nrows();
                let correction = *h_il * &ll_inv_bl;
                let mut segment = rhs.rows_mut(base, dim);
                segment -= correction;

                for (pj, h_jl) in couplings.iter().skip(i) {
                    let update = &h_il_inv * h_jl.transpose();
                    *reduced.add_block(*pi, *pj)? -= update;
                }
            }
            ll_inverses.push(ll_inv);
        }

        Ok(Self {
            reduced,
            rhs,
            num_free_blocks,
            free_dimension,
            ll_inverses,
        })
    }

    pub fn free_dimension(&self) -> usize {
        self.free_dimension
    }

    /// Full solution `[xp; xl]` from the reduced solution `xp`.
    pub fn back_substitute(
        &self,
        h: &SparseBlockMatrix<DMatrix<f64>>,
        b: &DVector<f64>,
        xp: &DVector<f64>,
    ) -> LinAlgResult<DVector<f64>> {
        if xp.len() != self.free_dimension {
            return Err(LinAlgError::DimensionMismatch {
                expected: self.free_dimension,
                actual: xp.len(),
            }
            .log());
        }
        let mut x = DVector::zeros(h.cols());
        x.rows_mut(0, self.free_dimension).copy_from(xp);

        for (k, ll_inv) in self.ll_inverses.iter().enumerate() {
            let l = self.num_free_blocks + k;
            let base = h.col_base_of_block(l);
            let dim = h.cols_of_block(l);
            let mut rhs = b.rows(base, dim).into_owned();
            for (r, h_rl) in h.column_blocks(l) {
                if r < self.num_free_blocks {
                    let xr = xp.rows(h.row_base_of_block(r), h.rows_of_block(r));
                    rhs -= h_rl.transpose() * xr;
                }
            }
            x.rows_mut(base, dim).copy_from(&(ll_inv * rhs));
        }
        Ok(x)
    }
}
