//! Block-sparse matrices.
//!
//! A [`SparseBlockMatrix`] stores dense blocks on a grid whose row and column
//! boundaries come from vertex dimensions. Block rows and columns are described by
//! cumulative end offsets: block `r` covers rows `row_base_of_block(r)..row_block_indices[r]`.
//! Each block column keeps its blocks in a row-ordered map, which gives
//! column-compressed traversal for free.
//!
//! The Hessian of an optimization problem is stored as its upper block triangle
//! (`r <= c`); [`SparseBlockMatrix::multiply_symmetric_upper_triangle`] and the
//! conversions in this module know how to mirror it.
//!
//! Blocks are generic over [`MatrixBlock`], implemented for dynamically sized
//! `DMatrix<f64>` and for fixed-size `SMatrix<f64, R, C>`.

use crate::linalg::{LinAlgError, LinAlgResult};
use faer::sparse::{SparseColMat, Triplet};
use nalgebra::{DMatrix, DVector, SMatrix};
use std::collections::BTreeMap;
use std::fmt;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Dense column-major block usable inside a [`SparseBlockMatrix`].
pub trait MatrixBlock: Clone + Send + Sync + fmt::Debug {
    /// Zero block of the given shape. Fixed-size blocks ignore the arguments.
    fn zeros_block(rows: usize, cols: usize) -> Self;

    fn block_rows(&self) -> usize;

    fn block_cols(&self) -> usize;

    /// Column-major storage.
    fn values(&self) -> &[f64];

    fn values_mut(&mut self) -> &mut [f64];

    #[inline]
    fn entry(&self, row: usize, col: usize) -> f64 {
        self.values()[col * self.block_rows() + row]
    }

    fn add_block(&mut self, other: &Self) {
        for (a, b) in self.values_mut().iter_mut().zip(other.values()) {
            *a += *b;
        }
    }

    fn set_zero(&mut self) {
        self.values_mut().fill(0.0);
    }
}

impl MatrixBlock for DMatrix<f64> {
    fn zeros_block(rows: usize, cols: usize) -> Self {
        DMatrix::zeros(rows, cols)
    }

    fn block_rows(&self) -> usize {
        self.nrows()
    }

    fn block_cols(&self) -> usize {
        self.ncols()
    }

    fn values(&self) -> &[f64] {
        self.as_slice()
    }

    fn values_mut(&mut self) -> &mut [f64] {
        self.as_mut_slice()
    }
}

impl<const R: usize, const C: usize> MatrixBlock for SMatrix<f64, R, C> {
    fn zeros_block(_rows: usize, _cols: usize) -> Self {
        SMatrix::zeros()
    }

    fn block_rows(&self) -> usize {
        R
    }

    fn block_cols(&self) -> usize {
        C
    }

    fn values(&self) -> &[f64] {
        self.as_slice()
    }

    fn values_mut(&mut self) -> &mut [f64] {
        self.as_mut_slice()
    }
}

/// Compressed-column export of a block matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedColumn {
    pub nrows: usize,
    pub ncols: usize,
    /// `col_ptr[j]..col_ptr[j + 1]` indexes the entries of column `j`
    pub col_ptr: Vec<usize>,
    pub row_idx: Vec<usize>,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct SparseBlockMatrix<B: MatrixBlock = DMatrix<f64>> {
    row_block_indices: Vec<usize>,
    col_block_indices: Vec<usize>,
    block_cols: Vec<BTreeMap<usize, B>>,
}

impl<B: MatrixBlock> SparseBlockMatrix<B> {
    /// Empty matrix with the given cumulative block end offsets.
    pub fn new(row_block_indices: Vec<usize>, col_block_indices: Vec<usize>) -> Self {
        let num_cols = col_block_indices.len();
        Self {
            row_block_indices,
            col_block_indices,
            block_cols: vec![BTreeMap::new(); num_cols],
        }
    }

    /// Square matrix with the same block layout for rows and columns.
    pub fn square(block_indices: Vec<usize>) -> Self {
        Self::new(block_indices.clone(), block_indices)
    }

    pub fn rows(&self) -> usize {
        self.row_block_indices.last().copied().unwrap_or(0)
    }

    pub fn cols(&self) -> usize {
        self.col_block_indices.last().copied().unwrap_or(0)
    }

    pub fn num_block_rows(&self) -> usize {
        self.row_block_indices.len()
    }

    pub fn num_block_cols(&self) -> usize {
        self.col_block_indices.len()
    }

    pub fn row_block_indices(&self) -> &[usize] {
        &self.row_block_indices
    }

    pub fn col_block_indices(&self) -> &[usize] {
        &self.col_block_indices
    }

    pub fn row_base_of_block(&self, r: usize) -> usize {
        if r == 0 { 0 } else { self.row_block_indices[r - 1] }
    }

    pub fn col_base_of_block(&self, c: usize) -> usize {
        if c == 0 { 0 } else { self.col_block_indices[c - 1] }
    }

    pub fn rows_of_block(&self, r: usize) -> usize {
        self.row_block_indices[r] - self.row_base_of_block(r)
    }

    pub fn cols_of_block(&self, c: usize) -> usize {
        self.col_block_indices[c] - self.col_base_of_block(c)
    }

    /// Number of stored blocks.
    pub fn non_zero_blocks(&self) -> usize {
        self.block_cols.iter().map(BTreeMap::len).sum()
    }

    /// Number of stored scalars.
    pub fn non_zeros(&self) -> usize {
        self.block_cols
            .iter()
            .flat_map(|column| column.values())
            .map(|block| block.block_rows() * block.block_cols())
            .sum()
    }

    fn index_error(&self, r: usize, c: usize) -> LinAlgError {
        LinAlgError::InvalidBlockIndex {
            row: r,
            col: c,
            block_rows: self.num_block_rows(),
            block_cols: self.num_block_cols(),
        }
    }

    fn check_index(&self, r: usize, c: usize) -> LinAlgResult<()> {
        if r >= self.num_block_rows() || c >= self.num_block_cols() {
            return Err(self.index_error(r, c));
        }
        Ok(())
    }

    pub fn block(&self, r: usize, c: usize) -> Option<&B> {
        self.block_cols.get(c).and_then(|column| column.get(&r))
    }

    pub fn block_mut(&mut self, r: usize, c: usize) -> Option<&mut B> {
        self.block_cols.get_mut(c).and_then(|column| column.get_mut(&r))
    }

    /// Block `(r, c)`, created as zeros if it does not exist yet.
    pub fn add_block(&mut self, r: usize, c: usize) -> LinAlgResult<&mut B> {
        self.check_index(r, c)?;
        let rows = self.rows_of_block(r);
        let cols = self.cols_of_block(c);
        let block = self.block_cols[c]
            .entry(r)
            .or_insert_with(|| B::zeros_block(rows, cols));
        if block.block_rows() != rows || block.block_cols() != cols {
            return Err(LinAlgError::BlockDimensionMismatch {
                expected: (rows, cols),
                actual: (block.block_rows(), block.block_cols()),
            });
        }
        Ok(block)
    }

    /// Add `value` into block `(r, c)`, creating it if needed.
    pub fn accumulate_block(&mut self, r: usize, c: usize, value: &B) -> LinAlgResult<()> {
        let rows = self.rows_of_block_checked(r)?;
        let cols = self.cols_of_block_checked(c)?;
        if value.block_rows() != rows || value.block_cols() != cols {
            return Err(LinAlgError::BlockDimensionMismatch {
                expected: (rows, cols),
                actual: (value.block_rows(), value.block_cols()),
            });
        }
        self.add_block(r, c)?.add_block(value);
        Ok(())
    }

    fn rows_of_block_checked(&self, r: usize) -> LinAlgResult<usize> {
        if r >= self.num_block_rows() {
            return Err(self.index_error(r, 0));
        }
        Ok(self.rows_of_block(r))
    }

    fn cols_of_block_checked(&self, c: usize) -> LinAlgResult<usize> {
        if c >= self.num_block_cols() {
            return Err(self.index_error(0, c));
        }
        Ok(self.cols_of_block(c))
    }

    /// Zero all stored blocks, keeping the structure.
    pub fn set_zero(&mut self) {
        for column in &mut self.block_cols {
            for block in column.values_mut() {
                block.set_zero();
            }
        }
    }

    /// Add every stored block of `other`, which must have the same block layout.
    pub fn add_matrix(&mut self, other: &Self) -> LinAlgResult<()> {
        self.check_len(other.rows(), self.rows())?;
        self.check_len(other.cols(), self.cols())?;
        if other.row_block_indices != self.row_block_indices
            || other.col_block_indices != self.col_block_indices
        {
            return Err(LinAlgError::Unsupported(
                "matrices with different block layouts cannot be added".to_string(),
            ));
        }
        for (c, column) in other.block_cols.iter().enumerate() {
            for (r, block) in column {
                self.add_block(*r, c)?.add_block(block);
            }
        }
        Ok(())
    }

    /// Stored blocks of column `c` as `(row block, block)`, ordered by row.
    pub fn column_blocks(&self, c: usize) -> impl Iterator<Item = (usize, &B)> + '_ {
        self.block_cols
            .get(c)
            .into_iter()
            .flat_map(|column| column.iter().map(|(r, block)| (*r, block)))
    }

    fn check_len(&self, len: usize, expected: usize) -> LinAlgResult<()> {
        if len != expected {
            return Err(LinAlgError::DimensionMismatch {
                expected,
                actual: len,
            });
        }
        Ok(())
    }

    /// `M · src`
    pub fn right_multiply(&self, src: &[f64]) -> LinAlgResult<Vec<f64>> {
        self.check_len(src.len(), self.cols())?;
        let mut dest = vec![0.0; self.rows()];
        for c in 0..self.num_block_cols() {
            let col_base = self.col_base_of_block(c);
            for (r, block) in self.column_blocks(c) {
                let row_base = self.row_base_of_block(r);
                gemv(block, &src[col_base..], &mut dest[row_base..]);
            }
        }
        Ok(dest)
    }

    /// `Mᵀ · src`, computed independently per block column.
    pub fn transpose_multiply(&self, src: &[f64]) -> LinAlgResult<Vec<f64>> {
        self.check_len(src.len(), self.rows())?;
        let column_product = |c: usize| -> Vec<f64> {
            let mut out = vec![0.0; self.cols_of_block(c)];
            for (r, block) in self.column_blocks(c) {
                gemv_transpose(block, &src[self.row_base_of_block(r)..], &mut out);
            }
            out
        };

        #[cfg(feature = "parallel")]
        let parts: Vec<Vec<f64>> = (0..self.num_block_cols())
            .into_par_iter()
            .map(column_product)
            .collect();

        #[cfg(not(feature = "parallel"))]
        let parts: Vec<Vec<f64>> = (0..self.num_block_cols()).map(column_product).collect();

        Ok(parts.concat())
    }

    /// `A · src` for a symmetric `A` of which only the upper block triangle is stored.
    pub fn multiply_symmetric_upper_triangle(&self, src: &[f64]) -> LinAlgResult<Vec<f64>> {
        self.check_len(src.len(), self.cols())?;
        self.check_len(self.rows(), self.cols())?;
        let mut dest = vec![0.0; self.rows()];
        for c in 0..self.num_block_cols() {
            let col_base = self.col_base_of_block(c);
            for (r, block) in self.column_blocks(c) {
                if r > c {
                    continue;
                }
                let row_base = self.row_base_of_block(r);
                gemv(block, &src[col_base..], &mut dest[row_base..]);
                if r != c {
                    gemv_transpose(block, &src[row_base..], &mut dest[col_base..]);
                }
            }
        }
        Ok(dest)
    }

    /// Export in compressed-column form. With `upper_triangle`, diagonal blocks only
    /// contribute entries on or above the diagonal.
    pub fn fill_ccs(&self, upper_triangle: bool) -> CompressedColumn {
        let mut col_ptr = Vec::with_capacity(self.cols() + 1);
        let mut row_idx = Vec::with_capacity(self.non_zeros());
        let mut values = Vec::with_capacity(self.non_zeros());
        col_ptr.push(0);

        for c in 0..self.num_block_cols() {
            for j in 0..self.cols_of_block(c) {
                for (r, block) in self.column_blocks(c) {
                    let row_base = self.row_base_of_block(r);
                    let count = if upper_triangle && r == c {
                        j + 1
                    } else {
                        block.block_rows()
                    };
                    for i in 0..count {
                        row_idx.push(row_base + i);
                        values.push(block.entry(i, j));
                    }
                }
                col_ptr.push(row_idx.len());
            }
        }

        CompressedColumn {
            nrows: self.rows(),
            ncols: self.cols(),
            col_ptr,
            row_idx,
            values,
        }
    }

    /// Add `lambda` to every diagonal entry of the square diagonal blocks.
    pub fn add_to_diagonal(&mut self, lambda: f64) {
        let count = self.num_block_cols().min(self.num_block_rows());
        for c in 0..count {
            if let Some(block) = self.block_cols[c].get_mut(&c) {
                let rows = block.block_rows();
                for k in 0..rows.min(block.block_cols()) {
                    block.values_mut()[k * rows + k] += lambda;
                }
            }
        }
    }

    /// Diagonal of the matrix as stored in the diagonal blocks (zero where absent).
    pub fn diagonal_values(&self) -> Vec<f64> {
        let mut diagonal = vec![0.0; self.rows().min(self.cols())];
        let count = self.num_block_cols().min(self.num_block_rows());
        for c in 0..count {
            if let Some(block) = self.block(c, c) {
                let base = self.col_base_of_block(c);
                for k in 0..block.block_rows().min(block.block_cols()) {
                    diagonal[base + k] = block.entry(k, k);
                }
            }
        }
        diagonal
    }

    /// Overwrite the diagonal of the stored diagonal blocks.
    pub fn set_diagonal_values(&mut self, diagonal: &[f64]) -> LinAlgResult<()> {
        self.check_len(diagonal.len(), self.rows().min(self.cols()))?;
        let count = self.num_block_cols().min(self.num_block_rows());
        for c in 0..count {
            let base = self.col_base_of_block(c);
            if let Some(block) = self.block_cols[c].get_mut(&c) {
                let rows = block.block_rows();
                for k in 0..rows.min(block.block_cols()) {
                    block.values_mut()[k * rows + k] = diagonal[base + k];
                }
            }
        }
        Ok(())
    }

    /// Dense copy. With `mirror_upper`, the stored upper triangle is mirrored below
    /// the diagonal.
    pub fn to_dense(&self, mirror_upper: bool) -> DMatrix<f64> {
        let mut dense = DMatrix::zeros(self.rows(), self.cols());
        for c in 0..self.num_block_cols() {
            let col_base = self.col_base_of_block(c);
            for (r, block) in self.column_blocks(c) {
                let row_base = self.row_base_of_block(r);
                for j in 0..block.block_cols() {
                    for i in 0..block.block_rows() {
                        if mirror_upper && r == c && i > j {
                            continue;
                        }
                        let value = block.entry(i, j);
                        dense[(row_base + i, col_base + j)] = value;
                        if mirror_upper && (row_base + i) != (col_base + j) {
                            dense[(col_base + j, row_base + i)] = value;
                        }
                    }
                }
            }
        }
        dense
    }

    /// Full symmetric faer matrix from the stored upper triangle.
    pub fn to_symmetric_faer(&self) -> LinAlgResult<SparseColMat<usize, f64>> {
        let ccs = self.fill_ccs(true);
        let mut triplets = Vec::with_capacity(2 * ccs.values.len());
        for col in 0..ccs.ncols {
            for k in ccs.col_ptr[col]..ccs.col_ptr[col + 1] {
                let row = ccs.row_idx[k];
                let value = ccs.values[k];
                triplets.push(Triplet::new(row, col, value));
                if row != col {
                    triplets.push(Triplet::new(col, row, value));
                }
            }
        }
        SparseColMat::try_new_from_triplets(ccs.nrows, ccs.ncols, &triplets).map_err(|e| {
            LinAlgError::SparseMatrixCreation(
                "Failed to build symmetric matrix from block upper triangle".to_string(),
            )
            .log_with_source(e)
        })
    }
}

/// `dest[..rows] += block · src[..cols]`
fn gemv<B: MatrixBlock>(block: &B, src: &[f64], dest: &mut [f64]) {
    let rows = block.block_rows();
    let values = block.values();
    for j in 0..block.block_cols() {
        let x = src[j];
        if x == 0.0 {
            continue;
        }
        let column = &values[j * rows..(j + 1) * rows];
        for (d, a) in dest[..rows].iter_mut().zip(column) {
            *d += a * x;
        }
    }
}

/// `dest[..cols] += blockᵀ · src[..rows]`
fn gemv_transpose<B: MatrixBlock>(block: &B, src: &[f64], dest: &mut [f64]) {
    let rows = block.block_rows();
    let values = block.values();
    for (j, d) in dest[..block.block_cols()].iter_mut().enumerate() {
        let column = &values[j * rows..(j + 1) * rows];
        *d += column.iter().zip(&src[..rows]).map(|(a, x)| a * x).sum::<f64>();
    }
}

impl SparseBlockMatrix<DMatrix<f64>> {
    /// `M · src` for nalgebra vectors.
    pub fn mul_vector(&self, src: &DVector<f64>) -> LinAlgResult<DVector<f64>> {
        Ok(DVector::from_vec(self.right_multiply(src.as_slice())?))
    }

    /// `A · src` for nalgebra vectors, `A` given by its upper block triangle.
    pub fn mul_symmetric_vector(&self, src: &DVector<f64>) -> LinAlgResult<DVector<f64>> {
        Ok(DVector::from_vec(
            self.multiply_symmetric_upper_triangle(src.as_slice())?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Matrix2, Matrix2x3, Matrix3};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// 5x5 symmetric matrix with blocks of size 2 and 3, upper triangle stored.
    fn symmetric_upper() -> LinAlgResult<SparseBlockMatrix<DMatrix<f64>>> {
        let mut m = SparseBlockMatrix::square(vec![2, 5]);
        *m.add_block(0, 0)? = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        *m.add_block(0, 1)? = DMatrix::from_row_slice(2, 3, &[1.0, 0.0, 2.0, 0.0, 1.0, 0.0]);
        *m.add_block(1, 1)? =
            DMatrix::from_row_slice(3, 3, &[5.0, 1.0, 0.0, 1.0, 6.0, 1.0, 0.0, 1.0, 7.0]);
        Ok(m)
    }

    #[test]
    fn test_block_layout() {
        let m: SparseBlockMatrix = SparseBlockMatrix::new(vec![3, 5, 6], vec![2, 5]);
        assert_eq!(m.rows(), 6);
        assert_eq!(m.cols(), 5);
        assert_eq!(m.row_base_of_block(1), 3);
        assert_eq!(m.rows_of_block(1), 2);
        assert_eq!(m.cols_of_block(1), 3);
        assert_eq!(m.non_zero_blocks(), 0);
    }

    #[test]
    fn test_add_block_accumulates() -> TestResult {
        let mut m: SparseBlockMatrix = SparseBlockMatrix::square(vec![2, 4]);
        let x = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let y = DMatrix::from_row_slice(2, 2, &[0.5, 0.5, -1.0, 2.0]);
        *m.add_block(1, 0)? += &x;
        *m.add_block(1, 0)? += &y;
        assert_eq!(m.non_zero_blocks(), 1);
        assert_eq!(m.block(1, 0), Some(&(&x + &y)));

        m.accumulate_block(1, 0, &x)?;
        assert_eq!(m.block(1, 0), Some(&(&x * 2.0 + &y)));
        assert!(m.add_block(2, 0).is_err());
        assert!(m.accumulate_block(0, 0, &DMatrix::zeros(3, 2)).is_err());
        Ok(())
    }

    #[test]
    fn test_add_matrix_merges_structure() -> TestResult {
        let mut sum = symmetric_upper()?;
        let mut other: SparseBlockMatrix = SparseBlockMatrix::square(vec![2, 5]);
        *other.add_block(1, 1)? = DMatrix::identity(3, 3);
        other.add_block(0, 0)?;
        sum.add_matrix(&other)?;
        assert_eq!(sum.non_zero_blocks(), 3);
        assert_eq!(sum.diagonal_values(), vec![4.0, 3.0, 6.0, 7.0, 8.0]);

        let mut empty: SparseBlockMatrix = SparseBlockMatrix::square(vec![2, 5]);
        empty.add_matrix(&other)?;
        assert_eq!(empty.non_zero_blocks(), 2);

        let mismatched: SparseBlockMatrix = SparseBlockMatrix::square(vec![3, 5]);
        assert!(sum.add_matrix(&mismatched).is_err());
        Ok(())
    }

    #[test]
    fn test_identity_block_right_multiply_reproduces_input() -> TestResult {
        let mut m: SparseBlockMatrix = SparseBlockMatrix::square(vec![4]);
        *m.add_block(0, 0)? = DMatrix::identity(4, 4);
        let src = [1.5, -2.0, 0.25, 8.0];
        assert_eq!(m.right_multiply(&src)?, src.to_vec());
        assert_eq!(m.transpose_multiply(&src)?, src.to_vec());
        Ok(())
    }

    #[test]
    fn test_products_match_dense() -> TestResult {
        let mut m: SparseBlockMatrix = SparseBlockMatrix::new(vec![2, 5], vec![3, 4]);
        *m.add_block(0, 0)? = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        *m.add_block(1, 1)? = DMatrix::from_row_slice(3, 1, &[7.0, 8.0, 9.0]);
        let dense = m.to_dense(false);

        let x = DVector::from_vec(vec![1.0, -1.0, 2.0, 0.5]);
        let expected = &dense * &x;
        assert_eq!(m.right_multiply(x.as_slice())?, expected.as_slice().to_vec());

        let y = DVector::from_vec(vec![1.0, 2.0, -1.0, 0.0, 3.0]);
        let expected = dense.transpose() * &y;
        assert_eq!(m.transpose_multiply(y.as_slice())?, expected.as_slice().to_vec());
        assert!(m.right_multiply(&[1.0]).is_err());
        Ok(())
    }

    #[test]
    fn test_symmetric_upper_multiply() -> TestResult {
        let m = symmetric_upper()?;
        let dense = m.to_dense(true);
        assert_eq!(dense, dense.transpose());

        let x = DVector::from_vec(vec![1.0, 2.0, -1.0, 0.5, 3.0]);
        let expected = &dense * &x;
        let actual = m.mul_symmetric_vector(&x)?;
        assert!((actual - expected).norm() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_fill_ccs_upper_triangle() -> TestResult {
        let m = symmetric_upper()?;
        let ccs = m.fill_ccs(true);
        assert_eq!(ccs.col_ptr.len(), 6);
        // column 0: (0,0); column 1: (0,1),(1,1); columns 2..5: 2 rows of the
        // off-diagonal block plus 1, 2, 3 rows of the diagonal block
        assert_eq!(ccs.col_ptr, vec![0, 1, 3, 6, 10, 15]);
        assert_eq!(&ccs.row_idx[..3], &[0, 0, 1]);
        assert_eq!(&ccs.values[..3], &[4.0, 1.0, 3.0]);

        let full = m.fill_ccs(false);
        assert_eq!(full.values.len(), m.non_zeros());
        Ok(())
    }

    #[test]
    fn test_diagonal_damping_and_restore() -> TestResult {
        let mut m = symmetric_upper()?;
        let backup = m.diagonal_values();
        assert_eq!(backup, vec![4.0, 3.0, 5.0, 6.0, 7.0]);
        m.add_to_diagonal(0.5);
        assert_eq!(m.diagonal_values(), vec![4.5, 3.5, 5.5, 6.5, 7.5]);
        assert_eq!(m.block(0, 1).map(|b| b[(0, 2)]), Some(2.0));
        m.set_diagonal_values(&backup)?;
        assert_eq!(m.diagonal_values(), backup);
        Ok(())
    }

    #[test]
    fn test_fixed_size_blocks_follow_same_contracts() -> TestResult {
        let mut m: SparseBlockMatrix<Matrix2<f64>> = SparseBlockMatrix::square(vec![2, 4]);
        *m.add_block(0, 0)? += Matrix2::identity();
        *m.add_block(0, 0)? += Matrix2::identity();
        *m.add_block(1, 1)? = Matrix2::new(1.0, 2.0, 3.0, 4.0);
        assert_eq!(m.right_multiply(&[1.0, 1.0, 1.0, 0.0])?, vec![2.0, 2.0, 1.0, 3.0]);

        let mut rect: SparseBlockMatrix<Matrix2x3<f64>> = SparseBlockMatrix::new(vec![2], vec![3]);
        *rect.add_block(0, 0)? = Matrix2x3::new(1.0, 0.0, 2.0, 0.0, 1.0, 0.0);
        assert_eq!(rect.transpose_multiply(&[1.0, 2.0])?, vec![1.0, 2.0, 2.0]);

        let mut big: SparseBlockMatrix<Matrix3<f64>> = SparseBlockMatrix::square(vec![3]);
        big.accumulate_block(0, 0, &Matrix3::identity())?;
        assert_eq!(big.diagonal_values(), vec![1.0, 1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_symmetric_faer_conversion() -> TestResult {
        let m = symmetric_upper()?;
        let sparse = m.to_symmetric_faer()?;
        assert_eq!(sparse.nrows(), 5);
        // 15 stored upper entries, 5 of them on the diagonal
        assert_eq!(sparse.compute_nnz(), 25);
        let dense = m.to_dense(true);
        for t in sparse.triplet_iter() {
            assert_eq!(*t.val, dense[(t.row, t.col)]);
        }
        Ok(())
    }
}
