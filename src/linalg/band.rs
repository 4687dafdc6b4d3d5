//! Banded matrix storage for the diagonal Jacobian blocks.
//!
//! [`BandMatrix`] holds the state Jacobian of a block and only supports
//! assembly and matrix-vector products. [`FactorizableBandMatrix`] is its
//! time-discretized companion: it carries `lower` additional superdiagonals
//! for the fill-in produced by partial pivoting, a pivot vector, and an
//! in-place LU factorization with banded triangular solves.
//!
//! Storage is row-major by diagonals: entry `(row, d)` is the coefficient of
//! column `row + d`, with `d = 0` the main diagonal, negative subdiagonals,
//! positive superdiagonals.

use crate::error::LinearSolverError;
use std::ops::{Index, IndexMut};

/// Banded matrix holding a state Jacobian block.
#[derive(Debug, Clone)]
pub struct BandMatrix {
    rows: usize,
    lower: usize,
    upper: usize,
    stride: usize,
    data: Vec<f64>,
}

impl BandMatrix {
    pub fn new(rows: usize, lower: usize, upper: usize) -> Self {
        let stride = lower + upper + 1;
        Self {
            rows,
            lower,
            upper,
            stride,
            data: vec![0.0; rows * stride],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn lower_bandwidth(&self) -> usize {
        self.lower
    }

    pub fn upper_bandwidth(&self) -> usize {
        self.upper
    }

    #[inline]
    pub fn get(&self, row: usize, diag: isize) -> f64 {
        debug_assert!(diag >= -(self.lower as isize) && diag <= self.upper as isize);
        self.data[row * self.stride + (self.lower as isize + diag) as usize]
    }

    #[inline]
    pub fn set(&mut self, row: usize, diag: isize, value: f64) {
        debug_assert!(diag >= -(self.lower as isize) && diag <= self.upper as isize);
        self.data[row * self.stride + (self.lower as isize + diag) as usize] = value;
    }

    #[inline]
    pub fn add(&mut self, row: usize, diag: isize, value: f64) {
        debug_assert!(diag >= -(self.lower as isize) && diag <= self.upper as isize);
        self.data[row * self.stride + (self.lower as isize + diag) as usize] += value;
    }

    pub fn set_all(&mut self, value: f64) {
        self.data.fill(value);
    }

    pub fn row_iter(&self, row: usize) -> BandRow<'_> {
        BandRow {
            data: &self.data,
            stride: self.stride,
            lower: self.lower,
            row,
        }
    }

    pub fn row_iter_mut(&mut self, row: usize) -> BandRowMut<'_> {
        BandRowMut {
            data: &mut self.data,
            stride: self.stride,
            lower: self.lower,
            row,
        }
    }

    /// `y = alpha * A * x + beta * y` over the whole matrix.
    pub fn multiply_vector(&self, x: &[f64], alpha: f64, beta: f64, y: &mut [f64]) {
        debug_assert!(x.len() >= self.rows && y.len() >= self.rows);
        for r in 0..self.rows {
            let dmin = -(r.min(self.lower) as isize);
            let dmax = self.upper.min(self.rows - 1 - r) as isize;
            let mut acc = 0.0;
            for d in dmin..=dmax {
                acc += self.get(r, d) * x[(r as isize + d) as usize];
            }
            y[r] = alpha * acc + beta * y[r];
        }
    }

    /// `y = alpha * A_sub * x + beta * y` for a rectangular patch.
    ///
    /// The patch covers rows `start_row .. start_row + n_rows`; its first
    /// column is the column of the diagonal at `start_row` shifted by
    /// `start_diag`. Entries outside the band contribute zero.
    #[allow(clippy::too_many_arguments)]
    pub fn submatrix_multiply_vector(
        &self,
        x: &[f64],
        start_row: usize,
        start_diag: isize,
        n_rows: usize,
        n_cols: usize,
        alpha: f64,
        beta: f64,
        y: &mut [f64],
    ) {
        debug_assert!(x.len() >= n_cols && y.len() >= n_rows);
        for i in 0..n_rows {
            let row = start_row + i;
            let mut acc = 0.0;
            for (j, xj) in x.iter().enumerate().take(n_cols) {
                let d = start_diag + j as isize - i as isize;
                if d < -(self.lower as isize) || d > self.upper as isize {
                    continue;
                }
                let col = row as isize + d;
                if col < 0 || col >= self.rows as isize {
                    continue;
                }
                acc += self.get(row, d) * xj;
            }
            y[i] = alpha * acc + beta * y[i];
        }
    }
}

/// Read-only view of one row of a [`BandMatrix`], indexed by diagonal offset.
pub struct BandRow<'a> {
    data: &'a [f64],
    stride: usize,
    lower: usize,
    row: usize,
}

impl BandRow<'_> {
    pub fn advance(&mut self, n: usize) {
        self.row += n;
    }

    pub fn row(&self) -> usize {
        self.row
    }
}

impl Index<isize> for BandRow<'_> {
    type Output = f64;
    fn index(&self, diag: isize) -> &f64 {
        &self.data[self.row * self.stride + (self.lower as isize + diag) as usize]
    }
}

/// Mutable view of one row of a [`BandMatrix`], indexed by diagonal offset.
pub struct BandRowMut<'a> {
    data: &'a mut [f64],
    stride: usize,
    lower: usize,
    row: usize,
}

impl BandRowMut<'_> {
    pub fn advance(&mut self, n: usize) {
        self.row += n;
    }

    pub fn row(&self) -> usize {
        self.row
    }
}

impl Index<isize> for BandRowMut<'_> {
    type Output = f64;
    fn index(&self, diag: isize) -> &f64 {
        &self.data[self.row * self.stride + (self.lower as isize + diag) as usize]
    }
}

impl IndexMut<isize> for BandRowMut<'_> {
    fn index_mut(&mut self, diag: isize) -> &mut f64 {
        &mut self.data[self.row * self.stride + (self.lower as isize + diag) as usize]
    }
}

/// Banded matrix with room for the fill-in of an in-place LU factorization.
///
/// The logical bandwidths match the [`BandMatrix`] the contents are copied
/// from; the storage carries `lower` extra superdiagonals that row exchanges
/// during partial pivoting can populate.
#[derive(Debug, Clone)]
pub struct FactorizableBandMatrix {
    rows: usize,
    lower: usize,
    upper: usize,
    /// Stored superdiagonal count: `upper + lower`.
    upper_store: usize,
    stride: usize,
    data: Vec<f64>,
    pivot: Vec<usize>,
    factorized: bool,
}

impl FactorizableBandMatrix {
    pub fn new(rows: usize, lower: usize, upper: usize) -> Self {
        let upper_store = upper + lower;
        let stride = lower + upper_store + 1;
        Self {
            rows,
            lower,
            upper,
            upper_store,
            stride,
            data: vec![0.0; rows * stride],
            pivot: vec![0; rows],
            factorized: false,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn lower_bandwidth(&self) -> usize {
        self.lower
    }

    pub fn upper_bandwidth(&self) -> usize {
        self.upper
    }

    #[inline]
    fn get(&self, row: usize, diag: isize) -> f64 {
        self.data[row * self.stride + (self.lower as isize + diag) as usize]
    }

    #[inline]
    fn set(&mut self, row: usize, diag: isize, value: f64) {
        self.data[row * self.stride + (self.lower as isize + diag) as usize] = value;
    }

    #[inline]
    pub fn add(&mut self, row: usize, diag: isize, value: f64) {
        debug_assert!(
            diag >= -(self.lower as isize) && diag <= self.upper_store as isize
        );
        self.data[row * self.stride + (self.lower as isize + diag) as usize] += value;
        self.factorized = false;
    }

    pub fn set_all(&mut self, value: f64) {
        self.data.fill(value);
        self.factorized = false;
    }

    /// Copies the contents of a non-factorized band matrix over, zeroing the
    /// fill-in diagonals. Bandwidths and sizes must match.
    pub fn copy_over(&mut self, src: &BandMatrix) {
        assert_eq!(self.rows, src.rows());
        assert_eq!(self.lower, src.lower_bandwidth());
        assert_eq!(self.upper, src.upper_bandwidth());
        let src_stride = src.lower + src.upper + 1;
        for r in 0..self.rows {
            let dst = &mut self.data[r * self.stride..r * self.stride + self.stride];
            dst[src_stride..].fill(0.0);
            dst[..src_stride].copy_from_slice(&src.data[r * src_stride..(r + 1) * src_stride]);
        }
        self.factorized = false;
    }

    /// Overwrites row `dst_row` with row `src_row` of a band matrix, zeroing
    /// the fill-in diagonals.
    pub fn copy_row_from_band(&mut self, dst_row: usize, src: &BandMatrix, src_row: usize) {
        debug_assert_eq!(self.lower, src.lower_bandwidth());
        debug_assert_eq!(self.upper, src.upper_bandwidth());
        let src_stride = src.lower + src.upper + 1;
        let dst = &mut self.data[dst_row * self.stride..(dst_row + 1) * self.stride];
        dst[src_stride..].fill(0.0);
        dst[..src_stride].copy_from_slice(&src.data[src_row * src_stride..(src_row + 1) * src_stride]);
        self.factorized = false;
    }

    pub fn row_iter_mut(&mut self, row: usize) -> FactorRowMut<'_> {
        self.factorized = false;
        FactorRowMut {
            data: &mut self.data,
            stride: self.stride,
            lower: self.lower,
            row,
        }
    }

    /// Reuses the leading storage as a dense `n x n` scratch matrix with its
    /// own pivot vector. The banded contents are clobbered; the caller must
    /// re-assemble and re-factorize afterwards.
    pub fn dense_scratch(&mut self, n: usize) -> crate::linalg::DenseSlab<'_> {
        assert!(n * n <= self.data.len());
        assert!(n <= self.pivot.len());
        self.factorized = false;
        crate::linalg::DenseSlab::new(&mut self.data[..n * n], &mut self.pivot[..n], n)
    }

    /// In-place LU factorization with partial pivoting.
    ///
    /// Returns an error on a zero pivot (singular block); the matrix contents
    /// are unspecified afterwards and must be re-assembled.
    pub fn factorize(&mut self) -> Result<(), LinearSolverError> {
        let n = self.rows;
        let l = self.lower;
        let us = self.upper_store;
        self.factorized = false;
        for k in 0..n {
            // Pivot search in column k, rows k..k+l
            let rmax = (k + l).min(n - 1);
            let mut p = k;
            let mut pmax = self.get(k, 0).abs();
            for r in (k + 1)..=rmax {
                let v = self.get(r, k as isize - r as isize).abs();
                if v > pmax {
                    pmax = v;
                    p = r;
                }
            }
            if pmax == 0.0 {
                return Err(LinearSolverError::SingularMatrix { row: k });
            }
            self.pivot[k] = p;
            let cmax = (k + us).min(n - 1);
            if p != k {
                for c in k..=cmax {
                    let dk = c as isize - k as isize;
                    let dp = c as isize - p as isize;
                    let tmp = self.get(k, dk);
                    self.set(k, dk, self.get(p, dp));
                    self.set(p, dp, tmp);
                }
            }
            let pivot_value = self.get(k, 0);
            for r in (k + 1)..=rmax {
                let dr = k as isize - r as isize;
                let factor = self.get(r, dr) / pivot_value;
                self.set(r, dr, factor);
                for c in (k + 1)..=cmax {
                    let v = self.get(r, c as isize - r as isize)
                        - factor * self.get(k, c as isize - k as isize);
                    self.set(r, c as isize - r as isize, v);
                }
            }
        }
        self.factorized = true;
        Ok(())
    }

    /// Solves `A x = b` in place using the stored factorization.
    pub fn solve(&self, b: &mut [f64]) -> Result<(), LinearSolverError> {
        if !self.factorized {
            return Err(LinearSolverError::NotFactorized);
        }
        let n = self.rows;
        debug_assert_eq!(b.len(), n);
        let l = self.lower;
        let us = self.upper_store;
        for k in 0..n {
            let p = self.pivot[k];
            if p != k {
                b.swap(k, p);
            }
            let rmax = (k + l).min(n - 1);
            for r in (k + 1)..=rmax {
                b[r] -= self.get(r, k as isize - r as isize) * b[k];
            }
        }
        for k in (0..n).rev() {
            let cmax = (k + us).min(n - 1);
            let mut acc = b[k];
            for c in (k + 1)..=cmax {
                acc -= self.get(k, c as isize - k as isize) * b[c];
            }
            b[k] = acc / self.get(k, 0);
        }
        Ok(())
    }

    pub fn is_factorized(&self) -> bool {
        self.factorized
    }
}

/// Mutable view of one row of a [`FactorizableBandMatrix`], indexed by
/// diagonal offset. Advancing moves the view to the next row.
pub struct FactorRowMut<'a> {
    data: &'a mut [f64],
    stride: usize,
    lower: usize,
    row: usize,
}

impl FactorRowMut<'_> {
    pub fn advance(&mut self, n: usize) {
        self.row += n;
    }

    pub fn row(&self) -> usize {
        self.row
    }
}

impl Index<isize> for FactorRowMut<'_> {
    type Output = f64;
    fn index(&self, diag: isize) -> &f64 {
        &self.data[self.row * self.stride + (self.lower as isize + diag) as usize]
    }
}

impl IndexMut<isize> for FactorRowMut<'_> {
    fn index_mut(&mut self, diag: isize) -> &mut f64 {
        &mut self.data[self.row * self.stride + (self.lower as isize + diag) as usize]
    }
}
