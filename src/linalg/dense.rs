//! Dense square matrix view with in-place LU, used for the algebraic
//! sub-blocks of the binding equations.
//!
//! The view borrows its storage from a [`FactorizableBandMatrix`] that is
//! about to be re-factorized anyway (see
//! [`FactorizableBandMatrix::dense_scratch`]), so no extra allocation is
//! needed during consistent initialization.
//!
//! [`FactorizableBandMatrix`]: crate::linalg::FactorizableBandMatrix
//! [`FactorizableBandMatrix::dense_scratch`]: crate::linalg::FactorizableBandMatrix::dense_scratch

use crate::error::LinearSolverError;
use crate::linalg::BandMatrix;

/// Row-major dense `n x n` matrix over borrowed storage.
pub struct DenseSlab<'a> {
    data: &'a mut [f64],
    pivot: &'a mut [usize],
    n: usize,
    factorized: bool,
}

impl<'a> DenseSlab<'a> {
    pub fn new(data: &'a mut [f64], pivot: &'a mut [usize], n: usize) -> Self {
        assert!(data.len() >= n * n);
        assert!(pivot.len() >= n);
        Self {
            data,
            pivot,
            n,
            factorized: false,
        }
    }

    pub fn order(&self) -> usize {
        self.n
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.n + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.data[row * self.n + col] = value;
        self.factorized = false;
    }

    pub fn set_all(&mut self, value: f64) {
        self.data[..self.n * self.n].fill(value);
        self.factorized = false;
    }

    /// Copies a rectangular patch of a band matrix into this dense matrix.
    ///
    /// Row `i` of the patch is row `start_row + i` of the band matrix; the
    /// first column of the patch is the column of the diagonal at `start_row`
    /// shifted by `start_diag`. Entries outside the band are zero.
    pub fn copy_submatrix_from_banded(
        &mut self,
        src: &BandMatrix,
        start_row: usize,
        start_diag: isize,
        n_rows: usize,
        n_cols: usize,
    ) {
        debug_assert!(n_rows <= self.n && n_cols <= self.n);
        for i in 0..n_rows {
            let row = start_row + i;
            for j in 0..n_cols {
                let d = start_diag + j as isize - i as isize;
                let value = if d < -(src.lower_bandwidth() as isize)
                    || d > src.upper_bandwidth() as isize
                {
                    0.0
                } else {
                    let col = row as isize + d;
                    if col < 0 || col >= src.rows() as isize {
                        0.0
                    } else {
                        src.get(row, d)
                    }
                };
                self.data[i * self.n + j] = value;
            }
        }
        self.factorized = false;
    }

    /// In-place LU factorization with partial pivoting.
    pub fn factorize(&mut self) -> Result<(), LinearSolverError> {
        let n = self.n;
        self.factorized = false;
        for k in 0..n {
            let mut p = k;
            let mut pmax = self.data[k * n + k].abs();
            for r in (k + 1)..n {
                let v = self.data[r * n + k].abs();
                if v > pmax {
                    pmax = v;
                    p = r;
                }
            }
            if pmax == 0.0 {
                return Err(LinearSolverError::SingularMatrix { row: k });
            }
            self.pivot[k] = p;
            if p != k {
                for c in 0..n {
                    self.data.swap(k * n + c, p * n + c);
                }
            }
            let pivot_value = self.data[k * n + k];
            for r in (k + 1)..n {
                let factor = self.data[r * n + k] / pivot_value;
                self.data[r * n + k] = factor;
                for c in (k + 1)..n {
                    self.data[r * n + c] -= factor * self.data[k * n + c];
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
        let n = self.n;
        debug_assert!(b.len() >= n);
        for k in 0..n {
            let p = self.pivot[k];
            if p != k {
                b.swap(k, p);
            }
            for r in (k + 1)..n {
                b[r] -= self.data[r * n + k] * b[k];
            }
        }
        for k in (0..n).rev() {
            let mut acc = b[k];
            for c in (k + 1)..n {
                acc -= self.data[k * n + c] * b[c];
            }
            b[k] = acc / self.data[k * n + k];
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factorize_solve() {
        let mut data = vec![0.0; 9];
        let mut pivot = vec![0; 3];
        let mut m = DenseSlab::new(&mut data, &mut pivot, 3);
        // [[2, 1, 0], [1, 3, 1], [0, 1, 4]] * [1, 2, 3] = [4, 10, 14]
        m.set(0, 0, 2.0);
        m.set(0, 1, 1.0);
        m.set(1, 0, 1.0);
        m.set(1, 1, 3.0);
        m.set(1, 2, 1.0);
        m.set(2, 1, 1.0);
        m.set(2, 2, 4.0);
        m.factorize().unwrap();
        let mut b = vec![4.0, 10.0, 14.0];
        m.solve(&mut b).unwrap();
        assert!((b[0] - 1.0).abs() < 1e-14);
        assert!((b[1] - 2.0).abs() < 1e-14);
        assert!((b[2] - 3.0).abs() < 1e-14);
    }

    #[test]
    fn test_pivoting_zero_diagonal() {
        let mut data = vec![0.0; 4];
        let mut pivot = vec![0; 2];
        let mut m = DenseSlab::new(&mut data, &mut pivot, 2);
        // [[0, 1], [1, 0]] swaps the unknowns
        m.set(0, 1, 1.0);
        m.set(1, 0, 1.0);
        m.factorize().unwrap();
        let mut b = vec![5.0, 7.0];
        m.solve(&mut b).unwrap();
        assert_eq!(b, vec![7.0, 5.0]);
    }

    #[test]
    fn test_singular_reported() {
        let mut data = vec![0.0; 4];
        let mut pivot = vec![0; 2];
        let mut m = DenseSlab::new(&mut data, &mut pivot, 2);
        m.set(0, 0, 1.0);
        m.set(0, 1, 2.0);
        m.set(1, 0, 2.0);
        m.set(1, 1, 4.0);
        assert!(matches!(
            m.factorize(),
            Err(LinearSolverError::SingularMatrix { row: 1 })
        ));
    }

    #[test]
    fn test_copy_from_banded() {
        let mut band = BandMatrix::new(6, 1, 1);
        for r in 0..6 {
            for d in -1isize..=1 {
                let c = r as isize + d;
                if c < 0 || c >= 6 {
                    continue;
                }
                band.set(r, d, (r * 10) as f64 + c as f64);
            }
        }
        let mut data = vec![0.0; 4];
        let mut pivot = vec![0; 2];
        let mut m = DenseSlab::new(&mut data, &mut pivot, 2);
        // Rows 2..4, first column = column 2 (start_diag 0)
        m.copy_submatrix_from_banded(&band, 2, 0, 2, 2);
        assert_eq!(m.get(0, 0), 22.0);
        assert_eq!(m.get(0, 1), 23.0);
        assert_eq!(m.get(1, 0), 32.0);
        assert_eq!(m.get(1, 1), 33.0);
    }
}
