//! Restarted GMRES for the Schur-complement system.
//!
//! The operator is supplied as a matrix-free callback, which lets the caller
//! capture its factorized diagonal blocks in a closure; those factorizations
//! act as an implicit preconditioner, so no additional preconditioning is
//! applied here. Orthogonalization uses modified Gram-Schmidt in the inner
//! product induced by the integrator's error weights, and the projected
//! least-squares problem is updated with Givens rotations, so the stopping
//! test tracks the weighted residual norm for free.

use crate::error::ChromsolError;
use crate::linear_solver_error;

/// Result of a converged GMRES solve.
#[derive(Debug, Clone, Copy)]
pub struct GmresStats {
    /// Total matrix-vector products over all restart cycles.
    pub iterations: usize,
    /// Weighted residual norm estimate at termination.
    pub residual: f64,
}

/// Restarted GMRES solver with caller-owned workspace.
#[derive(Debug, Clone)]
pub struct Gmres {
    max_krylov: usize,
    max_restarts: usize,
    n: usize,
    basis: Vec<Vec<f64>>,
    hessenberg: Vec<f64>,
    givens_c: Vec<f64>,
    givens_s: Vec<f64>,
    g: Vec<f64>,
    residual: Vec<f64>,
    av: Vec<f64>,
}

/// Below this subdiagonal magnitude the Krylov space cannot be extended.
const BREAKDOWN_TOL: f64 = 1e-300;

impl Gmres {
    /// `max_krylov = 0` uses the full problem dimension (no restarting).
    pub fn new(max_krylov: usize, max_restarts: usize) -> Self {
        Self {
            max_krylov,
            max_restarts,
            n: 0,
            basis: Vec::new(),
            hessenberg: Vec::new(),
            givens_c: Vec::new(),
            givens_s: Vec::new(),
            g: Vec::new(),
            residual: Vec::new(),
            av: Vec::new(),
        }
    }

    /// Allocates workspace for problems of dimension `n`.
    pub fn resize(&mut self, n: usize) {
        self.n = n;
        let m = self.krylov_dim();
        self.basis.resize(m + 1, Vec::new());
        for v in self.basis.iter_mut() {
            v.resize(n, 0.0);
        }
        self.hessenberg.resize((m + 1) * m, 0.0);
        self.givens_c.resize(m, 0.0);
        self.givens_s.resize(m, 0.0);
        self.g.resize(m + 1, 0.0);
        self.residual.resize(n, 0.0);
        self.av.resize(n, 0.0);
    }

    fn krylov_dim(&self) -> usize {
        if self.max_krylov == 0 {
            self.n
        } else {
            self.max_krylov.min(self.n)
        }
    }

    /// Solves `A x = b` where `A` is given by `op`.
    ///
    /// `x` holds the initial guess on entry and the solution on exit. The
    /// stopping test is `||b - A x||_w <= tol` with the weighted 2-norm
    /// induced by `weight`.
    pub fn solve<F>(
        &mut self,
        mut op: F,
        tol: f64,
        weight: &[f64],
        x: &mut [f64],
        b: &[f64],
    ) -> Result<GmresStats, ChromsolError>
    where
        F: FnMut(&[f64], &mut [f64]) -> Result<(), ChromsolError>,
    {
        let n = self.n;
        debug_assert!(x.len() == n && b.len() == n && weight.len() >= n);
        let m = self.krylov_dim();
        let h_rows = m + 1;
        let mut total_iters = 0;

        for _restart in 0..self.max_restarts.max(1) {
            op(x, &mut self.av)?;
            for i in 0..n {
                self.residual[i] = b[i] - self.av[i];
            }
            let beta = wnorm(&self.residual, weight);
            if beta <= tol {
                return Ok(GmresStats {
                    iterations: total_iters,
                    residual: beta,
                });
            }

            let inv_beta = 1.0 / beta;
            for i in 0..n {
                self.basis[0][i] = self.residual[i] * inv_beta;
            }
            self.g.fill(0.0);
            self.g[0] = beta;

            let mut k = 0;
            let mut res_est = beta;
            let mut happy = false;

            for j in 0..m {
                total_iters += 1;
                k = j + 1;

                op(&self.basis[j], &mut self.av)?;

                // Modified Gram-Schmidt in the weighted inner product
                for i in 0..=j {
                    let h = wdot(&self.av, &self.basis[i], weight);
                    self.hessenberg[j * h_rows + i] = h;
                    for (a, v) in self.av.iter_mut().zip(self.basis[i].iter()) {
                        *a -= h * v;
                    }
                }
                let h_next = wnorm(&self.av, weight);
                self.hessenberg[j * h_rows + j + 1] = h_next;
                happy = h_next <= BREAKDOWN_TOL;
                if !happy {
                    let inv = 1.0 / h_next;
                    let av = &self.av;
                    for (v, a) in self.basis[j + 1].iter_mut().zip(av.iter()) {
                        *v = a * inv;
                    }
                }

                // Apply accumulated Givens rotations to the new column
                for i in 0..j {
                    let a = self.hessenberg[j * h_rows + i];
                    let bb = self.hessenberg[j * h_rows + i + 1];
                    self.hessenberg[j * h_rows + i] = self.givens_c[i] * a - self.givens_s[i] * bb;
                    self.hessenberg[j * h_rows + i + 1] =
                        self.givens_s[i] * a + self.givens_c[i] * bb;
                }

                // New rotation zeroing the subdiagonal of column j
                let (c, s) = givens(
                    self.hessenberg[j * h_rows + j],
                    self.hessenberg[j * h_rows + j + 1],
                );
                self.givens_c[j] = c;
                self.givens_s[j] = s;
                let a = self.hessenberg[j * h_rows + j];
                let bb = self.hessenberg[j * h_rows + j + 1];
                self.hessenberg[j * h_rows + j] = c * a - s * bb;
                self.hessenberg[j * h_rows + j + 1] = 0.0;
                let ga = self.g[j];
                let gb = self.g[j + 1];
                self.g[j] = c * ga - s * gb;
                self.g[j + 1] = s * ga + c * gb;

                res_est = self.g[j + 1].abs();
                if res_est <= tol || happy {
                    break;
                }
            }

            update_solution(k, h_rows, &self.hessenberg, &self.g, &self.basis, x);

            if res_est <= tol {
                return Ok(GmresStats {
                    iterations: total_iters,
                    residual: res_est,
                });
            }
            if happy {
                // The Krylov space cannot be extended and the projected
                // residual is still above tolerance
                return Err(linear_solver_error!(GmresBreakdown {
                    iterations: total_iters,
                }));
            }
        }

        op(x, &mut self.av)?;
        for i in 0..n {
            self.residual[i] = b[i] - self.av[i];
        }
        let residual = wnorm(&self.residual, weight);
        if residual <= tol {
            return Ok(GmresStats {
                iterations: total_iters,
                residual,
            });
        }
        Err(linear_solver_error!(GmresDidNotConverge {
            iterations: total_iters,
            residual,
        }))
    }
}

/// Weighted inner product `sum_i w_i^2 a_i b_i`.
fn wdot(a: &[f64], b: &[f64], w: &[f64]) -> f64 {
    let mut acc = 0.0;
    for i in 0..a.len() {
        acc += w[i] * w[i] * a[i] * b[i];
    }
    acc
}

fn wnorm(a: &[f64], w: &[f64]) -> f64 {
    wdot(a, a, w).sqrt()
}

/// Rotation `(c, s)` with `c a - s b = r` and `s a + c b = 0`.
fn givens(a: f64, b: f64) -> (f64, f64) {
    if b.abs() < BREAKDOWN_TOL {
        (1.0, 0.0)
    } else if b.abs() > a.abs() {
        let tau = -a / b;
        let s = 1.0 / (1.0 + tau * tau).sqrt();
        (s * tau, s)
    } else {
        let tau = -b / a;
        let c = 1.0 / (1.0 + tau * tau).sqrt();
        (c, c * tau)
    }
}

/// Solves the projected upper triangular system and accumulates `x += V y`.
fn update_solution(
    k: usize,
    h_rows: usize,
    hessenberg: &[f64],
    g: &[f64],
    basis: &[Vec<f64>],
    x: &mut [f64],
) {
    let mut y = vec![0.0; k];
    for i in (0..k).rev() {
        let mut acc = g[i];
        for j in (i + 1)..k {
            acc -= hessenberg[j * h_rows + i] * y[j];
        }
        let diag = hessenberg[i * h_rows + i];
        y[i] = if diag.abs() > BREAKDOWN_TOL {
            acc / diag
        } else {
            0.0
        };
    }
    for i in 0..k {
        for (xv, v) in x.iter_mut().zip(basis[i].iter()) {
            *xv += y[i] * v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{DMatrix, DVector};

    fn test_matrix(n: usize) -> DMatrix<f64> {
        DMatrix::from_fn(n, n, |r, c| {
            if r == c {
                5.0 + 0.2 * r as f64
            } else {
                0.8 / (1.0 + (r as f64 - c as f64).abs())
            }
        })
    }

    #[test]
    fn test_converges_to_dense_solution() {
        let n = 20;
        let a = test_matrix(n);
        let b: Vec<f64> = (0..n).map(|i| (i as f64 * 0.3).cos()).collect();
        let weight = vec![1.0; n];

        let mut gmres = Gmres::new(0, 10);
        gmres.resize(n);
        let mut x = vec![0.0; n];
        let a_ref = a.clone();
        let stats = gmres
            .solve(
                |v, out| {
                    let y = &a_ref * DVector::from_column_slice(v);
                    out.copy_from_slice(y.as_slice());
                    Ok(())
                },
                1e-12,
                &weight,
                &mut x,
                &b,
            )
            .unwrap();
        assert!(stats.residual <= 1e-12);

        let x_ref = a.lu().solve(&DVector::from_column_slice(&b)).unwrap();
        for i in 0..n {
            assert!((x[i] - x_ref[i]).abs() < 1e-10);
        }
    }

    #[test]
    fn test_warm_start_from_solution_takes_no_iterations() {
        let n = 8;
        let a = test_matrix(n);
        let x_exact: Vec<f64> = (0..n).map(|i| 1.0 + i as f64).collect();
        let b = &a * DVector::from_column_slice(&x_exact);
        let weight = vec![1.0; n];

        let mut gmres = Gmres::new(0, 5);
        gmres.resize(n);
        let mut x = x_exact.clone();
        let stats = gmres
            .solve(
                |v, out| {
                    let y = &a * DVector::from_column_slice(v);
                    out.copy_from_slice(y.as_slice());
                    Ok(())
                },
                1e-8,
                &weight,
                &mut x,
                b.as_slice(),
            )
            .unwrap();
        assert_eq!(stats.iterations, 0);
    }

    #[test]
    fn test_restart_still_converges() {
        let n = 16;
        let a = test_matrix(n);
        let b = vec![1.0; n];
        let weight = vec![1.0; n];

        let mut gmres = Gmres::new(4, 50);
        gmres.resize(n);
        let mut x = vec![0.0; n];
        gmres
            .solve(
                |v, out| {
                    let y = &a * DVector::from_column_slice(v);
                    out.copy_from_slice(y.as_slice());
                    Ok(())
                },
                1e-10,
                &weight,
                &mut x,
                &b,
            )
            .unwrap();
        let r = DVector::from_column_slice(&b) - &a * DVector::from_column_slice(&x);
        assert!(r.norm() < 1e-9);
    }

    #[test]
    fn test_nonconvergence_is_reported() {
        let n = 12;
        let a = test_matrix(n);
        let b = vec![1.0; n];
        let weight = vec![1.0; n];

        let mut gmres = Gmres::new(1, 1);
        gmres.resize(n);
        let mut x = vec![0.0; n];
        let err = gmres
            .solve(
                |v, out| {
                    let y = &a * DVector::from_column_slice(v);
                    out.copy_from_slice(y.as_slice());
                    Ok(())
                },
                1e-14,
                &weight,
                &mut x,
                &b,
            )
            .unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_weighted_norm_stopping() {
        // Weights amplify the first component; with a loose tolerance and
        // heavily down-weighted remainder, convergence is declared once the
        // first component is resolved.
        let n = 6;
        let a = DMatrix::from_fn(n, n, |r, c| if r == c { 2.0 } else { 0.0 });
        let b = vec![2.0; n];
        let mut weight = vec![1e-8; n];
        weight[0] = 1.0;

        let mut gmres = Gmres::new(0, 5);
        gmres.resize(n);
        let mut x = vec![0.0; n];
        let stats = gmres
            .solve(
                |v, out| {
                    let y = &a * DVector::from_column_slice(v);
                    out.copy_from_slice(y.as_slice());
                    Ok(())
                },
                1e-6,
                &weight,
                &mut x,
                &b,
            )
            .unwrap();
        assert!(stats.residual <= 1e-6);
        assert!((x[0] - 1.0).abs() < 1e-6);
    }
}
