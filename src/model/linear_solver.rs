//! Schur-complement solve of the time-discretized system Jacobian.
//!
//! The Jacobian of the discretized equations,
//! `J = dF/dy + alpha * dF/d(dy)`, has block-arrow form: independent banded
//! blocks on the diagonal (one bulk block per component, one particle block
//! per column cell), sparse couplings to the flux equations, and the identity
//! on the flux diagonal. An LU decomposition of that form reduces the solve
//! to four steps:
//!
//! 1. factorize the diagonal blocks (in parallel, cached across calls),
//! 2. forward-substitute `y_i = J_i^{-1} b_i` and reduce
//!    `y_f = b_f - sum_i J_{f,i} y_i`,
//! 3. solve the Schur complement `S x_f = y_f`,
//!    `S = I - sum_p J_{f,p} J_p^{-1} J_{p,f}`, with matrix-free GMRES,
//! 4. back-substitute `x_i = y_i - J_i^{-1} J_{i,f} x_f` (in parallel).
//!
//! Bulk and particle loops of each parallel phase are issued through
//! `rayon::join`, so workers finishing the (short) bulk loop immediately
//! steal particle work. The serial reductions onto the flux slice run in a
//! fixed block order.

use rayon::prelude::*;
use std::time::Instant;

use crate::error::{ChromsolError, LinearSolverError};
use crate::linalg::{FactorizableBandMatrix, SparseCoupling};
use crate::linear_solver_error;
use crate::model::grm::{
    add_time_derivative_column_block, add_time_derivative_particle_block, GeneralRateModel,
};
use crate::parallel::FirstError;

fn singular_row(err: &LinearSolverError) -> usize {
    match err {
        LinearSolverError::SingularMatrix { row } => *row,
        _ => 0,
    }
}

/// One application of the Schur complement, `z = S x`.
///
/// `temp_head` is scratch covering the bulk and particle regions; it is
/// zeroed on entry and left holding intermediate block solutions.
#[allow(clippy::too_many_arguments)]
fn schur_matvec(
    x: &[f64],
    z: &mut [f64],
    temp_head: &mut [f64],
    jac_c_disc: &[FactorizableBandMatrix],
    jac_p_disc: &[FactorizableBandMatrix],
    jac_cf: &SparseCoupling,
    jac_fc: &SparseCoupling,
    jac_pf: &[SparseCoupling],
    jac_fp: &[SparseCoupling],
    n_col: usize,
    n_bulk: usize,
    stride_block: usize,
) -> Result<(), ChromsolError> {
    // Identity part of S
    z.copy_from_slice(x);

    temp_head.fill(0.0);
    // Apply J_{0,f}
    jac_cf.multiply_add(x, &mut temp_head[..n_bulk]);

    let first = FirstError::new();
    {
        let (bulk, par) = temp_head.split_at_mut(n_bulk);
        rayon::join(
            || {
                bulk.par_chunks_mut(n_col)
                    .enumerate()
                    .for_each(|(comp, slice)| {
                        if jac_c_disc[comp].solve(slice).is_err() {
                            tracing::error!(comp, "block solve failed in Schur operator");
                            first.record(linear_solver_error!(ColumnBlockSolveFailed { comp }));
                        }
                    });
            },
            || {
                par.par_chunks_mut(stride_block)
                    .enumerate()
                    .for_each(|(cell, slice)| {
                        // Apply J_{i,f}, then J_i^{-1}
                        jac_pf[cell].multiply_add(x, slice);
                        if jac_p_disc[cell].solve(slice).is_err() {
                            tracing::error!(cell, "block solve failed in Schur operator");
                            first.record(linear_solver_error!(ParticleBlockSolveFailed { cell }));
                        }
                    });
            },
        );
    }
    if let Some(err) = first.take() {
        return Err(err);
    }

    // Apply J_{f,i} and subtract from z
    jac_fc.multiply_subtract(&temp_head[..n_bulk], z);
    for cell in 0..n_col {
        jac_fp[cell].multiply_subtract(&temp_head[n_bulk + cell * stride_block..][..stride_block], z);
    }
    Ok(())
}

impl GeneralRateModel {
    /// Assembles and factorizes the discretized diagonal blocks
    /// `J_i + alpha * tau * dF/d(dy)` in parallel.
    pub fn factorize_discretized(&mut self, tau: f64, alpha: f64) -> Result<(), ChromsolError> {
        let alpha_tau = alpha * tau;
        let beta_p = self.beta_p();
        let first = FirstError::new();

        let jac_c = &self.jac_c;
        let jac_p = &self.jac_p;
        let jac_c_disc = &mut self.jac_c_disc;
        let jac_p_disc = &mut self.jac_p_disc;
        let binding = &self.binding;
        let disc = &self.disc;

        rayon::join(
            || {
                jac_c_disc
                    .par_iter_mut()
                    .enumerate()
                    .for_each(|(comp, fbm)| {
                        fbm.copy_over(&jac_c[comp]);
                        add_time_derivative_column_block(fbm, alpha_tau);
                        if let Err(e) = fbm.factorize() {
                            tracing::error!(comp, "factorization failed for column block");
                            first.record(linear_solver_error!(SingularColumnBlock {
                                comp,
                                row: singular_row(&e),
                            }));
                        }
                    });
            },
            || {
                jac_p_disc
                    .par_iter_mut()
                    .enumerate()
                    .for_each(|(cell, fbm)| {
                        fbm.copy_over(&jac_p[cell]);
                        add_time_derivative_particle_block(fbm, binding, disc, alpha_tau, beta_p);
                        if let Err(e) = fbm.factorize() {
                            tracing::error!(cell, "factorization failed for particle block");
                            first.record(linear_solver_error!(SingularParticleBlock {
                                cell,
                                row: singular_row(&e),
                            }));
                        }
                    });
            },
        );

        if let Some(err) = first.take() {
            self.factorize_jacobian = true;
            return Err(err);
        }
        Ok(())
    }

    /// Applies the Schur complement to `x`, using the current block
    /// factorizations.
    pub fn schur_complement_times(
        &mut self,
        x: &[f64],
        z: &mut [f64],
    ) -> Result<(), ChromsolError> {
        let idxr = self.indexer();
        let n_col = self.disc.n_col;
        let n_bulk = self.disc.n_comp * n_col;
        let stride_block = idxr.stride_par_block();
        let offset_jf = idxr.offset_jf();
        let (temp_head, _) = self.temp_state.split_at_mut(offset_jf);
        schur_matvec(
            x,
            z,
            temp_head,
            &self.jac_c_disc,
            &self.jac_p_disc,
            &self.jac_cf,
            &self.jac_fc,
            &self.jac_pf,
            &self.jac_fp,
            n_col,
            n_bulk,
            stride_block,
        )
    }

    /// Solves `(dF/dy + alpha * tau * dF/d(dy)) x = rhs` in place.
    ///
    /// `rhs` holds the right-hand side on entry and the solution on exit;
    /// `weight` are the integrator's error weights; `outer_tol` is the
    /// tolerance of the surrounding Newton iteration, from which the inner
    /// Schur tolerance is derived. A singular block or a failed inner solve
    /// returns a recoverable error, so the integrator can retry with a
    /// smaller step.
    pub fn linear_solve(
        &mut self,
        _t: f64,
        tau: f64,
        alpha: f64,
        outer_tol: f64,
        rhs: &mut [f64],
        weight: &[f64],
    ) -> Result<(), ChromsolError> {
        let idxr = self.indexer();
        let n_col = self.disc.n_col;
        let n_bulk = self.disc.n_comp * n_col;
        let stride_block = idxr.stride_par_block();
        let offset_jf = idxr.offset_jf();
        let n_dofs = idxr.num_dofs();
        debug_assert_eq!(rhs.len(), n_dofs);

        // ==== Step 1: factorize diagonal Jacobian blocks, only if required
        if self.factorize_jacobian {
            self.timers.factorize.start();
            self.factorize_jacobian = false;
            let result = self.factorize_discretized(tau, alpha);
            self.timers.factorize.stop();
            result?;
        }

        self.timers.linear_solve.start();

        // ==== Step 2: solve diagonal blocks, y_i = J_i^{-1} b_i in place
        let (head, flux) = rhs.split_at_mut(offset_jf);
        {
            let first = FirstError::new();
            let jac_c_disc = &self.jac_c_disc;
            let jac_p_disc = &self.jac_p_disc;
            let (bulk, par) = head.split_at_mut(n_bulk);
            rayon::join(
                || {
                    bulk.par_chunks_mut(n_col)
                        .enumerate()
                        .for_each(|(comp, slice)| {
                            if jac_c_disc[comp].solve(slice).is_err() {
                                tracing::error!(comp, "solve failed for column block");
                                first.record(linear_solver_error!(ColumnBlockSolveFailed { comp }));
                            }
                        });
                },
                || {
                    par.par_chunks_mut(stride_block)
                        .enumerate()
                        .for_each(|(cell, slice)| {
                            if jac_p_disc[cell].solve(slice).is_err() {
                                tracing::error!(cell, "solve failed for particle block");
                                first.record(linear_solver_error!(ParticleBlockSolveFailed { cell }));
                            }
                        });
                },
            );
            if let Some(err) = first.take() {
                self.timers.linear_solve.stop();
                return Err(err);
            }
        }

        // y_f = b_f - sum_i J_{f,i} y_i. Serial: every subtraction targets
        // the same flux slice.
        self.jac_fc.multiply_subtract(&head[..n_bulk], flux);
        for cell in 0..n_col {
            self.jac_fp[cell]
                .multiply_subtract(&head[n_bulk + cell * stride_block..][..stride_block], flux);
        }

        // ==== Step 3: Schur complement, S x_f = y_f
        let tolerance = (n_dofs as f64).sqrt() * outer_tol * self.schur_safety;
        let weight_flux = &weight[offset_jf..];
        let (temp_head, temp_flux) = self.temp_state.split_at_mut(offset_jf);
        // Warm start from the previous flux solution held in rhs
        temp_flux.copy_from_slice(flux);

        let jac_c_disc = &self.jac_c_disc;
        let jac_p_disc = &self.jac_p_disc;
        let jac_cf = &self.jac_cf;
        let jac_fc = &self.jac_fc;
        let jac_pf = &self.jac_pf;
        let jac_fp = &self.jac_fp;
        let mut mat_vec_elapsed = std::time::Duration::ZERO;
        let mut mat_vec_count = 0u64;

        self.timers.gmres.start();
        let gmres_result = self.gmres.solve(
            |x, z| {
                let begin = Instant::now();
                let result = schur_matvec(
                    x,
                    z,
                    &mut temp_head[..],
                    jac_c_disc,
                    jac_p_disc,
                    jac_cf,
                    jac_fc,
                    jac_pf,
                    jac_fp,
                    n_col,
                    n_bulk,
                    stride_block,
                );
                mat_vec_elapsed += begin.elapsed();
                mat_vec_count += 1;
                result
            },
            tolerance,
            weight_flux,
            temp_flux,
            flux,
        );
        self.timers.gmres.stop();
        self.timers.mat_vec.record_many(mat_vec_elapsed, mat_vec_count);
        if let Err(err) = gmres_result {
            tracing::warn!("Schur complement solve did not converge");
            self.timers.linear_solve.stop();
            return Err(err);
        }
        // The flux slice of rhs now becomes the solution x_f
        flux.copy_from_slice(temp_flux);
        // Drop intermediate results left by the Schur operator
        temp_head.fill(0.0);

        // ==== Step 4: back-substitute, x_i = y_i - J_i^{-1} J_{i,f} x_f
        let x_f: &[f64] = flux;
        self.jac_cf.multiply_add(x_f, &mut temp_head[..n_bulk]);
        {
            let first = FirstError::new();
            let (tmp_bulk, tmp_par) = temp_head.split_at_mut(n_bulk);
            let (rhs_bulk, rhs_par) = head.split_at_mut(n_bulk);
            rayon::join(
                || {
                    tmp_bulk
                        .par_chunks_mut(n_col)
                        .zip(rhs_bulk.par_chunks_mut(n_col))
                        .enumerate()
                        .for_each(|(comp, (tmp, r))| {
                            if jac_c_disc[comp].solve(tmp).is_err() {
                                tracing::error!(comp, "solve failed for column block");
                                first.record(linear_solver_error!(ColumnBlockSolveFailed { comp }));
                                return;
                            }
                            for i in 0..tmp.len() {
                                r[i] -= tmp[i];
                            }
                        });
                },
                || {
                    tmp_par
                        .par_chunks_mut(stride_block)
                        .zip(rhs_par.par_chunks_mut(stride_block))
                        .enumerate()
                        .for_each(|(cell, (tmp, r))| {
                            jac_pf[cell].multiply_add(x_f, tmp);
                            if jac_p_disc[cell].solve(tmp).is_err() {
                                tracing::error!(cell, "solve failed for particle block");
                                first.record(linear_solver_error!(ParticleBlockSolveFailed { cell }));
                                return;
                            }
                            for i in 0..tmp.len() {
                                r[i] -= tmp[i];
                            }
                        });
                },
            );
            if let Some(err) = first.take() {
                self.timers.linear_solve.stop();
                return Err(err);
            }
        }

        self.timers.linear_solve.stop();
        Ok(())
    }
}
