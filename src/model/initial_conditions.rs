//! Consistent initialization of the differential-algebraic system.
//!
//! The DAE `F(t, y, dy) = 0` is index 1: consistent initial values must
//! satisfy the algebraic isotherm equations and the flux relation, and the
//! initial time derivative must lie in the tangent space of that manifold.
//!
//! The normal pipeline solves the algebraic binding equations per shell,
//! closes the (linear) flux equations, evaluates the residual without time
//! derivative contributions, and solves the block system
//! `tau * dF/d(dy) * dy = -res`, where rows of algebraic equations are
//! replaced by their state Jacobian rows (differentiating `0 = f_alg(y)` in
//! time) with zero right-hand side. The lean variants shortcut the particle
//! work for warm restarts across section transitions, and the sensitivity
//! variant runs the same scheme once per parameter against the linearized
//! right-hand side `-dF/dp`.
//!
//! The factorizable particle blocks double as dense scratch for the
//! algebraic solves, which is why every pipeline ends by flagging the
//! Jacobian for re-factorization.

use rayon::prelude::*;

use crate::config::ParameterProvider;
use crate::error::ChromsolError;
use crate::model::grm::{
    add_time_derivative_column_block, add_time_derivative_particle_block, GeneralRateModel,
};
use crate::parallel::FirstError;
use crate::{config_error, init_error};

impl GeneralRateModel {
    /// Fills the state from the parameter provider: either a full `INIT_STATE`
    /// (optionally with the time derivative appended), or per-component
    /// `INIT_C` / `INIT_Q` with an optional `INIT_CP`.
    pub fn apply_initial_condition(
        &self,
        provider: &dyn ParameterProvider,
        y: &mut [f64],
        y_dot: &mut [f64],
    ) -> Result<(), ChromsolError> {
        let idxr = self.indexer();
        let n_dofs = idxr.num_dofs();
        debug_assert_eq!(y.len(), n_dofs);

        if provider.exists("INIT_STATE") {
            let init = provider.get_f64_array("INIT_STATE")?;
            if init.len() < n_dofs {
                return Err(config_error!(NotEnoughValues {
                    name: "INIT_STATE".to_string(),
                    expected: n_dofs,
                    found: init.len(),
                }));
            }
            y.copy_from_slice(&init[..n_dofs]);
            if init.len() >= 2 * n_dofs {
                y_dot.copy_from_slice(&init[n_dofs..2 * n_dofs]);
            }
            return Ok(());
        }

        let init_c = provider.get_f64_array("INIT_C")?;
        if init_c.len() < self.disc.n_comp {
            return Err(config_error!(NotEnoughValues {
                name: "INIT_C".to_string(),
                expected: self.disc.n_comp,
                found: init_c.len(),
            }));
        }

        let init_q = if self.disc.stride_bound > 0 {
            let init_q = provider.get_f64_array("INIT_Q")?;
            if init_q.len() < self.disc.stride_bound {
                return Err(config_error!(NotEnoughValues {
                    name: "INIT_Q".to_string(),
                    expected: self.disc.stride_bound,
                    found: init_q.len(),
                }));
            }
            init_q
        } else {
            Vec::new()
        };

        let init_cp = if provider.exists("INIT_CP") {
            let init_cp = provider.get_f64_array("INIT_CP")?;
            if init_cp.len() < self.disc.n_comp {
                return Err(config_error!(NotEnoughValues {
                    name: "INIT_CP".to_string(),
                    expected: self.disc.n_comp,
                    found: init_cp.len(),
                }));
            }
            init_cp
        } else {
            init_c.clone()
        };

        for comp in 0..self.disc.n_comp {
            for cell in 0..self.disc.n_col {
                y[idxr.offset_c(comp, cell)] = init_c[comp];
            }
        }
        for cell in 0..self.disc.n_col {
            let block = idxr.offset_cp(cell);
            for shell in 0..self.disc.n_par {
                let shell_off = block + shell * idxr.stride_par_shell();
                for comp in 0..self.disc.n_comp {
                    y[shell_off + comp] = init_cp[comp];
                }
                for bnd in 0..self.disc.stride_bound {
                    y[shell_off + idxr.stride_par_liquid() + bnd] = init_q[bnd];
                }
            }
        }
        y[idxr.offset_jf()..].fill(0.0);
        Ok(())
    }

    /// Solves the algebraic flux equations for `j_f` by substituting the
    /// diagonal block entries of `vec`: `j_f <- j_f - J_{f,0} c - sum J_{f,p} c_p`.
    pub(crate) fn solve_for_fluxes(&self, vec: &mut [f64]) {
        let idxr = self.indexer();
        let n_bulk = self.disc.n_comp * self.disc.n_col;
        let stride_block = idxr.stride_par_block();
        let (head, flux) = vec.split_at_mut(idxr.offset_jf());

        // Serial: the fluxes are updated in place
        self.jac_fc.multiply_subtract(&head[..n_bulk], flux);
        for cell in 0..self.disc.n_col {
            self.jac_fp[cell]
                .multiply_subtract(&head[n_bulk + cell * stride_block..][..stride_block], flux);
        }
    }

    /// Step 1 of the normal pipeline: solve the algebraic isotherm equations
    /// of every shell, then close the flux equations.
    ///
    /// A shell whose algebraic equations cannot be driven below `error_tol`
    /// is fatal: the state would be off the algebraic manifold.
    pub fn consistent_initial_state(
        &mut self,
        t: f64,
        sec: usize,
        _tau: f64,
        y: &mut [f64],
        error_tol: f64,
    ) -> Result<(), ChromsolError> {
        self.timers.consistent_init.start();
        let idxr = self.indexer();
        let offset_cp = idxr.offset_cp(0);
        let offset_jf = idxr.offset_jf();

        if self.binding.has_algebraic_equations() {
            let (_, alg_len) = self.binding.algebraic_block();
            let workspace = self.binding.workspace_size();
            let n_col = self.disc.n_col;
            let n_par = self.disc.n_par;
            let n_comp = self.disc.n_comp;
            let stride_shell = idxr.stride_par_shell();
            let stride_block = idxr.stride_par_block();

            let first = FirstError::new();
            let binding = &self.binding;
            let radius = &self.par_center_radius;
            let jac_p_disc = &mut self.jac_p_disc;
            let y_par = &mut y[offset_cp..offset_jf];

            jac_p_disc
                .par_iter_mut()
                .zip(y_par.par_chunks_mut(stride_block))
                .enumerate()
                .for_each_init(
                    || vec![0.0; workspace],
                    |scratch, (cell, (fbm, block))| {
                        // Midpoint of the column cell, needed by externally
                        // dependent isotherms
                        let z = (0.5 + cell as f64) / n_col as f64;
                        // Reuse the factorizable block as dense scratch
                        let mut dense = fbm.dense_scratch(alg_len);
                        for shell in 0..n_par {
                            let shell_off = shell * stride_shell;
                            let shell_slice =
                                &mut block[shell_off..shell_off + stride_shell];
                            let (cp, q) = shell_slice.split_at_mut(n_comp);
                            let result = binding
                                .consistent_initial_state(
                                    t,
                                    z,
                                    radius[shell],
                                    sec,
                                    cp,
                                    q,
                                    error_tol,
                                    scratch,
                                    &mut dense,
                                )
                                .map_err(|failure| {
                                    tracing::error!(
                                        cell,
                                        shell,
                                        residual = failure.residual,
                                        "binding equations did not converge during consistent initialization"
                                    );
                                    init_error!(BindingDidNotConverge {
                                        cell,
                                        shell,
                                        residual: failure.residual,
                                    })
                                });
                            first.record_result(result);
                        }
                    },
                );

            // The discretized Jacobians served as temporary storage
            self.factorize_jacobian = true;

            if let Some(err) = first.take() {
                self.timers.consistent_init.stop();
                return Err(err);
            }
        }

        y[offset_jf..].fill(0.0);
        self.solve_for_fluxes(y);
        self.timers.consistent_init.stop();
        Ok(())
    }

    /// Assembles, factorizes, and solves the pure time-derivative block
    /// system in place on the bulk and particle regions of `rhs_head`.
    ///
    /// Rows of algebraic equations are overwritten with the corresponding
    /// state Jacobian rows; their right-hand side becomes the explicit time
    /// derivative of the algebraic residual (zero for all shipped isotherms).
    /// `negated_rhs` states whether `rhs_head` already carries the negated
    /// residual, which flips the sign of that explicit term.
    fn solve_time_derivative_blocks(
        &mut self,
        t: f64,
        tau: f64,
        rhs_head: &mut [f64],
        negated_rhs: bool,
    ) -> Result<(), ChromsolError> {
        let idxr = self.indexer();
        let n_col = self.disc.n_col;
        let n_par = self.disc.n_par;
        let n_comp = self.disc.n_comp;
        let n_bulk = n_comp * n_col;
        let stride_shell = idxr.stride_par_shell();
        let stride_block = idxr.stride_par_block();
        let has_alg = self.binding.has_algebraic_equations();
        let (alg_start, alg_len) = self.binding.algebraic_block();
        let beta_p = self.beta_p();

        let first = FirstError::new();
        let jac_p = &self.jac_p;
        let jac_c_disc = &mut self.jac_c_disc;
        let jac_p_disc = &mut self.jac_p_disc;
        let binding = &self.binding;
        let disc = &self.disc;
        let (bulk, par) = rhs_head.split_at_mut(n_bulk);

        rayon::join(
            || {
                jac_c_disc
                    .par_iter_mut()
                    .zip(bulk.par_chunks_mut(n_col))
                    .enumerate()
                    .for_each(|(comp, (fbm, rhs))| {
                        fbm.set_all(0.0);
                        add_time_derivative_column_block(fbm, tau);
                        if fbm.factorize().is_err() {
                            tracing::error!(comp, "factorization failed for column block");
                            first.record(init_error!(SingularColumnBlock { comp }));
                            return;
                        }
                        if fbm.solve(rhs).is_err() {
                            first.record(init_error!(SingularColumnBlock { comp }));
                        }
                    });
            },
            || {
                jac_p_disc
                    .par_iter_mut()
                    .zip(par.par_chunks_mut(stride_block))
                    .enumerate()
                    .for_each(|(cell, (fbm, rhs))| {
                        fbm.set_all(0.0);
                        add_time_derivative_particle_block(fbm, binding, disc, tau, beta_p);

                        if has_alg {
                            let z = (0.5 + cell as f64) / n_col as f64;
                            let mut alg_dot = vec![0.0; alg_len];
                            let explicit = binding.algebraic_time_derivative(t, z, &mut alg_dot);
                            for shell in 0..n_par {
                                let row0 = shell * stride_shell + n_comp + alg_start;
                                for r in 0..alg_len {
                                    fbm.copy_row_from_band(row0 + r, &jac_p[cell], row0 + r);
                                    rhs[row0 + r] = if explicit {
                                        if negated_rhs {
                                            -alg_dot[r]
                                        } else {
                                            alg_dot[r]
                                        }
                                    } else {
                                        0.0
                                    };
                                }
                            }
                        }

                        if fbm.factorize().is_err() {
                            tracing::error!(cell, "factorization failed for particle block");
                            first.record(init_error!(SingularParticleBlock { cell }));
                            return;
                        }
                        if fbm.solve(rhs).is_err() {
                            first.record(init_error!(SingularParticleBlock { cell }));
                        }
                    });
            },
        );

        match first.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Step 2 of the normal pipeline: compute consistent time derivatives.
    ///
    /// On entry `y_dot` holds the residual evaluated without time derivative
    /// contributions; on exit it holds the consistent `dy`. Failures here are
    /// fatal: initialization cannot recover by step-size reduction.
    pub fn consistent_initial_time_derivative(
        &mut self,
        t: f64,
        tau: f64,
        y_dot: &mut [f64],
    ) -> Result<(), ChromsolError> {
        self.timers.consistent_init.start();
        let idxr = self.indexer();
        let offset_jf = idxr.offset_jf();

        // The residual enters with the wrong sign for a right-hand side; the
        // system is linear, so the solution is negated at the end instead.
        let (head, _) = y_dot.split_at_mut(offset_jf);
        let result = self.solve_time_derivative_blocks(t, tau, head, false);
        if let Err(err) = result {
            self.timers.consistent_init.stop();
            return Err(err);
        }

        y_dot[offset_jf..].fill(0.0);
        self.solve_for_fluxes(y_dot);

        y_dot.par_iter_mut().for_each(|v| *v = -*v);

        self.factorize_jacobian = true;
        self.timers.consistent_init.stop();
        Ok(())
    }

    /// Full consistent initialization: state, residual evaluation, time
    /// derivative. Do not mix with the lean pipeline.
    pub fn consistent_initial_conditions(
        &mut self,
        t: f64,
        sec: usize,
        tau: f64,
        y: &mut [f64],
        y_dot: &mut [f64],
        error_tol: f64,
    ) -> Result<(), ChromsolError> {
        self.consistent_initial_state(t, sec, tau, y, error_tol)?;

        // Residual without dy contributions, evaluated at the updated state;
        // this also refreshes the state Jacobians. Negation happens at the
        // end of the time-derivative step.
        self.residual_with_jacobian(t, sec, tau, y, None, y_dot);

        self.consistent_initial_time_derivative(t, tau, y_dot)
    }

    /// Lean step 1: keep the state, only close the flux equations.
    pub fn lean_consistent_initial_state(
        &mut self,
        _t: f64,
        _sec: usize,
        _tau: f64,
        y: &mut [f64],
    ) -> Result<(), ChromsolError> {
        self.warn_if_section_dependent();
        self.timers.consistent_init.start();
        let idxr = self.indexer();
        y[idxr.offset_jf()..].fill(0.0);
        self.solve_for_fluxes(y);
        self.timers.consistent_init.stop();
        Ok(())
    }

    /// Lean step 2: fix only the bulk and flux time derivatives; particle
    /// entries of `y_dot` stay untouched.
    ///
    /// `res` holds the residual without time derivative contributions and is
    /// overwritten.
    pub fn lean_consistent_initial_time_derivative(
        &mut self,
        tau: f64,
        y_dot: &mut [f64],
        res: &mut [f64],
    ) -> Result<(), ChromsolError> {
        self.warn_if_section_dependent();
        self.timers.consistent_init.start();
        let n_col = self.disc.n_col;
        let n_bulk = self.disc.n_comp * n_col;

        let first = FirstError::new();
        {
            let jac_c_disc = &mut self.jac_c_disc;
            jac_c_disc
                .par_iter_mut()
                .zip(res[..n_bulk].par_chunks_mut(n_col))
                .zip(y_dot[..n_bulk].par_chunks_mut(n_col))
                .enumerate()
                .for_each(|(comp, ((fbm, res_slice), y_dot_slice))| {
                    fbm.set_all(0.0);
                    add_time_derivative_column_block(fbm, tau);
                    if fbm.factorize().is_err() {
                        tracing::error!(comp, "factorization failed for column block");
                        first.record(init_error!(SingularColumnBlock { comp }));
                        return;
                    }
                    if fbm.solve(res_slice).is_err() {
                        first.record(init_error!(SingularColumnBlock { comp }));
                        return;
                    }
                    // Solved with the positive residual; negate the solution
                    for (yd, r) in y_dot_slice.iter_mut().zip(res_slice.iter()) {
                        *yd = -*r;
                    }
                });
        }
        if let Some(err) = first.take() {
            self.timers.consistent_init.stop();
            return Err(err);
        }

        let idxr = self.indexer();
        y_dot[idxr.offset_jf()..].fill(0.0);
        self.solve_for_fluxes(y_dot);

        self.factorize_jacobian = true;
        self.timers.consistent_init.stop();
        Ok(())
    }

    /// Lean consistent initialization: flux closure and bulk time
    /// derivatives only. Intended for warm restarts across section
    /// transitions that preserve the algebraic invariants.
    pub fn lean_consistent_initial_conditions(
        &mut self,
        t: f64,
        sec: usize,
        tau: f64,
        y: &mut [f64],
        y_dot: &mut [f64],
    ) -> Result<(), ChromsolError> {
        self.lean_consistent_initial_state(t, sec, tau, y)?;

        let mut res = std::mem::take(&mut self.temp_state);
        self.residual_with_jacobian(t, sec, tau, y, None, &mut res);
        let result = self.lean_consistent_initial_time_derivative(tau, y_dot, &mut res);
        self.temp_state = res;
        result
    }

    /// Consistent initialization of the forward sensitivity systems.
    ///
    /// For each registered parameter the linear DAE
    /// `dF/dy s + dF/d(dy) ds + dF/dp = 0` is initialized around the
    /// consistent `(y, dy)`: algebraic rows are solved with a dense
    /// factorization against `-dF/dp` minus the banded couplings, fluxes by
    /// the linear reduction, and the time derivative by the block system with
    /// right-hand side `-J s - dF/dp`.
    pub fn consistent_initial_sensitivity(
        &mut self,
        t: f64,
        sec: usize,
        tau: f64,
        y: &[f64],
        y_dot: &[f64],
        sens_y: &mut [Vec<f64>],
        sens_y_dot: &mut [Vec<f64>],
    ) -> Result<(), ChromsolError> {
        self.timers.consistent_init.start();
        debug_assert_eq!(sens_y.len(), sens_y_dot.len());

        // Parameter derivatives of the residual at (y, dy), plus fresh
        // state Jacobians
        self.assemble_jacobians(sec, y);
        self.update_sens_residual(t, sec, tau, y, Some(y_dot));

        let idxr = self.indexer();
        let n_dofs = idxr.num_dofs();
        let n_col = self.disc.n_col;
        let n_par = self.disc.n_par;
        let n_comp = self.disc.n_comp;
        let stride_shell = idxr.stride_par_shell();
        let stride_block = idxr.stride_par_block();
        let offset_cp = idxr.offset_cp(0);
        let offset_jf = idxr.offset_jf();
        let has_alg = self.binding.has_algebraic_equations();
        let (alg_start, alg_len) = self.binding.algebraic_block();
        let stride_bound = self.disc.stride_bound;

        for param in 0..sens_y.len() {
            let s = &mut sens_y[param];
            let s_dot = &mut sens_y_dot[param];
            debug_assert_eq!(s.len(), n_dofs);

            // -dF/dp
            for i in 0..n_dofs {
                s_dot[i] = -self.ad_res[i].derivative(param);
            }

            // ==== Step 1a: algebraic bound states
            if has_alg {
                let first = FirstError::new();
                let jac_p = &self.jac_p;
                let jac_p_disc = &mut self.jac_p_disc;
                let s_par = &mut s[offset_cp..offset_jf];
                let s_dot_par = &s_dot[offset_cp..offset_jf];

                jac_p_disc
                    .par_iter_mut()
                    .zip(s_par.par_chunks_mut(stride_block))
                    .zip(s_dot_par.par_chunks(stride_block))
                    .enumerate()
                    .for_each(|(cell, ((fbm, block), dfdp_block))| {
                        let mut dense = fbm.dense_scratch(alg_len);
                        for shell in 0..n_par {
                            let shell_off = shell * stride_shell;
                            let jac_row = shell_off + n_comp + alg_start;

                            // The algebraic rows couple to [c_p | q_pre | q_alg | q_post];
                            // move everything but q_alg to the right-hand side
                            let shell_slice =
                                &mut block[shell_off..shell_off + stride_shell];
                            let (pre, rest) = shell_slice.split_at_mut(n_comp + alg_start);
                            let (q_alg, q_post) = rest.split_at_mut(alg_len);

                            // -dF/dp of the algebraic rows
                            q_alg.copy_from_slice(
                                &dfdp_block[shell_off + n_comp + alg_start
                                    ..shell_off + n_comp + alg_start + alg_len],
                            );

                            // Subtract [c_p | q_pre] columns
                            jac_p[cell].submatrix_multiply_vector(
                                pre,
                                jac_row,
                                -((n_comp + alg_start) as isize),
                                alg_len,
                                n_comp + alg_start,
                                -1.0,
                                1.0,
                                q_alg,
                            );
                            // Subtract trailing bound-state columns
                            if alg_start + alg_len < stride_bound {
                                jac_p[cell].submatrix_multiply_vector(
                                    q_post,
                                    jac_row,
                                    alg_len as isize,
                                    alg_len,
                                    stride_bound - alg_start - alg_len,
                                    -1.0,
                                    1.0,
                                    q_alg,
                                );
                            }

                            // Dense solve on the algebraic slab
                            dense.copy_submatrix_from_banded(
                                &jac_p[cell],
                                jac_row,
                                0,
                                alg_len,
                                alg_len,
                            );
                            if dense.factorize().is_err() || dense.solve(q_alg).is_err() {
                                tracing::error!(cell, shell, "algebraic block solve failed");
                                first.record(init_error!(SingularAlgebraicBlock { cell, shell }));
                            }
                        }
                    });
                if let Some(err) = first.take() {
                    self.timers.consistent_init.stop();
                    return Err(err);
                }
            }

            // ==== Step 1b: fluxes, right-hand side is -dF/dp
            s[offset_jf..].copy_from_slice(&s_dot[offset_jf..]);
            self.solve_for_fluxes(s);

            // ==== Step 2: time derivatives, rhs = -J s - dF/dp
            self.subtract_jacobian_product(s, s_dot);

            let (head, _) = s_dot.split_at_mut(offset_jf);
            let result = self.solve_time_derivative_blocks(t, tau, head, true);
            if let Err(err) = result {
                self.timers.consistent_init.stop();
                return Err(err);
            }

            // Fluxes of ds: the flux slice still holds its -dF/dp part
            self.solve_for_fluxes(s_dot);
        }

        self.factorize_jacobian = true;
        self.timers.consistent_init.stop();
        Ok(())
    }

    /// Lean sensitivity initialization: bulk and flux subsystems only.
    pub fn lean_consistent_initial_sensitivity(
        &mut self,
        t: f64,
        sec: usize,
        tau: f64,
        y: &[f64],
        y_dot: &[f64],
        sens_y: &mut [Vec<f64>],
        sens_y_dot: &mut [Vec<f64>],
    ) -> Result<(), ChromsolError> {
        self.warn_if_section_dependent();
        self.timers.consistent_init.start();

        self.assemble_jacobians(sec, y);
        self.update_sens_residual(t, sec, tau, y, Some(y_dot));

        let idxr = self.indexer();
        let n_dofs = idxr.num_dofs();
        let n_col = self.disc.n_col;
        let n_bulk = self.disc.n_comp * n_col;
        let offset_cp = idxr.offset_cp(0);
        let offset_jf = idxr.offset_jf();

        for param in 0..sens_y.len() {
            let s = &mut sens_y[param];
            let s_dot = &mut sens_y_dot[param];

            // -dF/dp on the bulk and flux regions; particle entries keep
            // their caller-provided values
            for i in 0..offset_cp {
                s_dot[i] = -self.ad_res[i].derivative(param);
            }
            for i in offset_jf..n_dofs {
                s_dot[i] = -self.ad_res[i].derivative(param);
            }

            // Fluxes of s
            s[offset_jf..].copy_from_slice(&s_dot[offset_jf..]);
            self.solve_for_fluxes(s);

            // rhs = -J s - dF/dp
            self.subtract_jacobian_product(s, s_dot);

            let first = FirstError::new();
            {
                let jac_c_disc = &mut self.jac_c_disc;
                jac_c_disc
                    .par_iter_mut()
                    .zip(s_dot[..n_bulk].par_chunks_mut(n_col))
                    .enumerate()
                    .for_each(|(comp, (fbm, rhs))| {
                        fbm.set_all(0.0);
                        add_time_derivative_column_block(fbm, tau);
                        if fbm.factorize().is_err() || fbm.solve(rhs).is_err() {
                            tracing::error!(comp, "factorization failed for column block");
                            first.record(init_error!(SingularColumnBlock { comp }));
                        }
                    });
            }
            if let Some(err) = first.take() {
                self.timers.consistent_init.stop();
                return Err(err);
            }

            self.solve_for_fluxes(s_dot);
        }

        self.factorize_jacobian = true;
        self.timers.consistent_init.stop();
        Ok(())
    }

    fn warn_if_section_dependent(&self) {
        if self.has_section_dependent_diffusion() {
            tracing::warn!(
                "lean consistent initialization is not appropriate for section-dependent pore and surface diffusion"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InMemoryProvider;
    use crate::error::ConfigurationError;
    use crate::model::binding::{BindingModel, LinearBinding};
    use crate::model::{ColumnParams, Discretization, GeneralRateModel, Inlet, InletSection};

    fn dynamic_model() -> GeneralRateModel {
        let disc = Discretization::new(2, 8, 4, vec![1, 1]);
        let params = ColumnParams::new(
            0.1,
            0.4,
            0.3,
            5e-5,
            1e-3,
            1e-5,
            &[1e-3, 1e-3],
            &[1e-10, 1e-10],
            &[0.0, 0.0],
        );
        let binding = BindingModel::Linear(LinearBinding::new(
            vec![1, 1],
            &[2.0, 2.0],
            &[1.0, 1.0],
            false,
        ));
        let inlet = Inlet {
            sections: vec![InletSection::constant_profile(&[1.0, 0.5])],
        };
        let mut model = GeneralRateModel::new(disc, params, binding, inlet).unwrap();
        model.set_section_times(&[0.0, 100.0]);
        model
    }

    fn quasi_stationary_model() -> GeneralRateModel {
        let disc = Discretization::new(2, 4, 3, vec![1, 1]);
        let params = ColumnParams::new(
            0.1,
            0.4,
            0.3,
            5e-5,
            1e-3,
            1e-5,
            &[1e-3, 1e-3],
            &[1e-10, 1e-10],
            &[0.0, 0.0],
        );
        let binding = BindingModel::Linear(LinearBinding::new(
            vec![1, 1],
            &[2.0, 4.0],
            &[1.0, 2.0],
            true,
        ));
        let inlet = Inlet {
            sections: vec![InletSection::constant_profile(&[1.0, 0.5])],
        };
        let mut model = GeneralRateModel::new(disc, params, binding, inlet).unwrap();
        model.set_section_times(&[0.0, 100.0]);
        model
    }

    #[test]
    fn test_apply_initial_condition_fills_blocks() {
        let model = dynamic_model();
        let n = model.num_dofs();
        let mut provider = InMemoryProvider::new();
        provider
            .set_array("INIT_C", &[1.5, 0.25])
            .set_array("INIT_Q", &[0.1, 0.2])
            .set_array("INIT_CP", &[1.0, 0.125]);
        let mut y = vec![-1.0; n];
        let mut y_dot = vec![0.0; n];
        model
            .apply_initial_condition(&provider, &mut y, &mut y_dot)
            .unwrap();

        let idxr = model.indexer();
        assert_eq!(y[idxr.offset_c(0, 3)], 1.5);
        assert_eq!(y[idxr.offset_c(1, 0)], 0.25);
        let shell = idxr.offset_cp(2) + idxr.stride_par_shell();
        assert_eq!(y[shell], 1.0);
        assert_eq!(y[shell + 1], 0.125);
        assert_eq!(y[shell + 2], 0.1);
        assert_eq!(y[shell + 3], 0.2);
        assert_eq!(y[idxr.offset_jf()], 0.0);
    }

    #[test]
    fn test_apply_initial_condition_rejects_short_arrays() {
        let model = dynamic_model();
        let n = model.num_dofs();
        let mut provider = InMemoryProvider::new();
        provider.set_array("INIT_C", &[1.0]).set_array("INIT_Q", &[0.0, 0.0]);
        let mut y = vec![0.0; n];
        let mut y_dot = vec![0.0; n];
        let err = model
            .apply_initial_condition(&provider, &mut y, &mut y_dot)
            .unwrap_err();
        assert!(matches!(
            err,
            ChromsolError::ConfigurationError(ConfigurationError::NotEnoughValues { .. })
        ));
    }

    #[test]
    fn test_consistent_initialization_zeroes_the_residual() {
        let mut model = dynamic_model();
        let n = model.num_dofs();
        let mut provider = InMemoryProvider::new();
        provider
            .set_array("INIT_C", &[0.8, 0.3])
            .set_array("INIT_Q", &[0.4, 0.1]);
        let mut y = vec![0.0; n];
        let mut y_dot = vec![0.0; n];
        model
            .apply_initial_condition(&provider, &mut y, &mut y_dot)
            .unwrap();
        model
            .consistent_initial_conditions(0.0, 0, 1.0, &mut y, &mut y_dot, 1e-12)
            .unwrap();

        let mut res = vec![0.0; n];
        model.residual(0.0, 0, 1.0, &y, Some(&y_dot), &mut res);
        for (i, r) in res.iter().enumerate() {
            assert!(r.abs() < 1e-9, "residual row {i} = {r}");
        }
        assert!(model.needs_factorization());
    }

    #[test]
    fn test_flux_consistency_after_state_step() {
        let mut model = quasi_stationary_model();
        let n = model.num_dofs();
        let mut provider = InMemoryProvider::new();
        provider
            .set_array("INIT_C", &[1.0, 0.5])
            .set_array("INIT_Q", &[0.0, 0.0]);
        let mut y = vec![0.0; n];
        let mut y_dot = vec![0.0; n];
        model
            .apply_initial_condition(&provider, &mut y, &mut y_dot)
            .unwrap();
        model
            .consistent_initial_state(0.0, 0, 1.0, &mut y, 1e-12)
            .unwrap();

        // j_f = k_f (c - c_p(r_p)) holds exactly, and the algebraic
        // equations are at equilibrium
        let idxr = model.indexer();
        let surface = (model.disc.n_par - 1) * idxr.stride_par_shell();
        for cell in 0..model.disc.n_col {
            for comp in 0..model.disc.n_comp {
                let jf = y[idxr.offset_jf() + idxr.offset_jf_local(comp, cell)];
                let c = y[idxr.offset_c(comp, cell)];
                let cp = y[idxr.offset_cp(cell) + surface + comp];
                let kf = 1e-3;
                assert!(
                    (jf - kf * (c - cp)).abs() < 1e-15,
                    "flux mismatch at cell {cell}, comp {comp}"
                );
            }
        }
        let shell0 = idxr.offset_cp(0);
        // q = ka/kd cp
        assert!((y[shell0 + 2] - 2.0 * y[shell0]).abs() < 1e-14);
        assert!((y[shell0 + 3] - 2.0 * y[shell0 + 1]).abs() < 1e-14);
    }

    #[test]
    fn test_lean_and_normal_agree_for_dynamic_binding_from_rest() {
        // From an all-zero state with a nonzero inlet, both pipelines reduce
        // to the same bulk and flux computations
        let mut normal = dynamic_model();
        let mut lean = dynamic_model();
        let n = normal.num_dofs();

        let mut y_n = vec![0.0; n];
        let mut y_dot_n = vec![0.0; n];
        normal
            .consistent_initial_conditions(0.0, 0, 1.0, &mut y_n, &mut y_dot_n, 1e-12)
            .unwrap();

        let mut y_l = vec![0.0; n];
        let mut y_dot_l = vec![0.0; n];
        lean.lean_consistent_initial_conditions(0.0, 0, 1.0, &mut y_l, &mut y_dot_l)
            .unwrap();

        assert_eq!(y_n, y_l);
        assert_eq!(y_dot_n, y_dot_l);
    }
}
