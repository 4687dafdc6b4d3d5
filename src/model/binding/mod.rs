//! Adsorption isotherm models.
//!
//! The solver core only relies on a small capability set: location of the
//! algebraic sub-block inside a shell, a per-shell solve of the algebraic
//! isotherm equations for consistent initialization, and the contribution of
//! the binding kinetics to the time-derivative Jacobian. The known isotherm
//! families are represented as a tagged variant, so the per-shell loops
//! dispatch without virtual calls.

pub mod langmuir;
pub mod linear;
pub mod sma;

pub use langmuir::LangmuirBinding;
pub use linear::LinearBinding;
pub use sma::SmaBinding;

use crate::ad::Real;
use crate::linalg::{BandMatrix, DenseSlab, FactorizableBandMatrix};
use crate::model::ParamId;

/// Tagged variant over the supported isotherm families.
#[derive(Debug, Clone)]
pub enum BindingModel {
    Linear(LinearBinding),
    Langmuir(LangmuirBinding),
    StericMassAction(SmaBinding),
}

impl BindingModel {
    pub fn n_comp(&self) -> usize {
        match self {
            BindingModel::Linear(m) => m.n_comp(),
            BindingModel::Langmuir(m) => m.n_comp(),
            BindingModel::StericMassAction(m) => m.n_comp(),
        }
    }

    /// Bound states per component.
    pub fn n_bound(&self) -> &[usize] {
        match self {
            BindingModel::Linear(m) => m.n_bound(),
            BindingModel::Langmuir(m) => m.n_bound(),
            BindingModel::StericMassAction(m) => m.n_bound(),
        }
    }

    pub fn has_algebraic_equations(&self) -> bool {
        match self {
            BindingModel::Linear(m) => m.quasi_stationary(),
            BindingModel::Langmuir(_) => false,
            // The salt balance is algebraic even in kinetic mode
            BindingModel::StericMassAction(_) => true,
        }
    }

    /// Offset and length of the algebraic sub-block within the bound states
    /// of one shell. `(0, 0)` if there are no algebraic equations.
    pub fn algebraic_block(&self) -> (usize, usize) {
        match self {
            BindingModel::Linear(m) => m.algebraic_block(),
            BindingModel::Langmuir(_) => (0, 0),
            BindingModel::StericMassAction(m) => m.algebraic_block(),
        }
    }

    /// Doubles of scratch memory one thread needs for
    /// [`Self::consistent_initial_state`].
    pub fn workspace_size(&self) -> usize {
        let (_, alg_len) = self.algebraic_block();
        3 * alg_len
    }

    /// Residual of the bound-state equations of one shell.
    ///
    /// `res` receives one entry per bound state. Dynamic bound states get
    /// `tau * dq/dt - f_ads`, quasi-stationary ones the bare algebraic
    /// residual.
    pub fn residual<T: Real>(
        &self,
        tau: f64,
        cp: &[f64],
        q: &[f64],
        q_dot: Option<&[f64]>,
        res: &mut [T],
    ) {
        match self {
            BindingModel::Linear(m) => m.residual(tau, cp, q, q_dot, res),
            BindingModel::Langmuir(m) => m.residual(tau, cp, q, q_dot, res),
            BindingModel::StericMassAction(m) => m.residual(tau, cp, q, q_dot, res),
        }
    }

    /// Adds the state Jacobian of the bound-state equations of one shell to
    /// the particle block, rows `first_bound_row ..`.
    pub fn state_jacobian(
        &self,
        cp: &[f64],
        q: &[f64],
        jac: &mut BandMatrix,
        first_bound_row: usize,
    ) {
        match self {
            BindingModel::Linear(m) => m.state_jacobian(cp, q, jac, first_bound_row),
            BindingModel::Langmuir(m) => m.state_jacobian(cp, q, jac, first_bound_row),
            BindingModel::StericMassAction(m) => m.state_jacobian(cp, q, jac, first_bound_row),
        }
    }

    /// Adds `factor * dF/d(dq/dt)` to the diagonal of the dynamic bound-state
    /// rows, starting at `first_bound_row`.
    pub fn jacobian_add_discretized(
        &self,
        factor: f64,
        jac: &mut FactorizableBandMatrix,
        first_bound_row: usize,
    ) {
        match self {
            BindingModel::Linear(m) => m.jacobian_add_discretized(factor, jac, first_bound_row),
            BindingModel::Langmuir(m) => m.jacobian_add_discretized(factor, jac, first_bound_row),
            BindingModel::StericMassAction(m) => {
                m.jacobian_add_discretized(factor, jac, first_bound_row)
            }
        }
    }

    /// Solves the algebraic isotherm equations of one shell in place.
    ///
    /// `jac` is dense scratch of order `alg_len` carved from the factorizable
    /// particle block, `scratch` holds [`Self::workspace_size`] doubles.
    #[allow(clippy::too_many_arguments)]
    pub fn consistent_initial_state(
        &self,
        t: f64,
        z: f64,
        r: f64,
        sec_idx: usize,
        cp: &[f64],
        q: &mut [f64],
        error_tol: f64,
        scratch: &mut [f64],
        jac: &mut DenseSlab<'_>,
    ) -> Result<(), NewtonFailure> {
        match self {
            BindingModel::Linear(m) => m.consistent_initial_state(cp, q),
            BindingModel::Langmuir(_) => Ok(()),
            BindingModel::StericMassAction(m) => {
                m.consistent_initial_state(t, z, r, sec_idx, cp, q, error_tol, scratch, jac)
            }
        }
    }

    /// Explicit time derivative of the algebraic residual, written to `out`
    /// (one entry per algebraic equation). Returns `false` if it vanishes
    /// identically, which holds for all shipped isotherms; external-function
    /// driven isotherms would override this.
    pub fn algebraic_time_derivative(&self, _t: f64, _z: f64, out: &mut [f64]) -> bool {
        out.fill(0.0);
        false
    }

    /// Seeds the AD direction of a binding parameter. Returns `false` if the
    /// parameter does not belong to this model.
    pub fn set_sens_direction(&mut self, param: &ParamId, dir: usize) -> bool {
        match self {
            BindingModel::Linear(m) => m.set_sens_direction(param, dir),
            BindingModel::Langmuir(m) => m.set_sens_direction(param, dir),
            BindingModel::StericMassAction(m) => m.set_sens_direction(param, dir),
        }
    }
}

/// Maps bound-state index to component for models with at most one bound
/// state per component.
pub(crate) fn bound_to_comp(n_bound: &[usize]) -> Vec<usize> {
    let mut map = Vec::new();
    for (comp, nb) in n_bound.iter().enumerate() {
        for _ in 0..*nb {
            map.push(comp);
        }
    }
    map
}

/// Damped Newton iteration on a dense algebraic system.
///
/// `residual(q, res)` evaluates the equations, `jacobian(q, jac)` fills the
/// dense Jacobian. `q` holds the unknowns of the algebraic block; `scratch`
/// provides three work vectors of the block length.
pub(crate) fn damped_newton(
    q: &mut [f64],
    error_tol: f64,
    scratch: &mut [f64],
    jac: &mut DenseSlab<'_>,
    residual: impl Fn(&[f64], &mut [f64]),
    jacobian: impl Fn(&[f64], &mut DenseSlab<'_>),
) -> Result<(), NewtonFailure> {
    const MAX_ITER: usize = 50;
    const MIN_DAMPING: f64 = 1.0 / 64.0;

    let n = q.len();
    let (res, rest) = scratch.split_at_mut(n);
    let (step, trial) = rest.split_at_mut(n);

    residual(q, res);
    let mut norm = inf_norm(res);
    for _ in 0..MAX_ITER {
        if norm <= error_tol {
            return Ok(());
        }
        jacobian(q, jac);
        jac.factorize().map_err(|_| NewtonFailure { residual: norm })?;
        step[..n].copy_from_slice(res);
        jac.solve(step)
            .map_err(|_| NewtonFailure { residual: norm })?;

        // Reduce the step until the residual shrinks
        let mut damping = 1.0;
        loop {
            for i in 0..n {
                trial[i] = q[i] - damping * step[i];
            }
            residual(trial, res);
            let trial_norm = inf_norm(res);
            if trial_norm < norm || damping <= MIN_DAMPING {
                q.copy_from_slice(&trial[..n]);
                norm = trial_norm;
                break;
            }
            damping *= 0.5;
        }
    }
    if norm <= error_tol {
        Ok(())
    } else {
        Err(NewtonFailure { residual: norm })
    }
}

/// Failure of the per-shell algebraic Newton solve.
#[derive(Debug, Clone, Copy)]
pub struct NewtonFailure {
    pub residual: f64,
}

pub(crate) fn inf_norm(v: &[f64]) -> f64 {
    v.iter().fold(0.0_f64, |acc, x| acc.max(x.abs()))
}
