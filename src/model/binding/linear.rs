//! Linear isotherm, `f_ads = k_a c_p - k_d q`, in dynamic or quasi-stationary
//! form.

use crate::ad::{Active, Real};
use crate::linalg::{BandMatrix, FactorizableBandMatrix};
use crate::model::binding::{bound_to_comp, NewtonFailure};
use crate::model::ParamId;

#[derive(Debug, Clone)]
pub struct LinearBinding {
    n_bound: Vec<usize>,
    bound_comp: Vec<usize>,
    ka: Vec<Active>,
    kd: Vec<Active>,
    quasi_stationary: bool,
}

impl LinearBinding {
    /// `n_bound` selects which components bind (at most one bound state per
    /// component); `ka`/`kd` are per component.
    pub fn new(n_bound: Vec<usize>, ka: &[f64], kd: &[f64], quasi_stationary: bool) -> Self {
        assert_eq!(n_bound.len(), ka.len());
        assert_eq!(ka.len(), kd.len());
        assert!(n_bound.iter().all(|nb| *nb <= 1));
        Self {
            bound_comp: bound_to_comp(&n_bound),
            n_bound,
            ka: ka.iter().map(|v| Active::constant(*v)).collect(),
            kd: kd.iter().map(|v| Active::constant(*v)).collect(),
            quasi_stationary,
        }
    }

    pub fn n_comp(&self) -> usize {
        self.n_bound.len()
    }

    pub fn n_bound(&self) -> &[usize] {
        &self.n_bound
    }

    pub fn quasi_stationary(&self) -> bool {
        self.quasi_stationary
    }

    pub fn algebraic_block(&self) -> (usize, usize) {
        if self.quasi_stationary {
            (0, self.bound_comp.len())
        } else {
            (0, 0)
        }
    }

    pub fn residual<T: Real>(
        &self,
        tau: f64,
        cp: &[f64],
        q: &[f64],
        q_dot: Option<&[f64]>,
        res: &mut [T],
    ) {
        for (b, comp) in self.bound_comp.iter().enumerate() {
            let ka = T::from_active(self.ka[*comp]);
            let kd = T::from_active(self.kd[*comp]);
            let f_ads = ka * T::from_f64(cp[*comp]) - kd * T::from_f64(q[b]);
            res[b] = if self.quasi_stationary {
                -f_ads
            } else {
                let dq = q_dot.map(|qd| qd[b]).unwrap_or(0.0);
                T::from_f64(tau * dq) - f_ads
            };
        }
    }

    pub fn state_jacobian(
        &self,
        _cp: &[f64],
        _q: &[f64],
        jac: &mut BandMatrix,
        first_bound_row: usize,
    ) {
        let n_comp = self.n_comp();
        for (b, comp) in self.bound_comp.iter().enumerate() {
            let row = first_bound_row + b;
            // Column offsets relative to this bound-state row
            let to_cp = *comp as isize - (n_comp + b) as isize;
            jac.add(row, to_cp, -self.ka[*comp].value());
            jac.add(row, 0, self.kd[*comp].value());
        }
    }

    pub fn jacobian_add_discretized(
        &self,
        factor: f64,
        jac: &mut FactorizableBandMatrix,
        first_bound_row: usize,
    ) {
        if self.quasi_stationary {
            return;
        }
        for b in 0..self.bound_comp.len() {
            jac.add(first_bound_row + b, 0, factor);
        }
    }

    /// Closed-form equilibrium `q = (k_a / k_d) c_p`.
    pub fn consistent_initial_state(
        &self,
        cp: &[f64],
        q: &mut [f64],
    ) -> Result<(), NewtonFailure> {
        if !self.quasi_stationary {
            return Ok(());
        }
        for (b, comp) in self.bound_comp.iter().enumerate() {
            q[b] = self.ka[*comp].value() / self.kd[*comp].value() * cp[*comp];
        }
        Ok(())
    }

    pub fn set_sens_direction(&mut self, param: &ParamId, dir: usize) -> bool {
        match param {
            ParamId::BindingKa(comp) if *comp < self.ka.len() => {
                self.ka[*comp].set_direction(dir, 1.0);
                true
            }
            ParamId::BindingKd(comp) if *comp < self.kd.len() => {
                self.kd[*comp].set_direction(dir, 1.0);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dynamic_residual() {
        let binding = LinearBinding::new(vec![1, 1], &[2.0, 1.0], &[1.0, 0.5], false);
        let cp = [1.0, 2.0];
        let q = [0.5, 0.0];
        let q_dot = [0.1, 0.2];
        let mut res = [0.0_f64; 2];
        binding.residual(1.0, &cp, &q, Some(&q_dot), &mut res);
        // tau * dq/dt - (ka cp - kd q)
        assert!((res[0] - (0.1 - (2.0 - 0.5))).abs() < 1e-15);
        assert!((res[1] - (0.2 - 2.0)).abs() < 1e-15);
    }

    #[test]
    fn test_quasi_stationary_equilibrium() {
        let binding = LinearBinding::new(vec![1, 1], &[2.0, 4.0], &[1.0, 2.0], true);
        let cp = [1.0, 0.5];
        let mut q = [0.0, 0.0];
        binding.consistent_initial_state(&cp, &mut q).unwrap();
        assert_eq!(q, [2.0, 1.0]);

        let mut res = [1.0_f64; 2];
        binding.residual(1.0, &cp, &q, None, &mut res);
        assert_eq!(res, [0.0, 0.0]);
    }

    #[test]
    fn test_sensitivity_direction_seeding() {
        let mut binding = LinearBinding::new(vec![1], &[2.0], &[1.0], false);
        assert!(binding.set_sens_direction(&ParamId::BindingKa(0), 0));
        assert!(!binding.set_sens_direction(&ParamId::SmaLambda, 1));

        let cp = [3.0];
        let q = [0.0];
        let mut res = [Active::constant(0.0); 1];
        binding.residual(1.0, &cp, &q, None, &mut res);
        // d(res)/d(ka) = -cp
        assert_eq!(res[0].derivative(0), -3.0);
    }
}
