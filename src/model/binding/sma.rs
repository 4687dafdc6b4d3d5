//! Steric mass action isotherm.
//!
//! Component 0 is the salt. The bound salt concentration always satisfies
//! the algebraic charge balance `q_0 = Lambda - sum_j nu_j q_j`; the protein
//! bound states follow
//! `dq_i/dt = k_a,i c_p,i qbar_0^nu_i - k_d,i q_i c_p,0^nu_i`
//! with the sterically available salt
//! `qbar_0 = Lambda - sum_j (nu_j + sigma_j) q_j`, either kinetically or
//! quasi-stationary.

use crate::ad::{Active, Real};
use crate::linalg::{BandMatrix, DenseSlab, FactorizableBandMatrix};
use crate::model::binding::{damped_newton, NewtonFailure};
use crate::model::ParamId;

#[derive(Debug, Clone)]
pub struct SmaBinding {
    n_bound: Vec<usize>,
    lambda: Active,
    nu: Vec<f64>,
    sigma: Vec<f64>,
    ka: Vec<Active>,
    kd: Vec<Active>,
    quasi_stationary: bool,
}

impl SmaBinding {
    /// All slices are per component; entries for component 0 (the salt) are
    /// ignored for `ka`, `kd`, and `sigma`.
    pub fn new(
        lambda: f64,
        nu: &[f64],
        sigma: &[f64],
        ka: &[f64],
        kd: &[f64],
        quasi_stationary: bool,
    ) -> Self {
        assert_eq!(nu.len(), sigma.len());
        assert_eq!(nu.len(), ka.len());
        assert_eq!(nu.len(), kd.len());
        Self {
            n_bound: vec![1; nu.len()],
            lambda: Active::constant(lambda),
            nu: nu.to_vec(),
            sigma: sigma.to_vec(),
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
            (0, self.n_comp())
        } else {
            (0, 1)
        }
    }

    /// Sterically shielded salt concentration `qbar_0`.
    fn qbar0<T: Real>(&self, q: &[f64]) -> T {
        let mut qbar = T::from_active(self.lambda);
        for j in 1..self.n_comp() {
            qbar -= T::from_f64((self.nu[j] + self.sigma[j]) * q[j]);
        }
        qbar
    }

    pub fn residual<T: Real>(
        &self,
        tau: f64,
        cp: &[f64],
        q: &[f64],
        q_dot: Option<&[f64]>,
        res: &mut [T],
    ) {
        let n = self.n_comp();
        // Salt charge balance: q_0 - Lambda + sum nu_j q_j = 0
        let mut salt = T::from_f64(q[0]) - T::from_active(self.lambda);
        for j in 1..n {
            salt += T::from_f64(self.nu[j] * q[j]);
        }
        res[0] = salt;

        let qbar = self.qbar0::<T>(q);
        for i in 1..n {
            let ka = T::from_active(self.ka[i]);
            let kd = T::from_active(self.kd[i]);
            let f_ads = ka * T::from_f64(cp[i]) * qbar.powf_const(self.nu[i])
                - kd * T::from_f64(q[i]) * T::from_f64(cp[0].powf(self.nu[i]));
            res[i] = if self.quasi_stationary {
                -f_ads
            } else {
                let dq = q_dot.map(|qd| qd[i]).unwrap_or(0.0);
                T::from_f64(tau * dq) - f_ads
            };
        }
    }

    pub fn state_jacobian(
        &self,
        cp: &[f64],
        q: &[f64],
        jac: &mut BandMatrix,
        first_bound_row: usize,
    ) {
        let n = self.n_comp();
        // Salt row
        jac.add(first_bound_row, 0, 1.0);
        for j in 1..n {
            jac.add(first_bound_row, j as isize, self.nu[j]);
        }

        let qbar: f64 = self.qbar0(q);
        for i in 1..n {
            let row = first_bound_row + i;
            let ka = self.ka[i].value();
            let kd = self.kd[i].value();
            let nu = self.nu[i];
            let qbar_pow = qbar.powf(nu);
            let qbar_pow_m1 = qbar.powf(nu - 1.0);
            let cp0_pow = cp[0].powf(nu);
            let cp0_pow_m1 = cp[0].powf(nu - 1.0);

            // d(-f_ads)/d(c_p,i) and /d(c_p,0)
            let to_cp_i = i as isize - (n + i) as isize;
            let to_cp_0 = -((n + i) as isize);
            jac.add(row, to_cp_i, -ka * qbar_pow);
            jac.add(row, to_cp_0, kd * q[i] * nu * cp0_pow_m1);

            // d(-f_ads)/d(q_j)
            for j in 1..n {
                let mut v = ka * cp[i] * nu * qbar_pow_m1 * (self.nu[j] + self.sigma[j]);
                if i == j {
                    v += kd * cp0_pow;
                }
                jac.add(row, j as isize - i as isize, v);
            }
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
        // The salt balance stays algebraic in kinetic mode
        for b in 1..self.n_comp() {
            jac.add(first_bound_row + b, 0, factor);
        }
    }

    /// Dense Jacobian of the full algebraic block with respect to the bound
    /// states, for the per-shell Newton iteration.
    fn algebraic_jacobian_dense(&self, cp: &[f64], q: &[f64], jac: &mut DenseSlab<'_>) {
        let n = self.n_comp();
        jac.set_all(0.0);
        jac.set(0, 0, 1.0);
        for j in 1..n {
            jac.set(0, j, self.nu[j]);
        }
        let qbar: f64 = self.qbar0(q);
        for i in 1..n {
            let ka = self.ka[i].value();
            let kd = self.kd[i].value();
            let nu = self.nu[i];
            let qbar_pow_m1 = qbar.powf(nu - 1.0);
            let cp0_pow = cp[0].powf(nu);
            for j in 1..n {
                let mut v = ka * cp[i] * nu * qbar_pow_m1 * (self.nu[j] + self.sigma[j]);
                if i == j {
                    v += kd * cp0_pow;
                }
                jac.set(i, j, v);
            }
        }
    }

    /// Solves the algebraic equations of one shell.
    ///
    /// In quasi-stationary mode all bound states are solved with a damped
    /// Newton iteration on the dense block; the salt is then reset from the
    /// exact charge balance. In kinetic mode only the (linear) salt balance
    /// has to be evaluated.
    #[allow(clippy::too_many_arguments)]
    pub fn consistent_initial_state(
        &self,
        _t: f64,
        _z: f64,
        _r: f64,
        _sec_idx: usize,
        cp: &[f64],
        q: &mut [f64],
        error_tol: f64,
        scratch: &mut [f64],
        jac: &mut DenseSlab<'_>,
    ) -> Result<(), NewtonFailure> {
        if self.quasi_stationary {
            self.starting_point_from_salt_balance(cp, q);
            let result = damped_newton(
                q,
                error_tol,
                scratch,
                jac,
                |qq, res| self.residual::<f64>(1.0, cp, qq, None, res),
                |qq, dense| self.algebraic_jacobian_dense(cp, qq, dense),
            );
            // Charge balance, exact by construction
            q[0] = self.charge_balance_salt(q);
            result
        } else {
            q[0] = self.charge_balance_salt(q);
            Ok(())
        }
    }

    /// Starting point for the Newton iteration.
    ///
    /// At equilibrium every protein satisfies
    /// `q_i = k_a,i c_p,i qbar_0^nu_i / (k_d,i c_p,0^nu_i)`, which turns the
    /// shielded salt balance into a scalar monotone equation in `qbar_0` on
    /// `[0, Lambda]`. A bisection on that equation gives bound states close
    /// to the root, from where the dense Newton converges quadratically.
    fn starting_point_from_salt_balance(&self, cp: &[f64], q: &mut [f64]) {
        let n = self.n_comp();
        let lambda = self.lambda.value();
        if cp[0] <= 0.0 || lambda <= 0.0 {
            return;
        }
        let equilibrium_q = |qbar: f64, i: usize| {
            self.ka[i].value() * cp[i] * qbar.powf(self.nu[i])
                / (self.kd[i].value() * cp[0].powf(self.nu[i]))
        };
        let balance = |qbar: f64| {
            let mut acc = qbar - lambda;
            for i in 1..n {
                acc += (self.nu[i] + self.sigma[i]) * equilibrium_q(qbar, i);
            }
            acc
        };
        let mut lo = 0.0;
        let mut hi = lambda;
        for _ in 0..60 {
            let mid = 0.5 * (lo + hi);
            if balance(mid) > 0.0 {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        let qbar = 0.5 * (lo + hi);
        for i in 1..n {
            q[i] = equilibrium_q(qbar, i);
        }
        q[0] = self.charge_balance_salt(q);
    }

    /// `q_0 = Lambda - sum_j nu_j q_j`.
    pub fn charge_balance_salt(&self, q: &[f64]) -> f64 {
        let mut q0 = self.lambda.value();
        for j in 1..self.n_comp() {
            q0 -= self.nu[j] * q[j];
        }
        q0
    }

    pub fn set_sens_direction(&mut self, param: &ParamId, dir: usize) -> bool {
        match param {
            ParamId::SmaLambda => {
                self.lambda.set_direction(dir, 1.0);
                true
            }
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

    fn test_binding(quasi_stationary: bool) -> SmaBinding {
        SmaBinding::new(
            1200.0,
            &[1.0, 5.0, 4.0],
            &[0.0, 11.0, 10.0],
            &[0.0, 2e-13, 2.5e-10],
            &[0.0, 3.2e-9, 2e-7],
            quasi_stationary,
        )
    }

    #[test]
    fn test_charge_balance_is_exact() {
        let binding = test_binding(true);
        let q = [0.0, 3.0, 7.0];
        let q0 = binding.charge_balance_salt(&q);
        assert_eq!(q0, 1200.0 - 5.0 * 3.0 - 4.0 * 7.0);
    }

    #[test]
    fn test_quasi_stationary_newton_converges() {
        let binding = test_binding(true);
        let cp = [50.0, 0.2, 0.1];
        let mut q = [1200.0, 0.0, 0.0];
        let mut scratch = vec![0.0; 9];
        let mut data = vec![0.0; 9];
        let mut pivot = vec![0; 3];
        let mut jac = DenseSlab::new(&mut data, &mut pivot, 3);
        binding
            .consistent_initial_state(0.0, 0.5, 1e-5, 0, &cp, &mut q, 1e-12, &mut scratch, &mut jac)
            .unwrap();

        // Residual of every algebraic equation below tolerance
        let mut res = [0.0_f64; 3];
        binding.residual(1.0, &cp, &q, None, &mut res);
        for r in res {
            assert!(r.abs() < 1e-9, "residual {r}");
        }
        // Salt matches the closed form bit for bit
        assert_eq!(q[0], binding.charge_balance_salt(&q));
    }

    #[test]
    fn test_kinetic_mode_solves_only_salt() {
        let binding = test_binding(false);
        let cp = [100.0, 0.5, 0.5];
        let mut q = [0.0, 2.0, 1.0];
        let mut scratch = vec![0.0; 3];
        let mut data = vec![0.0; 1];
        let mut pivot = vec![0; 1];
        let mut jac = DenseSlab::new(&mut data, &mut pivot, 1);
        binding
            .consistent_initial_state(0.0, 0.5, 1e-5, 0, &cp, &mut q, 1e-12, &mut scratch, &mut jac)
            .unwrap();
        assert_eq!(q[0], 1200.0 - 5.0 * 2.0 - 4.0 * 1.0);
        assert_eq!(q[1], 2.0);
    }

    #[test]
    fn test_state_jacobian_matches_finite_differences() {
        let binding = test_binding(false);
        let cp = [80.0, 0.3, 0.6];
        let q = [1100.0, 4.0, 9.0];
        let n = 3;

        let mut jac = BandMatrix::new(6, 5, 5);
        binding.state_jacobian(&cp, &q, &mut jac, 3);

        let eps = 1e-6;
        let mut base = [0.0_f64; 3];
        binding.residual(1.0, &cp, &q, None, &mut base);
        for j in 0..n {
            let mut qp = q;
            qp[j] += eps;
            let mut pert = [0.0_f64; 3];
            binding.residual(1.0, &cp, &qp, None, &mut pert);
            for i in 0..n {
                let fd = (pert[i] - base[i]) / eps;
                let entry = jac.get(3 + i, j as isize - i as isize);
                assert!(
                    (entry - fd).abs() < 1e-3 * (1.0 + fd.abs()),
                    "dF{i}/dq{j}: {entry} vs {fd}"
                );
            }
        }
    }
}
