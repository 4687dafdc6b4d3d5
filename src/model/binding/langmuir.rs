//! Multi-component Langmuir isotherm with dynamic kinetics:
//! `dq_i/dt = k_a,i c_p,i q_max,i (1 - sum_j q_j / q_max,j) - k_d,i q_i`.

use crate::ad::{Active, Real};
use crate::linalg::{BandMatrix, FactorizableBandMatrix};
use crate::model::ParamId;

#[derive(Debug, Clone)]
pub struct LangmuirBinding {
    n_bound: Vec<usize>,
    ka: Vec<Active>,
    kd: Vec<Active>,
    qmax: Vec<Active>,
}

impl LangmuirBinding {
    pub fn new(ka: &[f64], kd: &[f64], qmax: &[f64]) -> Self {
        assert_eq!(ka.len(), kd.len());
        assert_eq!(ka.len(), qmax.len());
        Self {
            n_bound: vec![1; ka.len()],
            ka: ka.iter().map(|v| Active::constant(*v)).collect(),
            kd: kd.iter().map(|v| Active::constant(*v)).collect(),
            qmax: qmax.iter().map(|v| Active::constant(*v)).collect(),
        }
    }

    pub fn n_comp(&self) -> usize {
        self.n_bound.len()
    }

    pub fn n_bound(&self) -> &[usize] {
        &self.n_bound
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
        // Free-site fraction 1 - sum_j q_j / q_max,j
        let mut free = T::from_f64(1.0);
        for j in 0..n {
            free -= T::from_f64(q[j]) / T::from_active(self.qmax[j]);
        }
        for i in 0..n {
            let ka = T::from_active(self.ka[i]);
            let kd = T::from_active(self.kd[i]);
            let qmax = T::from_active(self.qmax[i]);
            let f_ads = ka * T::from_f64(cp[i]) * qmax * free - kd * T::from_f64(q[i]);
            let dq = q_dot.map(|qd| qd[i]).unwrap_or(0.0);
            res[i] = T::from_f64(tau * dq) - f_ads;
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
        let mut free = 1.0;
        for j in 0..n {
            free -= q[j] / self.qmax[j].value();
        }
        for i in 0..n {
            let row = first_bound_row + i;
            let ka = self.ka[i].value();
            let kd = self.kd[i].value();
            let qmax = self.qmax[i].value();
            // d(-f_ads)/d(c_p,i)
            let to_cp = i as isize - (n + i) as isize;
            jac.add(row, to_cp, -ka * qmax * free);
            for j in 0..n {
                // d(-f_ads)/d(q_j): occupancy term plus desorption
                let mut v = ka * cp[i] * qmax / self.qmax[j].value();
                if i == j {
                    v += kd;
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
        for i in 0..self.n_comp() {
            jac.add(first_bound_row + i, 0, factor);
        }
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
    fn test_residual_at_equilibrium() {
        let binding = LangmuirBinding::new(&[1.0], &[0.5], &[10.0]);
        // Equilibrium: ka cp qmax (1 - q/qmax) = kd q
        // with cp = 1: 10 (1 - q/10) = 0.5 q  ->  q = 20/3
        let cp = [1.0];
        let q = [20.0 / 3.0];
        let mut res = [0.0_f64; 1];
        binding.residual(1.0, &cp, &q, None, &mut res);
        assert!(res[0].abs() < 1e-13);
    }

    #[test]
    fn test_state_jacobian_matches_finite_differences() {
        let binding = LangmuirBinding::new(&[1.2, 0.8], &[0.5, 0.3], &[8.0, 6.0]);
        let cp = [0.7, 0.4];
        let q = [1.5, 2.0];
        let n = 2;

        // Band layout of one shell: 2 liquid + 2 bound entries
        let mut jac = BandMatrix::new(4, 3, 3);
        binding.state_jacobian(&cp, &q, &mut jac, 2);

        let eps = 1e-7;
        let mut base = [0.0_f64; 2];
        binding.residual(1.0, &cp, &q, None, &mut base);
        for j in 0..n {
            let mut qp = q;
            qp[j] += eps;
            let mut pert = [0.0_f64; 2];
            binding.residual(1.0, &cp, &qp, None, &mut pert);
            for i in 0..n {
                let fd = (pert[i] - base[i]) / eps;
                let row = 2 + i;
                let entry = jac.get(row, j as isize - i as isize);
                assert!(
                    (entry - fd).abs() < 1e-5,
                    "dF{i}/dq{j}: {entry} vs {fd}"
                );
            }
        }
    }
}
