//! Time integration driver.
//!
//! The [`Simulator`] owns the state vectors, the sensitivity subsystems, the
//! error weights, and the section layout; the model is borrowed per call.
//! Time stepping uses a variable-step BDF(1,2) method with a weighted-RMS
//! error test; every Newton iteration goes through the Schur-complement
//! linear solver of the model, and recoverable solver failures trigger a
//! step-size reduction instead of an abort. Forward sensitivities are
//! advanced with a staggered linear step per parameter, reusing the
//! factorization of the accepted state step.

mod bdf;

use nalgebra::DVector;

use crate::config::ParameterProvider;
use crate::error::ChromsolError;
use crate::integration_error;
use crate::model::{GeneralRateModel, ParamId};
use crate::timing::{Timer, TimingReport};
use bdf::BdfHistory;

/// How the initial values are made consistent at the start of a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsistentInitialization {
    #[default]
    Full,
    Lean,
    None,
}

/// Receives the solution at every user-requested solution time.
pub trait SolutionRecorder {
    fn solution(&mut self, t: f64, y: &[f64], y_dot: &[f64]);
    fn sensitivity(&mut self, _t: f64, _param: usize, _s: &[f64], _s_dot: &[f64]) {}
}

/// Recorder keeping full state snapshots in memory.
#[derive(Debug, Default)]
pub struct InMemoryRecorder {
    pub times: Vec<f64>,
    pub solutions: Vec<Vec<f64>>,
    pub derivatives: Vec<Vec<f64>>,
    pub sensitivities: Vec<Vec<Vec<f64>>>,
}

impl SolutionRecorder for InMemoryRecorder {
    fn solution(&mut self, t: f64, y: &[f64], y_dot: &[f64]) {
        self.times.push(t);
        self.solutions.push(y.to_vec());
        self.derivatives.push(y_dot.to_vec());
        self.sensitivities.push(Vec::new());
    }

    fn sensitivity(&mut self, _t: f64, param: usize, s: &[f64], _s_dot: &[f64]) {
        let last = self.sensitivities.last_mut().expect("solution recorded first");
        debug_assert_eq!(last.len(), param);
        last.push(s.to_vec());
    }
}

const NEWTON_TOL: f64 = 0.1;
const MAX_NEWTON_ITER: usize = 8;
const MAX_STEP_FAILURES: usize = 12;
const MIN_STEP_SCALE: f64 = 1e-14;

/// Drives the time integration of a configured [`GeneralRateModel`].
pub struct Simulator {
    model: Option<GeneralRateModel>,
    y: DVector<f64>,
    y_dot: DVector<f64>,
    sens_y: Vec<Vec<f64>>,
    sens_y_dot: Vec<Vec<f64>>,
    sens_hist: Vec<Vec<f64>>,
    sensitive_params: Vec<ParamId>,
    sens_abs_tol: Vec<f64>,

    section_times: Vec<f64>,
    section_continuity: Vec<bool>,
    solution_times: Vec<f64>,

    rel_tol: f64,
    abs_tol: f64,
    alg_tol: f64,
    init_step_size: f64,
    max_steps: usize,

    consistent_init: ConsistentInitialization,
    consistent_init_sens: ConsistentInitialization,
    skip_consistency: bool,

    timer_integration: Timer,
    last_integration_seconds: f64,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulator {
    pub fn new() -> Self {
        Self {
            model: None,
            y: DVector::zeros(0),
            y_dot: DVector::zeros(0),
            sens_y: Vec::new(),
            sens_y_dot: Vec::new(),
            sens_hist: Vec::new(),
            sensitive_params: Vec::new(),
            sens_abs_tol: Vec::new(),
            section_times: Vec::new(),
            section_continuity: Vec::new(),
            solution_times: Vec::new(),
            rel_tol: 1e-8,
            abs_tol: 1e-10,
            alg_tol: 1e-12,
            init_step_size: 1e-6,
            max_steps: 10_000,
            consistent_init: ConsistentInitialization::Full,
            consistent_init_sens: ConsistentInitialization::Full,
            skip_consistency: false,
            timer_integration: Timer::new(),
            last_integration_seconds: 0.0,
        }
    }

    /// Binds a configured model and allocates the state vectors.
    pub fn initialize_model(&mut self, model: GeneralRateModel) {
        let n = model.num_dofs();
        self.y = DVector::zeros(n);
        self.y_dot = DVector::zeros(n);
        self.sens_y.clear();
        self.sens_y_dot.clear();
        self.sens_hist.clear();
        self.sensitive_params.clear();
        self.sens_abs_tol.clear();
        self.model = Some(model);
    }

    pub fn model(&self) -> Option<&GeneralRateModel> {
        self.model.as_ref()
    }

    pub fn model_mut(&mut self) -> Option<&mut GeneralRateModel> {
        self.model.as_mut()
    }

    pub fn set_section_times(&mut self, times: &[f64]) {
        self.set_section_times_with_continuity(times, &vec![false; times.len().saturating_sub(2)]);
    }

    /// `continuity[i]` states whether the transition into section `i + 1` is
    /// continuous; the solver is only re-initialized at discontinuous
    /// transitions.
    pub fn set_section_times_with_continuity(&mut self, times: &[f64], continuity: &[bool]) {
        self.section_times = times.to_vec();
        self.section_continuity = continuity.to_vec();
    }

    pub fn set_solution_times(&mut self, times: &[f64]) {
        self.solution_times = times.to_vec();
    }

    pub fn configure_time_integrator(
        &mut self,
        rel_tol: f64,
        abs_tol: f64,
        init_step_size: f64,
        max_steps: usize,
    ) {
        self.rel_tol = rel_tol;
        self.abs_tol = abs_tol;
        self.init_step_size = init_step_size;
        self.max_steps = max_steps;
    }

    /// Tolerance for the algebraic equations in the consistent
    /// initialization.
    pub fn set_algebraic_error_tolerance(&mut self, alg_tol: f64) {
        self.alg_tol = alg_tol;
    }

    pub fn set_consistent_initialization(&mut self, mode: ConsistentInitialization) {
        self.consistent_init = mode;
    }

    pub fn set_consistent_initialization_sens(&mut self, mode: ConsistentInitialization) {
        self.consistent_init_sens = mode;
    }

    pub fn skip_consistent_initialization(&mut self) {
        self.skip_consistency = true;
    }

    /// Applies the initial conditions from a parameter provider; consistency
    /// is established when the integration starts.
    pub fn set_initial_condition_from(
        &mut self,
        provider: &dyn ParameterProvider,
    ) -> Result<(), ChromsolError> {
        let model = self.model.as_ref().ok_or_else(|| integration_error!(ModelNotSet))?;
        let mut y = std::mem::take(&mut self.y);
        let mut y_dot = std::mem::take(&mut self.y_dot);
        let result =
            model.apply_initial_condition(provider, y.as_mut_slice(), y_dot.as_mut_slice());
        self.y = y;
        self.y_dot = y_dot;
        result
    }

    /// Supplies the state directly. If the time derivative is also given,
    /// consistent initialization is skipped.
    pub fn set_initial_condition(&mut self, y: &[f64], y_dot: Option<&[f64]>) {
        self.y.as_mut_slice().copy_from_slice(y);
        if let Some(y_dot) = y_dot {
            self.y_dot.as_mut_slice().copy_from_slice(y_dot);
            self.skip_consistency = true;
        }
    }

    /// Registers a sensitive parameter; AD directions are assigned in
    /// registration order.
    pub fn set_sensitive_parameter(
        &mut self,
        param: ParamId,
        abs_tol: f64,
    ) -> Result<(), ChromsolError> {
        let model = self.model.as_mut().ok_or_else(|| integration_error!(ModelNotSet))?;
        let dir = self.sensitive_params.len();
        model.set_sensitive_parameter(&param, dir)?;
        let n = model.num_dofs();
        self.sensitive_params.push(param);
        self.sens_abs_tol.push(abs_tol);
        self.sens_y.push(vec![0.0; n]);
        self.sens_y_dot.push(vec![0.0; n]);
        self.sens_hist.push(vec![0.0; n]);
        Ok(())
    }

    pub fn num_sens_params(&self) -> usize {
        self.sensitive_params.len()
    }

    /// Absolute error tolerance registered for a sensitivity system.
    pub fn sens_error_tolerance(&self, idx: usize) -> f64 {
        self.sens_abs_tol[idx]
    }

    /// Forgets all registered sensitivities. The AD directions of previously
    /// seeded parameters stay in place but are no longer evaluated.
    pub fn clear_sens_params(&mut self) {
        self.sensitive_params.clear();
        self.sens_abs_tol.clear();
        self.sens_y.clear();
        self.sens_y_dot.clear();
        self.sens_hist.clear();
    }

    pub fn num_dofs(&self) -> usize {
        self.y.len()
    }

    pub fn last_solution(&self) -> &[f64] {
        self.y.as_slice()
    }

    pub fn last_solution_derivative(&self) -> &[f64] {
        self.y_dot.as_slice()
    }

    /// One slice per registered parameter.
    pub fn last_sensitivities(&self) -> Vec<&[f64]> {
        self.sens_y.iter().map(|s| s.as_slice()).collect()
    }

    pub fn last_sensitivity_derivatives(&self) -> Vec<&[f64]> {
        self.sens_y_dot.iter().map(|s| s.as_slice()).collect()
    }

    pub fn last_simulation_duration(&self) -> f64 {
        self.last_integration_seconds
    }

    pub fn timing_report(&self) -> Option<TimingReport> {
        self.model.as_ref().map(|m| m.timers().report())
    }

    fn update_weights(y: &[f64], rel_tol: f64, abs_tol: f64, w: &mut [f64]) {
        for (wi, yi) in w.iter_mut().zip(y.iter()) {
            *wi = 1.0 / (rel_tol * yi.abs() + abs_tol);
        }
    }

    fn wrms(v: &[f64], w: &[f64]) -> f64 {
        let mut acc = 0.0;
        for (vi, wi) in v.iter().zip(w.iter()) {
            acc += (vi * wi) * (vi * wi);
        }
        (acc / v.len() as f64).sqrt()
    }

    /// Runs the outer time loop over all sections, recording the solution at
    /// the requested times.
    pub fn integrate(&mut self, recorder: &mut dyn SolutionRecorder) -> Result<(), ChromsolError> {
        let mut model = self.model.take().ok_or_else(|| integration_error!(ModelNotSet))?;
        self.timer_integration.start();
        let result = self.integrate_with_model(&mut model, recorder);
        self.timer_integration.stop();
        self.last_integration_seconds = self.timer_integration.elapsed_seconds();
        self.model = Some(model);
        result
    }

    fn integrate_with_model(
        &mut self,
        model: &mut GeneralRateModel,
        recorder: &mut dyn SolutionRecorder,
    ) -> Result<(), ChromsolError> {
        if self.section_times.len() < 2 {
            return Err(integration_error!(InvalidSectionTimes));
        }
        if self.section_times.windows(2).any(|w| w[1] <= w[0]) {
            return Err(integration_error!(InvalidSectionTimes));
        }
        model.set_section_times(&self.section_times);

        let n = model.num_dofs();
        let n_sens = self.sensitive_params.len();
        let tau = 1.0;

        let mut weights = vec![1.0; n];
        let mut hist = BdfHistory::new(n, self.init_step_size);
        let mut y_pred = vec![0.0; n];
        let mut y_dot_accepted = vec![0.0; n];
        let mut residual = vec![0.0; n];
        let mut error = vec![0.0; n];
        let mut phi = vec![0.0; n];
        let mut mass_phi = vec![0.0; n];
        let mut sens_rhs = vec![0.0; n];
        let mut total_steps = 0usize;

        let mut sol_idx = self
            .solution_times
            .iter()
            .position(|st| *st >= self.section_times[0])
            .unwrap_or(self.solution_times.len());
        // Record solution times at or before the start
        while sol_idx < self.solution_times.len()
            && self.solution_times[sol_idx] <= self.section_times[0]
        {
            sol_idx += 1;
        }

        let n_sections = self.section_times.len() - 1;
        let mut record_initial = true;
        for sec in 0..n_sections {
            let t_start = self.section_times[sec];
            let t_end = self.section_times[sec + 1];
            let discontinuous =
                sec == 0 || !self.section_continuity.get(sec - 1).copied().unwrap_or(false);

            if discontinuous {
                if self.skip_consistency {
                    model.assemble_jacobians(sec, self.y.as_slice());
                } else {
                    match self.consistent_init {
                        ConsistentInitialization::Full => model.consistent_initial_conditions(
                            t_start,
                            sec,
                            tau,
                            self.y.as_mut_slice(),
                            self.y_dot.as_mut_slice(),
                            self.alg_tol,
                        )?,
                        ConsistentInitialization::Lean => model.lean_consistent_initial_conditions(
                            t_start,
                            sec,
                            tau,
                            self.y.as_mut_slice(),
                            self.y_dot.as_mut_slice(),
                        )?,
                        ConsistentInitialization::None => {
                            model.assemble_jacobians(sec, self.y.as_slice())
                        }
                    }
                    if n_sens > 0 {
                        match self.consistent_init_sens {
                            ConsistentInitialization::Full => model.consistent_initial_sensitivity(
                                t_start,
                                sec,
                                tau,
                                self.y.as_slice(),
                                self.y_dot.as_slice(),
                                &mut self.sens_y,
                                &mut self.sens_y_dot,
                            )?,
                            ConsistentInitialization::Lean => model
                                .lean_consistent_initial_sensitivity(
                                    t_start,
                                    sec,
                                    tau,
                                    self.y.as_slice(),
                                    self.y_dot.as_slice(),
                                    &mut self.sens_y,
                                    &mut self.sens_y_dot,
                                )?,
                            ConsistentInitialization::None => {}
                        }
                    }
                }
                hist.reset(self.y.as_slice(), self.init_step_size.min(t_end - t_start));
                y_dot_accepted.copy_from_slice(self.y_dot.as_slice());
                for p in 0..n_sens {
                    self.sens_hist[p].copy_from_slice(&self.sens_y[p]);
                }
            } else {
                // Continuous transition: refresh couplings for the new
                // section without touching the state
                model.assemble_jacobians(sec, self.y.as_slice());
            }

            if record_initial {
                recorder.solution(t_start, self.y.as_slice(), self.y_dot.as_slice());
                for p in 0..n_sens {
                    recorder.sensitivity(t_start, p, &self.sens_y[p], &self.sens_y_dot[p]);
                }
                record_initial = false;
            }

            let mut t = t_start;
            let mut failures = 0usize;
            while t < t_end - 1e-12 * t_end.abs().max(1.0) {
                if total_steps >= self.max_steps {
                    return Err(integration_error!(MaxStepsExceeded, self.max_steps));
                }
                total_steps += 1;

                // Aim exactly at the next output time or the section end
                let target = if sol_idx < self.solution_times.len()
                    && self.solution_times[sol_idx] < t_end
                {
                    self.solution_times[sol_idx]
                } else {
                    t_end
                };
                if hist.h > target - t {
                    hist.h = target - t;
                }
                if hist.h < MIN_STEP_SCALE * (t_end - t_start) {
                    return Err(integration_error!(StepSizeTooSmall { h: hist.h, time: t }));
                }
                let t_new = t + hist.h;
                let alpha = hist.alpha();

                Self::update_weights(self.y.as_slice(), self.rel_tol, self.abs_tol, &mut weights);
                hist.predict(&y_dot_accepted, &mut y_pred);
                self.y.as_mut_slice().copy_from_slice(&y_pred);

                // Newton iteration on the time-discretized equations
                let mut converged = false;
                let mut recoverable_failure = false;
                for iter in 0..MAX_NEWTON_ITER {
                    hist.differentiate(self.y.as_slice(), self.y_dot.as_mut_slice());
                    if iter == 0 {
                        model.residual_with_jacobian(
                            t_new,
                            sec,
                            tau,
                            self.y.as_slice(),
                            Some(self.y_dot.as_slice()),
                            &mut residual,
                        );
                    } else {
                        model.residual(
                            t_new,
                            sec,
                            tau,
                            self.y.as_slice(),
                            Some(self.y_dot.as_slice()),
                            &mut residual,
                        );
                    }
                    match model.linear_solve(
                        t_new,
                        tau,
                        alpha,
                        NEWTON_TOL,
                        &mut residual,
                        &weights,
                    ) {
                        Ok(()) => {}
                        Err(err) if err.is_recoverable() => {
                            recoverable_failure = true;
                            break;
                        }
                        Err(err) => return Err(err),
                    }
                    // residual now holds the Newton correction
                    for (yi, di) in self.y.as_mut_slice().iter_mut().zip(residual.iter()) {
                        *yi -= di;
                    }
                    if Self::wrms(&residual, &weights) < NEWTON_TOL {
                        converged = true;
                        break;
                    }
                }

                if !converged || recoverable_failure {
                    failures += 1;
                    if failures > MAX_STEP_FAILURES {
                        return Err(integration_error!(NewtonDidNotConverge { time: t }));
                    }
                    // Roll back to the last accepted solution and retry with
                    // a smaller step
                    hist.reset_step(hist.h * 0.25);
                    self.y.as_mut_slice().copy_from_slice(hist.last_accepted());
                    model.invalidate_factorization();
                    continue;
                }

                // Weighted-RMS error test against the predictor
                for i in 0..n {
                    error[i] = self.y[i] - y_pred[i];
                }
                let est = Self::wrms(&error, &weights) * hist.error_coefficient();
                if est > 1.0 {
                    failures += 1;
                    if failures > MAX_STEP_FAILURES {
                        return Err(integration_error!(TooManyErrorTestFailures { time: t }));
                    }
                    let scale = (0.9 * est.powf(-1.0 / (hist.order as f64 + 1.0)))
                        .clamp(0.1, 0.9);
                    hist.reset_step(hist.h * scale);
                    self.y.as_mut_slice().copy_from_slice(hist.last_accepted());
                    model.invalidate_factorization();
                    continue;
                }
                failures = 0;

                // Accepted: final derivative for this step
                hist.differentiate(self.y.as_slice(), self.y_dot.as_mut_slice());
                y_dot_accepted.copy_from_slice(self.y_dot.as_slice());

                // Staggered sensitivity step, reusing the factorization
                if n_sens > 0 {
                    model.update_sens_residual(
                        t_new,
                        sec,
                        tau,
                        self.y.as_slice(),
                        Some(self.y_dot.as_slice()),
                    );
                    let (_, a1, a2) = hist.coefficients();
                    let inv_h = 1.0 / hist.h;
                    for p in 0..n_sens {
                        for i in 0..n {
                            phi[i] =
                                (a1 * self.sens_y[p][i] + a2 * self.sens_hist[p][i]) * inv_h;
                        }
                        model.mass_times(tau, &phi, &mut mass_phi);
                        let dfdp = model.sens_residual();
                        for i in 0..n {
                            sens_rhs[i] = -dfdp[i].derivative(p) - mass_phi[i];
                        }
                        model.linear_solve(
                            t_new,
                            tau,
                            alpha,
                            NEWTON_TOL,
                            &mut sens_rhs,
                            &weights,
                        )?;
                        for i in 0..n {
                            self.sens_y_dot[p][i] = alpha * sens_rhs[i] + phi[i];
                        }
                        self.sens_hist[p].copy_from_slice(&self.sens_y[p]);
                        self.sens_y[p].copy_from_slice(&sens_rhs);
                    }
                }

                hist.advance(self.y.as_slice());
                t = t_new;

                // Grow the step within reason
                let growth = if est > 0.0 {
                    (0.9 * est.powf(-1.0 / (hist.order as f64 + 1.0))).clamp(1.0, 2.0)
                } else {
                    2.0
                };
                hist.h *= growth;

                if sol_idx < self.solution_times.len()
                    && (t - self.solution_times[sol_idx]).abs()
                        <= 1e-10 * self.solution_times[sol_idx].abs().max(1.0)
                {
                    recorder.solution(t, self.y.as_slice(), self.y_dot.as_slice());
                    for p in 0..n_sens {
                        recorder.sensitivity(t, p, &self.sens_y[p], &self.sens_y_dot[p]);
                    }
                    sol_idx += 1;
                }
            }
        }

        Ok(())
    }
}
