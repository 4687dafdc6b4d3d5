//! The general rate model of column liquid chromatography.
//!
//! State layout (see [`Indexer`]): bulk concentrations, one particle block
//! per column cell, film fluxes. Convective-dispersive transport in the bulk
//! uses first-order upwinding and central dispersion on an equidistant axial
//! grid; radial pore and surface diffusion inside the beads use a spherical
//! finite-volume discretization on equidistant shells; the binding model
//! contributes the bound-state equations. The film flux closes the system
//! through the algebraic relation `j_f = k_f (c - c_p(r_p))`.
//!
//! The residual is generic over the scalar type so that one evaluation with
//! [`Active`] parameters yields all parameter derivatives needed by the
//! sensitivity systems.

use crate::ad::{Active, Real};
use crate::config_error;
use crate::error::ChromsolError;
use crate::krylov::Gmres;
use crate::linalg::{BandMatrix, FactorizableBandMatrix, SparseCoupling};
use crate::model::binding::BindingModel;
use crate::model::discretization::{Discretization, Indexer};
use crate::model::ParamId;
use crate::timing::SolverTimers;

/// Default safety factor applied to the Schur-complement tolerance.
pub const DEFAULT_SCHUR_SAFETY: f64 = 1e-2;

/// Transport parameters of the column and the beads.
///
/// `film_diffusion`, `par_diffusion`, and `surf_diffusion` hold either one
/// value per component (bound state) or one value per component and time
/// section (section-major).
#[derive(Debug, Clone)]
pub struct ColumnParams {
    pub col_length: f64,
    pub col_porosity: f64,
    pub par_porosity: f64,
    pub par_radius: f64,
    pub velocity: Active,
    pub axial_dispersion: Active,
    pub film_diffusion: Vec<Active>,
    pub par_diffusion: Vec<Active>,
    pub surf_diffusion: Vec<Active>,
}

impl ColumnParams {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        col_length: f64,
        col_porosity: f64,
        par_porosity: f64,
        par_radius: f64,
        velocity: f64,
        axial_dispersion: f64,
        film_diffusion: &[f64],
        par_diffusion: &[f64],
        surf_diffusion: &[f64],
    ) -> Self {
        Self {
            col_length,
            col_porosity,
            par_porosity,
            par_radius,
            velocity: Active::constant(velocity),
            axial_dispersion: Active::constant(axial_dispersion),
            film_diffusion: film_diffusion.iter().map(|v| Active::constant(*v)).collect(),
            par_diffusion: par_diffusion.iter().map(|v| Active::constant(*v)).collect(),
            surf_diffusion: surf_diffusion.iter().map(|v| Active::constant(*v)).collect(),
        }
    }
}

/// Inlet concentration profile of one time section: cubic polynomial
/// coefficients per component, evaluated in section-local time.
#[derive(Debug, Clone, Default)]
pub struct InletSection {
    pub constant: Vec<f64>,
    pub linear: Vec<f64>,
    pub quadratic: Vec<f64>,
    pub cubic: Vec<f64>,
}

impl InletSection {
    pub fn constant_profile(c: &[f64]) -> Self {
        Self {
            constant: c.to_vec(),
            linear: vec![0.0; c.len()],
            quadratic: vec![0.0; c.len()],
            cubic: vec![0.0; c.len()],
        }
    }

    pub fn linear_profile(base: &[f64], slope: &[f64]) -> Self {
        Self {
            constant: base.to_vec(),
            linear: slope.to_vec(),
            quadratic: vec![0.0; base.len()],
            cubic: vec![0.0; base.len()],
        }
    }

    pub fn evaluate(&self, comp: usize, dt: f64) -> f64 {
        self.constant[comp]
            + dt * (self.linear[comp] + dt * (self.quadratic[comp] + dt * self.cubic[comp]))
    }
}

/// Piecewise cubic inlet profile over the time sections.
#[derive(Debug, Clone, Default)]
pub struct Inlet {
    pub sections: Vec<InletSection>,
}

impl Inlet {
    pub fn evaluate(&self, sec: usize, comp: usize, dt: f64) -> f64 {
        if self.sections.is_empty() {
            return 0.0;
        }
        let sec = sec.min(self.sections.len() - 1);
        self.sections[sec].evaluate(comp, dt)
    }
}

/// The configured general rate model with its Jacobian storage.
pub struct GeneralRateModel {
    pub(crate) disc: Discretization,
    pub(crate) params: ColumnParams,
    pub(crate) binding: BindingModel,
    pub(crate) inlet: Inlet,
    pub(crate) section_times: Vec<f64>,

    /// Shell midpoint radii, innermost shell first.
    pub(crate) par_center_radius: Vec<f64>,
    /// Outer face area over shell volume, per shell.
    pub(crate) outer_area_per_volume: Vec<f64>,
    /// Inner face area over shell volume, per shell (zero at the center).
    pub(crate) inner_area_per_volume: Vec<f64>,

    pub(crate) jac_c: Vec<BandMatrix>,
    pub(crate) jac_p: Vec<BandMatrix>,
    pub(crate) jac_c_disc: Vec<FactorizableBandMatrix>,
    pub(crate) jac_p_disc: Vec<FactorizableBandMatrix>,
    pub(crate) jac_cf: SparseCoupling,
    pub(crate) jac_fc: SparseCoupling,
    pub(crate) jac_pf: Vec<SparseCoupling>,
    pub(crate) jac_fp: Vec<SparseCoupling>,

    pub(crate) temp_state: Vec<f64>,
    pub(crate) factorize_jacobian: bool,
    pub(crate) schur_safety: f64,
    pub(crate) gmres: Gmres,
    pub(crate) timers: SolverTimers,

    pub(crate) n_sens: usize,
    pub(crate) ad_res: Vec<Active>,
}

impl GeneralRateModel {
    pub fn new(
        disc: Discretization,
        params: ColumnParams,
        binding: BindingModel,
        inlet: Inlet,
    ) -> Result<Self, ChromsolError> {
        if binding.n_comp() != disc.n_comp {
            return Err(config_error!(InvalidValue {
                name: "binding".to_string(),
                reason: "component count does not match discretization".to_string(),
            }));
        }
        if binding.n_bound() != disc.n_bound.as_slice() {
            return Err(config_error!(InvalidValue {
                name: "binding".to_string(),
                reason: "bound states do not match discretization".to_string(),
            }));
        }
        for (name, len, unit) in [
            ("FILM_DIFFUSION", params.film_diffusion.len(), disc.n_comp),
            ("PAR_DIFFUSION", params.par_diffusion.len(), disc.n_comp),
        ] {
            if len < unit || len % unit != 0 {
                return Err(config_error!(NotEnoughValues {
                    name: name.to_string(),
                    expected: unit,
                    found: len,
                }));
            }
        }
        if disc.stride_bound > 0
            && (params.surf_diffusion.len() < disc.stride_bound
                || params.surf_diffusion.len() % disc.stride_bound != 0)
        {
            return Err(config_error!(NotEnoughValues {
                name: "SURF_DIFFUSION".to_string(),
                expected: disc.stride_bound,
                found: params.surf_diffusion.len(),
            }));
        }

        // Equidistant radial shells, innermost first
        let n_par = disc.n_par;
        let dr = params.par_radius / n_par as f64;
        let mut par_center_radius = Vec::with_capacity(n_par);
        let mut outer_area_per_volume = Vec::with_capacity(n_par);
        let mut inner_area_per_volume = Vec::with_capacity(n_par);
        for j in 0..n_par {
            let r_in = j as f64 * dr;
            let r_out = (j + 1) as f64 * dr;
            let volume = (r_out.powi(3) - r_in.powi(3)) / 3.0;
            par_center_radius.push(0.5 * (r_in + r_out));
            outer_area_per_volume.push(r_out * r_out / volume);
            inner_area_per_volume.push(r_in * r_in / volume);
        }

        let idxr = Indexer::new(&disc);
        let stride_shell = idxr.stride_par_shell();
        let par_rows = idxr.stride_par_block();
        let par_band = (2 * stride_shell - 1).min(par_rows.saturating_sub(1));
        let n_dofs = idxr.num_dofs();
        let n_flux = disc.n_col * disc.n_comp;
        let n_bulk = disc.n_comp * disc.n_col;

        let jac_c = (0..disc.n_comp)
            .map(|_| BandMatrix::new(disc.n_col, 1, 1))
            .collect();
        let jac_c_disc = (0..disc.n_comp)
            .map(|_| FactorizableBandMatrix::new(disc.n_col, 1, 1))
            .collect();
        let jac_p = (0..disc.n_col)
            .map(|_| BandMatrix::new(par_rows, par_band, par_band))
            .collect();
        let jac_p_disc = (0..disc.n_col)
            .map(|_| FactorizableBandMatrix::new(par_rows, par_band, par_band))
            .collect();
        let jac_cf = SparseCoupling::new(n_bulk, n_flux);
        let jac_fc = SparseCoupling::new(n_flux, n_bulk);
        let jac_pf = (0..disc.n_col)
            .map(|_| SparseCoupling::new(par_rows, n_flux))
            .collect();
        let jac_fp = (0..disc.n_col)
            .map(|_| SparseCoupling::new(n_flux, par_rows))
            .collect();

        let mut gmres = Gmres::new(0, 10);
        gmres.resize(n_flux);

        Ok(Self {
            disc,
            params,
            binding,
            inlet,
            section_times: Vec::new(),
            par_center_radius,
            outer_area_per_volume,
            inner_area_per_volume,
            jac_c,
            jac_p,
            jac_c_disc,
            jac_p_disc,
            jac_cf,
            jac_fc,
            jac_pf,
            jac_fp,
            temp_state: vec![0.0; n_dofs],
            factorize_jacobian: true,
            schur_safety: DEFAULT_SCHUR_SAFETY,
            gmres,
            timers: SolverTimers::new(),
            n_sens: 0,
            ad_res: Vec::new(),
        })
    }

    pub fn discretization(&self) -> &Discretization {
        &self.disc
    }

    pub fn indexer(&self) -> Indexer<'_> {
        Indexer::new(&self.disc)
    }

    pub fn num_dofs(&self) -> usize {
        self.indexer().num_dofs()
    }

    pub fn binding(&self) -> &BindingModel {
        &self.binding
    }

    pub fn set_section_times(&mut self, section_times: &[f64]) {
        self.section_times = section_times.to_vec();
    }

    pub fn set_schur_safety(&mut self, safety: f64) {
        self.schur_safety = safety;
    }

    /// Whether the next [`Self::linear_solve`] will re-factorize the diagonal
    /// blocks.
    pub fn needs_factorization(&self) -> bool {
        self.factorize_jacobian
    }

    /// Forces re-assembly and re-factorization on the next solve.
    pub fn invalidate_factorization(&mut self) {
        self.factorize_jacobian = true;
    }

    pub fn timers(&self) -> &SolverTimers {
        &self.timers
    }

    pub fn n_sens(&self) -> usize {
        self.n_sens
    }

    /// Registers a parameter for sensitivity tracking in AD direction `dir`.
    pub fn set_sensitive_parameter(
        &mut self,
        param: &ParamId,
        dir: usize,
    ) -> Result<(), ChromsolError> {
        if dir >= crate::ad::MAX_DIRECTIONS {
            return Err(config_error!(
                TooManySensitivities,
                crate::ad::MAX_DIRECTIONS
            ));
        }
        let found = match param {
            ParamId::AxialDispersion => {
                self.params.axial_dispersion.set_direction(dir, 1.0);
                true
            }
            ParamId::InterstitialVelocity => {
                self.params.velocity.set_direction(dir, 1.0);
                true
            }
            ParamId::FilmDiffusion(comp) if *comp < self.disc.n_comp => {
                for sec in 0..self.params.film_diffusion.len() / self.disc.n_comp {
                    self.params.film_diffusion[sec * self.disc.n_comp + comp]
                        .set_direction(dir, 1.0);
                }
                true
            }
            ParamId::ParticleDiffusion(comp) if *comp < self.disc.n_comp => {
                for sec in 0..self.params.par_diffusion.len() / self.disc.n_comp {
                    self.params.par_diffusion[sec * self.disc.n_comp + comp]
                        .set_direction(dir, 1.0);
                }
                true
            }
            ParamId::SurfaceDiffusion(bnd)
                if self.disc.stride_bound > 0 && *bnd < self.disc.stride_bound =>
            {
                for sec in 0..self.params.surf_diffusion.len() / self.disc.stride_bound {
                    self.params.surf_diffusion[sec * self.disc.stride_bound + bnd]
                        .set_direction(dir, 1.0);
                }
                true
            }
            _ => self.binding.set_sens_direction(param, dir),
        };
        if !found {
            return Err(config_error!(UnknownSensitiveParameter));
        }
        if dir + 1 > self.n_sens {
            self.n_sens = dir + 1;
            self.ad_res.resize(self.num_dofs(), Active::constant(0.0));
        }
        Ok(())
    }

    pub(crate) fn film_diffusion(&self, comp: usize, sec: usize) -> Active {
        let n = self.disc.n_comp;
        if self.params.film_diffusion.len() > n {
            let sec = sec.min(self.params.film_diffusion.len() / n - 1);
            self.params.film_diffusion[sec * n + comp]
        } else {
            self.params.film_diffusion[comp]
        }
    }

    pub(crate) fn par_diffusion(&self, comp: usize, sec: usize) -> Active {
        let n = self.disc.n_comp;
        if self.params.par_diffusion.len() > n {
            let sec = sec.min(self.params.par_diffusion.len() / n - 1);
            self.params.par_diffusion[sec * n + comp]
        } else {
            self.params.par_diffusion[comp]
        }
    }

    pub(crate) fn surf_diffusion(&self, bound: usize, sec: usize) -> Active {
        let n = self.disc.stride_bound;
        if self.params.surf_diffusion.len() > n {
            let sec = sec.min(self.params.surf_diffusion.len() / n - 1);
            self.params.surf_diffusion[sec * n + bound]
        } else {
            self.params.surf_diffusion[bound]
        }
    }

    /// Whether pore or surface diffusion is configured per time section.
    pub fn has_section_dependent_diffusion(&self) -> bool {
        self.params.par_diffusion.len() > self.disc.n_comp
            || (self.disc.stride_bound > 0
                && self.params.surf_diffusion.len() > self.disc.stride_bound)
    }

    /// Phase ratio `(1 - eps_c) / eps_c` of the column.
    pub(crate) fn beta_c(&self) -> f64 {
        (1.0 - self.params.col_porosity) / self.params.col_porosity
    }

    /// Phase ratio `(1 - eps_p) / eps_p` of the beads.
    pub(crate) fn beta_p(&self) -> f64 {
        (1.0 - self.params.par_porosity) / self.params.par_porosity
    }

    fn section_start(&self, sec: usize) -> f64 {
        self.section_times.get(sec).copied().unwrap_or(0.0)
    }

    /// Inlet concentration of `comp` at time `t` in section `sec`.
    pub fn inlet_concentration(&self, t: f64, sec: usize, comp: usize) -> f64 {
        self.inlet.evaluate(sec, comp, t - self.section_start(sec))
    }

    /// Evaluates the residual `F(t, y, dy)`; `y_dot = None` omits all time
    /// derivative contributions.
    pub fn residual(
        &self,
        t: f64,
        sec: usize,
        tau: f64,
        y: &[f64],
        y_dot: Option<&[f64]>,
        res: &mut [f64],
    ) {
        self.residual_core::<f64>(t, sec, tau, y, y_dot, res);
    }

    /// Evaluates the residual and re-assembles the state Jacobian blocks at
    /// `y`.
    pub fn residual_with_jacobian(
        &mut self,
        t: f64,
        sec: usize,
        tau: f64,
        y: &[f64],
        y_dot: Option<&[f64]>,
        res: &mut [f64],
    ) {
        self.assemble_jacobians(sec, y);
        self.residual_core::<f64>(t, sec, tau, y, y_dot, res);
    }

    /// Evaluates the residual with all registered parameter directions; the
    /// result is available through [`Self::sens_residual`].
    pub fn update_sens_residual(
        &mut self,
        t: f64,
        sec: usize,
        tau: f64,
        y: &[f64],
        y_dot: Option<&[f64]>,
    ) {
        let mut ad = std::mem::take(&mut self.ad_res);
        ad.resize(self.num_dofs(), Active::constant(0.0));
        self.residual_core::<Active>(t, sec, tau, y, y_dot, &mut ad);
        self.ad_res = ad;
    }

    /// Residual of the last [`Self::update_sens_residual`] call.
    pub fn sens_residual(&self) -> &[Active] {
        &self.ad_res
    }

    fn residual_core<T: Real>(
        &self,
        t: f64,
        sec: usize,
        tau: f64,
        y: &[f64],
        y_dot: Option<&[f64]>,
        res: &mut [T],
    ) {
        let idxr = Indexer::new(&self.disc);
        let n_comp = self.disc.n_comp;
        let n_col = self.disc.n_col;
        let n_par = self.disc.n_par;
        let stride_shell = idxr.stride_par_shell();
        let dz = self.params.col_length / n_col as f64;
        let dr = self.params.par_radius / n_par as f64;
        let beta_c = self.beta_c();
        let beta_p = self.beta_p();
        let eps_p = self.params.par_porosity;
        let surface_to_volume = 3.0 / self.params.par_radius;

        let u = T::from_active(self.params.velocity);
        let d_ax = T::from_active(self.params.axial_dispersion);
        let inv_dz = 1.0 / dz;
        let inv_dz2 = inv_dz * inv_dz;
        let inv_dr = 1.0 / dr;

        // ==== Bulk: convection, dispersion, film transfer
        for comp in 0..n_comp {
            let c_in = self.inlet_concentration(t, sec, comp);
            for cell in 0..n_col {
                let idx = idxr.offset_c(comp, cell);
                let c = y[idx];
                let upstream = if cell > 0 { y[idx - 1] } else { c_in };
                let conv = u * T::from_f64((c - upstream) * inv_dz);
                let lap = if n_col == 1 {
                    0.0
                } else if cell == 0 {
                    (y[idx + 1] - c) * inv_dz2
                } else if cell == n_col - 1 {
                    (y[idx - 1] - c) * inv_dz2
                } else {
                    (y[idx + 1] - 2.0 * c + y[idx - 1]) * inv_dz2
                };
                let disp = d_ax * T::from_f64(lap);
                let jf = y[idxr.offset_jf() + idxr.offset_jf_local(comp, cell)];
                let film = T::from_f64(beta_c * surface_to_volume * jf);
                let time = T::from_f64(y_dot.map(|yd| tau * yd[idx]).unwrap_or(0.0));
                res[idx] = time + conv - disp + film;
            }
        }

        // ==== Particles: radial pore/surface diffusion and binding
        for cell in 0..n_col {
            let block = idxr.offset_cp(cell);
            for shell in 0..n_par {
                let shell_off = block + shell * stride_shell;
                for comp in 0..n_comp {
                    let idx = shell_off + comp;
                    let dp = T::from_active(self.par_diffusion(comp, sec));
                    let mut transport = T::from_f64(0.0);

                    if shell + 1 < n_par {
                        let av = self.outer_area_per_volume[shell];
                        let grad_c = (y[idx + stride_shell] - y[idx]) * inv_dr;
                        transport += dp * T::from_f64(av * grad_c);
                        for m in 0..self.disc.n_bound[comp] {
                            let bnd = self.disc.bound_offset[comp] + m;
                            let qi = shell_off + n_comp + bnd;
                            let ds = T::from_active(self.surf_diffusion(bnd, sec));
                            let grad_q = (y[qi + stride_shell] - y[qi]) * inv_dr;
                            transport += ds * T::from_f64(av * beta_p * grad_q);
                        }
                    } else {
                        // Particle surface: film flux enters the outer face
                        let jf = y[idxr.offset_jf() + idxr.offset_jf_local(comp, cell)];
                        transport +=
                            T::from_f64(self.outer_area_per_volume[shell] / eps_p * jf);
                    }

                    if shell > 0 {
                        let av = self.inner_area_per_volume[shell];
                        let grad_c = (y[idx] - y[idx - stride_shell]) * inv_dr;
                        transport -= dp * T::from_f64(av * grad_c);
                        for m in 0..self.disc.n_bound[comp] {
                            let bnd = self.disc.bound_offset[comp] + m;
                            let qi = shell_off + n_comp + bnd;
                            let ds = T::from_active(self.surf_diffusion(bnd, sec));
                            let grad_q = (y[qi] - y[qi - stride_shell]) * inv_dr;
                            transport -= ds * T::from_f64(av * beta_p * grad_q);
                        }
                    }

                    let time = y_dot
                        .map(|yd| {
                            let mut acc = yd[idx];
                            for m in 0..self.disc.n_bound[comp] {
                                let bnd = self.disc.bound_offset[comp] + m;
                                acc += beta_p * yd[shell_off + n_comp + bnd];
                            }
                            tau * acc
                        })
                        .unwrap_or(0.0);
                    res[idx] = T::from_f64(time) - transport;
                }

                if self.disc.stride_bound > 0 {
                    let cp = &y[shell_off..shell_off + n_comp];
                    let q = &y[shell_off + n_comp..shell_off + stride_shell];
                    let q_dot =
                        y_dot.map(|yd| &yd[shell_off + n_comp..shell_off + stride_shell]);
                    self.binding.residual(
                        tau,
                        cp,
                        q,
                        q_dot,
                        &mut res[shell_off + n_comp..shell_off + stride_shell],
                    );
                }
            }
        }

        // ==== Fluxes: j_f - k_f (c - c_p(r_p))
        let surface_shell = (n_par - 1) * stride_shell;
        for cell in 0..n_col {
            for comp in 0..n_comp {
                let idx = idxr.offset_jf() + idxr.offset_jf_local(comp, cell);
                let kf = T::from_active(self.film_diffusion(comp, sec));
                let c = y[idxr.offset_c(comp, cell)];
                let cp_surf = y[idxr.offset_cp(cell) + surface_shell + comp];
                res[idx] = T::from_f64(y[idx]) - kf * T::from_f64(c - cp_surf);
            }
        }
    }

    /// Re-assembles the state Jacobian blocks and the sparse couplings at the
    /// state `y`.
    pub fn assemble_jacobians(&mut self, sec: usize, y: &[f64]) {
        let idxr = Indexer::new(&self.disc);
        let n_comp = self.disc.n_comp;
        let n_col = self.disc.n_col;
        let n_par = self.disc.n_par;
        let stride_shell = idxr.stride_par_shell();
        let dz = self.params.col_length / n_col as f64;
        let dr = self.params.par_radius / n_par as f64;
        let inv_dz = 1.0 / dz;
        let inv_dz2 = inv_dz * inv_dz;
        let inv_dr = 1.0 / dr;
        let beta_p = self.beta_p();

        // Bulk blocks: tridiagonal convection-dispersion
        let u = self.params.velocity.value();
        let d_ax = self.params.axial_dispersion.value();
        for jac in self.jac_c.iter_mut() {
            jac.set_all(0.0);
            for cell in 0..n_col {
                if cell > 0 {
                    jac.set(cell, -1, -u * inv_dz - d_ax * inv_dz2);
                }
                let mut diag = u * inv_dz;
                if n_col > 1 && cell > 0 {
                    diag += d_ax * inv_dz2;
                }
                if n_col > 1 && cell < n_col - 1 {
                    diag += d_ax * inv_dz2;
                }
                jac.set(cell, 0, diag);
                if cell < n_col - 1 {
                    jac.set(cell, 1, -d_ax * inv_dz2);
                }
            }
        }

        // Particle blocks: radial diffusion plus binding
        let dp_values: Vec<f64> = (0..n_comp)
            .map(|comp| self.par_diffusion(comp, sec).value())
            .collect();
        let ds_values: Vec<f64> = (0..self.disc.stride_bound)
            .map(|bnd| self.surf_diffusion(bnd, sec).value())
            .collect();
        for (cell, jac) in self.jac_p.iter_mut().enumerate() {
            jac.set_all(0.0);
            let block = idxr.offset_cp(cell);
            for shell in 0..n_par {
                let row0 = shell * stride_shell;
                for comp in 0..n_comp {
                    let row = row0 + comp;
                    let dp = dp_values[comp];

                    if shell + 1 < n_par {
                        let av = self.outer_area_per_volume[shell];
                        let kappa = av * dp * inv_dr;
                        jac.add(row, 0, kappa);
                        jac.add(row, stride_shell as isize, -kappa);
                        for m in 0..self.disc.n_bound[comp] {
                            let bnd = self.disc.bound_offset[comp] + m;
                            let lambda = av * beta_p * ds_values[bnd] * inv_dr;
                            let to_q = (n_comp + bnd) as isize - comp as isize;
                            jac.add(row, to_q, lambda);
                            jac.add(row, stride_shell as isize + to_q, -lambda);
                        }
                    }
                    if shell > 0 {
                        let av = self.inner_area_per_volume[shell];
                        let kappa = av * dp * inv_dr;
                        jac.add(row, 0, kappa);
                        jac.add(row, -(stride_shell as isize), -kappa);
                        for m in 0..self.disc.n_bound[comp] {
                            let bnd = self.disc.bound_offset[comp] + m;
                            let lambda = av * beta_p * ds_values[bnd] * inv_dr;
                            let to_q = (n_comp + bnd) as isize - comp as isize;
                            jac.add(row, to_q, lambda);
                            jac.add(row, -(stride_shell as isize) + to_q, -lambda);
                        }
                    }
                }

                if self.disc.stride_bound > 0 {
                    let shell_off = block + shell * stride_shell;
                    let cp = &y[shell_off..shell_off + n_comp];
                    let q = &y[shell_off + n_comp..shell_off + stride_shell];
                    self.binding.state_jacobian(cp, q, jac, row0 + n_comp);
                }
            }
        }

        self.assemble_couplings(sec);
        self.factorize_jacobian = true;
    }

    /// Rebuilds the sparse couplings between the diagonal blocks and the
    /// flux equations for time section `sec`.
    pub(crate) fn assemble_couplings(&mut self, sec: usize) {
        let idxr = Indexer::new(&self.disc);
        let n_comp = self.disc.n_comp;
        let n_col = self.disc.n_col;
        let stride_shell = idxr.stride_par_shell();
        let surface_row = (self.disc.n_par - 1) * stride_shell;
        let beta_c = self.beta_c();
        let surface_to_volume = 3.0 / self.params.par_radius;
        let eps_p = self.params.par_porosity;
        let film_area = self.outer_area_per_volume[self.disc.n_par - 1] / eps_p;

        self.jac_cf.clear();
        self.jac_fc.clear();
        for cell in 0..n_col {
            self.jac_pf[cell].clear();
            self.jac_fp[cell].clear();
        }

        for cell in 0..n_col {
            for comp in 0..n_comp {
                let flux = idxr.offset_jf_local(comp, cell);
                let bulk = idxr.offset_c(comp, cell);
                let kf = self.film_diffusion(comp, sec).value();

                // Bulk equation picks up the film flux
                self.jac_cf
                    .add_entry(bulk, flux, beta_c * surface_to_volume);
                // Flux equation: -k_f c
                self.jac_fc.add_entry(flux, bulk, -kf);
                // Outer shell liquid equation: -(A/V)/eps_p j_f
                self.jac_pf[cell].add_entry(surface_row + comp, flux, -film_area);
                // Flux equation: +k_f c_p(r_p)
                self.jac_fp[cell].add_entry(flux, surface_row + comp, kf);
            }
        }
    }

    /// `y -= J x` with the full system Jacobian (state part only).
    pub fn subtract_jacobian_product(&self, x: &[f64], y: &mut [f64]) {
        let idxr = Indexer::new(&self.disc);
        let n_col = self.disc.n_col;
        let n_bulk = self.disc.n_comp * n_col;
        let offset_jf = idxr.offset_jf();
        let stride_block = idxr.stride_par_block();

        let (x_head, x_flux) = x.split_at(offset_jf);
        let x_bulk = &x_head[..n_bulk];
        let (y_head, y_flux) = y.split_at_mut(offset_jf);

        // Bulk rows
        for (comp, jac) in self.jac_c.iter().enumerate() {
            let range = comp * n_col..(comp + 1) * n_col;
            jac.multiply_vector(&x_bulk[range.clone()], -1.0, 1.0, &mut y_head[range]);
        }
        self.jac_cf.multiply_subtract(x_flux, &mut y_head[..n_bulk]);

        // Particle rows
        for cell in 0..n_col {
            let range = n_bulk + cell * stride_block..n_bulk + (cell + 1) * stride_block;
            let xp = &x_head[range.clone()];
            self.jac_p[cell].multiply_vector(xp, -1.0, 1.0, &mut y_head[range.clone()]);
            self.jac_pf[cell].multiply_subtract(x_flux, &mut y_head[range]);
        }

        // Flux rows: identity plus couplings
        for (yf, xf) in y_flux.iter_mut().zip(x_flux.iter()) {
            *yf -= xf;
        }
        self.jac_fc.multiply_subtract(x_bulk, y_flux);
        for cell in 0..n_col {
            let range = n_bulk + cell * stride_block..n_bulk + (cell + 1) * stride_block;
            self.jac_fp[cell].multiply_subtract(&x_head[range], y_flux);
        }
    }

    /// `out = tau * (dF/d(dy)) v`: the action of the time-derivative Jacobian.
    pub fn mass_times(&self, tau: f64, v: &[f64], out: &mut [f64]) {
        let idxr = Indexer::new(&self.disc);
        let n_comp = self.disc.n_comp;
        let n_bulk = n_comp * self.disc.n_col;
        let stride_shell = idxr.stride_par_shell();
        let beta_p = self.beta_p();
        let (alg_start, alg_len) = self.binding.algebraic_block();

        for i in 0..n_bulk {
            out[i] = tau * v[i];
        }
        for cell in 0..self.disc.n_col {
            let block = idxr.offset_cp(cell);
            for shell in 0..self.disc.n_par {
                let shell_off = block + shell * stride_shell;
                for comp in 0..n_comp {
                    let mut acc = v[shell_off + comp];
                    for m in 0..self.disc.n_bound[comp] {
                        let bnd = self.disc.bound_offset[comp] + m;
                        acc += beta_p * v[shell_off + n_comp + bnd];
                    }
                    out[shell_off + comp] = tau * acc;
                }
                for bnd in 0..self.disc.stride_bound {
                    let idx = shell_off + n_comp + bnd;
                    out[idx] = if bnd >= alg_start && bnd < alg_start + alg_len {
                        0.0
                    } else {
                        tau * v[idx]
                    };
                }
            }
        }
        for i in idxr.offset_jf()..idxr.num_dofs() {
            out[i] = 0.0;
        }
    }
}

/// Adds `alpha_tau` to the main diagonal of a bulk column block.
pub(crate) fn add_time_derivative_column_block(dst: &mut FactorizableBandMatrix, alpha_tau: f64) {
    for row in 0..dst.rows() {
        dst.add(row, 0, alpha_tau);
    }
}

/// Adds `alpha_tau * dF/d(dy)` to a particle block: the mobile phase rows get
/// `alpha_tau` on the diagonal and `alpha_tau * beta_p` on their bound-state
/// columns, the dynamic bound-state rows get `alpha_tau` through the binding
/// model.
pub(crate) fn add_time_derivative_particle_block(
    dst: &mut FactorizableBandMatrix,
    binding: &BindingModel,
    disc: &Discretization,
    alpha_tau: f64,
    beta_p: f64,
) {
    let n_comp = disc.n_comp;
    let stride_shell = n_comp + disc.stride_bound;
    for shell in 0..disc.n_par {
        let row0 = shell * stride_shell;
        for comp in 0..n_comp {
            let row = row0 + comp;
            dst.add(row, 0, alpha_tau);
            for m in 0..disc.n_bound[comp] {
                let to_q = (n_comp + disc.bound_offset[comp] + m) as isize - comp as isize;
                dst.add(row, to_q, alpha_tau * beta_p);
            }
        }
        if disc.stride_bound > 0 {
            binding.jacobian_add_discretized(alpha_tau, dst, row0 + n_comp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::binding::LinearBinding;

    fn small_model() -> GeneralRateModel {
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
            &[2.0, 1.0],
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

    #[test]
    fn test_residual_zero_state_zero_inlet() {
        let mut model = small_model();
        model.inlet = Inlet {
            sections: vec![InletSection::constant_profile(&[0.0, 0.0])],
        };
        let n = model.num_dofs();
        let y = vec![0.0; n];
        let mut res = vec![1.0; n];
        model.residual(0.0, 0, 1.0, &y, None, &mut res);
        for (i, r) in res.iter().enumerate() {
            assert_eq!(*r, 0.0, "residual row {i}");
        }
    }

    #[test]
    fn test_flux_residual_is_linear_relation() {
        let model = small_model();
        let idxr = model.indexer();
        let n = model.num_dofs();
        let mut y = vec![0.0; n];
        // c = 2, c_p(surface) = 0.5 for component 0 in cell 1
        y[idxr.offset_c(0, 1)] = 2.0;
        let surf = idxr.offset_cp(1) + 2 * idxr.stride_par_shell();
        y[surf] = 0.5;
        let mut res = vec![0.0; n];
        model.residual(0.0, 0, 1.0, &y, None, &mut res);
        let jf_row = idxr.offset_jf() + idxr.offset_jf_local(0, 1);
        // j_f = 0, so residual is -k_f (c - c_p) = -1e-3 * 1.5
        assert!((res[jf_row] - (-1.5e-3)).abs() < 1e-18);
    }

    #[test]
    fn test_state_jacobian_matches_residual_differences() {
        let mut model = small_model();
        let n = model.num_dofs();
        // Nontrivial state
        let y: Vec<f64> = (0..n).map(|i| 0.1 + 0.01 * (i % 7) as f64).collect();
        model.assemble_jacobians(0, &y);

        let mut base = vec![0.0; n];
        model.residual(0.0, 0, 1.0, &y, None, &mut base);

        // J x via subtract_jacobian_product against finite differences of
        // the residual in a random direction
        let x: Vec<f64> = (0..n).map(|i| ((i * 31 % 11) as f64 - 5.0) / 10.0).collect();
        let eps = 1e-7;
        let yp: Vec<f64> = y.iter().zip(x.iter()).map(|(a, b)| a + eps * b).collect();
        let mut pert = vec![0.0; n];
        model.residual(0.0, 0, 1.0, &yp, None, &mut pert);

        let mut jx = vec![0.0; n];
        model.subtract_jacobian_product(&x, &mut jx);
        for i in 0..n {
            let fd = (pert[i] - base[i]) / eps;
            // jx holds -J x
            assert!(
                (jx[i] + fd).abs() < 1e-5 * (1.0 + fd.abs()),
                "row {i}: -Jx = {}, fd = {fd}",
                jx[i]
            );
        }
    }

    #[test]
    fn test_mass_times_respects_algebraic_rows() {
        let disc = Discretization::new(1, 2, 2, vec![1]);
        let params = ColumnParams::new(
            0.1, 0.4, 0.3, 5e-5, 1e-3, 1e-5, &[1e-3], &[1e-10], &[0.0],
        );
        let binding =
            BindingModel::Linear(LinearBinding::new(vec![1], &[2.0], &[1.0], true));
        let inlet = Inlet {
            sections: vec![InletSection::constant_profile(&[1.0])],
        };
        let model = GeneralRateModel::new(disc, params, binding, inlet).unwrap();
        let n = model.num_dofs();
        let v = vec![1.0; n];
        let mut out = vec![9.0; n];
        model.mass_times(2.0, &v, &mut out);
        let idxr = model.indexer();
        // Bulk rows: tau
        assert_eq!(out[0], 2.0);
        // Liquid particle rows: tau (1 + beta_p)
        let beta_p = (1.0 - 0.3) / 0.3;
        assert!((out[idxr.offset_cp(0)] - 2.0 * (1.0 + beta_p)).abs() < 1e-14);
        // Algebraic bound rows: zero
        assert_eq!(out[idxr.offset_cp(0) + 1], 0.0);
        // Flux rows: zero
        assert_eq!(out[idxr.offset_jf()], 0.0);
    }
}
