//! Command line wrapper around the chromsol simulator.
//!
//! Reads a JSON problem description, runs the simulation, and writes the
//! recorded outlet concentrations (plus optional timing data) as JSON.
//! Exit codes: 0 success, 1 usage or configuration error, 2 I/O or file
//! format error, 3 solver or integration failure.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::ExitCode;

use chromsol::model::binding::{BindingModel, LangmuirBinding, LinearBinding, SmaBinding};
use chromsol::{
    ChromsolError, ColumnParams, ConsistentInitialization, Discretization, GeneralRateModel,
    InMemoryProvider, InMemoryRecorder, Inlet, InletSection, ParamId, Simulator, TimingReport,
};

#[derive(Parser)]
#[command(
    name = "chromsol-cli",
    about = "Simulates general rate model chromatography from a JSON problem file"
)]
struct Cli {
    /// Input problem file (JSON)
    input: PathBuf,
    /// Output file; stdout if omitted
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Log filter, e.g. "info" or "chromsol=debug"
    #[arg(short = 'L', long, default_value = "warn")]
    log_level: String,
    /// Include solver timings in the output
    #[arg(long)]
    timing: bool,
}

#[derive(Deserialize)]
struct ProblemFile {
    model: ModelSpec,
    inlet: InletSpec,
    solver: SolverSpec,
    #[serde(default)]
    sensitivities: Vec<SensitivitySpec>,
}

#[derive(Deserialize)]
struct ModelSpec {
    n_comp: usize,
    n_col: usize,
    n_par: usize,
    n_bound: Vec<usize>,
    col_length: f64,
    col_porosity: f64,
    par_porosity: f64,
    par_radius: f64,
    velocity: f64,
    axial_dispersion: f64,
    film_diffusion: Vec<f64>,
    par_diffusion: Vec<f64>,
    #[serde(default)]
    surf_diffusion: Vec<f64>,
    binding: BindingSpec,
    init_c: Vec<f64>,
    #[serde(default)]
    init_q: Vec<f64>,
    #[serde(default)]
    init_cp: Option<Vec<f64>>,
}

#[derive(Deserialize)]
#[serde(tag = "model")]
enum BindingSpec {
    #[serde(rename = "LINEAR")]
    Linear {
        ka: Vec<f64>,
        kd: Vec<f64>,
        #[serde(default)]
        quasi_stationary: bool,
    },
    #[serde(rename = "MULTI_COMPONENT_LANGMUIR")]
    Langmuir {
        ka: Vec<f64>,
        kd: Vec<f64>,
        qmax: Vec<f64>,
    },
    #[serde(rename = "STERIC_MASS_ACTION")]
    StericMassAction {
        lambda: f64,
        nu: Vec<f64>,
        sigma: Vec<f64>,
        ka: Vec<f64>,
        kd: Vec<f64>,
        #[serde(default)]
        quasi_stationary: bool,
    },
}

#[derive(Deserialize)]
struct InletSpec {
    sections: Vec<InletSectionSpec>,
}

#[derive(Deserialize)]
struct InletSectionSpec {
    constant: Vec<f64>,
    #[serde(default)]
    linear: Vec<f64>,
    #[serde(default)]
    quadratic: Vec<f64>,
    #[serde(default)]
    cubic: Vec<f64>,
}

#[derive(Deserialize)]
struct SolverSpec {
    section_times: Vec<f64>,
    #[serde(default)]
    section_continuity: Vec<bool>,
    solution_times: Vec<f64>,
    #[serde(default = "default_rel_tol")]
    rel_tol: f64,
    #[serde(default = "default_abs_tol")]
    abs_tol: f64,
    #[serde(default = "default_alg_tol")]
    alg_tol: f64,
    #[serde(default = "default_init_step")]
    init_step_size: f64,
    #[serde(default = "default_max_steps")]
    max_steps: usize,
    #[serde(default)]
    lean_consistent_initialization: bool,
}

fn default_rel_tol() -> f64 {
    1e-8
}
fn default_abs_tol() -> f64 {
    1e-10
}
fn default_alg_tol() -> f64 {
    1e-12
}
fn default_init_step() -> f64 {
    1e-6
}
fn default_max_steps() -> usize {
    10_000
}

#[derive(Deserialize)]
#[serde(tag = "param")]
enum SensitivitySpec {
    #[serde(rename = "AXIAL_DISPERSION")]
    AxialDispersion,
    #[serde(rename = "VELOCITY")]
    Velocity,
    #[serde(rename = "FILM_DIFFUSION")]
    FilmDiffusion { comp: usize },
    #[serde(rename = "PAR_DIFFUSION")]
    ParticleDiffusion { comp: usize },
    #[serde(rename = "SMA_LAMBDA")]
    SmaLambda,
    #[serde(rename = "BINDING_KA")]
    BindingKa { comp: usize },
    #[serde(rename = "BINDING_KD")]
    BindingKd { comp: usize },
}

impl SensitivitySpec {
    fn param_id(&self) -> ParamId {
        match self {
            SensitivitySpec::AxialDispersion => ParamId::AxialDispersion,
            SensitivitySpec::Velocity => ParamId::InterstitialVelocity,
            SensitivitySpec::FilmDiffusion { comp } => ParamId::FilmDiffusion(*comp),
            SensitivitySpec::ParticleDiffusion { comp } => ParamId::ParticleDiffusion(*comp),
            SensitivitySpec::SmaLambda => ParamId::SmaLambda,
            SensitivitySpec::BindingKa { comp } => ParamId::BindingKa(*comp),
            SensitivitySpec::BindingKd { comp } => ParamId::BindingKd(*comp),
        }
    }
}

#[derive(Serialize)]
struct OutputFile {
    times: Vec<f64>,
    /// Outlet concentration per solution time, one entry per component.
    outlet: Vec<Vec<f64>>,
    /// Outlet sensitivities per solution time, one entry per registered
    /// parameter.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    outlet_sensitivities: Vec<Vec<Vec<f64>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timing: Option<TimingReport>,
}

fn build_binding(spec: &BindingSpec) -> BindingModel {
    match spec {
        BindingSpec::Linear {
            ka,
            kd,
            quasi_stationary,
        } => BindingModel::Linear(LinearBinding::new(
            vec![1; ka.len()],
            ka,
            kd,
            *quasi_stationary,
        )),
        BindingSpec::Langmuir { ka, kd, qmax } => {
            BindingModel::Langmuir(LangmuirBinding::new(ka, kd, qmax))
        }
        BindingSpec::StericMassAction {
            lambda,
            nu,
            sigma,
            ka,
            kd,
            quasi_stationary,
        } => BindingModel::StericMassAction(SmaBinding::new(
            *lambda,
            nu,
            sigma,
            ka,
            kd,
            *quasi_stationary,
        )),
    }
}

fn run(cli: &Cli) -> Result<(), ChromsolError> {
    let text = std::fs::read_to_string(&cli.input)
        .map_err(|e| ChromsolError::IoError(format!("{}: {e}", cli.input.display())))?;
    let problem: ProblemFile = serde_json::from_str(&text)
        .map_err(|e| ChromsolError::IoError(format!("{}: {e}", cli.input.display())))?;

    let spec = &problem.model;
    let disc = Discretization::new(spec.n_comp, spec.n_col, spec.n_par, spec.n_bound.clone());
    let surf_diffusion = if spec.surf_diffusion.is_empty() {
        vec![0.0; disc.stride_bound]
    } else {
        spec.surf_diffusion.clone()
    };
    let params = ColumnParams::new(
        spec.col_length,
        spec.col_porosity,
        spec.par_porosity,
        spec.par_radius,
        spec.velocity,
        spec.axial_dispersion,
        &spec.film_diffusion,
        &spec.par_diffusion,
        &surf_diffusion,
    );
    let binding = build_binding(&spec.binding);
    let inlet = Inlet {
        sections: problem
            .inlet
            .sections
            .iter()
            .map(|s| {
                let n = s.constant.len();
                InletSection {
                    constant: s.constant.clone(),
                    linear: pad(&s.linear, n),
                    quadratic: pad(&s.quadratic, n),
                    cubic: pad(&s.cubic, n),
                }
            })
            .collect(),
    };
    let model = GeneralRateModel::new(disc, params, binding, inlet)?;

    let mut provider = InMemoryProvider::new();
    provider.set_array("INIT_C", &spec.init_c);
    if !spec.init_q.is_empty() {
        provider.set_array("INIT_Q", &spec.init_q);
    } else if model.discretization().stride_bound > 0 {
        provider.set_array("INIT_Q", &vec![0.0; model.discretization().stride_bound]);
    }
    if let Some(init_cp) = &spec.init_cp {
        provider.set_array("INIT_CP", init_cp);
    }

    let mut sim = Simulator::new();
    sim.initialize_model(model);
    sim.set_section_times_with_continuity(
        &problem.solver.section_times,
        &problem.solver.section_continuity,
    );
    sim.set_solution_times(&problem.solver.solution_times);
    sim.configure_time_integrator(
        problem.solver.rel_tol,
        problem.solver.abs_tol,
        problem.solver.init_step_size,
        problem.solver.max_steps,
    );
    sim.set_algebraic_error_tolerance(problem.solver.alg_tol);
    if problem.solver.lean_consistent_initialization {
        sim.set_consistent_initialization(ConsistentInitialization::Lean);
    }
    sim.set_initial_condition_from(&provider)?;
    for sens in &problem.sensitivities {
        sim.set_sensitive_parameter(sens.param_id(), problem.solver.abs_tol)?;
    }

    let mut recorder = InMemoryRecorder::default();
    sim.integrate(&mut recorder)?;

    // Outlet: bulk concentration in the last column cell
    let model = sim.model().expect("model bound");
    let idxr = model.indexer();
    let n_comp = model.discretization().n_comp;
    let n_col = model.discretization().n_col;
    let outlet_index =
        |comp: usize| -> usize { idxr.offset_c(comp, n_col - 1) };
    let outlet: Vec<Vec<f64>> = recorder
        .solutions
        .iter()
        .map(|y| (0..n_comp).map(|c| y[outlet_index(c)]).collect())
        .collect();
    let outlet_sensitivities: Vec<Vec<Vec<f64>>> = recorder
        .sensitivities
        .iter()
        .map(|per_time| {
            per_time
                .iter()
                .map(|s| (0..n_comp).map(|c| s[outlet_index(c)]).collect())
                .collect()
        })
        .filter(|v: &Vec<Vec<f64>>| !v.is_empty())
        .collect();

    let output = OutputFile {
        times: recorder.times.clone(),
        outlet,
        outlet_sensitivities,
        timing: cli.timing.then(|| sim.timing_report()).flatten(),
    };
    let rendered = serde_json::to_string_pretty(&output)
        .map_err(|e| ChromsolError::IoError(e.to_string()))?;
    match &cli.output {
        Some(path) => std::fs::write(path, rendered)
            .map_err(|e| ChromsolError::IoError(format!("{}: {e}", path.display())))?,
        None => println!("{rendered}"),
    }
    Ok(())
}

fn pad(values: &[f64], n: usize) -> Vec<f64> {
    let mut out = values.to_vec();
    out.resize(n, 0.0);
    out
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = err.print();
            return ExitCode::from(code);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&cli.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            eprintln!("error: {err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}
