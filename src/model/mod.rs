//! The general rate model: state layout, residual and Jacobian assembly,
//! the Schur-complement linear solver, and consistent initialization.

pub mod binding;
pub mod discretization;
pub mod grm;
pub mod initial_conditions;
pub mod linear_solver;

pub use binding::BindingModel;
pub use discretization::{Discretization, Indexer};
pub use grm::{ColumnParams, GeneralRateModel, Inlet, InletSection};

/// Identifies a model parameter that can be tracked by the forward
/// sensitivity machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamId {
    AxialDispersion,
    InterstitialVelocity,
    /// Film diffusion coefficient of a component.
    FilmDiffusion(usize),
    /// Pore diffusion coefficient of a component.
    ParticleDiffusion(usize),
    /// Surface diffusion coefficient of a bound state.
    SurfaceDiffusion(usize),
    /// Adsorption rate of a component.
    BindingKa(usize),
    /// Desorption rate of a component.
    BindingKd(usize),
    /// Ionic capacity of the steric mass action isotherm.
    SmaLambda,
}
