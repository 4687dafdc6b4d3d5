//! # chromsol
//!
//! Chromsol simulates chromatographic column processes described by the
//! general rate model: convective-dispersive transport in a packed bed, film
//! diffusion into porous beads, pore and surface diffusion inside each bead,
//! and adsorption isotherms binding mobile-phase species to the solid phase.
//! Spatial discretization turns the governing equations into a large index-1
//! differential-algebraic system that is advanced by a variable-step BDF
//! integrator.
//!
//! The crate is built around the two pieces of machinery that make such a
//! simulation fast and robust:
//!
//! - **The structured linear solver.** Every Newton iteration of the time
//!   integrator solves a system with the discretized Jacobian, whose
//!   block-arrow structure (independent banded diagonal blocks coupled to
//!   the film-flux equations) admits a Schur-complement decomposition:
//!   per-block banded LU factorizations run in parallel, and the reduced
//!   system on the flux unknowns is solved with matrix-free restarted GMRES.
//!   See [`GeneralRateModel::linear_solve`].
//!
//! - **Consistent initialization.** Initial values of an index-1 DAE must
//!   satisfy the algebraic equations, and the initial time derivative must
//!   lie in the tangent space of that manifold. The normal, lean, and
//!   sensitivity initialization pipelines live in
//!   [`model::initial_conditions`].
//!
//! ## Putting a simulation together
//!
//! Configure a [`Discretization`], [`ColumnParams`], a [`BindingModel`]
//! variant, and an [`Inlet`]; combine them into a [`GeneralRateModel`]; then
//! hand the model to a [`Simulator`], register solution times and (optionally)
//! sensitive parameters, and call [`Simulator::integrate`] with a
//! [`SolutionRecorder`].
//!
//! Forward parameter sensitivities use a fixed-direction dual number
//! ([`ad::Active`]): registering a parameter seeds one derivative direction,
//! and a single residual evaluation then yields `dF/dp` for all registered
//! parameters at once.

pub mod ad;
pub mod config;
pub mod error;
pub mod krylov;
pub mod linalg;
pub mod model;
pub mod parallel;
pub mod simulator;
pub mod timing;

pub use config::{InMemoryProvider, ParameterProvider};
pub use error::ChromsolError;
pub use krylov::{Gmres, GmresStats};
pub use linalg::{BandMatrix, DenseSlab, FactorizableBandMatrix, SparseCoupling};
pub use model::binding::{BindingModel, LangmuirBinding, LinearBinding, SmaBinding};
pub use model::{
    ColumnParams, Discretization, GeneralRateModel, Indexer, Inlet, InletSection, ParamId,
};
pub use simulator::{ConsistentInitialization, InMemoryRecorder, Simulator, SolutionRecorder};
pub use timing::TimingReport;
