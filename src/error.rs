use thiserror::Error;

/// Custom error type for chromsol
///
/// This error type is used to wrap all possible errors that can occur when
/// configuring, initializing, and integrating a general rate model.
#[derive(Error, Debug)]
pub enum ChromsolError {
    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigurationError),
    #[error("Linear solver error: {0}")]
    LinearSolverError(#[from] LinearSolverError),
    #[error("Initialization error: {0}")]
    InitializationError(#[from] InitializationError),
    #[error("Integration error: {0}")]
    IntegrationError(#[from] IntegrationError),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("Error: {0}")]
    Other(String),
}

impl ChromsolError {
    /// Exit code for the command line wrapper: 0 success, 1 usage or generic,
    /// 2 I/O or file format, 3 solver or integration failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ChromsolError::ConfigurationError(_) => 1,
            ChromsolError::IoError(_) => 2,
            ChromsolError::LinearSolverError(_)
            | ChromsolError::InitializationError(_)
            | ChromsolError::IntegrationError(_) => 3,
            ChromsolError::Other(_) => 1,
        }
    }

    /// Whether the time integrator may retry with a reduced step size.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ChromsolError::LinearSolverError(e) => e.is_recoverable(),
            _ => false,
        }
    }
}

/// Possible errors that can occur when configuring a model or simulator
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Parameter {0} is missing")]
    MissingParameter(String),
    #[error("Parameter {name} does not contain enough values: expected {expected}, got {found}")]
    NotEnoughValues {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("Parameter {name} has invalid value: {reason}")]
    InvalidValue { name: String, reason: String },
    #[error("Parameter {name} has wrong type")]
    WrongType { name: String },
    #[error("All sensitivity directions are in use (maximum {0})")]
    TooManySensitivities(usize),
    #[error("Unknown sensitive parameter")]
    UnknownSensitiveParameter,
    #[error("Error: {0}")]
    Other(String),
}

/// Possible errors that can occur during the Schur-complement linear solve
#[derive(Error, Debug)]
pub enum LinearSolverError {
    #[error("Factorization failed for column block of component {comp}: singular pivot in row {row}")]
    SingularColumnBlock { comp: usize, row: usize },
    #[error("Factorization failed for particle block of cell {cell}: singular pivot in row {row}")]
    SingularParticleBlock { cell: usize, row: usize },
    #[error("Block solve failed for column block of component {comp}")]
    ColumnBlockSolveFailed { comp: usize },
    #[error("Block solve failed for particle block of cell {cell}")]
    ParticleBlockSolveFailed { cell: usize },
    #[error("GMRES did not converge after {iterations} iterations (residual {residual:e})")]
    GmresDidNotConverge { iterations: usize, residual: f64 },
    #[error("GMRES breakdown after {iterations} iterations")]
    GmresBreakdown { iterations: usize },
    #[error("Matrix is singular: zero pivot in row {row}")]
    SingularMatrix { row: usize },
    #[error("Matrix has not been factorized")]
    NotFactorized,
    #[error("Error: {0}")]
    Other(String),
}

impl LinearSolverError {
    /// A recoverable failure maps to the `+1` return convention of the solver
    /// contract: the integrator reduces the step size and retries.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, LinearSolverError::NotFactorized)
    }
}

/// Possible errors that can occur during consistent initialization
#[derive(Error, Debug)]
pub enum InitializationError {
    #[error("Factorization failed for column block of component {comp} during initialization")]
    SingularColumnBlock { comp: usize },
    #[error("Factorization failed for particle block of cell {cell} during initialization")]
    SingularParticleBlock { cell: usize },
    #[error("Algebraic block factorization failed for cell {cell}, shell {shell}")]
    SingularAlgebraicBlock { cell: usize, shell: usize },
    #[error("Binding equations did not converge for cell {cell}, shell {shell} (residual {residual:e})")]
    BindingDidNotConverge {
        cell: usize,
        shell: usize,
        residual: f64,
    },
    #[error("Error: {0}")]
    Other(String),
}

/// Possible errors that can occur while integrating in time
#[derive(Error, Debug)]
pub enum IntegrationError {
    #[error("Maximum number of time steps ({0}) exceeded")]
    MaxStepsExceeded(usize),
    #[error("Step size {h:e} below minimum at time {time}")]
    StepSizeTooSmall { h: f64, time: f64 },
    #[error("Newton iteration did not converge at time {time}")]
    NewtonDidNotConverge { time: f64 },
    #[error("Too many error test failures at time {time}")]
    TooManyErrorTestFailures { time: f64 },
    #[error("Model has not been set")]
    ModelNotSet,
    #[error("Section times must be strictly increasing")]
    InvalidSectionTimes,
    #[error("Error: {0}")]
    Other(String),
}

#[macro_export]
macro_rules! config_error {
    ($variant:ident) => {
        $crate::error::ChromsolError::from($crate::error::ConfigurationError::$variant)
    };
    ($variant:ident { $($body:tt)* }) => {
        $crate::error::ChromsolError::from($crate::error::ConfigurationError::$variant { $($body)* })
    };
    ($variant:ident, $($arg:tt)*) => {
        $crate::error::ChromsolError::from($crate::error::ConfigurationError::$variant($($arg)*))
    };
}

#[macro_export]
macro_rules! linear_solver_error {
    ($variant:ident) => {
        $crate::error::ChromsolError::from($crate::error::LinearSolverError::$variant)
    };
    ($variant:ident { $($body:tt)* }) => {
        $crate::error::ChromsolError::from($crate::error::LinearSolverError::$variant { $($body)* })
    };
    ($variant:ident, $($arg:tt)*) => {
        $crate::error::ChromsolError::from($crate::error::LinearSolverError::$variant($($arg)*))
    };
}

#[macro_export]
macro_rules! init_error {
    ($variant:ident) => {
        $crate::error::ChromsolError::from($crate::error::InitializationError::$variant)
    };
    ($variant:ident { $($body:tt)* }) => {
        $crate::error::ChromsolError::from($crate::error::InitializationError::$variant { $($body)* })
    };
    ($variant:ident, $($arg:tt)*) => {
        $crate::error::ChromsolError::from($crate::error::InitializationError::$variant($($arg)*))
    };
}

#[macro_export]
macro_rules! integration_error {
    ($variant:ident) => {
        $crate::error::ChromsolError::from($crate::error::IntegrationError::$variant)
    };
    ($variant:ident { $($body:tt)* }) => {
        $crate::error::ChromsolError::from($crate::error::IntegrationError::$variant { $($body)* })
    };
    ($variant:ident, $($arg:tt)*) => {
        $crate::error::ChromsolError::from($crate::error::IntegrationError::$variant($($arg)*))
    };
}
