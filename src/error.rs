use thiserror::Error;

/// Error kinds produced by the inference engine.
///
/// `CovNotPsd` and `InnerDiverged` are *recoverable*: the outer optimizer
/// (see [`crate::optimizer`]) catches them, rolls back to the last accepted
/// snapshot, and decides whether to halve the step, retry with Nelder-Mead,
/// or stop. Every other variant is fatal.
#[derive(Error, Debug)]
pub enum GpremError {
    /// Unknown string for an enumerated option (likelihood name, optimizer
    /// kind, preconditioner, ...). Fatal, no recovery.
    #[error("invalid option '{0}'")]
    InvalidOption(String),

    /// The requested structural combination is illegal (e.g. Vecchia with
    /// grouped random effects, or an `only_one_*_on_RE_scale` assumption
    /// violated by the component registry). Fatal at construction.
    #[error("incompatible structure: {0}")]
    IncompatibleStructure(String),

    /// Response out of the likelihood's support, or NaN/Inf in an input.
    #[error("invalid input: {0}")]
    BadInput(String),

    /// Input array shapes do not match each other or the expected model
    /// dimension.
    #[error("dimension mismatch: {0}")]
    ShapeMismatch(String),

    /// A factorization detected a non-positive-definite matrix. Recovered
    /// locally by the outer optimizer via step halving.
    #[error("covariance is not positive definite at the attempted parameters")]
    CovNotPsd,

    /// Newton backtracking in the Laplace inner solver was exhausted
    /// without finding an accepted step. The mode is rolled back and the
    /// objective is reported as NaN to the outer optimizer.
    #[error("Laplace inner loop diverged: {0}")]
    InnerDiverged(String),

    /// Wrapper for errors coming from the ndarray-linalg backend.
    #[error("linear algebra backend error: {0}")]
    LinalgError(#[from] ndarray_linalg::error::LinalgError),
}

pub type Result<T> = std::result::Result<T, GpremError>;
