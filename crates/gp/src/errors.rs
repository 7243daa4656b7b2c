use ndarray::Array2;
use std::fmt;
use thiserror::Error;

/// A result type for GP inference models
pub type Result<T> = std::result::Result<T, GpError>;

/// One row of the parameter table attached to numerical failures
#[derive(Clone, Debug, PartialEq)]
pub struct ParameterSnapshot {
    /// Fully qualified parameter name (ex: `SquaredExponential.variance`)
    pub name: String,
    /// Feasible range rendered as text (ex: `[1e-8, ∞)`, `fixed`, `pegged`)
    pub range: String,
    /// Current constrained value rendered as text
    pub value: String,
}

/// Diagnostic payload of a failed Cholesky factorization.
///
/// The payload is a plain value: a copy of the offending matrix together with
/// the model parameter table at the time of failure, so that the caller can
/// inspect it, adjust jitter or hyperparameters and retry the training step.
#[derive(Clone, Debug)]
pub struct CholeskyFailure {
    /// Message of the underlying linear algebra failure
    pub message: String,
    /// Snapshot of the matrix which could not be factorized
    pub matrix: Array2<f64>,
    /// Whether the matrix contains NaNs
    pub has_nan: bool,
    /// Whether the matrix contains infinities
    pub has_inf: bool,
    /// Parameter table of the model owning the matrix
    pub parameters: Vec<ParameterSnapshot>,
}

impl fmt::Display for CholeskyFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} ({}x{} matrix",
            self.message,
            self.matrix.nrows(),
            self.matrix.ncols()
        )?;
        if self.has_nan {
            write!(f, ", has NaNs")?;
        }
        if self.has_inf {
            write!(f, ", has infinities")?;
        }
        write!(f, ")")
    }
}

/// An error when building or evaluating an inference model
#[derive(Error, Debug)]
pub enum GpError {
    /// When inputs do not have the expected shapes
    #[error("Shape error: {0}")]
    ShapeError(String),
    /// When error due to a bad value
    #[error("InvalidValue error: {0}")]
    InvalidValueError(String),
    /// When an operation is not allowed given the model configuration
    #[error("Usage error: {0}")]
    UsageError(String),
    /// When a covariance matrix is not positive definite
    #[error("Cholesky error: {0}")]
    CholeskyError(Box<CholeskyFailure>),
    /// When linear algebra computation fails
    #[error(transparent)]
    LinalgError(#[from] linfa_linalg::LinalgError),
    /// When an abstract model behaviour is requested
    #[error("NotImplemented error: {0}")]
    NotImplementedError(String),
    /// When error during saving
    #[cfg(feature = "persistent")]
    #[error("Save error: {0}")]
    SaveError(#[from] serde_json::Error),
    /// When error during loading
    #[error("Load IO error")]
    LoadIoError(#[from] std::io::Error),
    /// When error during loading
    #[error("Load error: {0}")]
    LoadError(String),
}

impl GpError {
    /// Diagnostic payload when the error is a failed Cholesky factorization
    pub fn cholesky_failure(&self) -> Option<&CholeskyFailure> {
        match self {
            GpError::CholeskyError(failure) => Some(&**failure),
            _ => None,
        }
    }
}
