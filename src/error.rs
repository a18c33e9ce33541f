//! Error types and terminal status codes for parallel L-BFGS-B runs.
//!
//! Two separate notions live here:
//!
//! - [`ReturnCode`]: how the quasi-Newton solver stopped. Every code is a
//!   normal outcome of a run, including the non-converged ones.
//! - [`OptimError`]: fatal conditions (bad inputs, failing objective, broken
//!   worker pool). A run that hits one returns no result at all.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Boxed error produced by user objective and gradient functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Terminal status of a solver run.
///
/// Positive values indicate convergence, negative values indicate the solver
/// stopped without meeting a convergence test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReturnCode {
    /// Projected gradient infinity-norm fell below `pgtol`.
    ConvergedPgtol = 1,
    /// Relative reduction of the objective fell below `ftol`.
    ConvergedFtol = 2,

    /// Line search could not find a point with sufficient decrease.
    LineSearchFailed = -1,
    /// Maximum number of iterations reached.
    MaxIterExceeded = -2,
    /// Maximum number of unique objective evaluations reached.
    MaxFunExceeded = -3,
    /// Stopped by the user callback.
    ForcedStop = -4,
    /// Solver state became unusable (non-finite gradient or no descent).
    AbnormalTermination = -5,
}

impl ReturnCode {
    /// Returns true if the solver converged.
    pub fn is_success(&self) -> bool {
        (*self as i32) > 0
    }

    /// Returns true if the solver stopped without converging.
    pub fn is_error(&self) -> bool {
        (*self as i32) < 0
    }

    /// Convert from the integer code.
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::ConvergedPgtol),
            2 => Some(Self::ConvergedFtol),
            -1 => Some(Self::LineSearchFailed),
            -2 => Some(Self::MaxIterExceeded),
            -3 => Some(Self::MaxFunExceeded),
            -4 => Some(Self::ForcedStop),
            -5 => Some(Self::AbnormalTermination),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConvergedPgtol => write!(f, "CONVERGENCE: NORM_OF_PROJECTED_GRADIENT_<=_PGTOL"),
            Self::ConvergedFtol => write!(f, "CONVERGENCE: REL_REDUCTION_OF_F_<=_FACTR*EPSMCH"),
            Self::LineSearchFailed => write!(f, "ABNORMAL_TERMINATION_IN_LNSRCH"),
            Self::MaxIterExceeded => write!(f, "STOP: TOTAL NO. of ITERATIONS REACHED LIMIT"),
            Self::MaxFunExceeded => write!(f, "STOP: TOTAL NO. of f AND g EVALUATIONS EXCEEDS LIMIT"),
            Self::ForcedStop => write!(f, "STOP: CALLBACK REQUESTED STOP"),
            Self::AbnormalTermination => write!(f, "ABNORMAL_TERMINATION: NON-FINITE GRADIENT OR NO DESCENT"),
        }
    }
}

/// Failures of the worker pool itself, as opposed to failures of the objective.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Worker pool could not be built: {0}")]
    Build(String),

    #[error("Worker panicked while evaluating {point:?}: {message}")]
    WorkerPanicked { point: Vec<f64>, message: String },
}

/// Fatal errors of a parallel optimization run.
#[derive(Error, Debug)]
pub enum OptimError {
    #[error("Invalid bounds in dimension {dim}: lower bound must be <= upper bound and not NaN")]
    InvalidBounds { dim: usize },

    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("Point {point:?} leaves the bounds in dimension {dim} and no admissible step exists")]
    Domain { point: Vec<f64>, dim: usize },

    #[error("Objective failed at {point:?}: {source}")]
    Objective {
        point: Vec<f64>,
        #[source]
        source: BoxError,
    },

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl OptimError {
    /// The parameter vector that triggered this error, if the error is tied to one.
    pub fn point(&self) -> Option<&[f64]> {
        match self {
            Self::Domain { point, .. } | Self::Objective { point, .. } => Some(point),
            Self::Pool(PoolError::WorkerPanicked { point, .. }) => Some(point),
            _ => None,
        }
    }
}

/// Result type alias for optimization operations.
pub type Result<T> = std::result::Result<T, OptimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_return_code_sign() {
        assert!(ReturnCode::ConvergedPgtol.is_success());
        assert!(ReturnCode::ConvergedFtol.is_success());
        assert!(ReturnCode::LineSearchFailed.is_error());
        assert!(ReturnCode::ForcedStop.is_error());
        assert!(!ReturnCode::MaxIterExceeded.is_success());
    }

    #[test]
    fn test_return_code_from_i32() {
        for code in [
            ReturnCode::ConvergedPgtol,
            ReturnCode::ConvergedFtol,
            ReturnCode::LineSearchFailed,
            ReturnCode::MaxIterExceeded,
            ReturnCode::MaxFunExceeded,
            ReturnCode::ForcedStop,
            ReturnCode::AbnormalTermination,
        ] {
            assert_eq!(ReturnCode::from_i32(code as i32), Some(code));
        }
        assert_eq!(ReturnCode::from_i32(0), None);
        assert_eq!(ReturnCode::from_i32(99), None);
    }

    #[test]
    fn test_objective_error_names_point() {
        let err = OptimError::Objective {
            point: vec![1.5, -2.0],
            source: "boom".into(),
        };
        assert_eq!(err.point(), Some(&[1.5, -2.0][..]));
        let msg = err.to_string();
        assert!(msg.contains("1.5"));
        assert!(msg.contains("boom"));
    }

    #[test]
    fn test_pool_error_converts() {
        let err: OptimError = PoolError::Build("no threads".into()).into();
        assert!(matches!(err, OptimError::Pool(PoolError::Build(_))));
        assert!(err.point().is_none());
        assert!(err.to_string().contains("no threads"));
    }
}
