//! Error taxonomy shared by the problem model, derivative engine, parallel
//! substrate and solver adapters.

use crate::history::SolveStatus;
use crate::parallel::Rank;
use paropt_solvers::SolverError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// One rank's failure inside a parallel derivative request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankFailure {
    pub rank: Rank,
    pub reason: String,
}

impl fmt::Display for RankFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rank {}: {}", self.rank, self.reason)
    }
}

fn join_failures(failures: &[RankFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Optimization errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptError {
    #[error("Duplicate {registry} name: {name}")]
    DuplicateName { registry: &'static str, name: String },

    #[error("Invalid bounds for variable {name}: lower {lower} > upper {upper}")]
    Bounds { name: String, lower: f64, upper: f64 },

    #[error("Shape mismatch for {what}: expected {expected}, found {found}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("User function signalled failure (fail = {code})")]
    UserFunction { code: i32 },

    #[error("Unknown option: {0}")]
    UnknownOption(String),

    #[error("Invalid value for option {key}: {reason}")]
    InvalidOption { key: String, reason: String },

    #[error("Derivative evaluation failed: {}", join_failures(.failures))]
    DerivativeEvaluation { failures: Vec<RankFailure> },

    #[error("Model does not accept complex arguments; complex-step sensitivities unavailable")]
    ComplexStepUnsupported,

    #[error("Analytic sensitivities requested but the model provides no gradient")]
    MissingGradient,

    #[error("Solver diverged ({status}); solution recorded at index {index}")]
    SolverDiverged { index: usize, status: SolveStatus },

    #[error("Solver detected an infeasible problem; solution recorded at index {index}")]
    SolverInfeasible { index: usize },

    #[error("Solution index {index} out of range (count {count})")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("Unsupported problem: {0}")]
    Unsupported(String),

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type OptResult<T> = Result<T, OptError>;

impl From<bincode::Error> for OptError {
    fn from(err: bincode::Error) -> Self {
        OptError::Communication(format!("message encoding: {}", err))
    }
}

impl From<serde_json::Error> for OptError {
    fn from(err: serde_json::Error) -> Self {
        OptError::Serialization(err.to_string())
    }
}

impl From<SolverError> for OptError {
    fn from(err: SolverError) -> Self {
        match err {
            SolverError::InvalidConfig(reason) => OptError::InvalidOption {
                key: "solver configuration".to_string(),
                reason,
            },
            SolverError::Dimension {
                what,
                expected,
                found,
            } => OptError::ShapeMismatch {
                what,
                expected,
                found,
            },
            SolverError::InvalidBounds { index, lower, upper } => OptError::Bounds {
                name: format!("#{}", index),
                lower,
                upper,
            },
            SolverError::Unsupported(reason) => OptError::Unsupported(reason),
        }
    }
}
