use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Native return codes reported in [`Termination::code`].
pub mod return_code {
    /// First-order optimality and feasibility reached within `tol`.
    pub const SOLVE_SUCCEEDED: i32 = 0;
    /// Only the looser `acceptable_tol` criteria were met.
    pub const SOLVED_TO_ACCEPTABLE_LEVEL: i32 = 1;
    /// The penalty reached its ceiling without reducing the infeasibility.
    pub const INFEASIBLE_PROBLEM_DETECTED: i32 = 2;
    /// Steps became too small to make progress; iterate is usually usable.
    pub const SEARCH_DIRECTION_TOO_SMALL: i32 = 3;
    /// Objective unbounded below or non-finite values encountered.
    pub const DIVERGING_ITERATES: i32 = 4;
    pub const MAXIMUM_ITERATIONS_EXCEEDED: i32 = -1;
    pub const LINE_SEARCH_FAILED: i32 = -2;
}

/// Sense of one constraint row `c(x)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintRow {
    /// `c(x) <= 0`
    LessEqual,
    /// `c(x) == 0`
    Equal,
}

/// Objective and constraint values at one point.
#[derive(Debug, Clone)]
pub struct Values {
    pub objective: f64,
    pub constraints: Array1<f64>,
}

impl Values {
    pub fn new(objective: f64, constraints: Array1<f64>) -> Self {
        Self {
            objective,
            constraints,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.objective.is_finite() && self.constraints.iter().all(|c| c.is_finite())
    }
}

/// Solver errors that do not originate in a problem callback.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolverError {
    #[error("Invalid solver configuration: {0}")]
    InvalidConfig(String),

    #[error("Dimension mismatch for {what}: expected {expected}, found {found}")]
    Dimension {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Invalid bounds for variable {index}: [{lower}, {upper}]")]
    InvalidBounds { index: usize, lower: f64, upper: f64 },

    #[error("Unsupported problem: {0}")]
    Unsupported(String),
}

pub type SolverResult<T> = Result<T, SolverError>;

/// Defines the nonlinear program handed to a solver.
///
/// `evaluate` and `jacobian` may fail; solvers propagate the error untouched.
/// The error type must absorb [`SolverError`] so that configuration and
/// dimension problems travel through the same channel.
pub trait NlpProblem {
    type Error: From<SolverError>;

    /// Number of variables.
    fn num_variables(&self) -> usize;

    /// Lower and upper bounds for each variable.
    fn bounds(&self) -> (Array1<f64>, Array1<f64>);

    /// Starting point.
    fn initial_point(&self) -> Array1<f64>;

    /// Sense of each constraint row. Empty for bound-constrained problems.
    fn constraint_rows(&self) -> Vec<ConstraintRow>;

    /// Objective and constraint values at `x`.
    fn evaluate(&mut self, x: &Array1<f64>) -> Result<Values, Self::Error>;

    /// Jacobian of `[f; c]` at `x`: row 0 is the objective gradient, row
    /// `1 + j` the gradient of constraint `j`.
    fn jacobian(&mut self, x: &Array1<f64>) -> Result<Array2<f64>, Self::Error>;
}

/// Configuration for the augmented Lagrangian solver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlmConfig {
    /// 0 silent, 1 final status, 3 outer iterations, 5 every inner step.
    pub print_level: u8,
    pub max_outer_iterations: usize,
    pub max_inner_iterations: usize,
    /// Stationarity tolerance, relative to the objective gradient scale.
    pub tolerance: f64,
    /// Absolute feasibility/complementarity tolerance.
    pub constraint_tolerance: f64,
    pub acceptable_tolerance: f64,
    pub penalty_init: f64,
    pub penalty_growth: f64,
    pub penalty_max: f64,
    /// Longest trial step as a fraction of `max(1, ||x||_inf)`.
    pub max_step_ratio: f64,
}

impl Default for AlmConfig {
    fn default() -> Self {
        Self {
            print_level: 0,
            max_outer_iterations: 50,
            max_inner_iterations: 200,
            tolerance: 1e-6,
            constraint_tolerance: 1e-6,
            acceptable_tolerance: 1e-4,
            penalty_init: 10.0,
            penalty_growth: 10.0,
            penalty_max: 1e8,
            max_step_ratio: 0.25,
        }
    }
}

impl AlmConfig {
    pub fn validate(&self) -> SolverResult<()> {
        if self.max_outer_iterations == 0 || self.max_inner_iterations == 0 {
            return Err(SolverError::InvalidConfig(
                "iteration limits must be positive".to_string(),
            ));
        }
        positive("tolerance", self.tolerance)?;
        positive("constraint_tolerance", self.constraint_tolerance)?;
        positive("acceptable_tolerance", self.acceptable_tolerance)?;
        positive("penalty_init", self.penalty_init)?;
        positive("max_step_ratio", self.max_step_ratio)?;
        if !(self.penalty_growth > 1.0) {
            return Err(SolverError::InvalidConfig(format!(
                "penalty_growth must exceed 1, got {}",
                self.penalty_growth
            )));
        }
        if !(self.penalty_max >= self.penalty_init) {
            return Err(SolverError::InvalidConfig(format!(
                "penalty_max ({}) below penalty_init ({})",
                self.penalty_max, self.penalty_init
            )));
        }
        Ok(())
    }
}

/// Configuration for the projected BFGS solver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BfgsConfig {
    pub print_level: u8,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub max_step_ratio: f64,
}

impl Default for BfgsConfig {
    fn default() -> Self {
        Self {
            print_level: 0,
            max_iterations: 500,
            tolerance: 1e-6,
            max_step_ratio: 0.25,
        }
    }
}

impl BfgsConfig {
    pub fn validate(&self) -> SolverResult<()> {
        if self.max_iterations == 0 {
            return Err(SolverError::InvalidConfig(
                "max_iterations must be positive".to_string(),
            ));
        }
        positive("tolerance", self.tolerance)?;
        positive("max_step_ratio", self.max_step_ratio)
    }
}

fn positive(name: &str, value: f64) -> SolverResult<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(SolverError::InvalidConfig(format!(
            "{} must be positive and finite, got {}",
            name, value
        )))
    }
}

/// The result of a solver run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Termination {
    /// One of the [`return_code`] constants.
    pub code: i32,
    pub variables: Array1<f64>,
    pub objective: f64,
    pub constraints: Array1<f64>,
    /// Lagrange multiplier estimates, one per constraint row.
    pub multipliers: Array1<f64>,
    /// Major iterations (outer iterations for the augmented Lagrangian).
    pub iterations: usize,
    /// Objective value after each major iteration.
    pub history: Vec<f64>,
}

/// Validated bounds and starting point shared by all solvers.
pub(crate) fn checked_start<P: NlpProblem>(
    problem: &P,
) -> Result<(Array1<f64>, Array1<f64>, Array1<f64>), P::Error> {
    let n = problem.num_variables();
    let (lower, upper) = problem.bounds();
    for (what, found) in [("lower bounds", lower.len()), ("upper bounds", upper.len())] {
        if found != n {
            return Err(SolverError::Dimension {
                what,
                expected: n,
                found,
            }
            .into());
        }
    }
    for (index, (l, u)) in lower.iter().zip(upper.iter()).enumerate() {
        if l.is_nan() || u.is_nan() || l > u {
            return Err(SolverError::InvalidBounds {
                index,
                lower: *l,
                upper: *u,
            }
            .into());
        }
    }
    let x0 = problem.initial_point();
    if x0.len() != n {
        return Err(SolverError::Dimension {
            what: "initial point",
            expected: n,
            found: x0.len(),
        }
        .into());
    }
    let start = project(&x0, &lower, &upper);
    Ok((lower, upper, start))
}

/// Clamp `x` into the box `[lower, upper]`.
pub(crate) fn project(x: &Array1<f64>, lower: &Array1<f64>, upper: &Array1<f64>) -> Array1<f64> {
    x.iter()
        .zip(lower.iter().zip(upper.iter()))
        .map(|(v, (l, u))| v.clamp(*l, *u))
        .collect()
}

pub(crate) fn inf_norm(v: &Array1<f64>) -> f64 {
    v.iter().fold(0.0_f64, |m, a| m.max(a.abs()))
}

pub(crate) fn jacobian_shape_check<P: NlpProblem>(
    jacobian: &Array2<f64>,
    rows: usize,
    cols: usize,
) -> Result<(), P::Error> {
    if jacobian.nrows() != rows {
        return Err(SolverError::Dimension {
            what: "jacobian rows",
            expected: rows,
            found: jacobian.nrows(),
        }
        .into());
    }
    if jacobian.ncols() != cols {
        return Err(SolverError::Dimension {
            what: "jacobian columns",
            expected: cols,
            found: jacobian.ncols(),
        }
        .into());
    }
    Ok(())
}
