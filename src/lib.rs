//! paropt
//!
//! Solver-agnostic nonlinear constrained optimization with pluggable solver
//! adapters and parallel sensitivity evaluation.
//!
//! # Architecture
//!
//! - [`problem`]: variables, objectives and constraints in ordered
//!   registries, plus the user model `(x) -> (f, g, fail)`
//! - [`derivative`]: Jacobians by finite differences, complex step or an
//!   analytic gradient, evaluated sequentially, on the rayon pool, or by
//!   columns across ranks ("pgc")
//! - [`parallel`]: rank identity and collectives (`broadcast`, `gather`)
//!   over an explicit [`ExecutionContext`]
//! - [`adapter`]: solver adapters with closed option schemas that drive the
//!   bundled `paropt-solvers` and normalize their return codes
//! - [`history`]: frozen, indexed solutions per problem
//!
//! ## Example Usage
//!
//! ```rust
//! use paropt::{
//!     Alm, AnalyticModel, ConstraintKind, Evaluation, ExecutionContext, Holomorphic,
//!     Problem, Scalar, SensitivityMode, SensitivityType, SolverAdapter, VariableKind,
//! };
//!
//! // min x^2 + y^2  s.t.  x + y == 1
//! struct Circle;
//!
//! impl AnalyticModel for Circle {
//!     fn evaluate<T: Scalar>(&self, x: &[T]) -> Evaluation<T> {
//!         Evaluation::new(x[0] * x[0] + x[1] * x[1], vec![x[0] + x[1]])
//!     }
//! }
//!
//! let mut problem = Problem::new("circle", Holomorphic(Circle));
//! problem.add_variable("x", VariableKind::Continuous, -10.0, 10.0, 3.0).unwrap();
//! problem.add_variable("y", VariableKind::Continuous, -10.0, 10.0, -2.0).unwrap();
//! problem.add_objective("f").unwrap();
//! problem
//!     .add_constraint_with_target("sum", ConstraintKind::Equality, 1.0)
//!     .unwrap();
//!
//! let ctx = ExecutionContext::single();
//! let index = Alm::new()
//!     .solve(&mut problem, &ctx, SensitivityType::complex_step(), SensitivityMode::Sequential)
//!     .unwrap()
//!     .unwrap();
//!
//! let solution = problem.solution(index).unwrap();
//! assert!((solution.x()[0] - 0.5).abs() < 1e-4);
//! println!("{}", solution);
//! ```

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod adapter;
pub mod derivative;
pub mod error;
pub mod history;
pub mod parallel;
pub mod problem;

// Re-export main types for convenience
pub use adapter::{Alm, Bfgs, NlpBridge, OptionPolicy, OptionValue, SolverAdapter};

pub use derivative::{
    ComplexStepFallback, DerivativeEngine, Jacobian, Partition, SensitivityMode, SensitivityType,
};

pub use error::{OptError, OptResult, RankFailure};

pub use history::{SolutionHistory, SolveStats, SolveStatus, Solution};

pub use parallel::{Communicator, ExecutionContext, Rank, SingleProcess, ThreadComm, ThreadGroup, ROOT};

pub use problem::{
    AnalyticModel, Constraint, ConstraintKind, Evaluation, Holomorphic, Model, Objective, Problem,
    ProblemState, Scalar, Sensitivity, Variable, VariableKind, WithGradient,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get version string
pub fn version() -> &'static str {
    VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let ver = version();
        assert!(!ver.is_empty());
        assert_eq!(ver, "0.1.0");
    }
}
