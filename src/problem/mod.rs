//! Optimization problem model
//!
//! A [`Problem`] aggregates ordered registries of variables, objectives and
//! constraints together with the user [`Model`]. Registry insertion order is
//! the position of each entry in `x`, `f` and `g`. Every evaluation checks the
//! model's output against the declared counts.

pub mod model;
pub mod state;
pub mod types;

pub use model::{AnalyticModel, Evaluation, Holomorphic, Model, Scalar, Sensitivity, WithGradient};
pub use state::ProblemState;
pub use types::{Constraint, ConstraintKind, Objective, Variable, VariableKind};

use indexmap::IndexMap;
use num_complex::Complex64;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

use crate::error::{OptError, OptResult};
use crate::history::{Solution, SolutionHistory};

/// A nonlinear program `min f(x)` s.t. `g(x) <= / == target`,
/// `lower <= x <= upper`.
pub struct Problem {
    name: String,
    variables: IndexMap<String, Variable>,
    objectives: IndexMap<String, Objective>,
    constraints: IndexMap<String, Constraint>,
    model: Arc<dyn Model>,
    history: SolutionHistory,
}

impl Problem {
    pub fn new(name: impl Into<String>, model: impl Model + 'static) -> Self {
        Self::with_shared_model(name, Arc::new(model))
    }

    /// Build a problem around a model that is already shared, e.g. one model
    /// instance used by several ranks of a thread group.
    pub fn with_shared_model(name: impl Into<String>, model: Arc<dyn Model>) -> Self {
        Self {
            name: name.into(),
            variables: IndexMap::new(),
            objectives: IndexMap::new(),
            constraints: IndexMap::new(),
            model,
            history: SolutionHistory::new(),
        }
    }

    /// Rebuild a problem from a snapshot, re-checking names and bounds.
    pub fn from_state(state: ProblemState, model: impl Model + 'static) -> OptResult<Self> {
        let mut problem = Problem::new(state.name, model);
        for v in state.variables {
            problem.add_variable(v.name, v.kind, v.lower, v.upper, v.value)?;
        }
        for o in state.objectives {
            problem.add_objective(o.name)?;
        }
        for c in state.constraints {
            problem.add_constraint_with_target(c.name, c.kind, c.target)?;
        }
        Ok(problem)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a design variable and return its position in `x`.
    pub fn add_variable(
        &mut self,
        name: impl Into<String>,
        kind: VariableKind,
        lower: f64,
        upper: f64,
        value: f64,
    ) -> OptResult<usize> {
        let name = name.into();
        if self.variables.contains_key(&name) {
            return Err(OptError::DuplicateName {
                registry: "variable",
                name,
            });
        }
        if !(lower <= upper) {
            return Err(OptError::Bounds { name, lower, upper });
        }
        let index = self.variables.len();
        self.variables
            .insert(name.clone(), Variable::new(name, kind, lower, upper, value));
        Ok(index)
    }

    pub fn add_objective(&mut self, name: impl Into<String>) -> OptResult<usize> {
        let name = name.into();
        if self.objectives.contains_key(&name) {
            return Err(OptError::DuplicateName {
                registry: "objective",
                name,
            });
        }
        let index = self.objectives.len();
        self.objectives.insert(name.clone(), Objective::new(name));
        Ok(index)
    }

    /// Register a constraint row `g_i(x) <= 0` or `g_i(x) == 0`.
    pub fn add_constraint(&mut self, name: impl Into<String>, kind: ConstraintKind) -> OptResult<usize> {
        self.add_constraint_with_target(name, kind, 0.0)
    }

    pub fn add_constraint_with_target(
        &mut self,
        name: impl Into<String>,
        kind: ConstraintKind,
        target: f64,
    ) -> OptResult<usize> {
        let name = name.into();
        if self.constraints.contains_key(&name) {
            return Err(OptError::DuplicateName {
                registry: "constraint",
                name,
            });
        }
        let index = self.constraints.len();
        self.constraints
            .insert(name.clone(), Constraint::new(name, kind, target));
        Ok(index)
    }

    pub fn num_variables(&self) -> usize {
        self.variables.len()
    }

    pub fn num_constraints(&self) -> usize {
        self.constraints.len()
    }

    pub fn num_objectives(&self) -> usize {
        self.objectives.len()
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.variables.values()
    }

    pub fn constraints(&self) -> impl Iterator<Item = &Constraint> {
        self.constraints.values()
    }

    pub fn objectives(&self) -> impl Iterator<Item = &Objective> {
        self.objectives.values()
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    pub fn constraint(&self, name: &str) -> Option<&Constraint> {
        self.constraints.get(name)
    }

    /// Declared values, the starting point of every solve.
    pub fn initial_point(&self) -> Vec<f64> {
        self.variables.values().map(|v| v.value).collect()
    }

    pub fn bounds(&self) -> (Vec<f64>, Vec<f64>) {
        self.variables.values().map(|v| (v.lower, v.upper)).unzip()
    }

    /// Evaluate the model at `x`.
    pub fn evaluate(&self, x: &[f64]) -> OptResult<Evaluation> {
        self.check_point(x.len())?;
        trace!(problem = %self.name, "evaluate");
        let eval = self.model.evaluate(x);
        self.check_evaluation(eval.fail, eval.g.len())?;
        Ok(eval)
    }

    /// Evaluate the model on complex input. `Ok(None)` means the model has no
    /// complex continuation.
    pub fn evaluate_complex(&self, x: &[Complex64]) -> OptResult<Option<Evaluation<Complex64>>> {
        self.check_point(x.len())?;
        trace!(problem = %self.name, "evaluate_complex");
        match self.model.evaluate_complex(x) {
            Some(eval) => {
                self.check_evaluation(eval.fail, eval.g.len())?;
                Ok(Some(eval))
            }
            None => Ok(None),
        }
    }

    /// User analytic sensitivities at `x`. `Ok(None)` means the model has
    /// none.
    pub fn gradient(&self, x: &[f64]) -> OptResult<Option<Sensitivity>> {
        self.check_point(x.len())?;
        let Some(sens) = self.model.gradient(x) else {
            return Ok(None);
        };
        if sens.fail != 0 {
            return Err(OptError::UserFunction { code: sens.fail });
        }
        let n = self.num_variables();
        if sens.df.len() != n {
            return Err(OptError::ShapeMismatch {
                what: "objective gradient",
                expected: n,
                found: sens.df.len(),
            });
        }
        if sens.dg.len() != self.num_constraints() {
            return Err(OptError::ShapeMismatch {
                what: "constraint jacobian rows",
                expected: self.num_constraints(),
                found: sens.dg.len(),
            });
        }
        if let Some(row) = sens.dg.iter().find(|row| row.len() != n) {
            return Err(OptError::ShapeMismatch {
                what: "constraint jacobian columns",
                expected: n,
                found: row.len(),
            });
        }
        Ok(Some(sens))
    }

    fn check_point(&self, found: usize) -> OptResult<()> {
        if found != self.num_variables() {
            return Err(OptError::ShapeMismatch {
                what: "x",
                expected: self.num_variables(),
                found,
            });
        }
        Ok(())
    }

    fn check_evaluation(&self, fail: i32, g_len: usize) -> OptResult<()> {
        if fail != 0 {
            return Err(OptError::UserFunction { code: fail });
        }
        // the model returns a scalar f, so exactly one objective must be declared
        if self.num_objectives() != 1 {
            return Err(OptError::ShapeMismatch {
                what: "objectives",
                expected: 1,
                found: self.num_objectives(),
            });
        }
        if g_len != self.num_constraints() {
            return Err(OptError::ShapeMismatch {
                what: "g",
                expected: self.num_constraints(),
                found: g_len,
            });
        }
        Ok(())
    }

    pub fn solution(&self, index: usize) -> OptResult<Arc<Solution>> {
        self.history.get(index)
    }

    pub fn solutions(&self) -> &SolutionHistory {
        &self.history
    }

    pub(crate) fn record(&mut self, solution: Solution) -> usize {
        self.history.append(solution)
    }

    pub fn state(&self) -> ProblemState {
        ProblemState {
            name: self.name.clone(),
            variables: self.variables.values().cloned().collect(),
            objectives: self.objectives.values().cloned().collect(),
            constraints: self.constraints.values().cloned().collect(),
        }
    }
}

impl fmt::Debug for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Problem")
            .field("name", &self.name)
            .field("variables", &self.variables.len())
            .field("objectives", &self.objectives.len())
            .field("constraints", &self.constraints.len())
            .field("solutions", &self.history.count())
            .finish()
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Optimization Problem -- {}", self.name)?;
        writeln!(f, "    Objectives:")?;
        for o in self.objectives.values() {
            writeln!(f, "        {}", o.name)?;
        }
        writeln!(f, "    Variables (c - continuous, i - integer, d - discrete):")?;
        for v in self.variables.values() {
            writeln!(
                f,
                "        {:<12} {}  {:>12.6e} <= {:>12.6e} <= {:>12.6e}",
                v.name, v.kind, v.lower, v.value, v.upper
            )?;
        }
        if !self.constraints.is_empty() {
            writeln!(f, "    Constraints (i - inequality, e - equality):")?;
            for c in self.constraints.values() {
                let op = match c.kind {
                    ConstraintKind::Inequality => "<=",
                    ConstraintKind::Equality => "==",
                };
                writeln!(f, "        {:<12} {}  g {} {:.6e}", c.name, c.kind, op, c.target)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tp37() -> Problem {
        let mut problem = Problem::new("TP37", |x: &[f64]| {
            let s = x[0] + 2.0 * x[1] + 2.0 * x[2];
            Evaluation::new(-x[0] * x[1] * x[2], vec![s - 72.0, -s])
        });
        for name in ["x1", "x2", "x3"] {
            problem
                .add_variable(name, VariableKind::Continuous, 0.0, 42.0, 10.0)
                .unwrap();
        }
        problem.add_objective("obj").unwrap();
        problem.add_constraint("con1", ConstraintKind::Inequality).unwrap();
        problem.add_constraint("con2", ConstraintKind::Inequality).unwrap();
        problem
    }

    #[test]
    fn test_registries_keep_insertion_order() {
        let problem = tp37();
        let names: Vec<_> = problem.variables().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["x1", "x2", "x3"]);
        assert_eq!(problem.initial_point(), vec![10.0; 3]);
        assert_eq!(problem.bounds(), (vec![0.0; 3], vec![42.0; 3]));
    }

    #[test]
    fn test_duplicate_names_rejected_per_registry() {
        let mut problem = tp37();
        assert!(matches!(
            problem.add_variable("x1", VariableKind::Continuous, 0.0, 1.0, 0.0),
            Err(OptError::DuplicateName { registry: "variable", .. })
        ));
        assert!(matches!(
            problem.add_constraint("con1", ConstraintKind::Equality),
            Err(OptError::DuplicateName { registry: "constraint", .. })
        ));
        // the same name in a different registry is fine
        assert_eq!(problem.add_constraint("x1", ConstraintKind::Equality).unwrap(), 2);
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let mut problem = tp37();
        let err = problem
            .add_variable("bad", VariableKind::Continuous, 2.0, 1.0, 1.5)
            .unwrap_err();
        assert!(matches!(err, OptError::Bounds { .. }));
        assert!(problem
            .add_variable("nan", VariableKind::Continuous, f64::NAN, 1.0, 0.0)
            .is_err());
        assert_eq!(problem.num_variables(), 3);
    }

    #[test]
    fn test_evaluate_checks_shapes() {
        let problem = tp37();
        let eval = problem.evaluate(&[10.0, 10.0, 10.0]).unwrap();
        assert_eq!(eval.f, -1000.0);
        assert_eq!(eval.g, vec![-22.0, -50.0]);

        assert_eq!(
            problem.evaluate(&[1.0, 2.0]).unwrap_err(),
            OptError::ShapeMismatch { what: "x", expected: 3, found: 2 }
        );
    }

    #[test]
    fn test_evaluate_detects_wrong_constraint_count() {
        let mut problem = tp37();
        problem.add_constraint("con3", ConstraintKind::Inequality).unwrap();
        assert_eq!(
            problem.evaluate(&[10.0, 10.0, 10.0]).unwrap_err(),
            OptError::ShapeMismatch { what: "g", expected: 3, found: 2 }
        );
    }

    #[test]
    fn test_evaluate_requires_one_objective() {
        let mut problem = Problem::new("none", |x: &[f64]| Evaluation::new(x[0], vec![]));
        problem
            .add_variable("x", VariableKind::Continuous, 0.0, 1.0, 0.5)
            .unwrap();
        assert!(matches!(
            problem.evaluate(&[0.5]),
            Err(OptError::ShapeMismatch { what: "objectives", expected: 1, found: 0 })
        ));

        problem.add_objective("f").unwrap();
        problem.add_objective("h").unwrap();
        assert!(matches!(
            problem.evaluate(&[0.5]),
            Err(OptError::ShapeMismatch { what: "objectives", expected: 1, found: 2 })
        ));
    }

    #[test]
    fn test_user_failure_propagates() {
        let mut problem = Problem::new("fails", |x: &[f64]| {
            if x[0] < 0.0 {
                Evaluation::failed(7)
            } else {
                Evaluation::new(x[0].sqrt(), vec![])
            }
        });
        problem
            .add_variable("x", VariableKind::Continuous, -1.0, 1.0, 0.5)
            .unwrap();
        problem.add_objective("f").unwrap();
        assert!(problem.evaluate(&[0.25]).is_ok());
        assert_eq!(
            problem.evaluate(&[-0.5]).unwrap_err(),
            OptError::UserFunction { code: 7 }
        );
    }

    #[test]
    fn test_complex_evaluation_optional() {
        let problem = tp37();
        let z = vec![Complex64::new(10.0, 0.0); 3];
        assert_eq!(problem.evaluate_complex(&z).unwrap(), None);
    }

    #[test]
    fn test_gradient_shape_checked() {
        let model = WithGradient::new(
            |x: &[f64]| Evaluation::new(x[0] * x[1], vec![x[0] + x[1]]),
            |_: &[f64]| Sensitivity::new(vec![1.0, 2.0], vec![vec![1.0]]),
        );
        let mut problem = Problem::new("grad", model);
        problem.add_variable("a", VariableKind::Continuous, 0.0, 1.0, 0.5).unwrap();
        problem.add_variable("b", VariableKind::Continuous, 0.0, 1.0, 0.5).unwrap();
        problem.add_objective("f").unwrap();
        problem.add_constraint("c", ConstraintKind::Inequality).unwrap();
        assert!(matches!(
            problem.gradient(&[0.5, 0.5]),
            Err(OptError::ShapeMismatch { what: "constraint jacobian columns", .. })
        ));
    }

    #[test]
    fn test_state_round_trip() {
        let mut problem = tp37();
        problem
            .add_constraint_with_target("budget", ConstraintKind::Equality, 4.0)
            .unwrap();
        let state = problem.state();
        let rebuilt = Problem::from_state(state.clone(), |_: &[f64]| Evaluation::<f64>::failed(1)).unwrap();
        assert_eq!(rebuilt.state(), state);
        assert_eq!(rebuilt.constraint("budget").unwrap().target, 4.0);
    }

    #[test]
    fn test_solution_index_out_of_range() {
        let problem = tp37();
        assert_eq!(
            problem.solution(0).unwrap_err(),
            OptError::IndexOutOfRange { index: 0, count: 0 }
        );
    }

    #[test]
    fn test_display_lists_registries() {
        let text = tp37().to_string();
        assert!(text.contains("Optimization Problem -- TP37"));
        assert!(text.contains("x3"));
        assert!(text.contains("con2"));
    }
}
