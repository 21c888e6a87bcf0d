//! Solution history
//!
//! Every solver run that reaches a definite terminal outcome leaves one
//! frozen [`Solution`] behind. The history is append-only and indexed in call
//! order; callers receive shared read-only handles.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::adapter::OptionValue;
use crate::derivative::{SensitivityMode, SensitivityType};
use crate::error::{OptError, OptResult};
use crate::problem::{ConstraintKind, VariableKind};

/// Solver outcome, independent of any solver's native return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SolveStatus {
    Optimal,
    Acceptable,
    Infeasible,
    Diverged,
    IterationLimit,
}

impl SolveStatus {
    /// Optimal and Acceptable solves return `Ok`.
    pub fn is_success(&self) -> bool {
        matches!(self, SolveStatus::Optimal | SolveStatus::Acceptable)
    }
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SolveStatus::Optimal => "optimal",
            SolveStatus::Acceptable => "acceptable",
            SolveStatus::Infeasible => "infeasible",
            SolveStatus::Diverged => "diverged",
            SolveStatus::IterationLimit => "iteration limit",
        };
        write!(f, "{}", text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolvedVariable {
    pub name: String,
    pub kind: VariableKind,
    pub lower: f64,
    pub upper: f64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolvedConstraint {
    pub name: String,
    pub kind: ConstraintKind,
    pub target: f64,
    pub value: f64,
    /// Lagrange multiplier estimate reported by the solver.
    pub multiplier: f64,
}

/// Run statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveStats {
    pub wall_time: Duration,
    pub iterations: usize,
    /// Model evaluations requested by the solver, excluding sensitivities.
    pub evaluations: usize,
    pub jacobian_evaluations: usize,
    /// Model evaluations spent inside sensitivity requests, summed over ranks.
    pub sensitivity_evaluations: usize,
    pub sensitivity: SensitivityType,
    pub mode: SensitivityMode,
    pub ranks: usize,
}

/// Frozen snapshot of one solver run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub index: usize,
    pub problem: String,
    pub optimizer: String,
    pub status: SolveStatus,
    pub message: String,
    pub objective_name: String,
    pub objective: f64,
    pub variables: Vec<SolvedVariable>,
    pub constraints: Vec<SolvedConstraint>,
    /// Objective value after each major iteration.
    pub objective_history: Vec<f64>,
    pub stats: SolveStats,
    /// Effective solver options for this run.
    pub options: BTreeMap<String, OptionValue>,
}

impl Solution {
    /// Final variable values in declaration order.
    pub fn x(&self) -> Vec<f64> {
        self.variables.iter().map(|v| v.value).collect()
    }

    pub fn variable(&self, name: &str) -> Option<&SolvedVariable> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn constraint(&self, name: &str) -> Option<&SolvedConstraint> {
        self.constraints.iter().find(|c| c.name == name)
    }

    pub fn to_json(&self) -> OptResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> OptResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl fmt::Display for Solution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(78);
        writeln!(f, "Optimization Problem -- {}", self.problem)?;
        writeln!(f, "{}", rule)?;
        writeln!(f, "    Solution #{} from {}: {}", self.index, self.optimizer, self.status)?;
        if !self.message.is_empty() {
            writeln!(f, "    {}", self.message)?;
        }
        writeln!(f, "    Objective Function: {} = {:.6}", self.objective_name, self.objective)?;
        writeln!(
            f,
            "    Wall time {:.4} s, {} iterations, {} evaluations, {} sensitivity requests",
            self.stats.wall_time.as_secs_f64(),
            self.stats.iterations,
            self.stats.evaluations,
            self.stats.jacobian_evaluations
        )?;
        writeln!(
            f,
            "    Sensitivities: {} ({}) over {} rank(s), {} model calls",
            self.stats.sensitivity, self.stats.mode, self.stats.ranks, self.stats.sensitivity_evaluations
        )?;

        writeln!(f)?;
        writeln!(f, "   Variables (c - continuous, i - integer, d - discrete)")?;
        writeln!(
            f,
            "    {:>5}  {:<12} {:>4}  {:>14} {:>14} {:>14}",
            "Index", "Name", "Type", "Lower Bound", "Value", "Upper Bound"
        )?;
        for (i, v) in self.variables.iter().enumerate() {
            writeln!(
                f,
                "    {:>5}  {:<12} {:>4}  {:>14.6e} {:>14.6e} {:>14.6e}",
                i, v.name, v.kind, v.lower, v.value, v.upper
            )?;
        }

        if !self.constraints.is_empty() {
            writeln!(f)?;
            writeln!(f, "   Constraints (i - inequality, e - equality)")?;
            writeln!(
                f,
                "    {:>5}  {:<12} {:>4}  {:>14} {:>14} {:>14}",
                "Index", "Name", "Type", "Target", "Value", "Multiplier"
            )?;
            for (i, c) in self.constraints.iter().enumerate() {
                writeln!(
                    f,
                    "    {:>5}  {:<12} {:>4}  {:>14.6e} {:>14.6e} {:>14.6e}",
                    i, c.name, c.kind, c.target, c.value, c.multiplier
                )?;
            }
        }
        write!(f, "{}", rule)
    }
}

/// Append-only store of solutions, indexed from zero.
#[derive(Debug, Clone, Default)]
pub struct SolutionHistory {
    solutions: Vec<Arc<Solution>>,
}

impl SolutionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `solution` and return its index. The stored index is assigned
    /// here and overrides whatever the caller put in the record.
    pub fn append(&mut self, mut solution: Solution) -> usize {
        let index = self.solutions.len();
        solution.index = index;
        self.solutions.push(Arc::new(solution));
        index
    }

    pub fn get(&self, index: usize) -> OptResult<Arc<Solution>> {
        self.solutions
            .get(index)
            .cloned()
            .ok_or(OptError::IndexOutOfRange {
                index,
                count: self.solutions.len(),
            })
    }

    pub fn count(&self) -> usize {
        self.solutions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.solutions.is_empty()
    }

    pub fn last(&self) -> Option<Arc<Solution>> {
        self.solutions.last().cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Solution>> {
        self.solutions.iter()
    }
}
