//! Solver-neutral snapshot of a problem definition

use serde::{Deserialize, Serialize};

use super::types::{Constraint, Objective, Variable};
use crate::error::OptResult;

/// Everything that defines a problem except the model itself.
///
/// Rank 0 broadcasts this at the start of a parallel solve so workers can
/// confirm they built the same problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemState {
    pub name: String,
    pub variables: Vec<Variable>,
    pub objectives: Vec<Objective>,
    pub constraints: Vec<Constraint>,
}

impl ProblemState {
    /// Compare dimensions and names with another snapshot. Values and bounds
    /// may differ between ranks; layout may not.
    pub fn layout_mismatch(&self, other: &ProblemState) -> Option<String> {
        if self.variables.len() != other.variables.len() {
            return Some(format!(
                "{} variables, expected {}",
                other.variables.len(),
                self.variables.len()
            ));
        }
        if self.constraints.len() != other.constraints.len() {
            return Some(format!(
                "{} constraints, expected {}",
                other.constraints.len(),
                self.constraints.len()
            ));
        }
        if self.objectives.len() != other.objectives.len() {
            return Some(format!(
                "{} objectives, expected {}",
                other.objectives.len(),
                self.objectives.len()
            ));
        }
        let names = |s: &ProblemState| -> Vec<String> {
            s.variables
                .iter()
                .map(|v| v.name.clone())
                .chain(s.constraints.iter().map(|c| c.name.clone()))
                .chain(s.objectives.iter().map(|o| o.name.clone()))
                .collect()
        };
        names(self)
            .into_iter()
            .zip(names(other))
            .find(|(a, b)| a != b)
            .map(|(a, b)| format!("found '{}' where '{}' was declared", b, a))
    }

    pub fn to_json(&self) -> OptResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> OptResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
