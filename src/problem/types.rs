//! Registry records describing problem dimensions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::OptError;

/// Variable kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariableKind {
    Continuous,
    Integer,
    Discrete,
}

impl VariableKind {
    pub fn code(&self) -> char {
        match self {
            VariableKind::Continuous => 'c',
            VariableKind::Integer => 'i',
            VariableKind::Discrete => 'd',
        }
    }
}

impl fmt::Display for VariableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl FromStr for VariableKind {
    type Err = OptError;

    /// Accepts the one-letter codes (`c`, `i`, `d`) and the full names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "c" | "continuous" => Ok(VariableKind::Continuous),
            "i" | "integer" => Ok(VariableKind::Integer),
            "d" | "discrete" => Ok(VariableKind::Discrete),
            other => Err(OptError::InvalidOption {
                key: "variable kind".to_string(),
                reason: format!("unrecognized kind '{}'", other),
            }),
        }
    }
}

/// Constraint kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConstraintKind {
    /// `g(x) <= target`
    Inequality,
    /// `g(x) == target`
    Equality,
}

impl ConstraintKind {
    pub fn code(&self) -> char {
        match self {
            ConstraintKind::Inequality => 'i',
            ConstraintKind::Equality => 'e',
        }
    }
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl FromStr for ConstraintKind {
    type Err = OptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "i" | "inequality" => Ok(ConstraintKind::Inequality),
            "e" | "equality" => Ok(ConstraintKind::Equality),
            other => Err(OptError::InvalidOption {
                key: "constraint kind".to_string(),
                reason: format!("unrecognized kind '{}'", other),
            }),
        }
    }
}

/// Design variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub kind: VariableKind,
    pub lower: f64,
    pub upper: f64,
    /// Starting value for every solve.
    pub value: f64,
}

impl Variable {
    pub fn new(name: impl Into<String>, kind: VariableKind, lower: f64, upper: f64, value: f64) -> Self {
        Self {
            name: name.into(),
            kind,
            lower,
            upper,
            value,
        }
    }

    pub fn is_continuous(&self) -> bool {
        self.kind == VariableKind::Continuous
    }
}

/// One scalar row of the constraint vector `g`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub name: String,
    pub kind: ConstraintKind,
    pub target: f64,
}

impl Constraint {
    pub fn new(name: impl Into<String>, kind: ConstraintKind, target: f64) -> Self {
        Self {
            name: name.into(),
            kind,
            target,
        }
    }

    /// Signed distance from the target; positive means violated for
    /// inequalities.
    pub fn residual(&self, value: f64) -> f64 {
        value - self.target
    }

    pub fn violation(&self, value: f64) -> f64 {
        let r = self.residual(value);
        match self.kind {
            ConstraintKind::Inequality => r.max(0.0),
            ConstraintKind::Equality => r.abs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    pub name: String,
}

impl Objective {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}
