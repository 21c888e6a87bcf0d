//! Typed solver options addressed by string keys
//!
//! Each adapter owns a closed configuration struct. [`OptionSchema`] maps
//! string keys onto its fields; [`Options`] adds the unknown-key policy.

use paropt_solvers::{AlmConfig, BfgsConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

use crate::error::{OptError, OptResult};

/// A single option value as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        OptionValue::Bool(v)
    }
}

impl From<i32> for OptionValue {
    fn from(v: i32) -> Self {
        OptionValue::Int(v as i64)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        OptionValue::Int(v)
    }
}

impl From<usize> for OptionValue {
    fn from(v: usize) -> Self {
        OptionValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for OptionValue {
    fn from(v: f64) -> Self {
        OptionValue::Float(v)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        OptionValue::Text(v.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        OptionValue::Text(v)
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(v) => write!(f, "{}", v),
            OptionValue::Int(v) => write!(f, "{}", v),
            OptionValue::Float(v) => write!(f, "{:e}", v),
            OptionValue::Text(v) => write!(f, "{}", v),
        }
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> OptError {
    OptError::InvalidOption {
        key: key.to_string(),
        reason: reason.into(),
    }
}

impl OptionValue {
    fn type_name(&self) -> &'static str {
        match self {
            OptionValue::Bool(_) => "bool",
            OptionValue::Int(_) => "integer",
            OptionValue::Float(_) => "float",
            OptionValue::Text(_) => "text",
        }
    }

    /// Positive finite number; integers are accepted.
    pub fn positive_f64(&self, key: &str) -> OptResult<f64> {
        let v = match self {
            OptionValue::Float(v) => *v,
            OptionValue::Int(v) => *v as f64,
            other => return Err(invalid(key, format!("expected a number, got {}", other.type_name()))),
        };
        if v > 0.0 && v.is_finite() {
            Ok(v)
        } else {
            Err(invalid(key, format!("must be positive and finite, got {}", v)))
        }
    }

    /// Integer within `[min, max]`.
    pub fn int_in(&self, key: &str, min: i64, max: i64) -> OptResult<i64> {
        match self {
            OptionValue::Int(v) if (min..=max).contains(v) => Ok(*v),
            OptionValue::Int(v) => Err(invalid(key, format!("must lie in [{}, {}], got {}", min, max, v))),
            other => Err(invalid(key, format!("expected an integer, got {}", other.type_name()))),
        }
    }

    pub fn count(&self, key: &str) -> OptResult<usize> {
        self.int_in(key, 1, i64::MAX).map(|v| v as usize)
    }
}

/// What happens to keys an adapter does not recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OptionPolicy {
    /// Fail with [`OptError::UnknownOption`].
    #[default]
    Strict,
    /// Log a warning and ignore the key.
    Permissive,
}

/// A solver configuration reachable through string keys.
pub trait OptionSchema: Clone + Default {
    /// Every recognized key.
    const KEYS: &'static [&'static str];

    /// Set one recognized key, checking type and range.
    fn apply(&mut self, key: &str, value: &OptionValue) -> OptResult<()>;

    /// Current value of every key.
    fn snapshot(&self) -> BTreeMap<String, OptionValue>;
}

/// A configuration plus the unknown-key policy.
#[derive(Debug, Clone, Default)]
pub struct Options<C> {
    config: C,
    policy: OptionPolicy,
}

impl<C: OptionSchema> Options<C> {
    pub fn new(policy: OptionPolicy) -> Self {
        Self {
            config: C::default(),
            policy,
        }
    }

    pub fn config(&self) -> &C {
        &self.config
    }

    pub fn policy(&self) -> OptionPolicy {
        self.policy
    }

    pub fn set(&mut self, key: &str, value: OptionValue) -> OptResult<()> {
        if !C::KEYS.contains(&key) {
            return match self.policy {
                OptionPolicy::Strict => Err(OptError::UnknownOption(key.to_string())),
                OptionPolicy::Permissive => {
                    warn!(key, %value, "ignoring unknown solver option");
                    Ok(())
                }
            };
        }
        self.config.apply(key, &value)
    }

    pub fn set_all<I, K, V>(&mut self, options: I) -> OptResult<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<OptionValue>,
    {
        for (key, value) in options {
            self.set(key.as_ref(), value.into())?;
        }
        Ok(())
    }

    pub fn snapshot(&self) -> BTreeMap<String, OptionValue> {
        self.config.snapshot()
    }
}

fn print_level(value: &OptionValue) -> OptResult<u8> {
    value.int_in("print_level", 0, 5).map(|v| v as u8)
}

impl OptionSchema for AlmConfig {
    const KEYS: &'static [&'static str] = &[
        "print_level",
        "max_iter",
        "max_inner_iter",
        "tol",
        "constr_viol_tol",
        "acceptable_tol",
        "penalty_init",
        "penalty_growth",
        "penalty_max",
        "max_step_ratio",
    ];

    fn apply(&mut self, key: &str, value: &OptionValue) -> OptResult<()> {
        match key {
            "print_level" => self.print_level = print_level(value)?,
            "max_iter" => self.max_outer_iterations = value.count(key)?,
            "max_inner_iter" => self.max_inner_iterations = value.count(key)?,
            "tol" => self.tolerance = value.positive_f64(key)?,
            "constr_viol_tol" => self.constraint_tolerance = value.positive_f64(key)?,
            "acceptable_tol" => self.acceptable_tolerance = value.positive_f64(key)?,
            "penalty_init" => self.penalty_init = value.positive_f64(key)?,
            "penalty_growth" => {
                let v = value.positive_f64(key)?;
                if v <= 1.0 {
                    return Err(invalid(key, format!("must exceed 1, got {}", v)));
                }
                self.penalty_growth = v;
            }
            "penalty_max" => self.penalty_max = value.positive_f64(key)?,
            "max_step_ratio" => self.max_step_ratio = value.positive_f64(key)?,
            other => return Err(OptError::UnknownOption(other.to_string())),
        }
        Ok(())
    }

    fn snapshot(&self) -> BTreeMap<String, OptionValue> {
        BTreeMap::from([
            ("print_level".to_string(), OptionValue::Int(self.print_level as i64)),
            ("max_iter".to_string(), self.max_outer_iterations.into()),
            ("max_inner_iter".to_string(), self.max_inner_iterations.into()),
            ("tol".to_string(), self.tolerance.into()),
            ("constr_viol_tol".to_string(), self.constraint_tolerance.into()),
            ("acceptable_tol".to_string(), self.acceptable_tolerance.into()),
            ("penalty_init".to_string(), self.penalty_init.into()),
            ("penalty_growth".to_string(), self.penalty_growth.into()),
            ("penalty_max".to_string(), self.penalty_max.into()),
            ("max_step_ratio".to_string(), self.max_step_ratio.into()),
        ])
    }
}

impl OptionSchema for BfgsConfig {
    const KEYS: &'static [&'static str] = &["print_level", "max_iter", "tol", "max_step_ratio"];

    fn apply(&mut self, key: &str, value: &OptionValue) -> OptResult<()> {
        match key {
            "print_level" => self.print_level = print_level(value)?,
            "max_iter" => self.max_iterations = value.count(key)?,
            "tol" => self.tolerance = value.positive_f64(key)?,
            "max_step_ratio" => self.max_step_ratio = value.positive_f64(key)?,
            other => return Err(OptError::UnknownOption(other.to_string())),
        }
        Ok(())
    }

    fn snapshot(&self) -> BTreeMap<String, OptionValue> {
        BTreeMap::from([
            ("print_level".to_string(), OptionValue::Int(self.print_level as i64)),
            ("max_iter".to_string(), self.max_iterations.into()),
            ("tol".to_string(), self.tolerance.into()),
            ("max_step_ratio".to_string(), self.max_step_ratio.into()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_rejects_unknown_key() {
        let mut options = Options::<AlmConfig>::new(OptionPolicy::Strict);
        assert_eq!(
            options.set("mu_strategy", "adaptive".into()).unwrap_err(),
            OptError::UnknownOption("mu_strategy".to_string())
        );
    }

    #[test]
    fn test_permissive_ignores_unknown_key() {
        let mut options = Options::<AlmConfig>::new(OptionPolicy::Permissive);
        options.set("mu_strategy", "adaptive".into()).unwrap();
        assert_eq!(options.config(), &AlmConfig::default());
    }

    #[test]
    fn test_values_are_type_and_range_checked() {
        let mut options = Options::<AlmConfig>::new(OptionPolicy::Permissive);
        assert!(matches!(
            options.set("print_level", 9.into()),
            Err(OptError::InvalidOption { .. })
        ));
        assert!(matches!(
            options.set("tol", "tight".into()),
            Err(OptError::InvalidOption { .. })
        ));
        assert!(matches!(
            options.set("penalty_growth", 0.5.into()),
            Err(OptError::InvalidOption { .. })
        ));
        assert!(matches!(
            options.set("max_iter", 0.into()),
            Err(OptError::InvalidOption { .. })
        ));
    }

    #[test]
    fn test_set_all_and_snapshot() {
        let mut options = Options::<BfgsConfig>::new(OptionPolicy::Strict);
        options
            .set_all([("max_iter", OptionValue::Int(40)), ("tol", OptionValue::Float(1e-8))])
            .unwrap();
        assert_eq!(options.config().max_iterations, 40);
        // integers are accepted where floats are expected
        options.set("max_step_ratio", 1.into()).unwrap();

        let snapshot = options.snapshot();
        assert_eq!(snapshot["max_iter"], OptionValue::Int(40));
        assert_eq!(snapshot["tol"], OptionValue::Float(1e-8));
        assert_eq!(snapshot["max_step_ratio"], OptionValue::Float(1.0));
    }

    #[test]
    fn test_untagged_json_form() {
        let json = serde_json::to_string(&OptionValue::Int(3)).unwrap();
        assert_eq!(json, "3");
        let back: OptionValue = serde_json::from_str("1e-6").unwrap();
        assert_eq!(back, OptionValue::Float(1e-6));
    }
}
