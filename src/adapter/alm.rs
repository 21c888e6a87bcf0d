use paropt_solvers::algorithms::AugmentedLagrangian;
use paropt_solvers::{AlmConfig, Termination};
use std::collections::BTreeMap;

use super::options::{OptionPolicy, OptionValue, Options};
use super::{NlpBridge, SolverAdapter};
use crate::error::OptResult;

/// Adapter for the bundled augmented-Lagrangian solver.
///
/// Keys: `print_level` (0..=5), `max_iter`, `max_inner_iter`, `tol`,
/// `constr_viol_tol`, `acceptable_tol`, `penalty_init`, `penalty_growth`,
/// `penalty_max`, `max_step_ratio`.
#[derive(Debug, Clone, Default)]
pub struct Alm {
    options: Options<AlmConfig>,
}

impl Alm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: OptionPolicy) -> Self {
        Self {
            options: Options::new(policy),
        }
    }

    /// Build with options from a key/value mapping, strict policy.
    pub fn with_options<I, K, V>(options: I) -> OptResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<OptionValue>,
    {
        let mut alm = Self::new();
        alm.options.set_all(options)?;
        Ok(alm)
    }

    pub fn config(&self) -> &AlmConfig {
        self.options.config()
    }
}

impl SolverAdapter for Alm {
    fn name(&self) -> &str {
        "alm"
    }

    fn set_option(&mut self, key: &str, value: OptionValue) -> OptResult<()> {
        self.options.set(key, value)
    }

    fn options(&self) -> BTreeMap<String, OptionValue> {
        self.options.snapshot()
    }

    fn run(&self, nlp: &mut NlpBridge<'_>) -> OptResult<Termination> {
        AugmentedLagrangian::new(self.config().clone())?.solve(nlp)
    }
}
