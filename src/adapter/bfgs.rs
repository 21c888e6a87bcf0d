use paropt_solvers::algorithms::ProjectedBfgs;
use paropt_solvers::{BfgsConfig, NlpProblem, Termination};
use std::collections::BTreeMap;

use super::options::{OptionPolicy, OptionValue, Options};
use super::{NlpBridge, SolverAdapter};
use crate::error::{OptError, OptResult};

/// Adapter for the bundled projected-BFGS solver. Bound constraints only.
///
/// Keys: `print_level` (0..=5), `max_iter`, `tol`, `max_step_ratio`.
#[derive(Debug, Clone, Default)]
pub struct Bfgs {
    options: Options<BfgsConfig>,
}

impl Bfgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: OptionPolicy) -> Self {
        Self {
            options: Options::new(policy),
        }
    }

    pub fn config(&self) -> &BfgsConfig {
        self.options.config()
    }
}

impl SolverAdapter for Bfgs {
    fn name(&self) -> &str {
        "bfgs"
    }

    fn set_option(&mut self, key: &str, value: OptionValue) -> OptResult<()> {
        self.options.set(key, value)
    }

    fn options(&self) -> BTreeMap<String, OptionValue> {
        self.options.snapshot()
    }

    fn run(&self, nlp: &mut NlpBridge<'_>) -> OptResult<Termination> {
        let rows = nlp.constraint_rows().len();
        if rows > 0 {
            return Err(OptError::Unsupported(format!(
                "bfgs handles bound constraints only, problem has {} general constraints",
                rows
            )));
        }
        ProjectedBfgs::new(self.config().clone())?.solve(nlp)
    }
}
