//! Single-column sensitivity kernels

use num_complex::Complex64;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{OptError, OptResult};
use crate::problem::{Evaluation, Problem};

/// Column index paired with `d[f; g] / dx_j`.
pub(crate) type Column = (usize, Vec<f64>);

/// Unperturbed `f` and `g` for forward differences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Baseline {
    pub f: f64,
    pub g: Vec<f64>,
}

impl From<&Evaluation> for Baseline {
    fn from(eval: &Evaluation) -> Self {
        Self {
            f: eval.f,
            g: eval.g.clone(),
        }
    }
}

/// A fully resolved perturbation scheme, ready to ship to any rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum Kernel {
    Forward { step: f64, baseline: Baseline },
    Complex { step: f64 },
}

impl Kernel {
    pub fn column(&self, problem: &Problem, x: &[f64], j: usize) -> OptResult<Vec<f64>> {
        match self {
            Kernel::Forward { step, baseline } => {
                let mut xp = x.to_vec();
                xp[j] += step;
                let eval = problem.evaluate(&xp)?;
                let mut col = Vec::with_capacity(1 + eval.g.len());
                col.push((eval.f - baseline.f) / step);
                col.extend(eval.g.iter().zip(&baseline.g).map(|(g, g0)| (g - g0) / step));
                Ok(col)
            }
            Kernel::Complex { step } => {
                let mut xc: Vec<Complex64> = x.iter().map(|&v| Complex64::new(v, 0.0)).collect();
                xc[j] = Complex64::new(x[j], *step);
                let eval = problem
                    .evaluate_complex(&xc)?
                    .ok_or(OptError::ComplexStepUnsupported)?;
                let mut col = Vec::with_capacity(1 + eval.g.len());
                col.push(eval.f.im / step);
                col.extend(eval.g.iter().map(|g| g.im / step));
                Ok(col)
            }
        }
    }

    /// Evaluate the given columns one after another.
    pub fn columns(&self, problem: &Problem, x: &[f64], indices: &[usize]) -> OptResult<Vec<Column>> {
        indices
            .iter()
            .map(|&j| Ok((j, self.column(problem, x, j)?)))
            .collect()
    }

    /// Evaluate the given columns on the rayon pool.
    pub fn columns_threaded(&self, problem: &Problem, x: &[f64], indices: &[usize]) -> OptResult<Vec<Column>> {
        indices
            .par_iter()
            .map(|&j| Ok((j, self.column(problem, x, j)?)))
            .collect()
    }
}
