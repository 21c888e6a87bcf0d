//! Derivative engine
//!
//! Computes the Jacobian of `[f; g]` with respect to `x` by forward finite
//! differences, complex step, or the model's analytic gradient. Perturbation
//! columns can be evaluated on the calling thread, on the rayon pool, or
//! spread across the ranks of an [`ExecutionContext`] ("pgc", parallel
//! gradient by columns).

mod kernel;
mod partition;
mod pgc;

pub use partition::Partition;

use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::error::{OptError, OptResult};
use crate::parallel::ExecutionContext;
use crate::problem::{Evaluation, Problem};
use kernel::{Baseline, Column, Kernel};

pub const DEFAULT_FD_STEP: f64 = 1e-6;
pub const DEFAULT_CS_STEP: f64 = 1e-20;

/// How sensitivities are obtained.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SensitivityType {
    /// Forward difference `(F(x + h e_j) - F(x)) / h`.
    FiniteDifference { step: f64 },
    /// `Im(F(x + i h e_j)) / h`.
    ComplexStep { step: f64 },
    /// The model's own gradient.
    Analytic,
}

impl SensitivityType {
    pub fn finite_difference() -> Self {
        SensitivityType::FiniteDifference {
            step: DEFAULT_FD_STEP,
        }
    }

    pub fn complex_step() -> Self {
        SensitivityType::ComplexStep {
            step: DEFAULT_CS_STEP,
        }
    }
}

impl Default for SensitivityType {
    fn default() -> Self {
        Self::finite_difference()
    }
}

impl fmt::Display for SensitivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensitivityType::FiniteDifference { step } => write!(f, "FD (h = {:e})", step),
            SensitivityType::ComplexStep { step } => write!(f, "CS (h = {:e})", step),
            SensitivityType::Analytic => write!(f, "analytic"),
        }
    }
}

impl FromStr for SensitivityType {
    type Err = OptError;

    /// `"FD"` and `"CS"` use the default steps.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fd" | "finite-difference" => Ok(Self::finite_difference()),
            "cs" | "complex-step" => Ok(Self::complex_step()),
            "analytic" | "user" => Ok(SensitivityType::Analytic),
            other => Err(OptError::InvalidOption {
                key: "sensitivity type".to_string(),
                reason: format!("expected FD, CS or analytic, got '{}'", other),
            }),
        }
    }
}

/// Where perturbation columns are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SensitivityMode {
    /// Every column on the calling thread.
    #[default]
    Sequential,
    /// Columns on the rayon thread pool of the calling rank.
    Threads,
    /// Columns partitioned across all ranks of the execution context.
    Parallel,
}

impl fmt::Display for SensitivityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SensitivityMode::Sequential => "sequential",
            SensitivityMode::Threads => "threads",
            SensitivityMode::Parallel => "pgc",
        };
        write!(f, "{}", text)
    }
}

impl FromStr for SensitivityMode {
    type Err = OptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "sequential" => Ok(SensitivityMode::Sequential),
            "threads" => Ok(SensitivityMode::Threads),
            "pgc" | "parallel" => Ok(SensitivityMode::Parallel),
            other => Err(OptError::InvalidOption {
                key: "sensitivity mode".to_string(),
                reason: format!("expected '', pgc or threads, got '{}'", other),
            }),
        }
    }
}

/// What to do when complex step is requested for a real-only model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ComplexStepFallback {
    /// Fail with [`OptError::ComplexStepUnsupported`].
    #[default]
    Error,
    /// Warn and use forward differences with the default step.
    FiniteDifference,
}

/// `(1 + constraints) x variables` sensitivity matrix. Row 0 is the
/// objective gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct Jacobian {
    matrix: Array2<f64>,
    evaluations: usize,
}

impl Jacobian {
    fn from_columns(rows: usize, n: usize, columns: Vec<Column>, evaluations: usize) -> OptResult<Self> {
        let mut matrix = Array2::<f64>::zeros((rows, n));
        let mut filled = vec![false; n];
        for (j, col) in columns {
            if j >= n || filled[j] {
                return Err(OptError::Communication(format!(
                    "column {} reported out of range or twice",
                    j
                )));
            }
            if col.len() != rows {
                return Err(OptError::ShapeMismatch {
                    what: "jacobian column",
                    expected: rows,
                    found: col.len(),
                });
            }
            for (i, v) in col.into_iter().enumerate() {
                matrix[[i, j]] = v;
            }
            filled[j] = true;
        }
        if let Some(j) = filled.iter().position(|done| !done) {
            return Err(OptError::Communication(format!("column {} never reported", j)));
        }
        Ok(Self { matrix, evaluations })
    }

    pub fn matrix(&self) -> &Array2<f64> {
        &self.matrix
    }

    pub fn into_matrix(self) -> Array2<f64> {
        self.matrix
    }

    pub fn objective_gradient(&self) -> ArrayView1<'_, f64> {
        self.matrix.row(0)
    }

    pub fn constraint_gradient(&self, index: usize) -> ArrayView1<'_, f64> {
        self.matrix.row(1 + index)
    }

    /// Model calls spent on this matrix, summed over every rank.
    pub fn evaluations(&self) -> usize {
        self.evaluations
    }
}

/// Resolved per-request method; complex step may have fallen back.
#[derive(Debug, Clone, Copy)]
enum Method {
    Forward(f64),
    Complex(f64),
    Analytic,
}

/// Jacobian producer for one problem and execution context.
///
/// In [`SensitivityMode::Parallel`] only the root rank calls
/// [`jacobian`](Self::jacobian); the other ranks run
/// [`serve`](Self::serve) between a common [`handshake`](Self::handshake)
/// and root's [`release`](Self::release). Models must be free of side effects
/// since every rank calls its own copy.
#[derive(Debug)]
pub struct DerivativeEngine {
    sensitivity: SensitivityType,
    mode: SensitivityMode,
    fallback: ComplexStepFallback,
    partition: Partition,
    /// Whether the model accepted complex input, once probed.
    complex_support: Cell<Option<bool>>,
}

impl DerivativeEngine {
    pub fn new(sensitivity: SensitivityType, mode: SensitivityMode) -> Self {
        Self {
            sensitivity,
            mode,
            fallback: ComplexStepFallback::default(),
            partition: Partition::default(),
            complex_support: Cell::new(None),
        }
    }

    pub fn with_fallback(mut self, fallback: ComplexStepFallback) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_partition(mut self, partition: Partition) -> Self {
        self.partition = partition;
        self
    }

    pub fn sensitivity(&self) -> SensitivityType {
        self.sensitivity
    }

    pub fn mode(&self) -> SensitivityMode {
        self.mode
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }

    /// Jacobian of `[f; g]` at `x`.
    pub fn jacobian(&self, problem: &Problem, x: &[f64], ctx: &ExecutionContext) -> OptResult<Jacobian> {
        self.jacobian_at(problem, x, None, ctx)
    }

    /// Like [`jacobian`](Self::jacobian), reusing an evaluation already made
    /// at exactly `x` as the finite-difference baseline.
    pub fn jacobian_at(
        &self,
        problem: &Problem,
        x: &[f64],
        baseline: Option<&Evaluation>,
        ctx: &ExecutionContext,
    ) -> OptResult<Jacobian> {
        if x.len() != problem.num_variables() {
            return Err(OptError::ShapeMismatch {
                what: "x",
                expected: problem.num_variables(),
                found: x.len(),
            });
        }
        if self.mode == SensitivityMode::Parallel && !ctx.is_root() {
            return Err(OptError::Communication(format!(
                "rank {} cannot request a parallel jacobian",
                ctx.rank()
            )));
        }
        debug!(sensitivity = %self.sensitivity, mode = %self.mode, "jacobian request");

        let rows = 1 + problem.num_constraints();
        let n = problem.num_variables();
        match self.method(problem, x)? {
            Method::Analytic => {
                let sens = problem.gradient(x)?.ok_or(OptError::MissingGradient)?;
                let mut matrix = Array2::<f64>::zeros((rows, n));
                matrix.row_mut(0).assign(&ArrayView1::from(&sens.df));
                for (i, row) in sens.dg.iter().enumerate() {
                    matrix.row_mut(1 + i).assign(&ArrayView1::from(row));
                }
                Ok(Jacobian {
                    matrix,
                    evaluations: 1,
                })
            }
            Method::Forward(step) => {
                let (baseline, spent) = match baseline {
                    Some(eval) => (Baseline::from(eval), 0),
                    None => (Baseline::from(&problem.evaluate(x)?), 1),
                };
                let columns = self.columns(problem, Kernel::Forward { step, baseline }, x, ctx)?;
                Jacobian::from_columns(rows, n, columns, spent + n)
            }
            Method::Complex(step) => {
                let columns = self.columns(problem, Kernel::Complex { step }, x, ctx)?;
                Jacobian::from_columns(rows, n, columns, n)
            }
        }
    }

    fn method(&self, problem: &Problem, x: &[f64]) -> OptResult<Method> {
        match self.sensitivity {
            SensitivityType::FiniteDifference { step } => Ok(Method::Forward(step)),
            SensitivityType::Analytic => Ok(Method::Analytic),
            SensitivityType::ComplexStep { step } => {
                let supported = match self.complex_support.get() {
                    Some(known) => known,
                    None => {
                        let z: Vec<_> = x.iter().map(|&v| num_complex::Complex64::new(v, 0.0)).collect();
                        let known = problem.evaluate_complex(&z)?.is_some();
                        self.complex_support.set(Some(known));
                        if !known && self.fallback == ComplexStepFallback::FiniteDifference {
                            warn!(
                                problem = problem.name(),
                                "model rejects complex input; using finite differences"
                            );
                        }
                        known
                    }
                };
                match (supported, self.fallback) {
                    (true, _) => Ok(Method::Complex(step)),
                    (false, ComplexStepFallback::FiniteDifference) => Ok(Method::Forward(DEFAULT_FD_STEP)),
                    (false, ComplexStepFallback::Error) => Err(OptError::ComplexStepUnsupported),
                }
            }
        }
    }

    fn columns(&self, problem: &Problem, kernel: Kernel, x: &[f64], ctx: &ExecutionContext) -> OptResult<Vec<Column>> {
        let all: Vec<usize> = (0..x.len()).collect();
        match self.mode {
            SensitivityMode::Sequential => kernel.columns(problem, x, &all),
            SensitivityMode::Threads => kernel.columns_threaded(problem, x, &all),
            SensitivityMode::Parallel => pgc::request(problem, kernel, x, self.partition, ctx),
        }
    }

    /// Confirm every rank built the same problem layout. Called by all ranks
    /// before the first parallel request. A mismatch fails on root only;
    /// root must still [`release`](Self::release) the workers.
    pub fn handshake(&self, problem: &Problem, ctx: &ExecutionContext) -> OptResult<()> {
        pgc::handshake(problem, ctx)
    }

    /// Worker loop: evaluate column blocks until root releases the session.
    /// Returns the number of requests served, or the failure root aborted
    /// with.
    pub fn serve(&self, problem: &Problem, ctx: &ExecutionContext) -> OptResult<usize> {
        pgc::serve(problem, ctx)
    }

    /// Release the workers from root: a clean shutdown, or an abort carrying
    /// `error`.
    pub fn release(&self, ctx: &ExecutionContext, error: Option<&OptError>) -> OptResult<()> {
        pgc::release(ctx, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::ThreadGroup;
    use crate::problem::{
        AnalyticModel, ConstraintKind, Holomorphic, Scalar, Sensitivity, VariableKind, WithGradient,
    };
    use approx::assert_relative_eq;

    /// f = x1 x2 x3, g = [x1 + x2, x2 * x3]
    struct Triple;

    impl AnalyticModel for Triple {
        fn evaluate<T: Scalar>(&self, x: &[T]) -> Evaluation<T> {
            Evaluation::new(x[0] * x[1] * x[2], vec![x[0] + x[1], x[1] * x[2]])
        }
    }

    fn exact(x: &[f64]) -> Sensitivity {
        Sensitivity::new(
            vec![x[1] * x[2], x[0] * x[2], x[0] * x[1]],
            vec![vec![1.0, 1.0, 0.0], vec![0.0, x[2], x[1]]],
        )
    }

    fn build(model: impl crate::problem::Model + 'static) -> Problem {
        let mut p = Problem::new("triple", model);
        for (name, v) in [("x1", 2.0), ("x2", 3.0), ("x3", 4.0)] {
            p.add_variable(name, VariableKind::Continuous, 0.0, 10.0, v).unwrap();
        }
        p.add_objective("f").unwrap();
        p.add_constraint("g1", ConstraintKind::Inequality).unwrap();
        p.add_constraint("g2", ConstraintKind::Equality).unwrap();
        p
    }

    fn triple() -> Problem {
        build(WithGradient::new(Holomorphic(Triple), exact))
    }

    fn real_only() -> Problem {
        build(|x: &[f64]| Evaluation::new(x[0] * x[1] * x[2], vec![x[0] + x[1], x[1] * x[2]]))
    }

    const X: [f64; 3] = [2.0, 3.0, 4.0];

    fn analytic_matrix() -> Array2<f64> {
        let ctx = ExecutionContext::single();
        DerivativeEngine::new(SensitivityType::Analytic, SensitivityMode::Sequential)
            .jacobian(&triple(), &X, &ctx)
            .unwrap()
            .into_matrix()
    }

    #[test]
    fn test_parse_sensitivity_settings() {
        assert_eq!("FD".parse::<SensitivityType>().unwrap(), SensitivityType::finite_difference());
        assert_eq!("cs".parse::<SensitivityType>().unwrap(), SensitivityType::complex_step());
        assert_eq!("pgc".parse::<SensitivityMode>().unwrap(), SensitivityMode::Parallel);
        assert_eq!("".parse::<SensitivityMode>().unwrap(), SensitivityMode::Sequential);
        assert!("spline".parse::<SensitivityType>().is_err());
    }

    #[test]
    fn test_finite_difference_matches_analytic() {
        let ctx = ExecutionContext::single();
        let engine = DerivativeEngine::new(SensitivityType::finite_difference(), SensitivityMode::Sequential);
        let jac = engine.jacobian(&triple(), &X, &ctx).unwrap();
        let reference = analytic_matrix();
        assert_eq!(jac.matrix().dim(), (3, 3));
        for (a, b) in jac.matrix().iter().zip(reference.iter()) {
            assert_relative_eq!(*a, *b, max_relative = 1e-4, epsilon = 1e-8);
        }
        // baseline plus one call per column
        assert_eq!(jac.evaluations(), 4);
    }

    #[test]
    fn test_complex_step_matches_analytic() {
        let ctx = ExecutionContext::single();
        let engine = DerivativeEngine::new(SensitivityType::complex_step(), SensitivityMode::Sequential);
        let jac = engine.jacobian(&triple(), &X, &ctx).unwrap();
        let reference = analytic_matrix();
        for (a, b) in jac.matrix().iter().zip(reference.iter()) {
            assert_relative_eq!(*a, *b, max_relative = 1e-12, epsilon = 1e-12);
        }
        assert_relative_eq!(jac.objective_gradient()[0], 12.0, max_relative = 1e-12);
        assert_eq!(jac.evaluations(), 3);
    }

    #[test]
    fn test_reused_baseline_saves_a_call() {
        let ctx = ExecutionContext::single();
        let problem = triple();
        let eval = problem.evaluate(&X).unwrap();
        let engine = DerivativeEngine::new(SensitivityType::finite_difference(), SensitivityMode::Sequential);
        let with = engine.jacobian_at(&problem, &X, Some(&eval), &ctx).unwrap();
        let without = engine.jacobian(&problem, &X, &ctx).unwrap();
        assert_eq!(with.matrix(), without.matrix());
        assert_eq!(with.evaluations() + 1, without.evaluations());
    }

    #[test]
    fn test_complex_step_unsupported() {
        let ctx = ExecutionContext::single();
        let engine = DerivativeEngine::new(SensitivityType::complex_step(), SensitivityMode::Sequential);
        assert_eq!(
            engine.jacobian(&real_only(), &X, &ctx).unwrap_err(),
            OptError::ComplexStepUnsupported
        );
    }

    #[test]
    fn test_complex_step_fallback_to_finite_difference() {
        let ctx = ExecutionContext::single();
        let engine = DerivativeEngine::new(SensitivityType::complex_step(), SensitivityMode::Sequential)
            .with_fallback(ComplexStepFallback::FiniteDifference);
        let jac = engine.jacobian(&real_only(), &X, &ctx).unwrap();
        assert_relative_eq!(jac.matrix()[[0, 0]], 12.0, max_relative = 1e-4);
    }

    #[test]
    fn test_missing_gradient() {
        let ctx = ExecutionContext::single();
        let engine = DerivativeEngine::new(SensitivityType::Analytic, SensitivityMode::Sequential);
        assert_eq!(
            engine.jacobian(&real_only(), &X, &ctx).unwrap_err(),
            OptError::MissingGradient
        );
    }

    #[test]
    fn test_threads_mode_equals_sequential() {
        let ctx = ExecutionContext::single();
        let problem = triple();
        for sens in [SensitivityType::finite_difference(), SensitivityType::complex_step()] {
            let seq = DerivativeEngine::new(sens, SensitivityMode::Sequential)
                .jacobian(&problem, &X, &ctx)
                .unwrap();
            let thr = DerivativeEngine::new(sens, SensitivityMode::Threads)
                .jacobian(&problem, &X, &ctx)
                .unwrap();
            assert_eq!(seq, thr);
        }
    }

    fn parallel_jacobian(
        ranks: usize,
        sens: SensitivityType,
        partition: Partition,
        build: fn() -> Problem,
    ) -> Vec<OptResult<Option<Jacobian>>> {
        ThreadGroup::run(ranks, |ctx| {
            let problem = build();
            let engine = DerivativeEngine::new(sens, SensitivityMode::Parallel).with_partition(partition);
            engine.handshake(&problem, &ctx)?;
            if ctx.is_root() {
                let result = engine.jacobian(&problem, &X, &ctx);
                engine.release(&ctx, result.as_ref().err())?;
                result.map(Some)
            } else {
                engine.serve(&problem, &ctx).map(|_| None)
            }
        })
    }

    #[test]
    fn test_parallel_is_bit_identical_to_sequential() {
        let ctx = ExecutionContext::single();
        for sens in [SensitivityType::finite_difference(), SensitivityType::complex_step()] {
            let reference = DerivativeEngine::new(sens, SensitivityMode::Sequential)
                .jacobian(&triple(), &X, &ctx)
                .unwrap();
            for ranks in 1..=4 {
                for partition in [Partition::Contiguous, Partition::RoundRobin] {
                    let results = parallel_jacobian(ranks, sens, partition, triple);
                    let jac = results[0].as_ref().unwrap().as_ref().unwrap();
                    assert_eq!(jac.matrix(), reference.matrix(), "{} ranks, {:?}", ranks, partition);
                    assert_eq!(jac.evaluations(), reference.evaluations());
                    assert!(results[1..].iter().all(|r| matches!(r, Ok(None))));
                }
            }
        }
    }

    /// Fails whenever x3 is perturbed, which the contiguous partition hands
    /// to the last rank.
    fn fails_on_last_column() -> Problem {
        build(|x: &[f64]| {
            if x[2] != 4.0 {
                Evaluation::failed(3)
            } else {
                Evaluation::new(x[0] * x[1] * x[2], vec![x[0] + x[1], x[1] * x[2]])
            }
        })
    }

    #[test]
    fn test_worker_failure_fails_every_rank() {
        let results = parallel_jacobian(
            3,
            SensitivityType::finite_difference(),
            Partition::Contiguous,
            fails_on_last_column,
        );
        for result in &results {
            match result {
                Err(OptError::DerivativeEvaluation { failures }) => {
                    assert_eq!(failures.len(), 1);
                    assert_eq!(failures[0].rank, 2);
                    assert!(failures[0].reason.contains("fail = 3"));
                }
                other => panic!("expected derivative failure, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_layout_mismatch_aborts_session() {
        let results: Vec<OptResult<()>> = ThreadGroup::run(2, |ctx| {
            let mut problem = triple();
            if !ctx.is_root() {
                problem.add_constraint("extra", ConstraintKind::Inequality)?;
            }
            let engine = DerivativeEngine::new(SensitivityType::complex_step(), SensitivityMode::Parallel);
            let shaken = engine.handshake(&problem, &ctx);
            if ctx.is_root() {
                engine.release(&ctx, shaken.as_ref().err())?;
                shaken
            } else {
                engine.serve(&problem, &ctx).map(|_| ())
            }
        });
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(OptError::DerivativeEvaluation { failures }) if failures[0].rank == 1)));
    }
}
