//! Solver adapters
//!
//! An adapter hands a [`Problem`] to one solver, lets the solver pull values
//! and Jacobians through an [`NlpBridge`], and turns the native result into a
//! [`Solution`] in the problem's history.

mod alm;
mod bfgs;
mod options;

pub use alm::Alm;
pub use bfgs::Bfgs;
pub use options::{OptionPolicy, OptionSchema, OptionValue, Options};

use ndarray::{Array1, Array2};
use paropt_solvers::{return_code, ConstraintRow, NlpProblem, Termination, Values};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{info, warn};

use crate::derivative::{DerivativeEngine, SensitivityMode, SensitivityType};
use crate::error::{OptError, OptResult};
use crate::history::{SolveStats, SolveStatus, Solution, SolvedConstraint, SolvedVariable};
use crate::parallel::ExecutionContext;
use crate::problem::{ConstraintKind, Evaluation, Problem};

/// Map a native return code onto the solver-neutral status.
pub fn normalize_status(code: i32) -> SolveStatus {
    match code {
        return_code::SOLVE_SUCCEEDED => SolveStatus::Optimal,
        return_code::SOLVED_TO_ACCEPTABLE_LEVEL | return_code::SEARCH_DIRECTION_TOO_SMALL => SolveStatus::Acceptable,
        return_code::INFEASIBLE_PROBLEM_DETECTED => SolveStatus::Infeasible,
        return_code::MAXIMUM_ITERATIONS_EXCEEDED => SolveStatus::IterationLimit,
        _ => SolveStatus::Diverged,
    }
}

fn describe(code: i32) -> String {
    let text = match code {
        return_code::SOLVE_SUCCEEDED => "Solve succeeded",
        return_code::SOLVED_TO_ACCEPTABLE_LEVEL => "Solved to acceptable level",
        return_code::INFEASIBLE_PROBLEM_DETECTED => "Converged to a point of local infeasibility",
        return_code::SEARCH_DIRECTION_TOO_SMALL => "Search direction becomes too small",
        return_code::DIVERGING_ITERATES => "Iterates diverging",
        return_code::MAXIMUM_ITERATIONS_EXCEEDED => "Maximum number of iterations exceeded",
        return_code::LINE_SEARCH_FAILED => "Line search failed",
        _ => "Unrecognized return code",
    };
    format!("{} (code {})", text, code)
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    evaluations: usize,
    jacobians: usize,
    sensitivity_evaluations: usize,
}

/// The problem as the bundled solvers see it: constraint targets are
/// subtracted so every row reads `c(x) <= 0` or `c(x) == 0`.
pub struct NlpBridge<'a> {
    problem: &'a Problem,
    engine: &'a DerivativeEngine,
    ctx: &'a ExecutionContext,
    targets: Vec<f64>,
    rows: Vec<ConstraintRow>,
    /// Last evaluation, reused as the finite-difference baseline.
    last: Option<(Array1<f64>, Evaluation)>,
    counters: Counters,
}

impl<'a> NlpBridge<'a> {
    fn new(problem: &'a Problem, engine: &'a DerivativeEngine, ctx: &'a ExecutionContext) -> Self {
        for v in problem.variables().filter(|v| !v.is_continuous()) {
            warn!(variable = %v.name, kind = %v.kind, "relaxing to a continuous variable");
        }
        Self {
            problem,
            engine,
            ctx,
            targets: problem.constraints().map(|c| c.target).collect(),
            rows: problem
                .constraints()
                .map(|c| match c.kind {
                    ConstraintKind::Inequality => ConstraintRow::LessEqual,
                    ConstraintKind::Equality => ConstraintRow::Equal,
                })
                .collect(),
            last: None,
            counters: Counters::default(),
        }
    }
}

impl NlpProblem for NlpBridge<'_> {
    type Error = OptError;

    fn num_variables(&self) -> usize {
        self.problem.num_variables()
    }

    fn bounds(&self) -> (Array1<f64>, Array1<f64>) {
        let (lower, upper) = self.problem.bounds();
        (Array1::from(lower), Array1::from(upper))
    }

    fn initial_point(&self) -> Array1<f64> {
        Array1::from(self.problem.initial_point())
    }

    fn constraint_rows(&self) -> Vec<ConstraintRow> {
        self.rows.clone()
    }

    fn evaluate(&mut self, x: &Array1<f64>) -> OptResult<Values> {
        let eval = self.problem.evaluate(&x.to_vec())?;
        self.counters.evaluations += 1;
        let shifted: Array1<f64> = eval
            .g
            .iter()
            .zip(&self.targets)
            .map(|(g, t)| g - t)
            .collect();
        let values = Values::new(eval.f, shifted);
        self.last = Some((x.clone(), eval));
        Ok(values)
    }

    fn jacobian(&mut self, x: &Array1<f64>) -> OptResult<Array2<f64>> {
        let baseline = match &self.last {
            Some((at, eval)) if at == x => Some(eval),
            _ => None,
        };
        let jac = self
            .engine
            .jacobian_at(self.problem, &x.to_vec(), baseline, self.ctx)?;
        self.counters.jacobians += 1;
        self.counters.sensitivity_evaluations += jac.evaluations();
        Ok(jac.into_matrix())
    }
}

/// A solver wrapped behind string-keyed options.
pub trait SolverAdapter {
    fn name(&self) -> &str;

    fn set_option(&mut self, key: &str, value: OptionValue) -> OptResult<()>;

    /// Effective value of every option.
    fn options(&self) -> BTreeMap<String, OptionValue>;

    /// Run the native solver on the bridged problem.
    fn run(&self, nlp: &mut NlpBridge<'_>) -> OptResult<Termination>;

    fn set(&mut self, key: &str, value: impl Into<OptionValue>) -> OptResult<()>
    where
        Self: Sized,
    {
        self.set_option(key, value.into())
    }

    /// Solve `problem` and record the outcome in its history.
    ///
    /// Root returns `Some(index)` of the new solution. Other ranks return
    /// `None`: immediately in sequential and threads mode, or once root
    /// finishes when they serve parallel sensitivity requests.
    ///
    /// Infeasible, diverged and iteration-limited runs are still recorded;
    /// their index travels in [`OptError::SolverInfeasible`] or
    /// [`OptError::SolverDiverged`]. Errors from the model, the derivative
    /// engine or the ranks record nothing.
    fn solve(
        &self,
        problem: &mut Problem,
        ctx: &ExecutionContext,
        sensitivity: SensitivityType,
        mode: SensitivityMode,
    ) -> OptResult<Option<usize>> {
        self.solve_with(problem, ctx, DerivativeEngine::new(sensitivity, mode))
    }

    /// [`solve`](Self::solve) with a preconfigured engine, e.g. one with a
    /// complex-step fallback or a round-robin partition.
    fn solve_with(
        &self,
        problem: &mut Problem,
        ctx: &ExecutionContext,
        engine: DerivativeEngine,
    ) -> OptResult<Option<usize>> {
        let parallel = engine.mode() == SensitivityMode::Parallel;
        if !ctx.is_root() {
            if !parallel {
                return Ok(None);
            }
            engine.handshake(problem, ctx)?;
            engine.serve(problem, ctx)?;
            return Ok(None);
        }

        info!(
            problem = problem.name(),
            optimizer = self.name(),
            sensitivity = %engine.sensitivity(),
            mode = %engine.mode(),
            ranks = ctx.size(),
            "solve started"
        );
        let started = Instant::now();
        let outcome = run_on_root(self, problem, ctx, &engine);
        if parallel {
            if let Err(release_err) = engine.release(ctx, outcome.as_ref().err()) {
                if outcome.is_ok() {
                    return Err(release_err);
                }
                warn!(error = %release_err, "failed to release worker ranks");
            }
        }
        let (termination, counters) = outcome?;

        let status = normalize_status(termination.code);
        let solution = build_solution(
            self,
            problem,
            &termination,
            status,
            SolveStats {
                wall_time: started.elapsed(),
                iterations: termination.iterations,
                evaluations: counters.evaluations,
                jacobian_evaluations: counters.jacobians,
                sensitivity_evaluations: counters.sensitivity_evaluations,
                sensitivity: engine.sensitivity(),
                mode: engine.mode(),
                ranks: if parallel { ctx.size() } else { 1 },
            },
        );
        let index = problem.record(solution);
        info!(
            problem = problem.name(),
            index,
            %status,
            objective = termination.objective,
            "solve finished"
        );

        match status {
            SolveStatus::Optimal | SolveStatus::Acceptable => Ok(Some(index)),
            SolveStatus::Infeasible => Err(OptError::SolverInfeasible { index }),
            status => Err(OptError::SolverDiverged { index, status }),
        }
    }
}

fn run_on_root<A: SolverAdapter + ?Sized>(
    adapter: &A,
    problem: &Problem,
    ctx: &ExecutionContext,
    engine: &DerivativeEngine,
) -> OptResult<(Termination, Counters)> {
    if engine.mode() == SensitivityMode::Parallel {
        engine.handshake(problem, ctx)?;
    }
    let mut bridge = NlpBridge::new(problem, engine, ctx);
    let termination = adapter.run(&mut bridge)?;
    Ok((termination, bridge.counters))
}

fn build_solution<A: SolverAdapter + ?Sized>(
    adapter: &A,
    problem: &Problem,
    termination: &Termination,
    status: SolveStatus,
    stats: SolveStats,
) -> Solution {
    let variables = problem
        .variables()
        .zip(termination.variables.iter())
        .map(|(v, value)| SolvedVariable {
            name: v.name.clone(),
            kind: v.kind,
            lower: v.lower,
            upper: v.upper,
            value: *value,
        })
        .collect();
    let constraints = problem
        .constraints()
        .zip(termination.constraints.iter().zip(termination.multipliers.iter()))
        .map(|(c, (value, multiplier))| SolvedConstraint {
            name: c.name.clone(),
            kind: c.kind,
            target: c.target,
            value: value + c.target,
            multiplier: *multiplier,
        })
        .collect();
    Solution {
        index: 0,
        problem: problem.name().to_string(),
        optimizer: adapter.name().to_string(),
        status,
        message: describe(termination.code),
        objective_name: problem
            .objectives()
            .next()
            .map(|o| o.name.clone())
            .unwrap_or_default(),
        objective: termination.objective,
        variables,
        constraints,
        objective_history: termination.history.clone(),
        stats,
        options: adapter.options(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::VariableKind;

    #[test]
    fn test_status_mapping() {
        assert_eq!(normalize_status(0), SolveStatus::Optimal);
        assert_eq!(normalize_status(1), SolveStatus::Acceptable);
        assert_eq!(normalize_status(3), SolveStatus::Acceptable);
        assert_eq!(normalize_status(2), SolveStatus::Infeasible);
        assert_eq!(normalize_status(4), SolveStatus::Diverged);
        assert_eq!(normalize_status(-2), SolveStatus::Diverged);
        assert_eq!(normalize_status(-1), SolveStatus::IterationLimit);
        assert_eq!(normalize_status(42), SolveStatus::Diverged);
    }

    #[test]
    fn test_bridge_shifts_targets_and_reuses_baseline() {
        let mut problem = Problem::new("shift", |x: &[f64]| Evaluation::new(x[0] * x[0], vec![x[0] + x[1]]));
        problem.add_variable("a", VariableKind::Integer, 0.0, 4.0, 1.0).unwrap();
        problem.add_variable("b", VariableKind::Continuous, 0.0, 4.0, 2.0).unwrap();
        problem.add_objective("f").unwrap();
        problem
            .add_constraint_with_target("sum", ConstraintKind::Equality, 5.0)
            .unwrap();

        let engine = DerivativeEngine::new(SensitivityType::finite_difference(), SensitivityMode::Sequential);
        let ctx = ExecutionContext::single();
        let mut bridge = NlpBridge::new(&problem, &engine, &ctx);
        assert_eq!(bridge.constraint_rows(), vec![ConstraintRow::Equal]);

        let x = bridge.initial_point();
        let values = bridge.evaluate(&x).unwrap();
        assert_eq!(values.constraints[0], -2.0);

        let jac = bridge.jacobian(&x).unwrap();
        assert_eq!(jac.dim(), (2, 2));
        // baseline came from the cached evaluation
        assert_eq!(bridge.counters.sensitivity_evaluations, 2);
        assert_eq!(bridge.counters.evaluations, 1);
    }
}
