use approx::assert_abs_diff_eq;
use paropt::{
    Alm, AnalyticModel, Bfgs, ComplexStepFallback, ConstraintKind, DerivativeEngine, Evaluation,
    ExecutionContext, Holomorphic, OptError, OptResult, Problem, Scalar, Sensitivity,
    SensitivityMode, SensitivityType, SolveStatus, SolverAdapter, ThreadGroup, VariableKind,
    WithGradient,
};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;

/// Schittkowski test problem 37.
struct Tp37;

impl AnalyticModel for Tp37 {
    fn evaluate<T: Scalar>(&self, x: &[T]) -> Evaluation<T> {
        let two = T::from_real(2.0);
        let s = x[0] + two * x[1] + two * x[2];
        Evaluation::new(-(x[0] * x[1] * x[2]), vec![s - T::from_real(72.0), -s])
    }
}

fn tp37_real(x: &[f64]) -> Evaluation {
    let s = x[0] + 2.0 * x[1] + 2.0 * x[2];
    Evaluation::new(-x[0] * x[1] * x[2], vec![s - 72.0, -s])
}

fn tp37_gradient(x: &[f64]) -> Sensitivity {
    Sensitivity::new(
        vec![-x[1] * x[2], -x[0] * x[2], -x[0] * x[1]],
        vec![vec![1.0, 2.0, 2.0], vec![-1.0, -2.0, -2.0]],
    )
}

fn declare(mut problem: Problem) -> Problem {
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

fn tp37() -> Problem {
    declare(Problem::new("TP37", Holomorphic(Tp37)))
}

fn assert_tp37_optimum(x: &[f64], f: f64) {
    assert_abs_diff_eq!(f, -3456.0, epsilon = 1e-3);
    assert_abs_diff_eq!(x[0], 24.0, epsilon = 1e-3);
    assert_abs_diff_eq!(x[1], 12.0, epsilon = 1e-3);
    assert_abs_diff_eq!(x[2], 12.0, epsilon = 1e-3);
}

fn solve_sequential(sensitivity: SensitivityType, mode: SensitivityMode) -> Problem {
    let mut problem = tp37();
    let ctx = ExecutionContext::single();
    let index = Alm::new()
        .solve(&mut problem, &ctx, sensitivity, mode)
        .unwrap()
        .unwrap();
    assert_eq!(index, 0);
    problem
}

#[test]
fn test_tp37_sequential_complex_step() {
    let problem = solve_sequential(SensitivityType::complex_step(), SensitivityMode::Sequential);
    let solution = problem.solution(0).unwrap();

    assert_eq!(solution.status, SolveStatus::Optimal);
    assert_tp37_optimum(&solution.x(), solution.objective);
    assert_eq!(solution.optimizer, "alm");
    assert_eq!(solution.constraints.len(), 2);
    assert_abs_diff_eq!(solution.constraints[0].value, 0.0, epsilon = 1e-3);
    assert_abs_diff_eq!(solution.constraints[0].multiplier, 144.0, epsilon = 1e-1);
    assert!(solution.stats.jacobian_evaluations > 0);
    // complex step spends one call per variable
    assert_eq!(solution.stats.sensitivity_evaluations, 3 * solution.stats.jacobian_evaluations);
}

#[test]
fn test_tp37_parallel_matches_sequential() {
    let sequential = solve_sequential(SensitivityType::complex_step(), SensitivityMode::Sequential);
    let reference = sequential.solution(0).unwrap();

    for ranks in [2, 3, 4] {
        let results: Vec<(OptResult<Option<usize>>, Option<Vec<f64>>)> = ThreadGroup::run(ranks, |ctx| {
            let mut problem = tp37();
            let result = Alm::new().solve(
                &mut problem,
                &ctx,
                SensitivityType::complex_step(),
                SensitivityMode::Parallel,
            );
            let x = problem.solutions().last().map(|s| s.x());
            (result, x)
        });

        let (root_result, root_x) = &results[0];
        assert_eq!(root_result, &Ok(Some(0)));
        let x = root_x.as_ref().unwrap();
        for (a, b) in x.iter().zip(reference.x()) {
            assert_abs_diff_eq!(*a, b, epsilon = 1e-4);
        }
        for (result, x) in &results[1..] {
            assert_eq!(result, &Ok(None));
            assert!(x.is_none());
        }
    }
}

#[test]
fn test_tp37_parallel_records_rank_count() {
    let stats: Vec<Option<(usize, SensitivityMode)>> = ThreadGroup::run(3, |ctx| {
        let mut problem = tp37();
        Alm::new()
            .solve(&mut problem, &ctx, SensitivityType::complex_step(), SensitivityMode::Parallel)
            .unwrap()
            .map(|index| {
                let solution = problem.solution(index).unwrap();
                assert_tp37_optimum(&solution.x(), solution.objective);
                (solution.stats.ranks, solution.stats.mode)
            })
    });
    assert_eq!(stats[0], Some((3, SensitivityMode::Parallel)));
    assert_eq!(stats[1], None);
}

#[test]
fn test_tp37_finite_difference() {
    let problem = solve_sequential(SensitivityType::finite_difference(), SensitivityMode::Sequential);
    let solution = problem.solution(0).unwrap();
    assert!(solution.status.is_success());
    assert_abs_diff_eq!(solution.objective, -3456.0, epsilon = 1e-2);
    assert_abs_diff_eq!(solution.x()[0], 24.0, epsilon = 1e-2);
}

#[test]
fn test_tp37_threads_mode_matches_sequential() {
    let sequential = solve_sequential(SensitivityType::complex_step(), SensitivityMode::Sequential);
    let threaded = solve_sequential(SensitivityType::complex_step(), SensitivityMode::Threads);
    let (a, b) = (sequential.solution(0).unwrap(), threaded.solution(0).unwrap());
    for (x, y) in a.x().iter().zip(b.x()) {
        assert_abs_diff_eq!(*x, y, epsilon = 1e-12);
    }
}

#[test]
fn test_tp37_analytic_gradient() {
    let mut problem = declare(Problem::new("TP37", WithGradient::new(tp37_real, tp37_gradient)));
    let ctx = ExecutionContext::single();
    let index = Alm::new()
        .solve(&mut problem, &ctx, SensitivityType::Analytic, SensitivityMode::Sequential)
        .unwrap()
        .unwrap();
    let solution = problem.solution(index).unwrap();
    assert_tp37_optimum(&solution.x(), solution.objective);
    assert_eq!(solution.stats.sensitivity_evaluations, solution.stats.jacobian_evaluations);
}

#[test]
fn test_complex_step_on_real_only_model() {
    let ctx = ExecutionContext::single();
    let mut problem = declare(Problem::new("TP37", tp37_real));
    let err = Alm::new()
        .solve(&mut problem, &ctx, SensitivityType::complex_step(), SensitivityMode::Sequential)
        .unwrap_err();
    assert_eq!(err, OptError::ComplexStepUnsupported);
    assert_eq!(problem.solutions().count(), 0);

    let engine = DerivativeEngine::new(SensitivityType::complex_step(), SensitivityMode::Sequential)
        .with_fallback(ComplexStepFallback::FiniteDifference);
    let index = Alm::new().solve_with(&mut problem, &ctx, engine).unwrap().unwrap();
    assert_eq!(index, 0);
}

#[test]
fn test_worker_failure_fails_every_rank() {
    let results: Vec<(OptResult<Option<usize>>, usize)> = ThreadGroup::run(3, |ctx| {
        let rank = ctx.rank();
        let model = move |x: &[f64]| {
            if rank == 2 {
                Evaluation::failed(5)
            } else {
                tp37_real(x)
            }
        };
        let mut problem = declare(Problem::new("TP37", model));
        let result = Alm::new().solve(
            &mut problem,
            &ctx,
            SensitivityType::finite_difference(),
            SensitivityMode::Parallel,
        );
        (result, problem.solutions().count())
    });

    for (result, count) in &results {
        match result {
            Err(OptError::DerivativeEvaluation { failures }) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].rank, 2);
            }
            other => panic!("expected derivative failure, got {:?}", other),
        }
        assert_eq!(*count, 0);
    }
}

#[test]
fn test_worker_panic_releases_every_rank() {
    let outcomes = Mutex::new(BTreeMap::new());
    let joined = catch_unwind(AssertUnwindSafe(|| {
        ThreadGroup::run(3, |ctx| {
            let rank = ctx.rank();
            let model = move |x: &[f64]| {
                if rank == 2 {
                    panic!("model crashed on rank 2");
                }
                tp37_real(x)
            };
            let mut problem = declare(Problem::new("TP37", model));
            let result = Alm::new().solve(
                &mut problem,
                &ctx,
                SensitivityType::finite_difference(),
                SensitivityMode::Parallel,
            );
            outcomes
                .lock()
                .unwrap()
                .insert(rank, (result, problem.solutions().count()));
        })
    }));

    // the panic resurfaces once the surviving ranks have returned
    assert!(joined.is_err());
    let outcomes = outcomes.into_inner().unwrap();
    assert_eq!(outcomes.len(), 2);
    let (root, recorded) = &outcomes[&0];
    assert!(matches!(root, Err(OptError::Communication(_))));
    assert_eq!(*recorded, 0);
    assert!(outcomes[&1].0.is_err());
}

#[test]
fn test_sequential_mode_releases_workers_immediately() {
    let results = ThreadGroup::run(2, |ctx| {
        let mut problem = tp37();
        Alm::new()
            .solve(&mut problem, &ctx, SensitivityType::complex_step(), SensitivityMode::Sequential)
            .map(|index| (index, problem.solutions().count()))
    });
    assert_eq!(results[0], Ok((Some(0), 1)));
    assert_eq!(results[1], Ok((None, 0)));
}

#[test]
fn test_iteration_limit_is_recorded() {
    let mut problem = tp37();
    let ctx = ExecutionContext::single();
    let mut alm = Alm::new();
    alm.set("max_iter", 1).unwrap();

    let err = alm
        .solve(&mut problem, &ctx, SensitivityType::complex_step(), SensitivityMode::Sequential)
        .unwrap_err();
    assert_eq!(
        err,
        OptError::SolverDiverged {
            index: 0,
            status: SolveStatus::IterationLimit
        }
    );
    let solution = problem.solution(0).unwrap();
    assert_eq!(solution.status, SolveStatus::IterationLimit);
    assert_eq!(solution.options["max_iter"], 1usize.into());
}

struct Contradiction;

impl AnalyticModel for Contradiction {
    fn evaluate<T: Scalar>(&self, x: &[T]) -> Evaluation<T> {
        let one = T::from_real(1.0);
        Evaluation::new(x[0] * x[0], vec![one - x[0], x[0] + one])
    }
}

#[test]
fn test_infeasible_problem_is_recorded() {
    let mut problem = Problem::new("contradiction", Holomorphic(Contradiction));
    problem
        .add_variable("x", VariableKind::Continuous, -5.0, 5.0, 0.0)
        .unwrap();
    problem.add_objective("f").unwrap();
    problem.add_constraint("above", ConstraintKind::Inequality).unwrap();
    problem.add_constraint("below", ConstraintKind::Inequality).unwrap();

    let ctx = ExecutionContext::single();
    let err = Alm::new()
        .solve(&mut problem, &ctx, SensitivityType::complex_step(), SensitivityMode::Sequential)
        .unwrap_err();
    assert_eq!(err, OptError::SolverInfeasible { index: 0 });
    assert_eq!(problem.solution(0).unwrap().status, SolveStatus::Infeasible);
}

struct Bowl;

impl AnalyticModel for Bowl {
    fn evaluate<T: Scalar>(&self, x: &[T]) -> Evaluation<T> {
        let a = x[0] - T::from_real(3.0);
        let b = x[1] + T::from_real(1.0);
        Evaluation::new(a * a + b * b, vec![])
    }
}

#[test]
fn test_bfgs_adapter() {
    let mut problem = Problem::new("bowl", Holomorphic(Bowl));
    problem.add_variable("x", VariableKind::Continuous, 0.0, 2.0, 0.5).unwrap();
    problem.add_variable("y", VariableKind::Continuous, -5.0, 5.0, 4.0).unwrap();
    problem.add_objective("f").unwrap();

    let ctx = ExecutionContext::single();
    let index = Bfgs::new()
        .solve(&mut problem, &ctx, SensitivityType::complex_step(), SensitivityMode::Sequential)
        .unwrap()
        .unwrap();
    let x = problem.solution(index).unwrap().x();
    assert_abs_diff_eq!(x[0], 2.0, epsilon = 1e-8);
    assert_abs_diff_eq!(x[1], -1.0, epsilon = 1e-5);
}

#[test]
fn test_bfgs_rejects_general_constraints() {
    let mut problem = tp37();
    let ctx = ExecutionContext::single();
    let err = Bfgs::new()
        .solve(&mut problem, &ctx, SensitivityType::complex_step(), SensitivityMode::Sequential)
        .unwrap_err();
    assert!(matches!(err, OptError::Unsupported(_)));
    assert_eq!(problem.solutions().count(), 0);
}

#[test]
fn test_repeated_solves_append_in_order() {
    let mut problem = tp37();
    let ctx = ExecutionContext::single();
    let alm = Alm::new();
    for expected in 0..2 {
        let index = alm
            .solve(&mut problem, &ctx, SensitivityType::complex_step(), SensitivityMode::Sequential)
            .unwrap()
            .unwrap();
        assert_eq!(index, expected);
    }
    // declared values stay the starting point
    assert_eq!(problem.initial_point(), vec![10.0; 3]);
    assert_eq!(problem.solutions().count(), 2);
    assert!(matches!(
        problem.solution(2),
        Err(OptError::IndexOutOfRange { index: 2, count: 2 })
    ));

    let json = problem.solution(1).unwrap().to_json().unwrap();
    assert!(json.contains("\"TP37\""));
}
