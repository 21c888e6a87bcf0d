//! Solve Schittkowski TP37 with complex-step sensitivities, first on one
//! rank, then with columns spread over a group of thread-hosted ranks.
//!
//! Run with `cargo run --example parallel_tp37 -- 4` (rank count optional).

use anyhow::{bail, Context, Result};
use paropt::{
    Alm, AnalyticModel, ConstraintKind, Evaluation, ExecutionContext, Holomorphic, Problem, Scalar,
    SensitivityMode, SensitivityType, SolverAdapter, ThreadGroup, VariableKind,
};

struct Tp37;

impl AnalyticModel for Tp37 {
    fn evaluate<T: Scalar>(&self, x: &[T]) -> Evaluation<T> {
        let two = T::from_real(2.0);
        let s = x[0] + two * x[1] + two * x[2];
        Evaluation::new(-(x[0] * x[1] * x[2]), vec![s - T::from_real(72.0), -s])
    }
}

fn build() -> Result<Problem> {
    let mut problem = Problem::new("TP37 Constrained Problem", Holomorphic(Tp37));
    for name in ["x1", "x2", "x3"] {
        problem.add_variable(name, VariableKind::Continuous, 0.0, 42.0, 10.0)?;
    }
    problem.add_objective("obj")?;
    problem.add_constraint("con1", ConstraintKind::Inequality)?;
    problem.add_constraint("con2", ConstraintKind::Inequality)?;
    Ok(problem)
}

fn solver() -> Result<Alm> {
    let mut alm = Alm::new();
    alm.set("print_level", 1)?;
    alm.set("tol", 1e-8)?;
    Ok(alm)
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let ranks: usize = match std::env::args().nth(1) {
        Some(arg) => arg.parse().context("rank count must be a positive integer")?,
        None => 4,
    };
    if ranks == 0 {
        bail!("rank count must be a positive integer");
    }

    println!("paropt v{}", paropt::version());
    println!("==========================================");
    println!();

    println!("=== Sequential complex step ===");
    let mut problem = build()?;
    println!("{}", problem);
    let ctx = ExecutionContext::single();
    let index = solver()?
        .solve(&mut problem, &ctx, SensitivityType::complex_step(), SensitivityMode::Sequential)?
        .context("root rank returned no solution")?;
    let sequential = problem.solution(index)?;
    println!("{}", sequential);

    println!();
    println!("=== Parallel complex step over {} ranks ===", ranks);
    let reports = ThreadGroup::run(ranks, |ctx| -> Result<Option<String>> {
        let mut problem = build()?;
        let solved = solver()?.solve(
            &mut problem,
            &ctx,
            SensitivityType::complex_step(),
            SensitivityMode::Parallel,
        )?;
        match solved {
            Some(index) => Ok(Some(problem.solution(index)?.to_string())),
            None => Ok(None),
        }
    });
    for (rank, report) in reports.into_iter().enumerate() {
        match report.with_context(|| format!("rank {} failed", rank))? {
            Some(text) => println!("{}", text),
            None => println!("rank {} served sensitivity columns", rank),
        }
    }
    Ok(())
}
