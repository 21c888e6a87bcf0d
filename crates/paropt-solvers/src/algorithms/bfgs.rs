use crate::common::{
    checked_start, inf_norm, jacobian_shape_check, project, return_code, BfgsConfig, NlpProblem,
    SolverError, SolverResult, Termination,
};
use ndarray::{Array1, Array2};
use tracing::{debug, info};

const ARMIJO: f64 = 1e-4;
const MAX_BACKTRACKS: usize = 60;
const CURVATURE_EPS: f64 = 1e-10;

/// A scalar merit function minimized over a box.
pub(crate) trait Merit {
    type Error;

    fn value(&mut self, x: &Array1<f64>) -> Result<f64, Self::Error>;

    fn gradient(&mut self, x: &Array1<f64>) -> Result<Array1<f64>, Self::Error>;
}

pub(crate) struct InnerSettings {
    pub max_iterations: usize,
    /// Absolute bound on the projected gradient infinity norm.
    pub tolerance: f64,
    pub max_step_ratio: f64,
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InnerStop {
    Converged,
    SmallStep,
    LineSearchFailed,
    IterationLimit,
    NonFinite,
}

pub(crate) struct InnerOutcome {
    pub x: Array1<f64>,
    pub value: f64,
    pub projected_gradient: f64,
    pub iterations: usize,
    pub stop: InnerStop,
    pub trace: Vec<f64>,
}

/// Minimize `merit` over `[lower, upper]` with a projected quasi-Newton method.
///
/// Variables sitting on a bound whose gradient pushes outward are frozen for
/// the step. The inverse Hessian approximation is reset to a scaled identity
/// whenever the masked direction stops being a descent direction.
pub(crate) fn minimize_bounded<M: Merit>(
    merit: &mut M,
    x0: &Array1<f64>,
    lower: &Array1<f64>,
    upper: &Array1<f64>,
    settings: &InnerSettings,
) -> Result<InnerOutcome, M::Error> {
    let n = x0.len();
    let mut x = project(x0, lower, upper);
    let mut value = merit.value(&x)?;
    let mut trace = vec![value];

    let finish = |x: Array1<f64>, value, pg, iterations, stop, trace| InnerOutcome {
        x,
        value,
        projected_gradient: pg,
        iterations,
        stop,
        trace,
    };

    if !value.is_finite() {
        return Ok(finish(x, value, f64::INFINITY, 0, InnerStop::NonFinite, trace));
    }

    let mut grad = merit.gradient(&x)?;
    let mut h: Array2<f64> = Array2::eye(n);
    let mut fresh = true;
    let mut pg_norm = f64::INFINITY;

    for iteration in 0..settings.max_iterations {
        if grad.iter().any(|g| !g.is_finite()) {
            return Ok(finish(x, value, f64::INFINITY, iteration, InnerStop::NonFinite, trace));
        }

        let active = active_set(&x, &grad, lower, upper);
        let pg: Array1<f64> = grad
            .iter()
            .zip(active.iter())
            .map(|(g, frozen)| if *frozen { 0.0 } else { *g })
            .collect();
        pg_norm = inf_norm(&pg);
        if pg_norm <= settings.tolerance {
            return Ok(finish(x, value, pg_norm, iteration, InnerStop::Converged, trace));
        }

        let mut direction = -h.dot(&pg);
        for (d, frozen) in direction.iter_mut().zip(active.iter()) {
            if *frozen {
                *d = 0.0;
            }
        }
        if direction.dot(&pg) >= 0.0 {
            h = Array2::eye(n);
            fresh = true;
            direction = -&pg;
        }

        let cap = settings.max_step_ratio * inf_norm(&x).max(1.0);
        let length = inf_norm(&direction);
        let mut alpha = if length > cap { cap / length } else { 1.0 };

        let mut accepted = None;
        for _ in 0..MAX_BACKTRACKS {
            let trial = project(&(&x + &(&direction * alpha)), lower, upper);
            let step = &trial - &x;
            let trial_value = merit.value(&trial)?;
            if trial_value.is_finite() && trial_value <= value + ARMIJO * grad.dot(&step) {
                accepted = Some((trial, step, trial_value));
                break;
            }
            alpha *= 0.5;
        }
        let Some((trial, step, trial_value)) = accepted else {
            return Ok(finish(
                x,
                value,
                pg_norm,
                iteration,
                InnerStop::LineSearchFailed,
                trace,
            ));
        };

        let trial_grad = merit.gradient(&trial)?;
        let y = &trial_grad - &grad;
        let sy = step.dot(&y);
        if sy > CURVATURE_EPS * step.dot(&step).sqrt() * y.dot(&y).sqrt() {
            if fresh {
                h = Array2::eye(n) * (sy / y.dot(&y));
                fresh = false;
            }
            bfgs_update(&mut h, &step, &y, sy);
        }

        if settings.verbose {
            debug!(
                "inner {:>4}  merit {:>+.10e}  |pg| {:.3e}  alpha {:.3e}",
                iteration, trial_value, pg_norm, alpha
            );
        }

        let stalled = (value - trial_value).abs() <= 1e-15 * (1.0 + value.abs())
            && inf_norm(&step) <= 1e-12 * (1.0 + inf_norm(&x));

        x = trial;
        value = trial_value;
        grad = trial_grad;
        trace.push(value);

        if stalled {
            return Ok(finish(x, value, pg_norm, iteration + 1, InnerStop::SmallStep, trace));
        }
    }

    Ok(finish(
        x,
        value,
        pg_norm,
        settings.max_iterations,
        InnerStop::IterationLimit,
        trace,
    ))
}

/// Variables held on a bound by an outward-pointing gradient.
fn active_set(x: &Array1<f64>, grad: &Array1<f64>, lower: &Array1<f64>, upper: &Array1<f64>) -> Vec<bool> {
    (0..x.len())
        .map(|i| (x[i] <= lower[i] && grad[i] > 0.0) || (x[i] >= upper[i] && grad[i] < 0.0))
        .collect()
}

/// Inverse BFGS update `H <- (I - r s y') H (I - r y s') + r s s'` with `r = 1 / s'y`.
fn bfgs_update(h: &mut Array2<f64>, s: &Array1<f64>, y: &Array1<f64>, sy: f64) {
    let hy = h.dot(y);
    let coef = (sy + y.dot(&hy)) / (sy * sy);
    let n = s.len();
    for i in 0..n {
        for j in 0..n {
            h[[i, j]] += coef * s[i] * s[j] - (hy[i] * s[j] + s[i] * hy[j]) / sy;
        }
    }
}

/// Objective-only merit used by [`ProjectedBfgs`].
struct ObjectiveMerit<'a, P> {
    problem: &'a mut P,
    n: usize,
}

impl<P: NlpProblem> Merit for ObjectiveMerit<'_, P> {
    type Error = P::Error;

    fn value(&mut self, x: &Array1<f64>) -> Result<f64, P::Error> {
        Ok(self.problem.evaluate(x)?.objective)
    }

    fn gradient(&mut self, x: &Array1<f64>) -> Result<Array1<f64>, P::Error> {
        let jacobian = self.problem.jacobian(x)?;
        jacobian_shape_check::<P>(&jacobian, 1, self.n)?;
        Ok(jacobian.row(0).to_owned())
    }
}

/// Bound-constrained quasi-Newton solver.
pub struct ProjectedBfgs {
    pub config: BfgsConfig,
}

impl ProjectedBfgs {
    pub fn new(config: BfgsConfig) -> SolverResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn solve<P: NlpProblem>(&self, problem: &mut P) -> Result<Termination, P::Error> {
        let rows = problem.constraint_rows();
        if !rows.is_empty() {
            return Err(SolverError::Unsupported(format!(
                "projected BFGS handles bounds only, problem has {} constraint rows",
                rows.len()
            ))
            .into());
        }
        let n = problem.num_variables();
        let (lower, upper, start) = checked_start(problem)?;

        let initial = problem.jacobian(&start)?;
        jacobian_shape_check::<P>(&initial, 1, n)?;
        let scale = inf_norm(&initial.row(0).to_owned()).max(1.0);

        let settings = InnerSettings {
            max_iterations: self.config.max_iterations,
            tolerance: self.config.tolerance * scale,
            max_step_ratio: self.config.max_step_ratio,
            verbose: self.config.print_level >= 5,
        };
        let outcome = {
            let mut merit = ObjectiveMerit { problem: &mut *problem, n };
            minimize_bounded(&mut merit, &start, &lower, &upper, &settings)?
        };
        let values = problem.evaluate(&outcome.x)?;

        let code = match outcome.stop {
            InnerStop::Converged => return_code::SOLVE_SUCCEEDED,
            InnerStop::SmallStep => return_code::SEARCH_DIRECTION_TOO_SMALL,
            InnerStop::LineSearchFailed if outcome.projected_gradient <= 100.0 * settings.tolerance => {
                return_code::SEARCH_DIRECTION_TOO_SMALL
            }
            InnerStop::LineSearchFailed => return_code::LINE_SEARCH_FAILED,
            InnerStop::IterationLimit => return_code::MAXIMUM_ITERATIONS_EXCEEDED,
            InnerStop::NonFinite => return_code::DIVERGING_ITERATES,
        };
        if self.config.print_level >= 1 {
            info!(
                "projected BFGS finished: code {} after {} iterations, f = {:.10e}",
                code, outcome.iterations, values.objective
            );
        }

        Ok(Termination {
            code,
            variables: outcome.x,
            objective: values.objective,
            constraints: values.constraints,
            multipliers: Array1::zeros(0),
            iterations: outcome.iterations,
            history: outcome.trace,
        })
    }
}
