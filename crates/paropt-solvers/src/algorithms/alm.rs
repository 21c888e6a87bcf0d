use crate::algorithms::bfgs::{minimize_bounded, InnerSettings, InnerStop, Merit};
use crate::common::{
    checked_start, inf_norm, jacobian_shape_check, return_code, AlmConfig, ConstraintRow,
    NlpProblem, SolverResult, Termination, Values,
};
use ndarray::Array1;
use tracing::{debug, info, warn};

/// Outer iterations without progress at the penalty ceiling before the
/// problem is declared infeasible.
const STALL_LIMIT: usize = 3;
const UNBOUNDED_OBJECTIVE: f64 = -1e20;

/// PHR augmented Lagrangian
///
/// `L(x) = f(x) + sum_eq (l c + r/2 c^2) + sum_ineq (max(0, l + r c)^2 - l^2) / (2 r)`
///
/// The point cache avoids a second `evaluate` when the gradient is requested
/// at the point whose value was just computed.
struct PhrMerit<'a, P> {
    problem: &'a mut P,
    rows: &'a [ConstraintRow],
    lambda: &'a Array1<f64>,
    rho: f64,
    n: usize,
    cache: Option<(Array1<f64>, Values)>,
}

impl<P: NlpProblem> PhrMerit<'_, P> {
    fn values_at(&mut self, x: &Array1<f64>) -> Result<Values, P::Error> {
        if let Some((cached_x, values)) = &self.cache {
            if cached_x == x {
                return Ok(values.clone());
            }
        }
        let values = self.problem.evaluate(x)?;
        self.cache = Some((x.clone(), values.clone()));
        Ok(values)
    }

    fn weight(&self, j: usize, c: f64) -> f64 {
        let shifted = self.lambda[j] + self.rho * c;
        match self.rows[j] {
            ConstraintRow::Equal => shifted,
            ConstraintRow::LessEqual => shifted.max(0.0),
        }
    }
}

impl<P: NlpProblem> Merit for PhrMerit<'_, P> {
    type Error = P::Error;

    fn value(&mut self, x: &Array1<f64>) -> Result<f64, P::Error> {
        let values = self.values_at(x)?;
        let mut total = values.objective;
        for (j, c) in values.constraints.iter().enumerate() {
            let l = self.lambda[j];
            total += match self.rows[j] {
                ConstraintRow::Equal => l * c + 0.5 * self.rho * c * c,
                ConstraintRow::LessEqual => {
                    let w = self.weight(j, *c);
                    (w * w - l * l) / (2.0 * self.rho)
                }
            };
        }
        Ok(total)
    }

    fn gradient(&mut self, x: &Array1<f64>) -> Result<Array1<f64>, P::Error> {
        let values = self.values_at(x)?;
        let jacobian = self.problem.jacobian(x)?;
        jacobian_shape_check::<P>(&jacobian, 1 + self.rows.len(), self.n)?;
        let mut grad = jacobian.row(0).to_owned();
        for (j, c) in values.constraints.iter().enumerate() {
            let w = self.weight(j, *c);
            if w != 0.0 {
                grad.scaled_add(w, &jacobian.row(1 + j));
            }
        }
        Ok(grad)
    }
}

/// Augmented Lagrangian solver for bound- and constraint-limited problems.
///
/// Each outer iteration minimizes the PHR merit over the variable box with the
/// projected BFGS routine, then updates the multipliers. The penalty grows
/// whenever the feasibility/complementarity measure fails to shrink by 4x.
pub struct AugmentedLagrangian {
    pub config: AlmConfig,
}

impl AugmentedLagrangian {
    pub fn new(config: AlmConfig) -> SolverResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn solve<P: NlpProblem>(&self, problem: &mut P) -> Result<Termination, P::Error> {
        let cfg = &self.config;
        let n = problem.num_variables();
        let rows = problem.constraint_rows();
        let m = rows.len();
        let (lower, upper, mut x) = checked_start(problem)?;

        let mut lambda = Array1::<f64>::zeros(m);
        let mut rho = cfg.penalty_init;
        let mut previous_measure = f64::INFINITY;
        let mut stalled = 0;
        let mut history = Vec::with_capacity(cfg.max_outer_iterations);
        let mut last = None;

        for outer in 0..cfg.max_outer_iterations {
            let start_jacobian = problem.jacobian(&x)?;
            jacobian_shape_check::<P>(&start_jacobian, 1 + m, n)?;
            let scale = inf_norm(&start_jacobian.row(0).to_owned()).max(1.0);

            let settings = InnerSettings {
                max_iterations: cfg.max_inner_iterations,
                tolerance: cfg.tolerance * scale,
                max_step_ratio: cfg.max_step_ratio,
                verbose: cfg.print_level >= 5,
            };
            let (inner, values) = {
                let mut merit = PhrMerit {
                    problem: &mut *problem,
                    rows: &rows,
                    lambda: &lambda,
                    rho,
                    n,
                    cache: None,
                };
                let inner = minimize_bounded(&mut merit, &x, &lower, &upper, &settings)?;
                let values = merit.values_at(&inner.x)?;
                (inner, values)
            };
            x = inner.x.clone();
            history.push(values.objective);

            if inner.stop == InnerStop::NonFinite || !values.is_finite() {
                warn!("augmented Lagrangian hit non-finite values at outer iteration {}", outer);
                return Ok(self.finish(return_code::DIVERGING_ITERATES, x, values, lambda, outer + 1, history));
            }

            let measure = complementarity_measure(&rows, &values.constraints, &lambda, rho);
            for j in 0..m {
                let shifted = lambda[j] + rho * values.constraints[j];
                lambda[j] = match rows[j] {
                    ConstraintRow::Equal => shifted,
                    ConstraintRow::LessEqual => shifted.max(0.0),
                };
            }

            if cfg.print_level >= 3 {
                info!(
                    "outer {:>3}  f {:>+.10e}  L {:>+.10e}  infeas {:.3e}  |pg| {:.3e}  rho {:.1e}  inner {} ({:?})",
                    outer, values.objective, inner.value, measure, inner.projected_gradient, rho, inner.iterations, inner.stop
                );
            } else {
                debug!(
                    "outer {} f={} merit={} measure={} rho={}",
                    outer, values.objective, inner.value, measure, rho
                );
            }

            if measure <= cfg.constraint_tolerance && inner.projected_gradient <= settings.tolerance {
                return Ok(self.finish(return_code::SOLVE_SUCCEEDED, x, values, lambda, outer + 1, history));
            }
            if values.objective < UNBOUNDED_OBJECTIVE {
                return Ok(self.finish(return_code::DIVERGING_ITERATES, x, values, lambda, outer + 1, history));
            }

            if measure > 0.25 * previous_measure {
                if rho < cfg.penalty_max {
                    rho = (rho * cfg.penalty_growth).min(cfg.penalty_max);
                } else if measure > cfg.constraint_tolerance {
                    stalled += 1;
                    if stalled >= STALL_LIMIT {
                        return Ok(self.finish(
                            return_code::INFEASIBLE_PROBLEM_DETECTED,
                            x,
                            values,
                            lambda,
                            outer + 1,
                            history,
                        ));
                    }
                }
            } else {
                stalled = 0;
            }
            previous_measure = measure;
            last = Some((values, measure, inner.projected_gradient / scale));
        }

        let Some((values, measure, relative_pg)) = last else {
            let values = problem.evaluate(&x)?;
            return Ok(self.finish(return_code::MAXIMUM_ITERATIONS_EXCEEDED, x, values, lambda, 0, history));
        };
        let code = if measure <= cfg.acceptable_tolerance && relative_pg <= cfg.acceptable_tolerance {
            return_code::SOLVED_TO_ACCEPTABLE_LEVEL
        } else if measure > cfg.constraint_tolerance && rho >= cfg.penalty_max {
            return_code::INFEASIBLE_PROBLEM_DETECTED
        } else {
            return_code::MAXIMUM_ITERATIONS_EXCEEDED
        };
        Ok(self.finish(code, x, values, lambda, cfg.max_outer_iterations, history))
    }

    fn finish(
        &self,
        code: i32,
        variables: Array1<f64>,
        values: Values,
        multipliers: Array1<f64>,
        iterations: usize,
        history: Vec<f64>,
    ) -> Termination {
        if self.config.print_level >= 1 {
            info!(
                "augmented Lagrangian finished: code {} after {} outer iterations, f = {:.10e}",
                code, iterations, values.objective
            );
        }
        Termination {
            code,
            variables,
            objective: values.objective,
            constraints: values.constraints,
            multipliers,
            iterations,
            history,
        }
    }
}

/// Feasibility and complementarity in one number: `|c|` for equalities,
/// `|max(c, -l/r)|` for inequalities.
fn complementarity_measure(rows: &[ConstraintRow], c: &Array1<f64>, lambda: &Array1<f64>, rho: f64) -> f64 {
    rows.iter()
        .enumerate()
        .map(|(j, row)| match row {
            ConstraintRow::Equal => c[j].abs(),
            ConstraintRow::LessEqual => c[j].max(-lambda[j] / rho).abs(),
        })
        .fold(0.0, f64::max)
}
