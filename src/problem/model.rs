//! User evaluation contract `(x) -> (f, g, fail)`

use num_complex::{Complex64, ComplexFloat};
use std::fmt::Debug;

/// Numeric type a model can be evaluated on: `f64`, or `Complex64` for
/// complex-step sensitivities.
pub trait Scalar: ComplexFloat<Real = f64> + Debug + Send + Sync + 'static {
    /// Lift a real constant into this scalar type.
    fn from_real(value: f64) -> Self;
}

impl Scalar for f64 {
    fn from_real(value: f64) -> Self {
        value
    }
}

impl Scalar for Complex64 {
    fn from_real(value: f64) -> Self {
        Complex64::new(value, 0.0)
    }
}

/// Result of one model call.
///
/// `fail != 0` marks the point as not evaluable; `f` and `g` are then ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation<T = f64> {
    pub f: T,
    pub g: Vec<T>,
    pub fail: i32,
}

impl<T: Scalar> Evaluation<T> {
    pub fn new(f: T, g: Vec<T>) -> Self {
        Self { f, g, fail: 0 }
    }

    /// A failed evaluation. A zero code would read as success and is
    /// replaced by 1.
    pub fn failed(code: i32) -> Self {
        Self {
            f: T::from_real(f64::NAN),
            g: Vec::new(),
            fail: if code == 0 { 1 } else { code },
        }
    }

    pub fn is_failure(&self) -> bool {
        self.fail != 0
    }
}

/// User-supplied analytic sensitivities at one point.
#[derive(Debug, Clone, PartialEq)]
pub struct Sensitivity {
    /// Objective gradient, one entry per variable.
    pub df: Vec<f64>,
    /// Constraint Jacobian, one row per constraint.
    pub dg: Vec<Vec<f64>>,
    pub fail: i32,
}

impl Sensitivity {
    pub fn new(df: Vec<f64>, dg: Vec<Vec<f64>>) -> Self {
        Self { df, dg, fail: 0 }
    }
}

/// An objective/constraint function.
///
/// Models must be side-effect-free: in parallel sensitivity mode every rank
/// calls its own copy independently and the results must agree.
///
/// Any `Fn(&[f64]) -> Evaluation + Send + Sync` closure is a model. Annotate
/// the argument (`|x: &[f64]| ...`) so the closure is generic over the slice
/// lifetime.
pub trait Model: Send + Sync {
    fn evaluate(&self, x: &[f64]) -> Evaluation;

    /// Evaluate on complex input. `None` means the model cannot be continued
    /// into the complex plane.
    fn evaluate_complex(&self, _x: &[Complex64]) -> Option<Evaluation<Complex64>> {
        None
    }

    /// Analytic sensitivities, if the model has them.
    fn gradient(&self, _x: &[f64]) -> Option<Sensitivity> {
        None
    }
}

impl<F> Model for F
where
    F: Fn(&[f64]) -> Evaluation + Send + Sync,
{
    fn evaluate(&self, x: &[f64]) -> Evaluation {
        self(x)
    }
}

/// A model written once for any [`Scalar`].
pub trait AnalyticModel: Send + Sync {
    fn evaluate<T: Scalar>(&self, x: &[T]) -> Evaluation<T>;
}

/// Adapts an [`AnalyticModel`] so it serves both real and complex calls.
pub struct Holomorphic<M>(pub M);

impl<M: AnalyticModel> Model for Holomorphic<M> {
    fn evaluate(&self, x: &[f64]) -> Evaluation {
        self.0.evaluate(x)
    }

    fn evaluate_complex(&self, x: &[Complex64]) -> Option<Evaluation<Complex64>> {
        Some(self.0.evaluate(x))
    }
}

/// Attaches an analytic gradient function to a model.
pub struct WithGradient<M, G> {
    model: M,
    gradient: G,
}

impl<M, G> WithGradient<M, G>
where
    M: Model,
    G: Fn(&[f64]) -> Sensitivity + Send + Sync,
{
    pub fn new(model: M, gradient: G) -> Self {
        Self { model, gradient }
    }
}

impl<M, G> Model for WithGradient<M, G>
where
    M: Model,
    G: Fn(&[f64]) -> Sensitivity + Send + Sync,
{
    fn evaluate(&self, x: &[f64]) -> Evaluation {
        self.model.evaluate(x)
    }

    fn evaluate_complex(&self, x: &[Complex64]) -> Option<Evaluation<Complex64>> {
        self.model.evaluate_complex(x)
    }

    fn gradient(&self, x: &[f64]) -> Option<Sensitivity> {
        Some((self.gradient)(x))
    }
}
