use std::{collections::HashMap, fmt, sync::Arc};

use num_complex::Complex;

pub mod expression;

pub use expression::{CompiledExpression, ExpressionError};

/// Named arguments bound into a time coefficient, ie `{"w": 2.0}` for `"sin(w*t)"`
pub type Args = HashMap<String, Complex<f64>>;

pub type CoefficientFn = dyn Fn(f64) -> Complex<f64> + Send + Sync;

/// A scalar function of time multiplying an operator.
///
/// Arguments are resolved when the coefficient is built, so evaluating
/// never touches the argument map.
#[derive(Clone)]
pub enum TimeCoefficient {
    Expression(CompiledExpression),
    Function(Arc<CoefficientFn>),
}

/// How a coefficient was provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoefficientKind {
    Expression,
    Function,
}

impl TimeCoefficient {
    /// Compile a string coefficient with the given arguments.
    ///
    /// # Errors
    ///
    /// Returns an error if the expression is malformed or refers to an unknown name.
    pub fn expression(source: &str, args: &Args) -> Result<Self, ExpressionError> {
        CompiledExpression::compile(source, args).map(TimeCoefficient::Expression)
    }

    pub fn function<F: Fn(f64) -> Complex<f64> + Send + Sync + 'static>(f: F) -> Self {
        TimeCoefficient::Function(Arc::new(f))
    }

    /// A closure taking the argument map, bound once to `args`.
    pub fn function_with_args<F: Fn(f64, &Args) -> Complex<f64> + Send + Sync + 'static>(
        f: F,
        args: Args,
    ) -> Self {
        TimeCoefficient::Function(Arc::new(move |t| f(t, &args)))
    }

    #[inline]
    #[must_use]
    pub fn evaluate(&self, t: f64) -> Complex<f64> {
        match self {
            TimeCoefficient::Expression(e) => e.evaluate(t),
            TimeCoefficient::Function(f) => f(t),
        }
    }

    #[must_use]
    pub fn kind(&self) -> CoefficientKind {
        match self {
            TimeCoefficient::Expression(_) => CoefficientKind::Expression,
            TimeCoefficient::Function(_) => CoefficientKind::Function,
        }
    }
}

impl fmt::Debug for TimeCoefficient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeCoefficient::Expression(e) => f.debug_tuple("Expression").field(&e.source()).finish(),
            TimeCoefficient::Function(_) => f.write_str("Function(..)"),
        }
    }
}

impl From<CompiledExpression> for TimeCoefficient {
    fn from(value: CompiledExpression) -> Self {
        TimeCoefficient::Expression(value)
    }
}
