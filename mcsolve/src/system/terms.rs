use std::{fmt, sync::Arc};

use num_complex::Complex;
use tracing::info;

use crate::{
    coefficient::{CoefficientKind, TimeCoefficient},
    error::ConfigError,
    sparse::CsrArray,
};

pub type HamiltonianFn = dyn Fn(f64) -> CsrArray<Complex<f64>> + Send + Sync;

/// An operator, optionally multiplied by a coefficient `g(t)`.
#[derive(Debug, Clone)]
pub struct OperatorTerm {
    pub operator: CsrArray<Complex<f64>>,
    pub coefficient: Option<TimeCoefficient>,
}

impl OperatorTerm {
    #[must_use]
    pub fn constant(operator: CsrArray<Complex<f64>>) -> Self {
        Self {
            operator,
            coefficient: None,
        }
    }

    #[must_use]
    pub fn time_dependent(operator: CsrArray<Complex<f64>>, coefficient: TimeCoefficient) -> Self {
        Self {
            operator,
            coefficient: Some(coefficient),
        }
    }

    #[must_use]
    pub fn is_constant(&self) -> bool {
        self.coefficient.is_none()
    }
}

impl From<CsrArray<Complex<f64>>> for OperatorTerm {
    fn from(operator: CsrArray<Complex<f64>>) -> Self {
        Self::constant(operator)
    }
}

/// The Hamiltonian of the system.
#[derive(Clone)]
pub enum HamiltonianSpec {
    Constant(CsrArray<Complex<f64>>),
    /// `H(t) = \sum_j f_j(t) H_j`, where constant terms have no coefficient
    Terms(Vec<OperatorTerm>),
    /// An arbitrary `H(t)`
    Function(Arc<HamiltonianFn>),
}

impl HamiltonianSpec {
    pub fn function<F: Fn(f64) -> CsrArray<Complex<f64>> + Send + Sync + 'static>(f: F) -> Self {
        HamiltonianSpec::Function(Arc::new(f))
    }

    fn terms(&self) -> &[OperatorTerm] {
        match self {
            HamiltonianSpec::Terms(terms) => terms,
            HamiltonianSpec::Constant(_) | HamiltonianSpec::Function(_) => &[],
        }
    }
}

impl fmt::Debug for HamiltonianSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HamiltonianSpec::Constant(h) => f.debug_tuple("Constant").field(&h.shape()).finish(),
            HamiltonianSpec::Terms(terms) => f.debug_tuple("Terms").field(terms).finish(),
            HamiltonianSpec::Function(_) => f.write_str("Function(..)"),
        }
    }
}

impl From<CsrArray<Complex<f64>>> for HamiltonianSpec {
    fn from(operator: CsrArray<Complex<f64>>) -> Self {
        HamiltonianSpec::Constant(operator)
    }
}

/// The class of time dependence of a problem, which decides how the derivative is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeDependence {
    /// No operator depends on time
    Constant,
    /// Every time-dependent term uses a compiled string coefficient
    Compiled,
    /// Every time-dependent term uses a closure coefficient
    FunctionList,
    /// The Hamiltonian is a function of time, collapse operators are constant
    Function,
}

/// Decide the [`TimeDependence`] of a problem.
///
/// # Errors
///
/// Returns an error if the Hamiltonian list has no constant term, if string and
/// closure coefficients are mixed, or if a function Hamiltonian is combined
/// with time-dependent collapse operators.
pub fn classify(
    hamiltonian: &HamiltonianSpec,
    collapse: &[OperatorTerm],
) -> Result<TimeDependence, ConfigError> {
    if let HamiltonianSpec::Function(_) = hamiltonian {
        if collapse.iter().any(|c| !c.is_constant()) {
            return Err(ConfigError::UnrecognizedTimeDependence(
                "a function Hamiltonian requires constant collapse operators".to_owned(),
            ));
        }
        info!(class = ?TimeDependence::Function, "Classified time dependence");
        return Ok(TimeDependence::Function);
    }

    let terms = hamiltonian.terms();
    if let HamiltonianSpec::Terms(_) = hamiltonian {
        if !terms.iter().any(OperatorTerm::is_constant) {
            return Err(ConfigError::MissingConstantTerm);
        }
    }

    let mut kinds = terms
        .iter()
        .chain(collapse)
        .filter_map(|term| term.coefficient.as_ref().map(TimeCoefficient::kind));
    let class = match kinds.next() {
        None => TimeDependence::Constant,
        Some(first) => {
            if kinds.any(|k| k != first) {
                return Err(ConfigError::UnrecognizedTimeDependence(
                    "string and function coefficients cannot be mixed".to_owned(),
                ));
            }
            match first {
                CoefficientKind::Expression => TimeDependence::Compiled,
                CoefficientKind::Function => TimeDependence::FunctionList,
            }
        }
    };
    info!(class = ?class, "Classified time dependence");
    Ok(class)
}

#[cfg(test)]
mod tests {
    use num_complex::Complex;

    use super::{classify, HamiltonianSpec, OperatorTerm, TimeDependence};
    use crate::{
        coefficient::{Args, TimeCoefficient},
        error::ConfigError,
        sparse::CsrArray,
    };

    fn operator() -> CsrArray<Complex<f64>> {
        CsrArray::identity(2)
    }

    fn string(source: &str) -> TimeCoefficient {
        TimeCoefficient::expression(source, &Args::new()).unwrap()
    }

    fn function() -> TimeCoefficient {
        TimeCoefficient::function(|t| Complex { re: t.cos(), im: 0.0 })
    }

    #[test]
    fn test_constant_problem() {
        let class = classify(
            &HamiltonianSpec::Constant(operator()),
            &[OperatorTerm::constant(operator())],
        );
        assert_eq!(class, Ok(TimeDependence::Constant));
    }

    #[test]
    fn test_string_and_function_lists() {
        let hamiltonian = HamiltonianSpec::Terms(vec![
            OperatorTerm::constant(operator()),
            OperatorTerm::time_dependent(operator(), string("cos(t)")),
        ]);
        assert_eq!(classify(&hamiltonian, &[]), Ok(TimeDependence::Compiled));

        let collapse = [OperatorTerm::time_dependent(operator(), function())];
        assert_eq!(
            classify(&HamiltonianSpec::Constant(operator()), &collapse),
            Ok(TimeDependence::FunctionList)
        );
        assert!(matches!(
            classify(&hamiltonian, &collapse),
            Err(ConfigError::UnrecognizedTimeDependence(_))
        ));
    }

    #[test]
    fn test_missing_constant_term() {
        let hamiltonian = HamiltonianSpec::Terms(vec![OperatorTerm::time_dependent(
            operator(),
            string("sin(t)"),
        )]);
        assert_eq!(
            classify(&hamiltonian, &[]),
            Err(ConfigError::MissingConstantTerm)
        );
    }

    #[test]
    fn test_function_hamiltonian() {
        let hamiltonian = HamiltonianSpec::function(|_| CsrArray::identity(2));
        assert_eq!(
            classify(&hamiltonian, &[OperatorTerm::constant(operator())]),
            Ok(TimeDependence::Function)
        );
        assert!(classify(
            &hamiltonian,
            &[OperatorTerm::time_dependent(operator(), function())]
        )
        .is_err());
    }
}
