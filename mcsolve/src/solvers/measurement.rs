use ndarray::{Array1, Array2};
use num_complex::Complex;

use crate::sparse::CsrArray;

/// Something recorded from the (normalized) state at each output time.
pub trait Measurement {
    type Out;
    fn measure(&self, state: &Array1<Complex<f64>>) -> Self::Out;
}

pub struct StateMeasurement {}

impl Measurement for StateMeasurement {
    type Out = Array1<Complex<f64>>;
    fn measure(&self, state: &Array1<Complex<f64>>) -> Self::Out {
        state.clone()
    }
}

impl<M: Measurement> Measurement for Vec<M> {
    type Out = Vec<M::Out>;
    fn measure(&self, state: &Array1<Complex<f64>>) -> Self::Out {
        self.iter().map(|m| m.measure(state)).collect()
    }
}

/// An expectation value operator, remembering whether its expectation is real.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpectationOperator {
    pub operator: CsrArray<Complex<f64>>,
    pub hermitian: bool,
}

impl ExpectationOperator {
    /// Tolerance used to decide if an operator is Hermitian
    pub const HERMITIAN_TOL: f64 = 1e-12;

    #[must_use]
    pub fn new(operator: CsrArray<Complex<f64>>) -> Self {
        let hermitian = operator.is_hermitian(Self::HERMITIAN_TOL);
        Self {
            operator,
            hermitian,
        }
    }
}

impl Measurement for ExpectationOperator {
    type Out = Complex<f64>;
    fn measure(&self, state: &Array1<Complex<f64>>) -> Self::Out {
        self.operator.expectation(state)
    }
}

/// The density matrix `|psi><psi|`
#[must_use]
pub fn density_matrix(state: &Array1<Complex<f64>>) -> Array2<Complex<f64>> {
    let n = state.len();
    Array2::from_shape_fn([n, n], |(i, j)| state[i] * state[j].conj())
}
