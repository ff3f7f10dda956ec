use ndarray::Array1;
use num_complex::Complex;

use crate::system::EvolutionSystem;

pub type DerivativeFn = dyn Fn(f64, &Array1<Complex<f64>>) -> Array1<Complex<f64>> + Send + Sync;

/// A system whose derivative is given by a function
pub struct SimpleSystem {
    pub derivative: Box<DerivativeFn>,
}

impl SimpleSystem {
    pub fn new<F: Fn(f64, &Array1<Complex<f64>>) -> Array1<Complex<f64>> + Send + Sync + 'static>(
        f: F,
    ) -> Self {
        Self {
            derivative: Box::new(f),
        }
    }
}

impl EvolutionSystem for SimpleSystem {
    #[inline]
    fn get_derivative(&self, t: f64, state: &Array1<Complex<f64>>) -> Array1<Complex<f64>> {
        (self.derivative)(t, state)
    }
}
