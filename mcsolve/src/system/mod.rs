use ndarray::Array1;
use num_complex::Complex;

pub mod mc;
pub mod simple;
pub mod terms;

/// A system evolving under `d/dt psi = f(t, psi)`.
pub trait EvolutionSystem {
    /// Get `f(t, psi)`.
    fn get_derivative(&self, t: f64, state: &Array1<Complex<f64>>) -> Array1<Complex<f64>>;
}

/// Represents a system evolving under an effective (non-Hermitian) generator,
/// interrupted by jumps through a set of collapse channels.
///
/// ```latex
/// d/dt \psi = -i H_{eff}(t) \psi, H_{eff} = H - i/2 \sum_k |g_k(t)|^2 C_k^\dagger C_k
/// ```
#[allow(clippy::module_name_repetitions)]
pub trait JumpSystem: EvolutionSystem {
    /// Number of collapse channels
    fn n_collapse(&self) -> usize;

    /// The (unnormalized) jump probability density of each channel,
    /// `|g_k(t)|^2 <psi| C_k^\dagger C_k |psi>`
    fn get_decay_weights(&self, t: f64, state: &Array1<Complex<f64>>) -> Vec<f64>;

    /// Apply collapse operator `channel` to the state, without renormalizing.
    fn get_collapsed_state(
        &self,
        channel: usize,
        t: f64,
        state: &Array1<Complex<f64>>,
    ) -> Array1<Complex<f64>>;
}
