use std::sync::Arc;

use ndarray::{linalg::Dot, Array1};
use num_complex::Complex;
use tracing::debug;

use crate::{
    coefficient::TimeCoefficient,
    error::ConfigError,
    sparse::CsrArray,
    system::{
        terms::{classify, HamiltonianFn, HamiltonianSpec, OperatorTerm, TimeDependence},
        EvolutionSystem, JumpSystem,
    },
};

const MINUS_I: Complex<f64> = Complex { re: 0f64, im: -1f64 };
const MINUS_HALF: Complex<f64> = Complex {
    re: -0.5f64,
    im: 0f64,
};

struct CollapseChannel {
    operator: CsrArray<Complex<f64>>,
    /// `C^\dagger C`
    rate: CsrArray<Complex<f64>>,
    coefficient: Option<TimeCoefficient>,
}

enum Generator {
    /// `-i H_eff`, with every constant collapse channel folded in
    Static(CsrArray<Complex<f64>>),
    Function {
        hamiltonian: Arc<HamiltonianFn>,
        /// `-1/2 \sum_k C_k^\dagger C_k`
        dissipator: CsrArray<Complex<f64>>,
    },
}

/// The operator configuration of a Monte Carlo problem.
///
/// Built once before any trajectory runs and shared read-only between workers.
pub struct MCSystem {
    time_dependence: TimeDependence,
    dimension: usize,
    generator: Generator,
    /// `(-i H_j, f_j(t))` for each time-dependent Hamiltonian term
    hamiltonian_terms: Vec<(CsrArray<Complex<f64>>, TimeCoefficient)>,
    channels: Vec<CollapseChannel>,
    constant_channels: Vec<usize>,
    time_dependent_channels: Vec<usize>,
}

fn check_shape(
    what: impl Fn() -> String,
    operator: &CsrArray<Complex<f64>>,
    dimension: usize,
) -> Result<(), ConfigError> {
    let [rows, cols] = operator.shape();
    if rows != dimension {
        return Err(ConfigError::dimension_mismatch(what(), dimension, rows));
    }
    if cols != dimension {
        return Err(ConfigError::dimension_mismatch(what(), dimension, cols));
    }
    Ok(())
}

impl MCSystem {
    /// Build the configuration for a state of size `dimension`.
    ///
    /// A function Hamiltonian is checked by evaluating it at `t0`.
    /// When `tidy` is set, operator entries with magnitude not above it are dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if an operator has the wrong shape or the time dependence is not recognized.
    pub fn new(
        hamiltonian: &HamiltonianSpec,
        collapse: &[OperatorTerm],
        dimension: usize,
        t0: f64,
        tidy: Option<f64>,
    ) -> Result<Self, ConfigError> {
        let time_dependence = classify(hamiltonian, collapse)?;
        let tidied = |operator: CsrArray<Complex<f64>>| match tidy {
            Some(tol) => operator.tidyup(tol),
            None => operator,
        };

        let mut channels = Vec::with_capacity(collapse.len());
        for (i, term) in collapse.iter().enumerate() {
            check_shape(|| format!("collapse operator {i}"), &term.operator, dimension)?;
            let operator = tidied(term.operator.clone());
            let rate = operator.adjoint().matmul(&operator);
            channels.push(CollapseChannel {
                operator,
                rate,
                coefficient: term.coefficient.clone(),
            });
        }
        let (constant_channels, time_dependent_channels): (Vec<_>, Vec<_>) =
            (0..channels.len()).partition(|&i| channels[i].coefficient.is_none());

        let mut dissipator = CsrArray::zeros([dimension, dimension]);
        for &i in &constant_channels {
            dissipator = dissipator.add_scaled(&channels[i].rate, MINUS_HALF);
        }

        let mut hamiltonian_terms = Vec::new();
        let generator = match hamiltonian {
            HamiltonianSpec::Constant(h) => {
                check_shape(|| "Hamiltonian".to_owned(), h, dimension)?;
                Generator::Static(tidied(dissipator.add_scaled(h, MINUS_I)))
            }
            HamiltonianSpec::Terms(terms) => {
                let mut constant = dissipator;
                for (j, term) in terms.iter().enumerate() {
                    check_shape(|| format!("Hamiltonian term {j}"), &term.operator, dimension)?;
                    match &term.coefficient {
                        None => constant = constant.add_scaled(&term.operator, MINUS_I),
                        Some(coefficient) => hamiltonian_terms.push((
                            tidied(term.operator.scaled(MINUS_I)),
                            coefficient.clone(),
                        )),
                    }
                }
                Generator::Static(tidied(constant))
            }
            HamiltonianSpec::Function(f) => {
                check_shape(|| format!("Hamiltonian at t = {t0}"), &f(t0), dimension)?;
                Generator::Function {
                    hamiltonian: Arc::clone(f),
                    dissipator: tidied(dissipator),
                }
            }
        };

        debug!(
            dimension,
            n_hamiltonian_terms = hamiltonian_terms.len(),
            n_constant_channels = constant_channels.len(),
            n_time_dependent_channels = time_dependent_channels.len(),
            "Built Monte Carlo system"
        );
        Ok(Self {
            time_dependence,
            dimension,
            generator,
            hamiltonian_terms,
            channels,
            constant_channels,
            time_dependent_channels,
        })
    }

    #[must_use]
    pub fn time_dependence(&self) -> TimeDependence {
        self.time_dependence
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Indices of the collapse operators with a constant rate
    #[must_use]
    pub fn constant_channels(&self) -> &[usize] {
        &self.constant_channels
    }

    /// Indices of the collapse operators with a time-dependent rate
    #[must_use]
    pub fn time_dependent_channels(&self) -> &[usize] {
        &self.time_dependent_channels
    }
}

impl EvolutionSystem for MCSystem {
    /// # Panics
    ///
    /// Will panic if a function Hamiltonian returns an operator of the wrong shape
    fn get_derivative(&self, t: f64, state: &Array1<Complex<f64>>) -> Array1<Complex<f64>> {
        let mut out = match &self.generator {
            Generator::Static(generator) => generator.dot(state),
            Generator::Function {
                hamiltonian,
                dissipator,
            } => {
                let mut out = dissipator.dot(state);
                out.scaled_add(MINUS_I, &hamiltonian(t).dot(state));
                out
            }
        };
        for (operator, coefficient) in &self.hamiltonian_terms {
            out.scaled_add(coefficient.evaluate(t), &operator.dot(state));
        }
        for &i in &self.time_dependent_channels {
            let channel = &self.channels[i];
            if let Some(coefficient) = &channel.coefficient {
                let weight = coefficient.evaluate(t).norm_sqr();
                out.scaled_add(MINUS_HALF * weight, &channel.rate.dot(state));
            }
        }
        out
    }
}

impl JumpSystem for MCSystem {
    fn n_collapse(&self) -> usize {
        self.channels.len()
    }

    fn get_decay_weights(&self, t: f64, state: &Array1<Complex<f64>>) -> Vec<f64> {
        self.channels
            .iter()
            .map(|channel| {
                let weight = channel.rate.expectation(state).re.max(0f64);
                match &channel.coefficient {
                    Some(coefficient) => coefficient.evaluate(t).norm_sqr() * weight,
                    None => weight,
                }
            })
            .collect()
    }

    fn get_collapsed_state(
        &self,
        channel: usize,
        t: f64,
        state: &Array1<Complex<f64>>,
    ) -> Array1<Complex<f64>> {
        let channel = &self.channels[channel];
        let out = channel.operator.dot(state);
        match &channel.coefficient {
            Some(coefficient) => {
                let g = coefficient.evaluate(t);
                out.mapv_into(|x| x * g)
            }
            None => out,
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::{linalg::Dot, Array1};
    use num_complex::Complex;
    use rand::{rngs::StdRng, SeedableRng};

    use super::MCSystem;
    use crate::{
        coefficient::{Args, TimeCoefficient},
        error::ConfigError,
        sparse::CsrArray,
        system::{
            terms::{HamiltonianSpec, OperatorTerm, TimeDependence},
            EvolutionSystem, JumpSystem,
        },
        tests::{get_random_hermitian, get_random_operator, get_random_state, sigma_minus},
    };

    fn assert_states_close(a: &Array1<Complex<f64>>, b: &Array1<Complex<f64>>) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(x.re, y.re, epsilon = 1e-10);
            assert_abs_diff_eq!(x.im, y.im, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_no_collapse_is_unitary_generator() {
        let mut rng = StdRng::seed_from_u64(1);
        let hamiltonian = get_random_hermitian(&mut rng, 5);
        let state = get_random_state(&mut rng, 5);
        let system =
            MCSystem::new(&HamiltonianSpec::Constant(hamiltonian.clone()), &[], 5, 0.0, None).unwrap();

        let expected = hamiltonian.dot(&state).mapv(|x| x * Complex { re: 0.0, im: -1.0 });
        assert_states_close(&system.get_derivative(0.3, &state), &expected);
        assert_eq!(system.n_collapse(), 0);
        assert_eq!(system.time_dependence(), TimeDependence::Constant);
    }

    #[test]
    fn test_constant_collapse_is_folded_into_generator() {
        let mut rng = StdRng::seed_from_u64(2);
        let hamiltonian = get_random_hermitian(&mut rng, 4);
        let collapse = get_random_operator(&mut rng, 4);
        let state = get_random_state(&mut rng, 4);
        let system = MCSystem::new(
            &HamiltonianSpec::Constant(hamiltonian.clone()),
            &[OperatorTerm::constant(collapse.clone())],
            4,
            0.0,
            Some(1e-12),
        )
        .unwrap();

        let rate = collapse.adjoint().matmul(&collapse);
        let effective = hamiltonian.add_scaled(&rate, Complex { re: 0.0, im: -0.5 });
        let expected = effective.dot(&state).mapv(|x| x * Complex { re: 0.0, im: -1.0 });
        assert_states_close(&system.get_derivative(0.0, &state), &expected);
        assert_eq!(system.constant_channels(), &[0]);
        assert!(system.time_dependent_channels().is_empty());
    }

    #[test]
    fn test_time_dependent_terms() {
        let mut rng = StdRng::seed_from_u64(3);
        let h0 = get_random_hermitian(&mut rng, 3);
        let h1 = get_random_hermitian(&mut rng, 3);
        let c0 = get_random_operator(&mut rng, 3);
        let state = get_random_state(&mut rng, 3);
        let args = Args::from([("w".to_owned(), Complex { re: 1.3, im: 0.0 })]);
        let hamiltonian = HamiltonianSpec::Terms(vec![
            OperatorTerm::constant(h0.clone()),
            OperatorTerm::time_dependent(
                h1.clone(),
                TimeCoefficient::expression("cos(w*t)", &args).unwrap(),
            ),
        ]);
        let collapse = [OperatorTerm::time_dependent(
            c0.clone(),
            TimeCoefficient::expression("exp(-t)", &args).unwrap(),
        )];
        let system = MCSystem::new(&hamiltonian, &collapse, 3, 0.0, None).unwrap();
        assert_eq!(system.time_dependence(), TimeDependence::Compiled);
        assert_eq!(system.time_dependent_channels(), &[0]);

        let t: f64 = 0.7;
        let rate = c0.adjoint().matmul(&c0);
        let effective = h0
            .add_scaled(&h1, Complex { re: (1.3 * t).cos(), im: 0.0 })
            .add_scaled(&rate, Complex { re: 0.0, im: -0.5 * (-2.0 * t).exp() });
        let expected = effective.dot(&state).mapv(|x| x * Complex { re: 0.0, im: -1.0 });
        assert_states_close(&system.get_derivative(t, &state), &expected);

        let weights = system.get_decay_weights(t, &state);
        assert_abs_diff_eq!(
            weights[0],
            (-2.0 * t).exp() * rate.expectation(&state).re,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_decay_weights_are_norm_loss_rate() {
        let mut rng = StdRng::seed_from_u64(4);
        let hamiltonian = get_random_hermitian(&mut rng, 4);
        let collapse = (0..3)
            .map(|_| OperatorTerm::constant(get_random_operator(&mut rng, 4)))
            .collect::<Vec<_>>();
        let state = get_random_state(&mut rng, 4);
        let system = MCSystem::new(&HamiltonianSpec::Constant(hamiltonian), &collapse, 4, 0.0, None).unwrap();

        // d/dt <psi|psi> = 2 Re <psi|d psi> = -\sum_k w_k
        let derivative = system.get_derivative(0.0, &state);
        let norm_rate = 2.0
            * state
                .iter()
                .zip(derivative.iter())
                .map(|(s, d)| (s.conj() * d).re)
                .sum::<f64>();
        let total = system.get_decay_weights(0.0, &state).iter().sum::<f64>();
        assert_abs_diff_eq!(norm_rate, -total, epsilon = 1e-10);
    }

    #[test]
    fn test_function_hamiltonian() {
        let hamiltonian = HamiltonianSpec::function(|t| {
            CsrArray::identity(2).scaled(Complex { re: t, im: 0.0 })
        });
        let system =
            MCSystem::new(&hamiltonian, &[OperatorTerm::constant(sigma_minus())], 2, 0.0, None).unwrap();
        let state = Array1::from(vec![Complex { re: 0.0, im: 0.0 }, Complex { re: 1.0, im: 0.0 }]);

        // -i t psi - 1/2 |1><1| psi
        let derivative = system.get_derivative(2.0, &state);
        assert_abs_diff_eq!(derivative[1].re, -0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(derivative[1].im, -2.0, epsilon = 1e-12);

        let collapsed = system.get_collapsed_state(0, 2.0, &state);
        assert_abs_diff_eq!(collapsed[0].re, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_dimension_mismatch() {
        let result = MCSystem::new(
            &HamiltonianSpec::Constant(CsrArray::identity(3)),
            &[OperatorTerm::constant(sigma_minus())],
            3,
            0.0,
            None,
        );
        assert!(matches!(
            result,
            Err(ConfigError::DimensionMismatch { expected: 3, actual: 2, .. })
        ));
    }
}
