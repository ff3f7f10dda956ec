#![warn(clippy::pedantic)]

// Links the CBLAS implementation required by ndarray's `blas` feature
// (enabled transitively by ndarray-linalg).
extern crate blis_src as _;

pub mod coefficient;
pub mod distribution;
pub mod error;
pub mod options;
pub mod result;
pub mod solvers;
pub mod sparse;
pub mod system;

pub use error::{ConfigError, IntegratorError, MCError, TrajectoryError};
pub use options::{FailurePolicy, SolverOptions, TrajectoryCount};
pub use result::{ExpectOutput, ExpectationSeries, McResult, StateOutput};
pub use solvers::ensemble::{
    mcsolve, mcsolve_with, CancellationToken, ExpectOperators, LogProgress, MCProblem,
    NoProgress, ProgressReporter,
};

#[cfg(test)]
mod tests {
    use ndarray::{Array1, Array2};
    use ndarray_linalg::Norm;
    use num_complex::Complex;
    use rand::{rngs::StdRng, Rng};

    use crate::{
        coefficient::TimeCoefficient,
        distribution::StandardComplexNormal,
        options::{SolverOptions, TrajectoryCount},
        result::ExpectOutput,
        solvers::ensemble::{mcsolve, ExpectOperators, MCProblem},
        sparse::CsrArray,
        system::terms::{HamiltonianSpec, OperatorTerm},
    };

    /// The lowering operator `|0><1|`
    pub(crate) fn sigma_minus() -> CsrArray<Complex<f64>> {
        CsrArray::from_triplets([2, 2], &[(0, 1, Complex { re: 1.0, im: 0.0 })])
    }

    pub(crate) fn sigma_z() -> CsrArray<Complex<f64>> {
        CsrArray::from_triplets(
            [2, 2],
            &[
                (0, 0, Complex { re: 1.0, im: 0.0 }),
                (1, 1, Complex { re: -1.0, im: 0.0 }),
            ],
        )
    }

    fn excited_projector() -> CsrArray<Complex<f64>> {
        CsrArray::from_triplets([2, 2], &[(1, 1, Complex { re: 1.0, im: 0.0 })])
    }

    pub(crate) fn excited_state() -> Array1<Complex<f64>> {
        Array1::from(vec![Complex { re: 0.0, im: 0.0 }, Complex { re: 1.0, im: 0.0 }])
    }

    pub(crate) fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
        #[allow(clippy::cast_precision_loss)]
        (0..n)
            .map(|i| start + (end - start) * i as f64 / (n - 1) as f64)
            .collect()
    }

    fn get_random_dense(rng: &mut StdRng, n: usize) -> Array2<Complex<f64>> {
        Array2::from_shape_vec(
            [n, n],
            rng.sample_iter(StandardComplexNormal).take(n * n).collect(),
        )
        .unwrap()
    }

    pub(crate) fn get_random_hermitian(rng: &mut StdRng, n: usize) -> CsrArray<Complex<f64>> {
        let dense = get_random_dense(rng, n);
        let hermitian = (&dense + &dense.t().mapv(|x| x.conj())).mapv(|x| x * 0.5);
        CsrArray::from_dense(&hermitian, 0.0)
    }

    /// A random operator, scaled so that decay rates are of order one
    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn get_random_operator(rng: &mut StdRng, n: usize) -> CsrArray<Complex<f64>> {
        let dense = get_random_dense(rng, n).mapv(|x| x / (n as f64));
        CsrArray::from_dense(&dense, 0.0)
    }

    pub(crate) fn get_random_state(rng: &mut StdRng, n: usize) -> Array1<Complex<f64>> {
        let state = Array1::from_iter(rng.sample_iter(StandardComplexNormal).take(n));
        let norm = state.norm_l2();
        state.mapv(|x| x / norm)
    }

    /// A two level atom decaying from the excited state at rate `gamma`,
    /// recording the excited population.
    pub(crate) fn decay_problem(gamma: f64, times: Vec<f64>) -> MCProblem {
        MCProblem {
            hamiltonian: HamiltonianSpec::Constant(CsrArray::zeros([2, 2])),
            initial_state: excited_state(),
            times,
            collapse: vec![OperatorTerm::constant(sigma_minus().scaled(Complex {
                re: gamma.sqrt(),
                im: 0.0,
            }))],
            expect: ExpectOperators::List(vec![excited_projector()]),
        }
    }

    fn seeded(ntraj: usize, num_cpus: usize) -> SolverOptions {
        SolverOptions {
            ntraj: TrajectoryCount::Single(ntraj),
            seeds: Some((0..ntraj as u64).map(|i| 7 * i + 3).collect()),
            num_cpus: Some(num_cpus),
            ..Default::default()
        }
    }

    /// Assert the averaged population lies within three standard errors of `expected`
    #[allow(clippy::cast_precision_loss)]
    fn assert_population_close(population: &[f64], expected: impl Fn(usize) -> f64, ntraj: usize) {
        for (i, p) in population.iter().enumerate() {
            let e = expected(i);
            let sigma = (e * (1.0 - e) / ntraj as f64).sqrt();
            assert!(
                (p - e).abs() <= 3.0 * sigma + 1e-12,
                "population {p} at index {i}, expected {e}"
            );
        }
    }

    #[test]
    fn test_result_is_independent_of_worker_count() {
        let problem = decay_problem(1.0, linspace(0.0, 3.0, 7));
        let serial = mcsolve(&problem, &seeded(40, 1)).unwrap();
        let parallel = mcsolve(&problem, &seeded(40, 4)).unwrap();
        assert_eq!(serial, parallel);
    }

    #[test]
    fn test_decay_matches_exponential() {
        let times = linspace(0.0, 4.0, 9);
        let ntraj = 500;
        let result = mcsolve(&decay_problem(1.0, times.clone()), &seeded(ntraj, 4)).unwrap();

        assert_eq!(result.ntraj, vec![ntraj]);
        let population = result.averaged_expect(0).unwrap().as_real().unwrap();
        assert!((population[0] - 1.0).abs() < 1e-12);
        assert_population_close(population, |i| (-times[i]).exp(), ntraj);

        let n_collapse = result.col_times.iter().filter(|c| !c.is_empty()).count();
        assert!(result.col_times.iter().all(|c| c.len() <= 1));
        assert_eq!(n_collapse, result.col_which.iter().filter(|c| !c.is_empty()).count());
    }

    #[test]
    fn test_time_dependent_decay() {
        // |g(t)|^2 = exp(-t), so P(t) = exp(exp(-t) - 1)
        let times = linspace(0.0, 3.0, 7);
        let ntraj = 300;
        let with_coefficient = |coefficient: TimeCoefficient| MCProblem {
            collapse: vec![OperatorTerm::time_dependent(sigma_minus(), coefficient)],
            ..decay_problem(1.0, times.clone())
        };
        let mut args = crate::coefficient::Args::new();
        args.insert("rate".to_owned(), Complex { re: 0.5, im: 0.0 });

        let compiled = mcsolve(
            &with_coefficient(TimeCoefficient::expression("exp(-rate * t)", &args).unwrap()),
            &seeded(ntraj, 4),
        )
        .unwrap();
        let function = mcsolve(
            &with_coefficient(TimeCoefficient::function(|t| Complex {
                re: (-0.5 * t).exp(),
                im: 0.0,
            })),
            &seeded(ntraj, 4),
        )
        .unwrap();

        let Some(ExpectOutput::Averaged(compiled_expect)) = &compiled.expect else {
            panic!("expected averaged expectations");
        };
        let Some(ExpectOutput::Averaged(function_expect)) = &function.expect else {
            panic!("expected averaged expectations");
        };
        let population = compiled_expect[0][0].as_real().unwrap();
        let other = function_expect[0][0].as_real().unwrap();
        for (a, b) in population.iter().zip(other) {
            assert!((a - b).abs() < 1e-8);
        }
        assert_population_close(population, |i| ((-times[i]).exp() - 1.0).exp(), ntraj);
    }
}
