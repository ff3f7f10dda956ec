use std::{hint::black_box, thread, time::Duration, time::Instant};

use mcsolve::{
    coefficient::TimeCoefficient,
    mcsolve, mcsolve_with,
    sparse::CsrArray,
    system::terms::{HamiltonianSpec, OperatorTerm},
    CancellationToken, ExpectOperators, LogProgress, MCError, MCProblem, SolverOptions,
    TrajectoryCount,
};
use ndarray::Array1;
use num_complex::Complex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// A chain of `n` sites with nearest neighbour hopping, and loss from every site.
fn lossy_chain(n: usize, gamma: f64) -> MCProblem {
    let hopping = (0..n - 1)
        .flat_map(|i| {
            [
                (i, i + 1, Complex { re: 1f64, im: 0f64 }),
                (i + 1, i, Complex { re: 1f64, im: 0f64 }),
            ]
        })
        .collect::<Vec<_>>();
    // The extra level n is the vacuum
    let dimension = n + 1;
    let hamiltonian = CsrArray::from_triplets([dimension, dimension], &hopping);
    let collapse = (0..n)
        .map(|i| {
            OperatorTerm::constant(CsrArray::from_triplets(
                [dimension, dimension],
                &[(n, i, Complex { re: gamma.sqrt(), im: 0f64 })],
            ))
        })
        .collect();
    let occupation = (0..n)
        .map(|i| CsrArray::from_triplets([dimension, dimension], &[(i, i, Complex { re: 1f64, im: 0f64 })]))
        .collect::<Vec<_>>();

    let mut initial_state = Array1::zeros(dimension);
    initial_state[0] = Complex { re: 1f64, im: 0f64 };
    MCProblem {
        hamiltonian: HamiltonianSpec::Constant(hamiltonian),
        initial_state,
        times: (0..=100u32).map(|i| f64::from(i) * 0.1).collect(),
        collapse,
        expect: ExpectOperators::List(occupation),
    }
}

fn constant_decay_benchmark() {
    let problem = lossy_chain(20, 0.1);
    let options = SolverOptions {
        ntraj: TrajectoryCount::Checkpoints(vec![100, 500]),
        ..Default::default()
    };
    let start = Instant::now();
    match mcsolve(&problem, &options) {
        Ok(result) => {
            info!(
                elapsed = ?start.elapsed(),
                ntraj = ?result.ntraj,
                "Constant decay benchmark complete"
            );
            black_box(result);
        }
        Err(error) => warn!(%error, "Constant decay benchmark failed"),
    }
}

fn time_dependent_benchmark() {
    let mut problem = lossy_chain(20, 0.1);
    let args = [("omega".to_owned(), Complex { re: 2f64, im: 0f64 })]
        .into_iter()
        .collect();
    let coefficient = match TimeCoefficient::expression("1 + 0.5 * sin(omega * t)", &args) {
        Ok(coefficient) => coefficient,
        Err(error) => {
            warn!(%error, "Failed to compile coefficient");
            return;
        }
    };
    problem.collapse = problem
        .collapse
        .into_iter()
        .map(|term| OperatorTerm::time_dependent(term.operator, coefficient.clone()))
        .collect();

    let options = SolverOptions {
        ntraj: TrajectoryCount::Single(200),
        ..Default::default()
    };
    let start = Instant::now();
    match mcsolve(&problem, &options) {
        Ok(result) => {
            info!(elapsed = ?start.elapsed(), "Time dependent benchmark complete");
            black_box(result);
        }
        Err(error) => warn!(%error, "Time dependent benchmark failed"),
    }
}

fn cancelled_benchmark() {
    let problem = lossy_chain(40, 0.05);
    let options = SolverOptions {
        ntraj: TrajectoryCount::Single(100_000),
        ..Default::default()
    };
    let cancel = CancellationToken::new();
    let timer = {
        let cancel = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(500));
            cancel.cancel();
        })
    };
    let start = Instant::now();
    match mcsolve_with(&problem, &options, &LogProgress, &cancel) {
        Err(MCError::Cancelled) => info!(elapsed = ?start.elapsed(), "Run cancelled"),
        Ok(_) => warn!("Run completed before it was cancelled"),
        Err(error) => warn!(%error, "Cancelled benchmark failed"),
    }
    if timer.join().is_err() {
        warn!("Timer thread panicked");
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    constant_decay_benchmark();
    time_dependent_benchmark();
    cancelled_benchmark();
}
