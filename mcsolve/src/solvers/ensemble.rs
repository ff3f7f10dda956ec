use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread,
};

use ndarray::Array1;
use ndarray_linalg::Norm;
use num_complex::Complex;
use rand::Rng;
use tracing::{info, warn};

use crate::{
    error::{ConfigError, MCError, Result, TrajectoryError},
    options::{FailurePolicy, SolverOptions, TrajectoryCount},
    result::{McResult, RunSummary, StateAveraging, TrajectoryFailure},
    solvers::{
        jump::JumpTolerance,
        measurement::{ExpectationOperator, Measurement, StateMeasurement},
        trajectory::{run_trajectory, TrajectoryConfig, TrajectoryRecord, TrajectoryTask},
    },
    sparse::CsrArray,
    system::{
        mc::MCSystem,
        terms::{HamiltonianSpec, OperatorTerm},
        JumpSystem,
    },
};

/// Generated seeds are drawn uniformly from `0..SEED_RANGE`
pub const SEED_RANGE: u64 = 100_000_000;

/// A flag which stops a run when set, from any thread.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Receives the number of completed trajectories, on the thread that started the run.
pub trait ProgressReporter {
    fn update(&self, completed: usize, total: usize);
}

/// Logs progress at every 10% of completed trajectories
pub struct LogProgress;

impl ProgressReporter for LogProgress {
    fn update(&self, completed: usize, total: usize) {
        if total == 0 || completed == 0 {
            return;
        }
        let level = completed * 10 / total;
        if level > (completed - 1) * 10 / total {
            info!(completed, total, percent = level * 10, "Progress");
        }
    }
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn update(&self, _completed: usize, _total: usize) {}
}

/// Expectation value operators, either as a list or keyed by name.
#[derive(Debug, Clone, PartialEq)]
pub enum ExpectOperators {
    List(Vec<CsrArray<Complex<f64>>>),
    /// Results keep the insertion order of the names
    Named(Vec<(String, CsrArray<Complex<f64>>)>),
}

impl Default for ExpectOperators {
    fn default() -> Self {
        ExpectOperators::List(Vec::new())
    }
}

impl From<Vec<CsrArray<Complex<f64>>>> for ExpectOperators {
    fn from(value: Vec<CsrArray<Complex<f64>>>) -> Self {
        ExpectOperators::List(value)
    }
}

impl ExpectOperators {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            ExpectOperators::List(operators) => operators.len(),
            ExpectOperators::Named(operators) => operators.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn names(&self) -> Option<Vec<String>> {
        match self {
            ExpectOperators::List(_) => None,
            ExpectOperators::Named(operators) => {
                Some(operators.iter().map(|(name, _)| name.clone()).collect())
            }
        }
    }

    #[must_use]
    pub fn operators(&self) -> Vec<&CsrArray<Complex<f64>>> {
        match self {
            ExpectOperators::List(operators) => operators.iter().collect(),
            ExpectOperators::Named(operators) => operators.iter().map(|(_, op)| op).collect(),
        }
    }
}

/// A Monte Carlo problem: the system, its initial state and what to record.
#[derive(Debug, Clone)]
pub struct MCProblem {
    pub hamiltonian: HamiltonianSpec,
    pub initial_state: Array1<Complex<f64>>,
    /// Strictly increasing output times, starting from the initial time
    pub times: Vec<f64>,
    pub collapse: Vec<OperatorTerm>,
    /// If empty, states are recorded instead
    pub expect: ExpectOperators,
}

#[allow(clippy::neg_cmp_op_on_partial_ord)]
fn validate_times(times: &[f64]) -> std::result::Result<(), ConfigError> {
    if times.is_empty() {
        return Err(ConfigError::EmptyTimes);
    }
    if !times[0].is_finite() {
        return Err(ConfigError::NonIncreasingTimes {
            index: 0,
            previous: times[0],
            current: times[0],
        });
    }
    for (i, pair) in times.windows(2).enumerate() {
        if !(pair[1] > pair[0]) || !pair[1].is_finite() {
            return Err(ConfigError::NonIncreasingTimes {
                index: i + 1,
                previous: pair[0],
                current: pair[1],
            });
        }
    }
    Ok(())
}

/// Check the initial state, normalizing it if required.
fn validate_initial_state(
    state: &Array1<Complex<f64>>,
) -> std::result::Result<Array1<Complex<f64>>, ConfigError> {
    if state.is_empty() {
        return Err(ConfigError::InvalidInitialState("state is empty".to_owned()));
    }
    if state.iter().any(|x| !x.is_finite()) {
        return Err(ConfigError::InvalidInitialState(
            "state has a non-finite amplitude".to_owned(),
        ));
    }
    let norm = state.norm_l2();
    if norm == 0f64 {
        return Err(ConfigError::InvalidInitialState("state has zero norm".to_owned()));
    }
    if (norm - 1f64).abs() > 1e-10 {
        warn!(norm, "Initial state is not normalized, normalizing");
    }
    Ok(state.mapv(|x| x / norm))
}

fn resolve_seeds(seeds: Option<&[u64]>, n: usize) -> std::result::Result<Vec<u64>, ConfigError> {
    match seeds {
        Some(seeds) if seeds.len() < n => Err(ConfigError::InsufficientSeeds {
            expected: n,
            actual: seeds.len(),
        }),
        Some(seeds) => Ok(seeds[..n].to_vec()),
        None => {
            let mut rng = rand::thread_rng();
            Ok((0..n).map(|_| rng.gen_range(0..SEED_RANGE)).collect())
        }
    }
}

fn worker_count(options: &SolverOptions, n_tasks: usize) -> usize {
    options
        .num_cpus
        .unwrap_or_else(|| thread::available_parallelism().map_or(1, NonZeroUsize::get))
        .min(n_tasks)
        .max(1)
}

/// Run `run` for every task, calling `on_complete` on this thread as each finishes.
///
/// Results arrive in completion order, tagged with their task index.
fn dispatch<T, F, C>(tasks: Vec<TrajectoryTask>, workers: usize, run: F, mut on_complete: C)
where
    T: Send,
    F: Fn(TrajectoryTask) -> std::result::Result<T, TrajectoryError> + Sync,
    C: FnMut(usize, std::result::Result<T, TrajectoryError>),
{
    if workers > 1 && tasks.len() > 1 {
        match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
            Ok(pool) => {
                let (sender, receiver) = mpsc::channel();
                pool.in_place_scope(|scope| {
                    for task in tasks {
                        let sender = sender.clone();
                        let run = &run;
                        scope.spawn(move |_| {
                            // The receiver lives until every task has reported
                            let _ = sender.send((task.index, run(task)));
                        });
                    }
                    drop(sender);
                    for (index, result) in receiver {
                        on_complete(index, result);
                    }
                });
                return;
            }
            Err(error) => {
                warn!(%error, "Failed to build worker pool, running sequentially");
            }
        }
    }
    for task in tasks {
        on_complete(task.index, run(task));
    }
}

/// Run every task, and collect the records in index order.
///
/// # Errors
///
/// Returns an error if the run is cancelled, or a trajectory fails under [`FailurePolicy::Abort`].
#[allow(clippy::too_many_arguments)]
pub fn run_ensemble<S, M>(
    tasks: Vec<TrajectoryTask>,
    system: &S,
    config: &TrajectoryConfig,
    measurement: &M,
    workers: usize,
    policy: FailurePolicy,
    progress: &dyn ProgressReporter,
    cancel: &CancellationToken,
) -> Result<(Vec<TrajectoryRecord<M::Out>>, Vec<TrajectoryFailure>)>
where
    S: JumpSystem + Sync,
    M: Measurement + Sync,
    M::Out: Send,
{
    let total = tasks.len();
    let seeds = tasks.iter().map(|t| t.seed).collect::<Vec<_>>();
    let mut slots = (0..total).map(|_| None).collect::<Vec<_>>();
    let mut completed = 0;

    dispatch(
        tasks,
        workers,
        |task| run_trajectory(task, system, config, measurement, cancel),
        |index, result| {
            slots[index] = Some(result);
            completed += 1;
            progress.update(completed, total);
        },
    );

    if cancel.is_cancelled() {
        warn!(completed, total, "Run cancelled");
        return Err(MCError::Cancelled);
    }

    let mut records = Vec::with_capacity(total);
    let mut failures = Vec::new();
    for (index, slot) in slots.into_iter().enumerate() {
        match slot {
            Some(Ok(record)) => records.push(record),
            // A missing result means the run was interrupted
            Some(Err(TrajectoryError::Cancelled)) | None => return Err(MCError::Cancelled),
            Some(Err(error)) => match policy {
                FailurePolicy::Abort => {
                    return Err(MCError::Trajectory {
                        index,
                        source: error,
                    })
                }
                FailurePolicy::Discard => {
                    warn!(trajectory = index, %error, "Discarding failed trajectory");
                    failures.push(TrajectoryFailure {
                        index,
                        seed: seeds[index],
                        error,
                    });
                }
            },
        }
    }

    if records.is_empty() && !failures.is_empty() {
        let failure = failures.swap_remove(0);
        return Err(MCError::Trajectory {
            index: failure.index,
            source: failure.error,
        });
    }
    Ok((records, failures))
}

/// Solve a problem by the Monte Carlo wavefunction method, logging progress.
///
/// # Errors
///
/// Returns an error if the problem or options are invalid, or the run fails.
pub fn mcsolve(problem: &MCProblem, options: &SolverOptions) -> Result<McResult> {
    mcsolve_with(problem, options, &LogProgress, &CancellationToken::default())
}

/// Solve a problem by the Monte Carlo wavefunction method.
///
/// Without collapse operators a single trajectory is run, and no averaging is applied.
///
/// # Errors
///
/// Returns an error if the problem or options are invalid, the run is
/// cancelled, or a trajectory fails under [`FailurePolicy::Abort`].
pub fn mcsolve_with(
    problem: &MCProblem,
    options: &SolverOptions,
    progress: &dyn ProgressReporter,
    cancel: &CancellationToken,
) -> Result<McResult> {
    options.validate()?;
    validate_times(&problem.times)?;
    let initial_state = validate_initial_state(&problem.initial_state)?;
    let dimension = initial_state.len();

    let mut expect = Vec::with_capacity(problem.expect.len());
    for (i, operator) in problem.expect.operators().into_iter().enumerate() {
        let [rows, cols] = operator.shape();
        if rows != dimension || cols != dimension {
            return Err(ConfigError::dimension_mismatch(
                format!("expectation operator {i}"),
                dimension,
                if rows == dimension { cols } else { rows },
            )
            .into());
        }
        expect.push(ExpectationOperator::new(operator.clone()));
    }

    let system = MCSystem::new(
        &problem.hamiltonian,
        &problem.collapse,
        dimension,
        problem.times[0],
        options.tidy.then_some(options.atol),
    )?;

    let no_collapse = system.n_collapse() == 0;
    let counts = if no_collapse {
        if options.ntraj.total() > 1 {
            warn!(
                requested = options.ntraj.total(),
                "No collapse operators, running a single trajectory"
            );
        }
        TrajectoryCount::Single(1)
    } else {
        options.ntraj.clone()
    };
    let n = counts.total();
    let seeds = resolve_seeds(options.seeds.as_deref(), n)?;
    let workers = worker_count(options, n);

    let config = TrajectoryConfig {
        initial_state,
        times: problem.times.clone(),
        integrator: options.into(),
        tolerance: JumpTolerance {
            norm_tol: options.norm_tol,
            norm_steps: options.norm_steps,
        },
    };
    let summary = RunSummary {
        times: problem.times.clone(),
        checkpoints: counts.checkpoints(),
        num_collapse: system.n_collapse(),
        seeds: seeds.clone(),
        expect_names: problem.expect.names(),
    };
    let tasks = seeds
        .iter()
        .enumerate()
        .map(|(index, &seed)| TrajectoryTask { index, seed })
        .collect::<Vec<_>>();

    info!(
        ntraj = n,
        workers,
        dimension,
        n_collapse = system.n_collapse(),
        n_expect = expect.len(),
        "Starting Monte Carlo run"
    );
    let result = if expect.is_empty() {
        let (records, failures) = run_ensemble(
            tasks,
            &system,
            &config,
            &StateMeasurement {},
            workers,
            options.failure_policy,
            progress,
            cancel,
        )?;
        let averaging = if no_collapse || !options.averages_states() {
            StateAveraging::None
        } else if options.steady_state_average {
            StateAveraging::SteadyState
        } else {
            StateAveraging::PerTime
        };
        McResult::from_states(summary, records, failures, averaging, dimension)
    } else {
        let (records, failures) = run_ensemble(
            tasks,
            &system,
            &config,
            &expect,
            workers,
            options.failure_policy,
            progress,
            cancel,
        )?;
        let average = options.average_expect && !no_collapse;
        McResult::from_expectations(summary, &records, failures, &expect, average)
    };
    info!(
        ntraj = ?result.ntraj,
        failed = result.failures.len(),
        "Finished Monte Carlo run"
    );
    Ok(result)
}
