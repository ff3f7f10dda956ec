use std::collections::HashMap;

use mcsolve::{
    coefficient::TimeCoefficient,
    mcsolve,
    sparse::CsrArray,
    system::terms::{HamiltonianSpec, OperatorTerm},
    ExpectOperators, ExpectOutput, FailurePolicy, MCError, MCProblem, McResult, SolverOptions,
    StateOutput, TrajectoryCount,
};
use ndarray::{Array1, Array2};
use num_complex::Complex;
use pyo3::{
    exceptions::{PyRuntimeError, PyValueError},
    prelude::*,
};

#[pyclass]
#[derive(Clone)]
struct SimulationConfig {
    #[pyo3(get, set)]
    n_trajectories: usize,
    #[pyo3(get, set)]
    atol: f64,
    #[pyo3(get, set)]
    rtol: f64,
    #[pyo3(get, set)]
    nsteps: usize,
    #[pyo3(get, set)]
    norm_tol: f64,
    #[pyo3(get, set)]
    norm_steps: usize,
    #[pyo3(get, set)]
    seeds: Option<Vec<u64>>,
    #[pyo3(get, set)]
    num_cpus: Option<usize>,
    #[pyo3(get, set)]
    average_expect: bool,
    #[pyo3(get, set)]
    discard_failures: bool,
}

#[pymethods]
impl SimulationConfig {
    #[new]
    #[allow(clippy::too_many_arguments)]
    #[pyo3(signature = (*, n_trajectories=500, atol=1e-8, rtol=1e-6, nsteps=1000, norm_tol=1e-3, norm_steps=5, seeds=None, num_cpus=None, average_expect=true, discard_failures=false))]
    fn new(
        n_trajectories: usize,
        atol: f64,
        rtol: f64,
        nsteps: usize,
        norm_tol: f64,
        norm_steps: usize,
        seeds: Option<Vec<u64>>,
        num_cpus: Option<usize>,
        average_expect: bool,
        discard_failures: bool,
    ) -> Self {
        SimulationConfig {
            n_trajectories,
            atol,
            rtol,
            nsteps,
            norm_tol,
            norm_steps,
            seeds,
            num_cpus,
            average_expect,
            discard_failures,
        }
    }
}

impl From<&SimulationConfig> for SolverOptions {
    fn from(value: &SimulationConfig) -> Self {
        SolverOptions {
            atol: value.atol,
            rtol: value.rtol,
            nsteps: value.nsteps,
            norm_tol: value.norm_tol,
            norm_steps: value.norm_steps,
            ntraj: TrajectoryCount::Single(value.n_trajectories),
            seeds: value.seeds.clone(),
            num_cpus: value.num_cpus,
            average_expect: value.average_expect,
            failure_policy: if value.discard_failures {
                FailurePolicy::Discard
            } else {
                FailurePolicy::Abort
            },
            ..Default::default()
        }
    }
}

/// A row major dense operator, stored as a sparse array.
fn operator_from_dense(data: Vec<Complex<f64>>, n_states: usize) -> PyResult<CsrArray<Complex<f64>>> {
    let dense = Array2::from_shape_vec((n_states, n_states), data)
        .map_err(|e| PyValueError::new_err(format!("Operator has the wrong shape: {e}")))?;
    Ok(CsrArray::from_dense(&dense, 0f64))
}

fn to_py_err(error: MCError) -> PyErr {
    match error {
        MCError::Config(error) => PyValueError::new_err(error.to_string()),
        error => PyRuntimeError::new_err(error.to_string()),
    }
}

#[pyclass]
struct SimulationResult {
    #[pyo3(get)]
    times: Vec<f64>,
    #[pyo3(get)]
    ntraj: usize,
    #[pyo3(get)]
    seeds: Vec<u64>,
    #[pyo3(get)]
    collapse_times: Vec<Vec<f64>>,
    #[pyo3(get)]
    collapse_which: Vec<Vec<usize>>,
    /// Expectations indexed by `[trajectory][operator][time]`, with a single
    /// trajectory when averaged
    #[pyo3(get)]
    expect: Vec<Vec<Vec<Complex<f64>>>>,
    /// States indexed by `[trajectory][time]`, flattened
    #[pyo3(get)]
    states: Vec<Vec<Complex<f64>>>,
}

impl From<McResult> for SimulationResult {
    fn from(value: McResult) -> Self {
        let expect = match &value.expect {
            Some(ExpectOutput::Averaged(checkpoints)) => checkpoints
                .last()
                .map(|series| vec![series.iter().map(|s| s.to_complex()).collect()])
                .unwrap_or_default(),
            Some(ExpectOutput::Trajectories(trajectories)) => trajectories
                .iter()
                .map(|series| series.iter().map(|s| s.to_complex()).collect())
                .collect(),
            None => Vec::new(),
        };
        let states = match &value.states {
            Some(StateOutput::Trajectories(trajectories)) => trajectories
                .iter()
                .map(|states| states.iter().flat_map(|s| s.iter()).copied().collect())
                .collect(),
            _ => Vec::new(),
        };
        SimulationResult {
            ntraj: value.ntraj.last().copied().unwrap_or(0),
            times: value.times,
            seeds: value.seeds,
            collapse_times: value.col_times,
            collapse_which: value.col_which,
            expect,
            states,
        }
    }
}

#[pyfunction]
#[pyo3(signature = (initial_state, hamiltonian, collapse_operators, expect_operators, times, config, collapse_coefficients=None, args=None))]
#[allow(clippy::too_many_arguments)]
fn solve_mc(
    py: Python<'_>,
    initial_state: Vec<Complex<f64>>,
    hamiltonian: Vec<Complex<f64>>,
    collapse_operators: Vec<Vec<Complex<f64>>>,
    expect_operators: Vec<Vec<Complex<f64>>>,
    times: Vec<f64>,
    config: PyRef<SimulationConfig>,
    collapse_coefficients: Option<Vec<Option<String>>>,
    args: Option<HashMap<String, Complex<f64>>>,
) -> PyResult<SimulationResult> {
    let n_states = initial_state.len();
    let args = args.unwrap_or_default();
    let coefficients = collapse_coefficients.unwrap_or_else(|| vec![None; collapse_operators.len()]);
    if coefficients.len() != collapse_operators.len() {
        return Err(PyValueError::new_err(
            "Expected one coefficient for each collapse operator",
        ));
    }

    let collapse = collapse_operators
        .into_iter()
        .zip(coefficients)
        .map(|(data, coefficient)| {
            let operator = operator_from_dense(data, n_states)?;
            Ok(match coefficient {
                Some(source) => OperatorTerm::time_dependent(
                    operator,
                    TimeCoefficient::expression(&source, &args)
                        .map_err(|e| PyValueError::new_err(e.to_string()))?,
                ),
                None => OperatorTerm::constant(operator),
            })
        })
        .collect::<PyResult<Vec<_>>>()?;
    let expect = expect_operators
        .into_iter()
        .map(|data| operator_from_dense(data, n_states))
        .collect::<PyResult<Vec<_>>>()?;

    let problem = MCProblem {
        hamiltonian: HamiltonianSpec::Constant(operator_from_dense(hamiltonian, n_states)?),
        initial_state: Array1::from(initial_state),
        times,
        collapse,
        expect: ExpectOperators::List(expect),
    };
    let options = SolverOptions::from(&*config);

    py.allow_threads(|| mcsolve(&problem, &options))
        .map(SimulationResult::from)
        .map_err(to_py_err)
}

/// A Python module implemented in Rust.
#[pymodule]
fn _mcsolve(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(solve_mc, m)?)?;
    m.add_class::<SimulationConfig>()?;
    m.add_class::<SimulationResult>()?;
    Ok(())
}
