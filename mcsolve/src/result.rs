use ndarray::{Array1, Array2};
use num_complex::Complex;
use tracing::info;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
    error::TrajectoryError,
    solvers::{
        measurement::{density_matrix, ExpectationOperator},
        trajectory::TrajectoryRecord,
    },
};

/// The expectation value of one operator at every output time.
///
/// Hermitian operators give a real series.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ExpectationSeries {
    Real(Vec<f64>),
    Complex(Vec<Complex<f64>>),
}

impl ExpectationSeries {
    fn from_values(values: impl Iterator<Item = Complex<f64>>, hermitian: bool) -> Self {
        if hermitian {
            ExpectationSeries::Real(values.map(|v| v.re).collect())
        } else {
            ExpectationSeries::Complex(values.collect())
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            ExpectationSeries::Real(v) => v.len(),
            ExpectationSeries::Complex(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn as_real(&self) -> Option<&[f64]> {
        match self {
            ExpectationSeries::Real(v) => Some(v),
            ExpectationSeries::Complex(_) => None,
        }
    }

    /// The series as complex values, whatever its kind
    #[must_use]
    pub fn to_complex(&self) -> Vec<Complex<f64>> {
        match self {
            ExpectationSeries::Real(v) => v.iter().map(|re| Complex { re: *re, im: 0f64 }).collect(),
            ExpectationSeries::Complex(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ExpectOutput {
    /// Indexed by `[trajectory][operator]`
    Trajectories(Vec<Vec<ExpectationSeries>>),
    /// Indexed by `[checkpoint][operator]`
    Averaged(Vec<Vec<ExpectationSeries>>),
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum StateOutput {
    /// Indexed by `[trajectory][time]`
    Trajectories(Vec<Vec<Array1<Complex<f64>>>>),
    /// Density matrices, indexed by `[checkpoint][time]`
    Averaged(Vec<Vec<Array2<Complex<f64>>>>),
    /// A single density matrix averaged over trajectories and times, one per checkpoint
    SteadyState(Vec<Array2<Complex<f64>>>),
}

/// How states are reduced over the ensemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateAveraging {
    None,
    PerTime,
    SteadyState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryFailure {
    pub index: usize,
    pub seed: u64,
    pub error: TrajectoryError,
}

/// The result of a Monte Carlo run.
///
/// Per-trajectory data covers the successful trajectories, in index order.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct McResult {
    pub times: Vec<f64>,
    /// The requested trajectory count of each checkpoint
    pub checkpoints: Vec<usize>,
    /// The number of trajectories averaged at each checkpoint
    pub ntraj: Vec<usize>,
    pub num_expect: usize,
    pub num_collapse: usize,
    /// The seed of every trajectory, so the run can be replayed
    pub seeds: Vec<u64>,
    /// The index of each successful trajectory
    pub trajectories: Vec<usize>,
    pub col_times: Vec<Vec<f64>>,
    pub col_which: Vec<Vec<usize>>,
    /// Names of the expectation operators, if given as a mapping
    pub expect_names: Option<Vec<String>>,
    pub expect: Option<ExpectOutput>,
    pub states: Option<StateOutput>,
    #[cfg_attr(feature = "serde", serde(skip))]
    pub failures: Vec<TrajectoryFailure>,
}

impl McResult {
    /// The position of the named expectation operator
    #[must_use]
    pub fn expect_index(&self, name: &str) -> Option<usize> {
        self.expect_names.as_ref()?.iter().position(|n| n == name)
    }

    /// The averaged expectation of operator `index` at the last checkpoint
    #[must_use]
    pub fn averaged_expect(&self, index: usize) -> Option<&ExpectationSeries> {
        match &self.expect {
            Some(ExpectOutput::Averaged(checkpoints)) => checkpoints.last()?.get(index),
            _ => None,
        }
    }
}

/// Everything about a run except its outputs.
pub(crate) struct RunSummary {
    pub times: Vec<f64>,
    pub checkpoints: Vec<usize>,
    pub num_collapse: usize,
    pub seeds: Vec<u64>,
    pub expect_names: Option<Vec<String>>,
}

impl RunSummary {
    fn into_result<O>(
        self,
        records: &[TrajectoryRecord<O>],
        failures: Vec<TrajectoryFailure>,
        num_expect: usize,
    ) -> McResult {
        let ntraj = self
            .checkpoints
            .iter()
            .map(|n| records.iter().filter(|r| r.index < *n).count())
            .collect();
        McResult {
            times: self.times,
            checkpoints: self.checkpoints,
            ntraj,
            num_expect,
            num_collapse: self.num_collapse,
            seeds: self.seeds,
            trajectories: records.iter().map(|r| r.index).collect(),
            col_times: records
                .iter()
                .map(|r| r.collapses.iter().map(|c| c.time).collect())
                .collect(),
            col_which: records
                .iter()
                .map(|r| r.collapses.iter().map(|c| c.channel).collect())
                .collect(),
            expect_names: self.expect_names,
            expect: None,
            states: None,
            failures,
        }
    }
}

fn first_n<O>(records: &[TrajectoryRecord<O>], n: usize) -> Vec<&TrajectoryRecord<O>> {
    records.iter().filter(|r| r.index < n).collect()
}

/// The expectations of a single trajectory, indexed by operator.
#[must_use]
pub fn trajectory_expectations(
    record: &TrajectoryRecord<Vec<Complex<f64>>>,
    operators: &[ExpectationOperator],
) -> Vec<ExpectationSeries> {
    operators
        .iter()
        .enumerate()
        .map(|(k, op)| {
            ExpectationSeries::from_values(record.output.iter().map(|values| values[k]), op.hermitian)
        })
        .collect()
}

/// The unweighted mean of the expectations, reduced in the order given.
///
/// An empty ensemble gives NaN.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn average_expectations(
    records: &[&TrajectoryRecord<Vec<Complex<f64>>>],
    operators: &[ExpectationOperator],
    n_times: usize,
) -> Vec<ExpectationSeries> {
    let count = records.len() as f64;
    operators
        .iter()
        .enumerate()
        .map(|(k, op)| {
            let means = (0..n_times).map(|t| {
                records
                    .iter()
                    .fold(Complex::default(), |acc, r| acc + r.output[t][k])
                    / count
            });
            ExpectationSeries::from_values(means, op.hermitian)
        })
        .collect()
}

/// The mean density matrix at each time.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn average_states(
    records: &[&TrajectoryRecord<Array1<Complex<f64>>>],
    n_times: usize,
    dimension: usize,
) -> Vec<Array2<Complex<f64>>> {
    let count = records.len() as f64;
    (0..n_times)
        .map(|t| {
            let mut sum = Array2::zeros([dimension, dimension]);
            for record in records {
                sum += &density_matrix(&record.output[t]);
            }
            sum.mapv_into(|x| x / count)
        })
        .collect()
}

/// The mean density matrix over every trajectory and every time.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn steady_state(
    records: &[&TrajectoryRecord<Array1<Complex<f64>>>],
    n_times: usize,
    dimension: usize,
) -> Array2<Complex<f64>> {
    let mut sum = Array2::zeros([dimension, dimension]);
    for record in records {
        for state in &record.output {
            sum += &density_matrix(state);
        }
    }
    let count = (records.len() * n_times) as f64;
    sum.mapv_into(|x| x / count)
}

impl McResult {
    pub(crate) fn from_expectations(
        summary: RunSummary,
        records: &[TrajectoryRecord<Vec<Complex<f64>>>],
        failures: Vec<TrajectoryFailure>,
        operators: &[ExpectationOperator],
        average: bool,
    ) -> Self {
        let n_times = summary.times.len();
        let expect = if average {
            info!(checkpoints = ?summary.checkpoints, "Averaging expectation values");
            ExpectOutput::Averaged(
                summary
                    .checkpoints
                    .iter()
                    .map(|n| average_expectations(&first_n(records, *n), operators, n_times))
                    .collect(),
            )
        } else {
            ExpectOutput::Trajectories(
                records
                    .iter()
                    .map(|r| trajectory_expectations(r, operators))
                    .collect(),
            )
        };
        let mut result = summary.into_result(records, failures, operators.len());
        result.expect = Some(expect);
        result
    }

    pub(crate) fn from_states(
        summary: RunSummary,
        records: Vec<TrajectoryRecord<Array1<Complex<f64>>>>,
        failures: Vec<TrajectoryFailure>,
        averaging: StateAveraging,
        dimension: usize,
    ) -> Self {
        let n_times = summary.times.len();
        if averaging != StateAveraging::None {
            info!(checkpoints = ?summary.checkpoints, ?averaging, "Averaging states");
        }
        let states = match averaging {
            StateAveraging::None => None,
            StateAveraging::PerTime => Some(StateOutput::Averaged(
                summary
                    .checkpoints
                    .iter()
                    .map(|n| average_states(&first_n(&records, *n), n_times, dimension))
                    .collect(),
            )),
            StateAveraging::SteadyState => Some(StateOutput::SteadyState(
                summary
                    .checkpoints
                    .iter()
                    .map(|n| steady_state(&first_n(&records, *n), n_times, dimension))
                    .collect(),
            )),
        };
        let mut result = summary.into_result(&records, failures, 0);
        result.states = Some(match states {
            Some(states) => states,
            None => StateOutput::Trajectories(records.into_iter().map(|r| r.output).collect()),
        });
        result
    }
}
