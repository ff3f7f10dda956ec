use ndarray::Array1;
use ndarray_linalg::Norm;
use num_complex::Complex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::debug;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
    distribution::{JumpThreshold, JumpThresholdDistribution},
    error::TrajectoryError,
    solvers::{
        ensemble::CancellationToken,
        integrator::{DormandPrince, IntegrationMode, IntegratorOptions},
        jump::{locate_jump, select_channel, Bracket, JumpTolerance, NormPoint},
        measurement::Measurement,
    },
    system::JumpSystem,
};

/// A single trajectory to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrajectoryTask {
    pub index: usize,
    pub seed: u64,
}

/// A quantum jump.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Collapse {
    pub time: f64,
    pub channel: usize,
}

/// The output of a completed trajectory.
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryRecord<O> {
    pub index: usize,
    pub seed: u64,
    /// Collapses, in the order they occurred
    pub collapses: Vec<Collapse>,
    /// One measurement per output time
    pub output: Vec<O>,
}

/// Settings shared by every trajectory of a run.
#[derive(Debug, Clone)]
pub struct TrajectoryConfig {
    pub initial_state: Array1<Complex<f64>>,
    /// Output times, the first of which is the initial time
    pub times: Vec<f64>,
    pub integrator: IntegratorOptions,
    pub tolerance: JumpTolerance,
}

#[derive(Debug)]
pub enum Phase {
    FreeEvolution,
    JumpSearch(Bracket),
    PostJump(NormPoint),
    Done,
    Failed,
}

fn normalized(state: &Array1<Complex<f64>>) -> Array1<Complex<f64>> {
    let norm = state.norm_l2();
    state.mapv(|x| x / norm)
}

/// Drives a single trajectory from phase to phase.
pub struct TrajectoryEngine<'a, S, M: Measurement> {
    task: TrajectoryTask,
    system: &'a S,
    config: &'a TrajectoryConfig,
    measurement: &'a M,
    integrator: DormandPrince<'a, S>,
    rng: StdRng,
    threshold: JumpThreshold,
    next_output: usize,
    phase: Phase,
    collapses: Vec<Collapse>,
    output: Vec<M::Out>,
}

impl<'a, S: JumpSystem, M: Measurement> TrajectoryEngine<'a, S, M> {
    /// Start a trajectory, recording the initial state at the first output time.
    ///
    /// # Panics
    ///
    /// Will panic if `config.times` is empty
    pub fn new(
        task: TrajectoryTask,
        system: &'a S,
        config: &'a TrajectoryConfig,
        measurement: &'a M,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(task.seed);
        let threshold = rng.sample(JumpThresholdDistribution);
        let mut integrator = DormandPrince::new(system, config.integrator.clone());
        integrator.set_initial_value(config.times[0], config.initial_state.clone());

        let mut output = Vec::with_capacity(config.times.len());
        output.push(measurement.measure(&normalized(&config.initial_state)));
        let phase = if config.times.len() == 1 {
            Phase::Done
        } else {
            Phase::FreeEvolution
        };
        Self {
            task,
            system,
            config,
            measurement,
            integrator,
            rng,
            threshold,
            next_output: 1,
            phase,
            collapses: Vec::new(),
            output,
        }
    }

    #[must_use]
    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self.phase, Phase::Done)
    }

    /// Perform a single transition of the trajectory.
    ///
    /// # Errors
    ///
    /// Returns an error if integration or the jump search fails, after
    /// which the trajectory is left in [`Phase::Failed`].
    pub fn advance(&mut self) -> Result<(), TrajectoryError> {
        let next = match std::mem::replace(&mut self.phase, Phase::Failed) {
            Phase::FreeEvolution => self.free_evolution()?,
            Phase::JumpSearch(bracket) => self.jump_search(bracket)?,
            Phase::PostJump(point) => self.post_jump(&point)?,
            Phase::Done => Phase::Done,
            Phase::Failed => Phase::Failed,
        };
        self.phase = next;
        Ok(())
    }

    fn free_evolution(&mut self) -> Result<Phase, TrajectoryError> {
        let target = self.config.times[self.next_output];
        let previous = NormPoint::new(self.integrator.t(), self.integrator.y().clone());

        self.integrator.integrate(target, IntegrationMode::SingleStep)?;
        if self.integrator.t() > target {
            self.integrator
                .set_initial_value(previous.t, previous.state.clone());
            self.integrator.integrate(target, IntegrationMode::Exact)?;
        }

        let current = NormPoint::new(self.integrator.t(), self.integrator.y().clone());
        if current.norm_sqr <= self.threshold.norm {
            return Ok(Phase::JumpSearch(Bracket {
                lower: previous,
                upper: current,
            }));
        }
        if current.t >= target {
            self.output
                .push(self.measurement.measure(&normalized(&current.state)));
            self.next_output += 1;
            if self.next_output == self.config.times.len() {
                return Ok(Phase::Done);
            }
        }
        Ok(Phase::FreeEvolution)
    }

    fn jump_search(&mut self, bracket: Bracket) -> Result<Phase, TrajectoryError> {
        let integrator = &mut self.integrator;
        let point = locate_jump(
            bracket,
            self.threshold.norm,
            self.config.tolerance,
            |from, t| {
                integrator.set_initial_value(from.t, from.state.clone());
                integrator.integrate(t, IntegrationMode::Exact)?;
                Ok(NormPoint::new(integrator.t(), integrator.y().clone()))
            },
        )?;
        Ok(Phase::PostJump(point))
    }

    #[allow(clippy::neg_cmp_op_on_partial_ord)]
    fn post_jump(&mut self, point: &NormPoint) -> Result<Phase, TrajectoryError> {
        let weights = self.system.get_decay_weights(point.t, &point.state);
        let channel = select_channel(&weights, self.threshold.channel)
            .ok_or(TrajectoryError::NoDecayChannel { t: point.t })?;

        let collapsed = self
            .system
            .get_collapsed_state(channel, point.t, &point.state);
        let norm = collapsed.norm_l2();
        if !(norm > 0f64) {
            return Err(TrajectoryError::NoDecayChannel { t: point.t });
        }
        debug!(
            trajectory = self.task.index,
            t = point.t,
            channel,
            "Collapse"
        );
        self.collapses.push(Collapse {
            time: point.t,
            channel,
        });
        self.integrator
            .set_initial_value(point.t, collapsed.mapv_into(|x| x / norm));
        self.threshold = self.rng.sample(JumpThresholdDistribution);
        Ok(Phase::FreeEvolution)
    }

    #[must_use]
    pub fn finish(self) -> TrajectoryRecord<M::Out> {
        TrajectoryRecord {
            index: self.task.index,
            seed: self.task.seed,
            collapses: self.collapses,
            output: self.output,
        }
    }
}

/// Run a trajectory without collapse operators, integrating exactly
/// between output times.
fn run_without_collapse<S: JumpSystem, M: Measurement>(
    task: TrajectoryTask,
    system: &S,
    config: &TrajectoryConfig,
    measurement: &M,
    cancel: &CancellationToken,
) -> Result<TrajectoryRecord<M::Out>, TrajectoryError> {
    let mut integrator = DormandPrince::new(system, config.integrator.clone());
    integrator.set_initial_value(config.times[0], config.initial_state.clone());

    let mut output = Vec::with_capacity(config.times.len());
    output.push(measurement.measure(&normalized(&config.initial_state)));
    for &t in &config.times[1..] {
        if cancel.is_cancelled() {
            return Err(TrajectoryError::Cancelled);
        }
        integrator.integrate(t, IntegrationMode::Exact)?;
        output.push(measurement.measure(&normalized(integrator.y())));
    }
    Ok(TrajectoryRecord {
        index: task.index,
        seed: task.seed,
        collapses: Vec::new(),
        output,
    })
}

/// Run a single trajectory to completion.
///
/// This depends only on its arguments, so trajectories can be run in any
/// order, on any thread, with identical results.
///
/// # Errors
///
/// Returns an error if the trajectory fails or `cancel` is triggered.
pub fn run_trajectory<S: JumpSystem, M: Measurement>(
    task: TrajectoryTask,
    system: &S,
    config: &TrajectoryConfig,
    measurement: &M,
    cancel: &CancellationToken,
) -> Result<TrajectoryRecord<M::Out>, TrajectoryError> {
    if cancel.is_cancelled() {
        return Err(TrajectoryError::Cancelled);
    }
    if system.n_collapse() == 0 {
        return run_without_collapse(task, system, config, measurement, cancel);
    }

    let mut engine = TrajectoryEngine::new(task, system, config, measurement);
    while !engine.is_done() {
        if cancel.is_cancelled() {
            return Err(TrajectoryError::Cancelled);
        }
        engine.advance()?;
    }
    let record = engine.finish();
    debug!(
        trajectory = record.index,
        n_collapse = record.collapses.len(),
        "Trajectory complete"
    );
    Ok(record)
}

#[cfg(test)]
mod tests {
    use ndarray::Array1;
    use ndarray_linalg::Norm;
    use num_complex::Complex;
    use rand::{rngs::StdRng, SeedableRng};

    use super::{run_trajectory, Phase, TrajectoryConfig, TrajectoryEngine, TrajectoryTask};
    use crate::{
        error::TrajectoryError,
        solvers::{
            ensemble::CancellationToken,
            integrator::IntegratorOptions,
            jump::JumpTolerance,
            measurement::StateMeasurement,
        },
        system::{
            mc::MCSystem,
            terms::{HamiltonianSpec, OperatorTerm},
        },
        sparse::CsrArray,
        tests::{
            excited_state, get_random_hermitian, get_random_operator, get_random_state, linspace,
            sigma_minus,
        },
    };

    fn config(initial_state: Array1<Complex<f64>>, times: Vec<f64>) -> TrajectoryConfig {
        TrajectoryConfig {
            initial_state,
            times,
            integrator: IntegratorOptions::default(),
            tolerance: JumpTolerance {
                norm_tol: 1e-3,
                norm_steps: 5,
            },
        }
    }

    fn decay_system(gamma: f64) -> MCSystem {
        MCSystem::new(
            &HamiltonianSpec::Constant(CsrArray::zeros([2, 2])),
            &[OperatorTerm::constant(sigma_minus().scaled(Complex {
                re: gamma.sqrt(),
                im: 0.0,
            }))],
            2,
            0.0,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_no_collapse_preserves_norm() {
        let mut rng = StdRng::seed_from_u64(1);
        let hamiltonian = get_random_hermitian(&mut rng, 6);
        let system =
            MCSystem::new(&HamiltonianSpec::Constant(hamiltonian), &[], 6, 0.0, None).unwrap();
        let config = config(get_random_state(&mut rng, 6), linspace(0.0, 5.0, 11));

        let task = TrajectoryTask { index: 0, seed: 0 };
        let record = run_trajectory(
            task,
            &system,
            &config,
            &StateMeasurement {},
            &CancellationToken::default(),
        )
        .unwrap();
        assert_eq!(record.output.len(), 11);
        assert!(record.collapses.is_empty());
        for state in &record.output {
            assert!((state.norm_l2() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_norm_decays_between_jumps() {
        let mut rng = StdRng::seed_from_u64(2);
        let hamiltonian = get_random_hermitian(&mut rng, 4);
        let collapse = (0..2)
            .map(|_| OperatorTerm::constant(get_random_operator(&mut rng, 4)))
            .collect::<Vec<_>>();
        let system =
            MCSystem::new(&HamiltonianSpec::Constant(hamiltonian), &collapse, 4, 0.0, None)
                .unwrap();
        let config = config(get_random_state(&mut rng, 4), linspace(0.0, 3.0, 4));
        let measurement = StateMeasurement {};
        let task = TrajectoryTask { index: 0, seed: 17 };
        let mut engine = TrajectoryEngine::new(task, &system, &config, &measurement);

        let mut last_norm = 1.0;
        let mut n_jumps = 0;
        while !engine.is_done() {
            engine.advance().unwrap();
            match engine.phase() {
                Phase::FreeEvolution => {
                    let norm = engine.integrator.y().norm_l2();
                    if engine.collapses.len() > n_jumps {
                        n_jumps = engine.collapses.len();
                        assert!((norm - 1.0).abs() < 1e-12);
                    } else {
                        assert!(norm <= last_norm + 1e-6);
                    }
                    last_norm = norm;
                }
                Phase::JumpSearch(bracket) => {
                    assert!(bracket.lower.norm_sqr > engine.threshold.norm);
                    assert!(bracket.upper.norm_sqr <= engine.threshold.norm);
                }
                Phase::PostJump(_) | Phase::Done => {}
                Phase::Failed => panic!("trajectory failed"),
            }
        }
        let record = engine.finish();
        assert!(!record.collapses.is_empty());
        assert_eq!(record.output.len(), 4);
    }

    #[test]
    fn test_collapse_times_are_increasing() {
        let system = decay_system(1.0);
        let mut rng = StdRng::seed_from_u64(3);
        let hamiltonian = get_random_hermitian(&mut rng, 2);
        let driven = MCSystem::new(
            &HamiltonianSpec::Constant(hamiltonian),
            &[OperatorTerm::constant(sigma_minus())],
            2,
            0.0,
            None,
        )
        .unwrap();
        let config = config(excited_state(), linspace(0.0, 20.0, 21));

        for (system, seed) in [(&system, 5), (&driven, 6), (&driven, 7)] {
            let record = run_trajectory(
                TrajectoryTask { index: 0, seed },
                system,
                &config,
                &StateMeasurement {},
                &CancellationToken::default(),
            )
            .unwrap();
            for pair in record.collapses.windows(2) {
                assert!(pair[0].time < pair[1].time);
            }
            for collapse in &record.collapses {
                assert!(collapse.time >= 0.0 && collapse.time <= 20.0);
                assert_eq!(collapse.channel, 0);
            }
        }
    }

    #[test]
    fn test_decay_ends_in_ground_state() {
        let system = decay_system(2.0);
        let config = config(excited_state(), linspace(0.0, 50.0, 6));
        let record = run_trajectory(
            TrajectoryTask { index: 3, seed: 11 },
            &system,
            &config,
            &StateMeasurement {},
            &CancellationToken::default(),
        )
        .unwrap();

        // A single jump to the ground state, well before the last output
        assert_eq!(record.index, 3);
        assert_eq!(record.collapses.len(), 1);
        let last = record.output.last().unwrap();
        assert!((last[0].norm() - 1.0).abs() < 1e-10);
        assert!(last[1].norm() < 1e-10);
    }

    #[test]
    fn test_trajectory_is_deterministic() {
        let system = decay_system(1.0);
        let config = config(excited_state(), linspace(0.0, 4.0, 9));
        let run = || {
            run_trajectory(
                TrajectoryTask { index: 0, seed: 42 },
                &system,
                &config,
                &StateMeasurement {},
                &CancellationToken::default(),
            )
            .unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_cancelled_trajectory() {
        let system = decay_system(1.0);
        let config = config(excited_state(), linspace(0.0, 4.0, 9));
        let cancel = CancellationToken::default();
        cancel.cancel();
        let result = run_trajectory(
            TrajectoryTask { index: 0, seed: 42 },
            &system,
            &config,
            &StateMeasurement {},
            &cancel,
        );
        assert_eq!(result, Err(TrajectoryError::Cancelled));
    }
}
