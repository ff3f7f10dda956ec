#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// What to do when a single trajectory fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FailurePolicy {
    /// Fail the whole run, reporting the lowest failing trajectory index
    #[default]
    Abort,
    /// Drop failed trajectories and average over the successful ones
    Discard,
}

/// The number of trajectories to run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TrajectoryCount {
    Single(usize),
    /// Run the largest count, and average over the first `n` trajectories for each `n`
    Checkpoints(Vec<usize>),
}

impl TrajectoryCount {
    /// The number of trajectories which must be run
    #[must_use]
    pub fn total(&self) -> usize {
        match self {
            TrajectoryCount::Single(n) => *n,
            TrajectoryCount::Checkpoints(counts) => counts.iter().copied().max().unwrap_or(0),
        }
    }

    #[must_use]
    pub fn checkpoints(&self) -> Vec<usize> {
        match self {
            TrajectoryCount::Single(n) => vec![*n],
            TrajectoryCount::Checkpoints(counts) => counts.clone(),
        }
    }

    /// # Errors
    ///
    /// Returns an error if a count is zero, or the checkpoints are empty or not increasing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            TrajectoryCount::Single(0) => Err(ConfigError::InvalidTrajectoryCount(
                "at least one trajectory is required".to_owned(),
            )),
            TrajectoryCount::Single(_) => Ok(()),
            TrajectoryCount::Checkpoints(counts) => {
                if counts.is_empty() || counts[0] == 0 {
                    return Err(ConfigError::InvalidTrajectoryCount(
                        "checkpoints must be a non-empty list of positive counts".to_owned(),
                    ));
                }
                if let Some(i) = counts.windows(2).position(|w| w[0] >= w[1]) {
                    return Err(ConfigError::InvalidTrajectoryCount(format!(
                        "checkpoints must be increasing ({} >= {})",
                        counts[i],
                        counts[i + 1]
                    )));
                }
                Ok(())
            }
        }
    }
}

impl From<usize> for TrajectoryCount {
    fn from(value: usize) -> Self {
        TrajectoryCount::Single(value)
    }
}

impl From<Vec<usize>> for TrajectoryCount {
    fn from(value: Vec<usize>) -> Self {
        TrajectoryCount::Checkpoints(value)
    }
}

/// Options controlling the integrator, the jump search and the ensemble.
///
/// A step size of zero means "choose automatically" (`first_step`) or
/// "no bound" (`min_step`, `max_step`).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SolverOptions {
    pub atol: f64,
    pub rtol: f64,
    /// Maximum number of internal steps in a single call to the integrator
    pub nsteps: usize,
    pub first_step: f64,
    pub min_step: f64,
    pub max_step: f64,
    /// Drop operator entries with magnitude below `atol`
    pub tidy: bool,
    /// Relative tolerance on the squared norm when locating a jump
    pub norm_tol: f64,
    /// Maximum number of refinements when locating a jump
    pub norm_steps: usize,
    pub ntraj: TrajectoryCount,
    pub seeds: Option<Vec<u64>>,
    /// Size of the worker pool, defaults to the number of available cores
    pub num_cpus: Option<usize>,
    pub average_expect: bool,
    pub average_states: bool,
    pub steady_state_average: bool,
    pub failure_policy: FailurePolicy,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            atol: 1e-8,
            rtol: 1e-6,
            nsteps: 1000,
            first_step: 0f64,
            min_step: 0f64,
            max_step: 0f64,
            tidy: true,
            norm_tol: 1e-3,
            norm_steps: 5,
            ntraj: TrajectoryCount::Single(500),
            seeds: None,
            num_cpus: None,
            average_expect: true,
            average_states: false,
            steady_state_average: false,
            failure_policy: FailurePolicy::Abort,
        }
    }
}

impl SolverOptions {
    /// # Errors
    ///
    /// Returns an error naming the first invalid option.
    #[allow(clippy::neg_cmp_op_on_partial_ord)]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.atol > 0f64) {
            return Err(ConfigError::invalid_option("atol", "must be positive"));
        }
        if !(self.rtol > 0f64) {
            return Err(ConfigError::invalid_option("rtol", "must be positive"));
        }
        if self.nsteps == 0 {
            return Err(ConfigError::invalid_option("nsteps", "must be at least 1"));
        }
        if self.norm_steps == 0 {
            return Err(ConfigError::invalid_option("norm_steps", "must be at least 1"));
        }
        if !(self.norm_tol > 0f64 && self.norm_tol < 1f64) {
            return Err(ConfigError::invalid_option("norm_tol", "must lie in (0, 1)"));
        }
        for (name, value) in [
            ("first_step", self.first_step),
            ("min_step", self.min_step),
            ("max_step", self.max_step),
        ] {
            if !(value >= 0f64) {
                return Err(ConfigError::invalid_option(name, "must not be negative"));
            }
        }
        if self.min_step > 0f64 && self.max_step > 0f64 && self.min_step > self.max_step {
            return Err(ConfigError::invalid_option(
                "min_step",
                "must not exceed max_step",
            ));
        }
        self.ntraj.validate()?;
        if self.num_cpus == Some(0) {
            return Err(ConfigError::invalid_option("num_cpus", "must be at least 1"));
        }
        Ok(())
    }

    /// True if states are reduced to density matrices.
    #[must_use]
    pub fn averages_states(&self) -> bool {
        self.average_states || self.steady_state_average
    }
}

#[cfg(test)]
mod tests {
    use super::{FailurePolicy, SolverOptions, TrajectoryCount};
    use crate::error::ConfigError;

    #[test]
    fn test_defaults_are_valid() {
        let options = SolverOptions::default();
        assert_eq!(options.validate(), Ok(()));
        assert_eq!(options.norm_steps, 5);
        assert_eq!(options.failure_policy, FailurePolicy::Abort);
        assert!(!options.averages_states());
    }

    #[test]
    fn test_invalid_options_are_rejected() {
        let options = SolverOptions {
            norm_tol: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(ConfigError::InvalidOption { name, .. }) if name == "norm_tol"
        ));

        let options = SolverOptions {
            min_step: 0.5,
            max_step: 0.1,
            ..Default::default()
        };
        assert!(options.validate().is_err());

        let options = SolverOptions {
            atol: f64::NAN,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_trajectory_counts() {
        let single = TrajectoryCount::from(20);
        assert_eq!(single.total(), 20);
        assert_eq!(single.checkpoints(), vec![20]);

        let checkpoints = TrajectoryCount::from(vec![10, 50, 100]);
        assert_eq!(checkpoints.total(), 100);
        assert_eq!(checkpoints.validate(), Ok(()));

        assert!(TrajectoryCount::Single(0).validate().is_err());
        assert!(TrajectoryCount::Checkpoints(vec![]).validate().is_err());
        assert!(matches!(
            TrajectoryCount::Checkpoints(vec![10, 10]).validate(),
            Err(ConfigError::InvalidTrajectoryCount(_))
        ));
    }
}
