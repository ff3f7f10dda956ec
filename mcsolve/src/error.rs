use thiserror::Error;

use crate::coefficient::expression::ExpressionError;

/// Result type alias for a full Monte Carlo run.
pub type Result<T> = std::result::Result<T, MCError>;

/// Problems found while validating the inputs, before any trajectory runs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("The list of output times is empty")]
    EmptyTimes,

    #[error("Output times must be strictly increasing (index {index}: {previous} >= {current})")]
    NonIncreasingTimes {
        index: usize,
        previous: f64,
        current: f64,
    },

    #[error("Dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    #[error("Initial state must be a normalizable state vector: {0}")]
    InvalidInitialState(String),

    #[error("The Hamiltonian must contain at least one constant term")]
    MissingConstantTerm,

    #[error("Unrecognized time-dependence format: {0}")]
    UnrecognizedTimeDependence(String),

    #[error("Failed to compile time coefficient: {0}")]
    Expression(#[from] ExpressionError),

    #[error("Invalid option '{name}': {reason}")]
    InvalidOption { name: String, reason: String },

    #[error("Incompatible number of seeds: need {expected}, got {actual}")]
    InsufficientSeeds { expected: usize, actual: usize },

    #[error("Invalid trajectory count: {0}")]
    InvalidTrajectoryCount(String),
}

impl ConfigError {
    pub fn dimension_mismatch(what: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch {
            what: what.into(),
            expected,
            actual,
        }
    }

    pub fn invalid_option(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Failures of the adaptive integrator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IntegratorError {
    #[error("Exceeded the maximum of {nsteps} internal steps at t = {t}")]
    TooManySteps { t: f64, nsteps: usize },

    #[error("Step size {h} fell below the minimum allowed at t = {t}")]
    StepSizeTooSmall { t: f64, h: f64 },

    #[error("State became non-finite at t = {t}")]
    NonFiniteState { t: f64 },
}

/// Failures that abort a single trajectory.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrajectoryError {
    #[error("Integration failed: {0}")]
    Integrator(#[from] IntegratorError),

    #[error(
        "Norm tolerance not reached after {norm_steps} steps near t = {t}. \
         Increase accuracy of the ODE solver or the norm_steps option."
    )]
    NormToleranceNotReached { t: f64, norm_steps: usize },

    #[error("No collapse channel has a non-zero rate at t = {t}")]
    NoDecayChannel { t: f64 },

    #[error("Trajectory cancelled")]
    Cancelled,
}

/// Errors returned by a full Monte Carlo run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MCError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Trajectory {index} failed: {source}")]
    Trajectory {
        index: usize,
        #[source]
        source: TrajectoryError,
    },

    #[error("Run cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConfigError::dimension_mismatch("initial state", 4, 2);
        assert!(err.to_string().contains("initial state"));
        assert!(err.to_string().contains('4'));

        let err = MCError::Trajectory {
            index: 7,
            source: TrajectoryError::NormToleranceNotReached {
                t: 1.5,
                norm_steps: 5,
            },
        };
        assert!(err.to_string().contains("Trajectory 7"));
        assert!(err.to_string().contains("norm_steps"));
    }

    #[test]
    fn test_integrator_error_converts() {
        let err: TrajectoryError = IntegratorError::TooManySteps { t: 0.5, nsteps: 10 }.into();
        assert!(matches!(err, TrajectoryError::Integrator(_)));
    }
}
