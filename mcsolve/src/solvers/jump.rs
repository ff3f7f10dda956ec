use ndarray::Array1;
use ndarray_linalg::Norm;
use num_complex::Complex;

use crate::error::TrajectoryError;

/// A point on the trajectory, with its squared norm.
#[derive(Debug, Clone, PartialEq)]
pub struct NormPoint {
    pub t: f64,
    pub state: Array1<Complex<f64>>,
    pub norm_sqr: f64,
}

impl NormPoint {
    #[must_use]
    pub fn new(t: f64, state: Array1<Complex<f64>>) -> Self {
        let norm = state.norm_l2();
        Self {
            t,
            state,
            norm_sqr: norm * norm,
        }
    }
}

/// Two points between which the squared norm crosses the jump threshold.
///
/// `lower.norm_sqr > threshold >= upper.norm_sqr`
#[derive(Debug, Clone, PartialEq)]
pub struct Bracket {
    pub lower: NormPoint,
    pub upper: NormPoint,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JumpTolerance {
    /// Relative tolerance on the squared norm at the jump
    pub norm_tol: f64,
    /// Maximum number of refinements
    pub norm_steps: usize,
}

/// Guess the time at which the squared norm reaches `threshold`, assuming it
/// decays exponentially between the ends of the bracket.
///
/// Falls back to the midpoint if the guess is not strictly inside the bracket.
#[must_use]
pub fn interpolate_jump_time(lower: &NormPoint, upper: &NormPoint, threshold: f64) -> f64 {
    let fraction = (lower.norm_sqr / threshold).ln() / (lower.norm_sqr / upper.norm_sqr).ln();
    let guess = lower.t + fraction * (upper.t - lower.t);
    if guess.is_finite() && guess > lower.t && guess <= upper.t {
        guess
    } else {
        0.5 * (lower.t + upper.t)
    }
}

/// Locate the time at which the squared norm reaches `threshold`.
///
/// `propagate(from, t)` must evolve the state at `from` exactly to time `t`.
/// Each refinement replaces whichever end of the bracket lies on the same
/// side of the threshold as the guess.
///
/// # Errors
///
/// Returns an error if propagation fails, or the tolerance is not reached
/// within `norm_steps` refinements.
pub fn locate_jump<F>(
    bracket: Bracket,
    threshold: f64,
    tolerance: JumpTolerance,
    mut propagate: F,
) -> Result<NormPoint, TrajectoryError>
where
    F: FnMut(&NormPoint, f64) -> Result<NormPoint, TrajectoryError>,
{
    let Bracket {
        mut lower,
        mut upper,
    } = bracket;
    for _ in 0..tolerance.norm_steps {
        let t_guess = interpolate_jump_time(&lower, &upper, threshold);
        let guess = propagate(&lower, t_guess)?;

        if (threshold - guess.norm_sqr).abs() < tolerance.norm_tol * threshold {
            return Ok(guess);
        }
        if guess.norm_sqr < threshold {
            upper = guess;
        } else {
            lower = guess;
        }
    }
    Err(TrajectoryError::NormToleranceNotReached {
        t: lower.t,
        norm_steps: tolerance.norm_steps,
    })
}

/// Select the collapse channel from the (unnormalized) decay weights.
///
/// Returns the lowest index whose cumulative probability is at least `r`,
/// or `None` if no channel has positive weight.
#[must_use]
#[allow(clippy::neg_cmp_op_on_partial_ord)]
pub fn select_channel(weights: &[f64], r: f64) -> Option<usize> {
    let total = weights.iter().sum::<f64>();
    if !(total > 0f64) {
        return None;
    }
    let mut cumulative = 0f64;
    for (i, w) in weights.iter().enumerate() {
        cumulative += w / total;
        if cumulative >= r {
            return Some(i);
        }
    }
    // Rounding can leave the final cumulative sum just below r
    weights.iter().rposition(|w| *w > 0f64)
}
