use ndarray::Array1;
use num_complex::Complex;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{error::IntegratorError, options::SolverOptions, system::EvolutionSystem};

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IntegratorOptions {
    pub atol: f64,
    pub rtol: f64,
    /// Maximum number of attempted steps in a single call to `integrate`
    pub nsteps: usize,
    /// Zero to choose automatically
    pub first_step: f64,
    /// Zero for no bound
    pub min_step: f64,
    /// Zero for no bound
    pub max_step: f64,
}

impl Default for IntegratorOptions {
    fn default() -> Self {
        SolverOptions::default().into()
    }
}

impl From<&SolverOptions> for IntegratorOptions {
    fn from(value: &SolverOptions) -> Self {
        Self {
            atol: value.atol,
            rtol: value.rtol,
            nsteps: value.nsteps,
            first_step: value.first_step,
            min_step: value.min_step,
            max_step: value.max_step,
        }
    }
}

impl From<SolverOptions> for IntegratorOptions {
    fn from(value: SolverOptions) -> Self {
        (&value).into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationMode {
    /// Advance to exactly the target time
    Exact,
    /// Take a single accepted step toward the target, which may overshoot it
    SingleStep,
}

/// An adaptive, embedded Runge-Kutta 5(4) integrator of Dormand and Prince.
///
/// The fifth order solution is propagated, and the derivative at the end of
/// each accepted step is reused as the first stage of the next.
pub struct DormandPrince<'a, S> {
    system: &'a S,
    options: IntegratorOptions,
    t: f64,
    y: Array1<Complex<f64>>,
    derivative: Array1<Complex<f64>>,
    /// Suggested size of the next step, or zero if not yet chosen
    h: f64,
    successful: bool,
}

impl<S> DormandPrince<'_, S> {
    pub const C: [f64; 7] = [0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0];

    // Note: the tableau is lower diagonal, and the last row equals B
    pub const A: [[f64; 6]; 7] = [
        [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        [1.0 / 5.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        [3.0 / 40.0, 9.0 / 40.0, 0.0, 0.0, 0.0, 0.0],
        [44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0, 0.0, 0.0, 0.0],
        [
            19372.0 / 6561.0,
            -25360.0 / 2187.0,
            64448.0 / 6561.0,
            -212.0 / 729.0,
            0.0,
            0.0,
        ],
        [
            9017.0 / 3168.0,
            -355.0 / 33.0,
            46732.0 / 5247.0,
            49.0 / 176.0,
            -5103.0 / 18656.0,
            0.0,
        ],
        [
            35.0 / 384.0,
            0.0,
            500.0 / 1113.0,
            125.0 / 192.0,
            -2187.0 / 6784.0,
            11.0 / 84.0,
        ],
    ];

    /// Difference between the fifth and fourth order weights
    pub const E: [f64; 7] = [
        71.0 / 57600.0,
        0.0,
        -71.0 / 16695.0,
        71.0 / 1920.0,
        -17253.0 / 339_200.0,
        22.0 / 525.0,
        -1.0 / 40.0,
    ];

    const SAFETY: f64 = 0.9;
    const MIN_FACTOR: f64 = 0.2;
    const MAX_FACTOR: f64 = 10.0;

    #[must_use]
    pub fn t(&self) -> f64 {
        self.t
    }

    #[must_use]
    pub fn y(&self) -> &Array1<Complex<f64>> {
        &self.y
    }

    /// False if the last call to `integrate` failed
    #[must_use]
    pub fn successful(&self) -> bool {
        self.successful
    }

    fn step_factor(error: f64) -> f64 {
        if error == 0f64 {
            Self::MAX_FACTOR
        } else if error.is_finite() {
            (Self::SAFETY * error.powf(-0.2)).clamp(Self::MIN_FACTOR, Self::MAX_FACTOR)
        } else {
            Self::MIN_FACTOR
        }
    }
}

/// Root mean square of `|values_i| / scale_i`
#[allow(clippy::cast_precision_loss)]
fn scaled_rms<'a>(
    values: impl Iterator<Item = &'a Complex<f64>>,
    scale: impl Iterator<Item = f64>,
    len: usize,
) -> f64 {
    if len == 0 {
        return 0f64;
    }
    let sum = values
        .zip(scale)
        .map(|(v, s)| (v.norm() / s).powi(2))
        .sum::<f64>();
    (sum / len as f64).sqrt()
}

impl<'a, S: EvolutionSystem> DormandPrince<'a, S> {
    #[must_use]
    pub fn new(system: &'a S, options: IntegratorOptions) -> Self {
        Self {
            system,
            options,
            t: 0f64,
            y: Array1::zeros(0),
            derivative: Array1::zeros(0),
            h: 0f64,
            successful: true,
        }
    }

    /// Restart the integration from `(t0, y0)`.
    ///
    /// The current step size suggestion is kept.
    pub fn set_initial_value(&mut self, t0: f64, y0: Array1<Complex<f64>>) {
        self.derivative = self.system.get_derivative(t0, &y0);
        self.t = t0;
        self.y = y0;
        self.successful = true;
    }

    /// Integrate toward `target`.
    ///
    /// In [`IntegrationMode::Exact`] the integrator finishes at exactly `target`, in
    /// [`IntegrationMode::SingleStep`] it takes one accepted step which may overshoot.
    /// Does nothing if the integrator is already at or past `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tolerances cannot be satisfied within `nsteps`
    /// attempts, the step size underflows, or the state becomes non-finite.
    pub fn integrate(&mut self, target: f64, mode: IntegrationMode) -> Result<(), IntegratorError> {
        let result = self.advance(target, mode);
        self.successful = result.is_ok();
        result
    }

    fn advance(&mut self, target: f64, mode: IntegrationMode) -> Result<(), IntegratorError> {
        if self.t >= target {
            return Ok(());
        }
        if self.h <= 0f64 {
            self.h = if self.options.first_step > 0f64 {
                self.options.first_step
            } else {
                self.initial_step()
            };
        }

        let mut rejected = false;
        for _ in 0..self.options.nsteps {
            let mut h = self.h;
            if self.options.max_step > 0f64 {
                h = h.min(self.options.max_step);
            }
            if self.options.min_step > 0f64 {
                h = h.max(self.options.min_step);
            }

            let remaining = target - self.t;
            let smallest = 16f64 * f64::EPSILON * self.t.abs().max(1f64);
            let lands = mode == IntegrationMode::Exact && h >= remaining;
            if lands {
                if remaining <= smallest {
                    self.t = target;
                    return Ok(());
                }
                h = remaining;
            } else if h < smallest {
                return Err(IntegratorError::StepSizeTooSmall { t: self.t, h });
            }

            let (y_new, derivative_new, error) = self.attempt(h);
            let mut factor = Self::step_factor(error);

            if error <= 1f64 {
                if y_new.iter().any(|y| !y.is_finite()) {
                    return Err(IntegratorError::NonFiniteState { t: self.t + h });
                }
                if rejected {
                    factor = factor.min(1f64);
                }
                self.t = if lands { target } else { self.t + h };
                self.y = y_new;
                self.derivative = derivative_new;
                self.h = if lands { self.h.max(h * factor) } else { h * factor };

                if lands || mode == IntegrationMode::SingleStep {
                    return Ok(());
                }
                rejected = false;
            } else {
                if self.options.min_step > 0f64 && h <= self.options.min_step {
                    return Err(IntegratorError::StepSizeTooSmall { t: self.t, h });
                }
                rejected = true;
                self.h = h * factor;
            }
        }
        Err(IntegratorError::TooManySteps {
            t: self.t,
            nsteps: self.options.nsteps,
        })
    }

    /// Attempt a step of size `h`, returning the new state, the derivative there and the scaled error.
    fn attempt(&self, h: f64) -> (Array1<Complex<f64>>, Array1<Complex<f64>>, f64) {
        let mut k = Vec::with_capacity(7);
        k.push(self.derivative.clone());
        let mut stage = self.y.clone();
        for i in 1..7 {
            stage = self.y.clone();
            for (j, kj) in k.iter().enumerate() {
                let a = Self::A[i][j];
                if a != 0f64 {
                    stage.scaled_add(Complex { re: a * h, im: 0f64 }, kj);
                }
            }
            k.push(self.system.get_derivative(self.t + Self::C[i] * h, &stage));
        }
        // The last stage is evaluated at the fifth order solution
        let y_new = stage;

        let mut error = Array1::<Complex<f64>>::zeros(self.y.len());
        for (e, kj) in Self::E.iter().zip(&k) {
            if *e != 0f64 {
                error.scaled_add(Complex { re: e * h, im: 0f64 }, kj);
            }
        }
        let scale = self
            .y
            .iter()
            .zip(y_new.iter())
            .map(|(a, b)| self.options.atol + self.options.rtol * a.norm().max(b.norm()));
        let error = scaled_rms(error.iter(), scale, self.y.len());

        let derivative_new = k.pop().unwrap_or_default();
        (y_new, derivative_new, error)
    }

    /// Choose a first step from the size of the state and its derivatives.
    fn initial_step(&self) -> f64 {
        let scale = || {
            self.y
                .iter()
                .map(|y| self.options.atol + self.options.rtol * y.norm())
        };
        let n = self.y.len();
        let d0 = scaled_rms(self.y.iter(), scale(), n);
        let d1 = scaled_rms(self.derivative.iter(), scale(), n);
        let h0 = if d0 < 1e-5 || d1 < 1e-5 {
            1e-6
        } else {
            0.01 * d0 / d1
        };

        let mut y1 = self.y.clone();
        y1.scaled_add(Complex { re: h0, im: 0f64 }, &self.derivative);
        let f1 = self.system.get_derivative(self.t + h0, &y1);
        let difference = &f1 - &self.derivative;
        let d2 = scaled_rms(difference.iter(), scale(), n) / h0;

        let h1 = if d1.max(d2) <= 1e-15 {
            (h0 * 1e-3).max(1e-6)
        } else {
            (0.01 / d1.max(d2)).powf(0.2)
        };
        (100f64 * h0).min(h1)
    }
}
