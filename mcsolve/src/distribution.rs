use num_complex::Complex;
use rand::{distributions::Open01, Rng};
use rand_distr::{Distribution, StandardNormal};

/// The Standard Normal distribution for a complex number
/// ``<dWi dWj*> = delta_ij``
pub struct StandardComplexNormal;

impl Distribution<Complex<f64>> for StandardComplexNormal {
    #[inline]
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Complex<f64> {
        let re = rng.sample::<f64, _>(StandardNormal) / std::f64::consts::SQRT_2;
        let im = rng.sample::<f64, _>(StandardNormal) / std::f64::consts::SQRT_2;
        Complex { re, im }
    }
}

/// The two random numbers that decide the next quantum jump.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JumpThreshold {
    /// A jump occurs once the squared norm of the state falls to this value
    pub norm: f64,
    /// Selects the collapse channel from the cumulative channel probabilities
    pub channel: f64,
}

/// Draws a [`JumpThreshold`], with both values uniform on the open interval (0, 1).
///
/// The norm threshold is drawn first, so a seeded stream always yields
/// the same sequence of thresholds.
pub struct JumpThresholdDistribution;

impl Distribution<JumpThreshold> for JumpThresholdDistribution {
    #[inline]
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> JumpThreshold {
        let norm = rng.sample::<f64, _>(Open01);
        let channel = rng.sample::<f64, _>(Open01);
        JumpThreshold { norm, channel }
    }
}
