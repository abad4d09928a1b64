//! Seeded Gaussian noise for initial latents and stochastic steps.

use std::ops::Range;

use ndarray::{Array4, Axis};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::{rngs::StdRng, SeedableRng};

use crate::{Result, SamplingError};

/// Mixed into the user seed for the generator that supplies per-step noise, so that it never replays the stream of
/// the first sample's initial noise.
const STEP_NOISE_SALT: u64 = 0x9e37_79b9_7f4a_7c15;

/// Seeded Gaussian noise, generated one sample at a time.
///
/// Sample `i` of a batch is drawn from its own generator seeded with `seed + i`. The noise for a given sample is
/// therefore the same whatever the batch size, and whichever way the batch is later split into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoiseSource {
	seed: u64
}

impl NoiseSource {
	/// Creates a noise source for the given base seed.
	pub fn new(seed: u64) -> Self {
		Self { seed }
	}

	/// The base seed.
	pub fn seed(&self) -> u64 {
		self.seed
	}

	/// Standard normal noise of `shape` (`[batch, channels, height, width]`).
	///
	/// # Errors
	/// Returns [`SamplingError::Config`] if any dimension of `shape` is 0.
	pub fn sample(&self, shape: [usize; 4]) -> Result<Array4<f32>> {
		self.sample_range(shape, 0..shape[0])
	}

	/// The samples `range` of the batch that [`NoiseSource::sample`] would produce for `shape`.
	///
	/// # Errors
	/// Returns [`SamplingError::Config`] if any dimension of `shape` is 0 or `range` is not inside the batch.
	pub fn sample_range(&self, shape: [usize; 4], range: Range<usize>) -> Result<Array4<f32>> {
		validate_shape(shape)?;
		if range.start > range.end || range.end > shape[0] {
			return Err(SamplingError::config(format!("sample range {range:?} outside batch of {}", shape[0])));
		}

		let [_, channels, height, width] = shape;
		let mut noise = Array4::<f32>::zeros((range.len(), channels, height, width));
		for (sample, mut out) in range.zip(noise.axis_iter_mut(Axis(0))) {
			let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(sample as u64));
			let single = Array4::<f32>::random_using((1, channels, height, width), StandardNormal, &mut rng);
			out.assign(&single.index_axis(Axis(0), 0));
		}
		Ok(noise)
	}

	/// A generator for the noise injected during sampling (ancestral steps, `eta > 0`, churn).
	pub fn step_rng(&self) -> StdRng {
		StdRng::seed_from_u64(self.seed ^ STEP_NOISE_SALT)
	}
}

pub(crate) fn validate_shape(shape: [usize; 4]) -> Result<()> {
	if shape.iter().any(|&d| d == 0) {
		return Err(SamplingError::config(format!("malformed latent shape {shape:?}: every dimension must be > 0")));
	}
	Ok(())
}
