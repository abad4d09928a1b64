use ndarray::{Array4, ArrayView4};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::Rng;

use super::{check_step, EpsilonModel, Sampler, SamplerStepOutput, StepContext};
use crate::{schedulers::ReducedSchedule, Result, SamplingError};

/// Scaling of the noise injected by a DDIM update when `eta > 0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct StepNoise {
	pub(crate) temperature: f32,
	pub(crate) dropout: f32
}

impl Default for StepNoise {
	fn default() -> Self {
		Self { temperature: 1.0, dropout: 0.0 }
	}
}

/// One DDIM update at reduced index `index` given the noise estimate `eps`.
pub(crate) fn ddim_update<R: Rng + ?Sized>(
	schedule: &ReducedSchedule,
	index: usize,
	sample: ArrayView4<'_, f32>,
	eps: ArrayView4<'_, f32>,
	noise: StepNoise,
	rng: &mut R
) -> SamplerStepOutput {
	let alpha = schedule.alphas()[index];
	let alpha_prev = schedule.alphas_prev()[index];
	let sigma = schedule.sigmas()[index];
	let sqrt_one_minus_alpha = schedule.sqrt_one_minus_alphas()[index];

	// 1. compute predicted original sample from predicted noise - "predicted x_0" of formula (12)
	let pred_original_sample = (&sample - &(&eps * sqrt_one_minus_alpha as f32)) / alpha.sqrt() as f32;

	// 2. compute direction pointing to x_t of formula (12)
	let direction = (1.0 - alpha_prev - sigma.powi(2)).max(0.0).sqrt() as f32;
	let mut prev_sample = &pred_original_sample * alpha_prev.sqrt() as f32;
	prev_sample.scaled_add(direction, &eps);

	// 3. random noise, sigma_t(η) of formula (16)
	if sigma > 0.0 {
		let mut variance_noise = Array4::<f32>::random_using(sample.raw_dim(), StandardNormal, rng);
		if noise.dropout > 0.0 {
			let keep = 1.0 - noise.dropout;
			variance_noise.mapv_inplace(|z| if rng.gen::<f32>() < noise.dropout { 0.0 } else { z / keep });
		}
		prev_sample.scaled_add(sigma as f32 * noise.temperature, &variance_noise);
	}

	SamplerStepOutput {
		prev_sample,
		pred_original_sample: Some(pred_original_sample)
	}
}

/// [Denoising Diffusion Implicit Models](https://arxiv.org/abs/2010.02502) over a [`ReducedSchedule`].
///
/// With `eta = 0` the sampler is deterministic; the schedule's sigmas control how much fresh noise every step adds.
#[derive(Debug, Clone)]
pub struct DdimSampler {
	schedule: ReducedSchedule,
	noise: StepNoise,
	num_steps: usize
}

impl DdimSampler {
	/// Creates a DDIM sampler running every step of `schedule`.
	pub fn new(schedule: ReducedSchedule) -> Self {
		let num_steps = schedule.len();
		Self {
			schedule,
			noise: StepNoise::default(),
			num_steps
		}
	}

	/// Scales the injected noise. Has no effect with `eta = 0`.
	pub fn with_temperature(mut self, temperature: f32) -> Self {
		self.noise.temperature = temperature;
		self
	}

	/// Zeroes each element of the injected noise with probability `p`, rescaling the rest by `1 / (1 - p)`.
	///
	/// # Errors
	/// Returns [`SamplingError::Config`] if `p` is not in `[0, 1)`.
	pub fn with_noise_dropout(mut self, p: f32) -> Result<Self> {
		if !(0.0..1.0).contains(&p) {
			return Err(SamplingError::config(format!("noise dropout ({p}) must be in [0, 1)")));
		}
		self.noise.dropout = p;
		Ok(self)
	}

	/// Only runs the `start_step` least noisy steps of the schedule, starting from reduced index `start_step - 1`.
	/// Used to denoise a latent produced by
	/// [`LatentSampler::stochastic_encode`](crate::pipelines::LatentSampler::stochastic_encode).
	///
	/// # Errors
	/// Returns [`SamplingError::Config`] if `start_step` is 0 or exceeds the schedule length.
	pub fn with_start_step(mut self, start_step: usize) -> Result<Self> {
		if start_step == 0 || start_step > self.schedule.len() {
			return Err(SamplingError::config(format!("start step {start_step} outside a schedule of {} steps", self.schedule.len())));
		}
		self.num_steps = start_step;
		Ok(self)
	}

	/// The schedule this sampler steps over.
	pub fn schedule(&self) -> &ReducedSchedule {
		&self.schedule
	}

	fn index(&self, step: usize) -> usize {
		self.num_steps - 1 - step
	}
}

impl Sampler for DdimSampler {
	fn num_steps(&self) -> usize {
		self.num_steps
	}

	fn timestep(&self, step: usize) -> f32 {
		self.schedule.timesteps()[self.index(step)] as f32
	}

	fn prepare_latent(&self, noise: Array4<f32>) -> Array4<f32> {
		noise
	}

	fn step<M: EpsilonModel + ?Sized, R: Rng + ?Sized>(&mut self, model: &mut M, latent: ArrayView4<'_, f32>, step: usize, rng: &mut R) -> Result<SamplerStepOutput> {
		check_step(step, self.num_steps)?;
		let ctx = StepContext { index: step, total: self.num_steps };
		let eps = model.predict(latent, self.timestep(step), ctx)?;
		Ok(ddim_update(&self.schedule, self.index(step), latent, eps.view(), self.noise, rng))
	}
}
