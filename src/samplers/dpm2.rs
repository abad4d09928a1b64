use ndarray::{Array4, ArrayView4};
use rand::Rng;

use super::{
	k_diffusion::{add_ancestral_noise, ancestral_step, log_midpoint, to_d, ChurnConfig, SigmaSteps},
	EpsilonModel, Sampler, SamplerStepOutput, StepContext
};
use crate::{
	schedulers::{KarrasSigmas, SigmaSpacing},
	Result
};

/// Moves `sample` from `sigma` to `sigma_target` with a midpoint step, evaluating the model a second time at the
/// log-space midpoint of the two noise levels. Falls back to an Euler step when `sigma_target` is 0.
fn midpoint_step<M: EpsilonModel + ?Sized>(
	sigmas: &SigmaSteps,
	model: &mut M,
	sample: &mut Array4<f32>,
	derivative: &Array4<f32>,
	sigma: f32,
	sigma_target: f32,
	ctx: StepContext
) -> Result<()> {
	if sigma_target == 0.0 {
		sample.scaled_add(sigma_target - sigma, derivative);
		return Ok(());
	}

	let sigma_mid = log_midpoint(sigma, sigma_target);
	let mut midpoint = sample.clone();
	midpoint.scaled_add(sigma_mid - sigma, derivative);
	let denoised_2 = sigmas.denoise(model, midpoint.view(), sigma_mid, ctx)?;
	let derivative_2 = to_d(midpoint.view(), denoised_2.view(), sigma_mid);
	sample.scaled_add(sigma_target - sigma, &derivative_2);
	Ok(())
}

/// A sampler inspired by [DPM-Solver-2](https://arxiv.org/abs/2206.00927) and algorithm 2 of
/// [Karras et al. (2022)](https://arxiv.org/abs/2206.00364): a midpoint method over noise levels.
#[derive(Debug, Clone)]
pub struct Dpm2Sampler {
	sigmas: SigmaSteps,
	churn: ChurnConfig
}

impl Dpm2Sampler {
	/// Creates a DPM-2 sampler running `steps` steps over the noise levels of `table`.
	///
	/// # Errors
	/// Returns [`SamplingError::Config`](crate::SamplingError::Config) if `steps` is 0 or `spacing` is invalid.
	pub fn new(table: KarrasSigmas, steps: usize, spacing: SigmaSpacing) -> Result<Self> {
		Ok(Self {
			sigmas: SigmaSteps::new(table, steps, spacing)?,
			churn: ChurnConfig::default()
		})
	}

	/// Enables stochastic churn.
	pub fn with_churn(mut self, churn: ChurnConfig) -> Self {
		self.churn = churn;
		self
	}

	/// The noise levels this sampler walks through, ending in `0`.
	pub fn sigmas(&self) -> &[f32] {
		self.sigmas.sigmas()
	}
}

impl Sampler for Dpm2Sampler {
	fn num_steps(&self) -> usize {
		self.sigmas.num_steps()
	}

	fn timestep(&self, step: usize) -> f32 {
		self.sigmas.timestep(step)
	}

	fn prepare_latent(&self, noise: Array4<f32>) -> Array4<f32> {
		self.sigmas.prepare_latent(noise)
	}

	fn step<M: EpsilonModel + ?Sized, R: Rng + ?Sized>(&mut self, model: &mut M, latent: ArrayView4<'_, f32>, step: usize, rng: &mut R) -> Result<SamplerStepOutput> {
		let (sigma, sigma_next) = self.sigmas.pair(step)?;
		let ctx = self.sigmas.context(step);
		let mut sample = latent.to_owned();
		let sigma_hat = self.churn.apply(&mut sample, sigma, self.num_steps(), rng);

		let denoised = self.sigmas.denoise(model, sample.view(), sigma_hat, ctx)?;
		let derivative = to_d(sample.view(), denoised.view(), sigma_hat);
		midpoint_step(&self.sigmas, model, &mut sample, &derivative, sigma_hat, sigma_next, ctx)?;

		Ok(SamplerStepOutput {
			prev_sample: sample,
			pred_original_sample: Some(denoised)
		})
	}
}

/// Ancestral variant of [`Dpm2Sampler`]: a midpoint step down to `sigma_down`, then fresh noise of scale `sigma_up`.
#[derive(Debug, Clone)]
pub struct Dpm2AncestralSampler {
	sigmas: SigmaSteps
}

impl Dpm2AncestralSampler {
	/// Creates an ancestral DPM-2 sampler running `steps` steps over the noise levels of `table`.
	///
	/// # Errors
	/// Returns [`SamplingError::Config`](crate::SamplingError::Config) if `steps` is 0 or `spacing` is invalid.
	pub fn new(table: KarrasSigmas, steps: usize, spacing: SigmaSpacing) -> Result<Self> {
		Ok(Self {
			sigmas: SigmaSteps::new(table, steps, spacing)?
		})
	}

	/// The noise levels this sampler walks through, ending in `0`.
	pub fn sigmas(&self) -> &[f32] {
		self.sigmas.sigmas()
	}
}

impl Sampler for Dpm2AncestralSampler {
	fn num_steps(&self) -> usize {
		self.sigmas.num_steps()
	}

	fn timestep(&self, step: usize) -> f32 {
		self.sigmas.timestep(step)
	}

	fn prepare_latent(&self, noise: Array4<f32>) -> Array4<f32> {
		self.sigmas.prepare_latent(noise)
	}

	fn step<M: EpsilonModel + ?Sized, R: Rng + ?Sized>(&mut self, model: &mut M, latent: ArrayView4<'_, f32>, step: usize, rng: &mut R) -> Result<SamplerStepOutput> {
		let (sigma, sigma_next) = self.sigmas.pair(step)?;
		let ctx = self.sigmas.context(step);
		let mut sample = latent.to_owned();

		let denoised = self.sigmas.denoise(model, latent, sigma, ctx)?;
		let (sigma_down, sigma_up) = ancestral_step(sigma, sigma_next);
		let derivative = to_d(latent, denoised.view(), sigma);
		midpoint_step(&self.sigmas, model, &mut sample, &derivative, sigma, sigma_down, ctx)?;
		add_ancestral_noise(&mut sample, sigma_up, rng);

		Ok(SamplerStepOutput {
			prev_sample: sample,
			pred_original_sample: Some(denoised)
		})
	}
}
