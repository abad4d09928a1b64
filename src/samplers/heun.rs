use ndarray::{Array4, ArrayView4};
use rand::Rng;

use super::{
	k_diffusion::{to_d, ChurnConfig, SigmaSteps},
	EpsilonModel, Sampler, SamplerStepOutput
};
use crate::{
	schedulers::{KarrasSigmas, SigmaSpacing},
	Result
};

/// Heun's method (a second order predictor-corrector), algorithm 2 of
/// [Karras et al. (2022)](https://arxiv.org/abs/2206.00364).
///
/// Costs two model evaluations per step, except the last one which is a plain Euler step to `sigma = 0`.
#[derive(Debug, Clone)]
pub struct HeunSampler {
	sigmas: SigmaSteps,
	churn: ChurnConfig
}

impl HeunSampler {
	/// Creates a Heun sampler running `steps` steps over the noise levels of `table`.
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

impl Sampler for HeunSampler {
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
		let dt = sigma_next - sigma_hat;

		if sigma_next == 0.0 {
			sample.scaled_add(dt, &derivative);
		} else {
			let mut predicted = sample.clone();
			predicted.scaled_add(dt, &derivative);
			let denoised_2 = self.sigmas.denoise(model, predicted.view(), sigma_next, ctx)?;
			let derivative_2 = to_d(predicted.view(), denoised_2.view(), sigma_next);
			sample.scaled_add(dt / 2.0, &derivative);
			sample.scaled_add(dt / 2.0, &derivative_2);
		}

		Ok(SamplerStepOutput {
			prev_sample: sample,
			pred_original_sample: Some(denoised)
		})
	}
}
