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

/// Euler steps over noise levels, algorithm 2 of [Karras et al. (2022)](https://arxiv.org/abs/2206.00364).
///
/// Based on the original [`k-diffusion` implementation by Katherine Crowson][kd].
///
/// [kd]: https://github.com/crowsonkb/k-diffusion/blob/481677d114f6ea445aa009cf5bd7a9cdee909e47/k_diffusion/sampling.py#L51
#[derive(Debug, Clone)]
pub struct EulerSampler {
	sigmas: SigmaSteps,
	churn: ChurnConfig
}

impl EulerSampler {
	/// Creates an Euler sampler running `steps` steps over the noise levels of `table`.
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

impl Sampler for EulerSampler {
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
		let mut sample = latent.to_owned();
		let sigma_hat = self.churn.apply(&mut sample, sigma, self.num_steps(), rng);

		// 1. compute predicted original sample (x_0) from sigma-scaled predicted noise
		let pred_original_sample = self.sigmas.denoise(model, sample.view(), sigma_hat, self.sigmas.context(step))?;

		// 2. convert to an ODE derivative
		let derivative = to_d(sample.view(), pred_original_sample.view(), sigma_hat);

		// 3. Euler step
		sample.scaled_add(sigma_next - sigma_hat, &derivative);

		Ok(SamplerStepOutput {
			prev_sample: sample,
			pred_original_sample: Some(pred_original_sample)
		})
	}
}
