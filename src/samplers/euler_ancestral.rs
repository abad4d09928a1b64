// Copyright 2022-2023 pyke.io
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// 	http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use ndarray::{Array4, ArrayView4};
use rand::Rng;

use super::{
	k_diffusion::{add_ancestral_noise, ancestral_step, to_d, SigmaSteps},
	EpsilonModel, Sampler, SamplerStepOutput
};
use crate::{
	schedulers::{KarrasSigmas, SigmaSpacing},
	Result
};

/// Ancestral sampling with Euler method steps.
///
/// Based on the original [`k-diffusion` implementation by Katherine Crowson][kd].
///
/// [kd]: https://github.com/crowsonkb/k-diffusion/blob/481677d114f6ea445aa009cf5bd7a9cdee909e47/k_diffusion/sampling.py#L72
#[derive(Debug, Clone)]
pub struct EulerAncestralSampler {
	sigmas: SigmaSteps
}

impl EulerAncestralSampler {
	/// Creates an ancestral Euler sampler running `steps` steps over the noise levels of `table`.
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

impl Sampler for EulerAncestralSampler {
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
		let (sigma_from, sigma_to) = self.sigmas.pair(step)?;

		// 1. compute predicted original sample (x_0) from sigma-scaled predicted noise
		let pred_original_sample = self.sigmas.denoise(model, latent, sigma_from, self.sigmas.context(step))?;
		let (sigma_down, sigma_up) = ancestral_step(sigma_from, sigma_to);

		// 2. convert to an ODE derivative
		let derivative = to_d(latent, pred_original_sample.view(), sigma_from);
		let mut prev_sample = latent.to_owned();
		prev_sample.scaled_add(sigma_down - sigma_from, &derivative);

		add_ancestral_noise(&mut prev_sample, sigma_up, rng);

		Ok(SamplerStepOutput {
			prev_sample,
			pred_original_sample: Some(pred_original_sample)
		})
	}
}
