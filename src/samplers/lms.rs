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

use std::collections::VecDeque;

use ndarray::{Array4, ArrayView4};
use rand::Rng;

use super::{
	k_diffusion::{to_d, SigmaSteps},
	EpsilonModel, Sampler, SamplerStepOutput
};
use crate::{
	schedulers::{KarrasSigmas, SigmaSpacing},
	util::quadrature::gauss_legendre,
	Result
};

const ORDER: usize = 4;

/// Integral over `[sigmas[t], sigmas[t + 1]]` of the Lagrange basis polynomial that is `1` at `sigmas[t - current]`
/// and `0` at the other `order - 1` previous noise levels.
fn lms_coefficient(sigmas: &[f32], order: usize, t: usize, current: usize) -> f64 {
	debug_assert!(t + 1 >= order);
	let node = |k: usize| f64::from(sigmas[t - k]);
	gauss_legendre(
		|tau| {
			(0..order)
				.filter(|&k| k != current)
				.map(|k| (tau - node(k)) / (node(current) - node(k)))
				.product::<f64>()
		},
		f64::from(sigmas[t]),
		f64::from(sigmas[t + 1])
	)
}

/// Linear multistep sampling over noise levels.
///
/// Keeps the derivatives of the last 4 steps and combines them with coefficients from Lagrange interpolation, so
/// each step costs a single model evaluation.
#[derive(Debug, Clone)]
pub struct LmsSampler {
	sigmas: SigmaSteps,
	derivatives: VecDeque<Array4<f32>>
}

impl LmsSampler {
	/// Creates an LMS sampler running `steps` steps over the noise levels of `table`.
	///
	/// # Errors
	/// Returns [`SamplingError::Config`](crate::SamplingError::Config) if `steps` is 0 or `spacing` is invalid.
	pub fn new(table: KarrasSigmas, steps: usize, spacing: SigmaSpacing) -> Result<Self> {
		Ok(Self {
			sigmas: SigmaSteps::new(table, steps, spacing)?,
			derivatives: VecDeque::with_capacity(ORDER + 1)
		})
	}

	/// The noise levels this sampler walks through, ending in `0`.
	pub fn sigmas(&self) -> &[f32] {
		self.sigmas.sigmas()
	}
}

impl Sampler for LmsSampler {
	fn num_steps(&self) -> usize {
		self.sigmas.num_steps()
	}

	fn timestep(&self, step: usize) -> f32 {
		self.sigmas.timestep(step)
	}

	fn prepare_latent(&self, noise: Array4<f32>) -> Array4<f32> {
		self.sigmas.prepare_latent(noise)
	}

	fn step<M: EpsilonModel + ?Sized, R: Rng + ?Sized>(&mut self, model: &mut M, latent: ArrayView4<'_, f32>, step: usize, _rng: &mut R) -> Result<SamplerStepOutput> {
		let (sigma, _) = self.sigmas.pair(step)?;
		if step == 0 {
			self.derivatives.clear();
		}

		// 1. compute predicted original sample (x_0) from sigma-scaled predicted noise
		let pred_original_sample = self.sigmas.denoise(model, latent, sigma, self.sigmas.context(step))?;

		// 2. convert to an ODE derivative
		self.derivatives.push_back(to_d(latent, pred_original_sample.view(), sigma));
		if self.derivatives.len() > ORDER {
			self.derivatives.pop_front();
		}

		// 3. compute linear multistep coefficients
		let order = ORDER.min(step + 1).min(self.derivatives.len());
		let sigmas = self.sigmas.sigmas();

		// 4. compute previous sample based on the derivatives path
		let mut prev_sample = latent.to_owned();
		for (current, derivative) in self.derivatives.iter().rev().take(order).enumerate() {
			prev_sample.scaled_add(lms_coefficient(sigmas, order, step, current) as f32, derivative);
		}

		Ok(SamplerStepOutput {
			prev_sample,
			pred_original_sample: Some(pred_original_sample)
		})
	}
}

#[cfg(test)]
mod tests {
	use super::lms_coefficient;

	#[test]
	fn first_order_coefficient_is_step_width() {
		let sigmas = [14.6, 9.0, 3.5, 0.0];
		assert!((lms_coefficient(&sigmas, 1, 0, 0) - (9.0 - 14.6)).abs() < 1e-5);
	}

	#[test]
	fn coefficients_sum_to_step_width() {
		// the basis polynomials sum to 1, so their integrals sum to the interval length
		let sigmas = [14.6, 9.0, 5.5, 3.5, 1.2, 0.0];
		let step = 4;
		let sum: f64 = (0..4).map(|j| lms_coefficient(&sigmas, 4, step, j)).sum();
		assert!((sum - (0.0 - 1.2)).abs() < 1e-5, "{sum}");
	}
}
