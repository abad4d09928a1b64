//! Shared pieces of the samplers ported from [`k-diffusion`](https://github.com/crowsonkb/k-diffusion).

use std::f32::consts::SQRT_2;

use ndarray::{Array4, ArrayView4, Zip};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::Rng;

use super::{EpsilonModel, StepContext};
use crate::{
	schedulers::{KarrasSigmas, SigmaSpacing},
	Result, SamplingError
};

/// Stochastic "churn" from [Karras et al. (2022)](https://arxiv.org/abs/2206.00364), algorithm 2: before a step,
/// noise is added to raise the current noise level from `sigma` to `sigma * (1 + gamma)`.
///
/// Disabled by default (`s_churn = 0`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChurnConfig {
	/// Total amount of churn spread over the run.
	pub s_churn: f32,
	/// Churn is only applied while `s_tmin <= sigma <= s_tmax`.
	pub s_tmin: f32,
	/// See `s_tmin`.
	pub s_tmax: f32,
	/// Scale of the added noise.
	pub s_noise: f32
}

impl Default for ChurnConfig {
	fn default() -> Self {
		Self {
			s_churn: 0.0,
			s_tmin: 0.0,
			s_tmax: f32::INFINITY,
			s_noise: 1.0
		}
	}
}

impl ChurnConfig {
	/// Adds churn noise to `x` in place and returns the raised noise level `sigma_hat`.
	pub(crate) fn apply<R: Rng + ?Sized>(&self, x: &mut Array4<f32>, sigma: f32, num_steps: usize, rng: &mut R) -> f32 {
		let gamma = if self.s_churn > 0.0 && self.s_tmin <= sigma && sigma <= self.s_tmax {
			(self.s_churn / num_steps as f32).min(SQRT_2 - 1.0)
		} else {
			0.0
		};
		let sigma_hat = sigma * (gamma + 1.0);
		if gamma > 0.0 {
			let eps = Array4::<f32>::random_using(x.raw_dim(), StandardNormal, rng);
			x.scaled_add(self.s_noise * (sigma_hat.powi(2) - sigma.powi(2)).sqrt(), &eps);
		}
		sigma_hat
	}
}

/// The noise levels a `k-diffusion` sampler walks through, plus the table used to map them back to model timesteps.
#[derive(Debug, Clone)]
pub(crate) struct SigmaSteps {
	table: KarrasSigmas,
	sigmas: Vec<f32>
}

impl SigmaSteps {
	pub(crate) fn new(table: KarrasSigmas, steps: usize, spacing: SigmaSpacing) -> Result<Self> {
		if steps == 0 {
			return Err(SamplingError::config("number of steps must be > 0"));
		}
		if let SigmaSpacing::Karras { rho } = spacing {
			if !rho.is_finite() || rho <= 0.0 {
				return Err(SamplingError::config(format!("rho ({rho}) must be a positive number")));
			}
		}
		let sigmas = table.sigmas(steps, spacing);
		tracing::debug!(steps, ?spacing, sigma_max = sigmas[0], "built sigma sequence");
		Ok(Self { table, sigmas })
	}

	pub(crate) fn num_steps(&self) -> usize {
		self.sigmas.len() - 1
	}

	pub(crate) fn sigmas(&self) -> &[f32] {
		&self.sigmas
	}

	/// `(sigma[step], sigma[step + 1])`
	pub(crate) fn pair(&self, step: usize) -> Result<(f32, f32)> {
		super::check_step(step, self.num_steps())?;
		Ok((self.sigmas[step], self.sigmas[step + 1]))
	}

	pub(crate) fn timestep(&self, step: usize) -> f32 {
		self.table.sigma_to_t(f64::from(self.sigmas[step])) as f32
	}

	pub(crate) fn prepare_latent(&self, noise: Array4<f32>) -> Array4<f32> {
		noise * self.sigmas[0]
	}

	pub(crate) fn context(&self, step: usize) -> StepContext {
		StepContext { index: step, total: self.num_steps() }
	}

	/// Denoised estimate of `x` at noise level `sigma`, wrapping an epsilon-predicting model like `k-diffusion`'s
	/// `CompVisDenoiser`: the input is scaled by `c_in = 1 / sqrt(sigma^2 + 1)` and `denoised = x + c_out * eps` with
	/// `c_out = -sigma`.
	pub(crate) fn denoise<M: EpsilonModel + ?Sized>(&self, model: &mut M, x: ArrayView4<'_, f32>, sigma: f32, ctx: StepContext) -> Result<Array4<f32>> {
		let c_in = 1.0 / (sigma.powi(2) + 1.0).sqrt();
		let t = self.table.sigma_to_t(f64::from(sigma)) as f32;
		let eps = model.predict((&x * c_in).view(), t, ctx)?;
		if eps.shape() != x.shape() {
			return Err(SamplingError::Upstream(anyhow::anyhow!("model returned shape {:?} for a latent of shape {:?}", eps.shape(), x.shape())));
		}
		let mut denoised = x.to_owned();
		denoised.scaled_add(-sigma, &eps);
		Ok(denoised)
	}
}

/// Converts a denoiser output to a Karras ODE derivative.
pub(crate) fn to_d(x: ArrayView4<'_, f32>, denoised: ArrayView4<'_, f32>, sigma: f32) -> Array4<f32> {
	let mut derivative = x.to_owned();
	Zip::from(&mut derivative).and(&denoised).par_for_each(|d, &den| {
		*d = (*d - den) / sigma;
	});
	derivative
}

/// Calculates the noise level (`sigma_down`) to step down to and the amount of noise to add (`sigma_up`) when doing
/// an ancestral sampling step.
pub(crate) fn ancestral_step(sigma_from: f32, sigma_to: f32) -> (f32, f32) {
	if sigma_to <= 0.0 {
		return (0.0, 0.0);
	}
	let sigma_up = sigma_to.min((sigma_to.powi(2) * (sigma_from.powi(2) - sigma_to.powi(2)) / sigma_from.powi(2)).max(0.0).sqrt());
	let sigma_down = (sigma_to.powi(2) - sigma_up.powi(2)).max(0.0).sqrt();
	(sigma_down, sigma_up)
}

/// Log-space midpoint of two noise levels.
pub(crate) fn log_midpoint(a: f32, b: f32) -> f32 {
	((a.ln() + b.ln()) / 2.0).exp()
}

/// Adds `z * sigma_up` with fresh Gaussian `z`.
pub(crate) fn add_ancestral_noise<R: Rng + ?Sized>(x: &mut Array4<f32>, sigma_up: f32, rng: &mut R) {
	if sigma_up > 0.0 {
		let noise = Array4::<f32>::random_using(x.raw_dim(), StandardNormal, rng);
		x.scaled_add(sigma_up, &noise);
	}
}
