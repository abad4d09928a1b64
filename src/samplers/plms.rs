use std::collections::VecDeque;

use ndarray::{Array4, ArrayView4};
use rand::Rng;

use super::{
	check_step,
	ddim::{ddim_update, StepNoise},
	EpsilonModel, Sampler, SamplerStepOutput, StepContext
};
use crate::{schedulers::ReducedSchedule, Result, SamplingError};

const HISTORY: usize = 3;

/// Pseudo linear multistep sampling from [Liu et al. (2022)](https://arxiv.org/abs/2202.09778).
///
/// The first step is a pseudo improved Euler step (two model evaluations); later steps extrapolate the noise estimate
/// with Adams–Bashforth coefficients of order 2 to 4 over the last three estimates, then apply the DDIM update.
#[derive(Debug, Clone)]
pub struct PlmsSampler {
	schedule: ReducedSchedule,
	old_eps: VecDeque<Array4<f32>>
}

impl PlmsSampler {
	/// Creates a PLMS sampler over `schedule`.
	///
	/// # Errors
	/// Returns [`SamplingError::Config`] if the schedule was built with `eta != 0`; PLMS is deterministic.
	pub fn new(schedule: ReducedSchedule) -> Result<Self> {
		if schedule.eta() != 0.0 {
			return Err(SamplingError::config(format!("PLMS requires eta = 0, got {}", schedule.eta())));
		}
		Ok(Self {
			schedule,
			old_eps: VecDeque::with_capacity(HISTORY + 1)
		})
	}

	/// The schedule this sampler steps over.
	pub fn schedule(&self) -> &ReducedSchedule {
		&self.schedule
	}

	fn index(&self, step: usize) -> usize {
		self.schedule.len() - 1 - step
	}
}

impl Sampler for PlmsSampler {
	fn num_steps(&self) -> usize {
		self.schedule.len()
	}

	fn timestep(&self, step: usize) -> f32 {
		self.schedule.timesteps()[self.index(step)] as f32
	}

	fn prepare_latent(&self, noise: Array4<f32>) -> Array4<f32> {
		noise
	}

	fn step<M: EpsilonModel + ?Sized, R: Rng + ?Sized>(&mut self, model: &mut M, latent: ArrayView4<'_, f32>, step: usize, rng: &mut R) -> Result<SamplerStepOutput> {
		check_step(step, self.num_steps())?;
		if step == 0 {
			self.old_eps.clear();
		}

		let index = self.index(step);
		let ctx = StepContext { index: step, total: self.num_steps() };
		let eps = model.predict(latent, self.timestep(step), ctx)?;

		let eps_prime = match self.old_eps.len() {
			0 => {
				// pseudo improved Euler (2nd order)
				let predicted = ddim_update(&self.schedule, index, latent, eps.view(), StepNoise::default(), rng);
				let t_next = self.schedule.timesteps()[index.saturating_sub(1)] as f32;
				let eps_next = model.predict(predicted.prev_sample(), t_next, ctx)?;
				(&eps + &eps_next) / 2.0
			}
			1 => (&eps * 3.0 - &self.old_eps[0]) / 2.0,
			2 => (&eps * 23.0 - &self.old_eps[1] * 16.0 + &self.old_eps[0] * 5.0) / 12.0,
			_ => (&eps * 55.0 - &self.old_eps[2] * 59.0 + &self.old_eps[1] * 37.0 - &self.old_eps[0] * 9.0) / 24.0
		};

		let output = ddim_update(&self.schedule, index, latent, eps_prime.view(), StepNoise::default(), rng);
		self.old_eps.push_back(eps);
		if self.old_eps.len() > HISTORY {
			self.old_eps.pop_front();
		}
		Ok(output)
	}
}
