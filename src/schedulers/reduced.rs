use std::str::FromStr;

use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

use crate::{Result, SamplingError};

/// How the sampling timesteps are spread over the training timesteps.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Discretization {
	/// Evenly spaced timesteps.
	#[default]
	Uniform,
	/// Quadratically spaced timesteps, denser towards the low-noise end.
	Quadratic
}

impl FromStr for Discretization {
	type Err = SamplingError;

	fn from_str(s: &str) -> Result<Self> {
		match s {
			"uniform" => Ok(Self::Uniform),
			"quad" | "quadratic" => Ok(Self::Quadratic),
			_ => Err(SamplingError::config(format!("there is no ddim discretization method called '{s}'")))
		}
	}
}

/// A subset of the training timesteps together with the DDIM sampling parameters for each of them.
///
/// All per-step vectors are indexed by position in [`ReducedSchedule::timesteps`], i.e. index `0` is the least noisy
/// step.
#[derive(Debug, Clone)]
pub struct ReducedSchedule {
	timesteps: Vec<usize>,
	alphas: Vec<f64>,
	alphas_prev: Vec<f64>,
	sigmas: Vec<f64>,
	sqrt_one_minus_alphas: Vec<f64>,
	eta: f32
}

impl ReducedSchedule {
	/// Picks `steps` timesteps from `alphas_cumprod` and derives the DDIM parameters with stochasticity `eta`
	/// (`0` is fully deterministic, `1` matches DDPM's posterior variance).
	///
	/// # Errors
	/// - [`SamplingError::Config`] if `steps` is 0 or larger than the number of training timesteps, if `eta` is
	///   negative, or if the quadratic discretization collapses timesteps for this many steps.
	/// - [`SamplingError::Precondition`] if a picked timestep falls outside the training schedule.
	pub fn new(alphas_cumprod: ArrayView1<'_, f64>, steps: usize, discretization: Discretization, eta: f32) -> Result<Self> {
		let num_train_timesteps = alphas_cumprod.len();
		if steps == 0 || steps > num_train_timesteps {
			return Err(SamplingError::config(format!("cannot sample {steps} steps from a schedule of {num_train_timesteps} timesteps")));
		}
		if eta.is_nan() || eta < 0.0 {
			return Err(SamplingError::config(format!("eta ({eta}) must be >= 0")));
		}

		let mut timesteps: Vec<usize> = match discretization {
			Discretization::Uniform => {
				let c = num_train_timesteps / steps;
				(0..steps).map(|i| i * c).collect()
			}
			Discretization::Quadratic => {
				let end = (num_train_timesteps as f64 * 0.8).sqrt();
				let denom = steps.saturating_sub(1).max(1) as f64;
				(0..steps).map(|i| (end * i as f64 / denom).powi(2) as usize).collect()
			}
		};
		if timesteps.windows(2).any(|w| w[0] >= w[1]) {
			return Err(SamplingError::config(format!("{discretization:?} discretization yields duplicate timesteps for {steps} steps")));
		}

		// shift by one so the final step lands on the alphas of timestep 1 rather than 0, unless that would run off
		// the end of the schedule
		if timesteps[steps - 1] + 1 < num_train_timesteps {
			timesteps.iter_mut().for_each(|t| *t += 1);
		}
		if let Some(t) = timesteps.iter().find(|&&t| t >= num_train_timesteps) {
			return Err(SamplingError::precondition(format!("timestep {t} outside schedule of length {num_train_timesteps}")));
		}

		let alphas: Vec<f64> = timesteps.iter().map(|&t| alphas_cumprod[t]).collect();
		let alphas_prev: Vec<f64> = std::iter::once(alphas_cumprod[0]).chain(alphas[..steps - 1].iter().copied()).collect();
		let sigmas = alphas
			.iter()
			.zip(&alphas_prev)
			.map(|(&a, &a_prev)| f64::from(eta) * ((1.0 - a_prev) / (1.0 - a) * (1.0 - a / a_prev)).sqrt())
			.collect();
		let sqrt_one_minus_alphas = alphas.iter().map(|a| (1.0 - a).sqrt()).collect();

		tracing::debug!(steps, ?discretization, eta, first = timesteps[0], last = timesteps[steps - 1], "built reduced schedule");

		Ok(Self {
			timesteps,
			alphas,
			alphas_prev,
			sigmas,
			sqrt_one_minus_alphas,
			eta
		})
	}

	/// Number of sampling steps (`S`).
	pub fn len(&self) -> usize {
		self.timesteps.len()
	}

	/// Always `false`; a reduced schedule has at least one step.
	pub fn is_empty(&self) -> bool {
		self.timesteps.is_empty()
	}

	/// The picked training timesteps, ascending.
	pub fn timesteps(&self) -> &[usize] {
		&self.timesteps
	}

	/// `alphas_cumprod` at each picked timestep.
	pub fn alphas(&self) -> &[f64] {
		&self.alphas
	}

	/// `alphas_cumprod` at the previous picked timestep (`alphas_cumprod[0]` for the first).
	pub fn alphas_prev(&self) -> &[f64] {
		&self.alphas_prev
	}

	/// Standard deviation of the noise injected at each step.
	pub fn sigmas(&self) -> &[f64] {
		&self.sigmas
	}

	/// `sqrt(1 - alpha)` at each picked timestep.
	pub fn sqrt_one_minus_alphas(&self) -> &[f64] {
		&self.sqrt_one_minus_alphas
	}

	/// The `eta` this schedule was built with.
	pub fn eta(&self) -> f32 {
		self.eta
	}
}
