use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::util::interpolation::LinearInterpolator;

/// How the noise levels of a k-diffusion sampling run are spaced.
#[derive(Debug, Default, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SigmaSpacing {
	/// Evenly spaced training timesteps from `T - 1` down to `0`, converted to sigmas.
	#[default]
	Linear,
	/// The rho-schedule from [Karras et al. (2022)](https://arxiv.org/abs/2206.00364), eq. 5, between the schedule's
	/// smallest and largest sigma. `rho = 7` is the paper's choice.
	Karras {
		/// Controls how strongly steps concentrate near the low-noise end.
		rho: f64
	}
}

/// A discrete-time schedule viewed as noise levels: `sigma_t = sqrt((1 - ac_t) / ac_t)`, the standard deviation of the
/// noise in `x_t / sqrt(ac_t)`.
///
/// Conversions between fractional timesteps and sigmas interpolate linearly in `log(sigma)`, like the `CompVis`
/// denoiser wrapper of `k-diffusion`.
#[derive(Debug, Clone)]
pub struct KarrasSigmas {
	sigmas: Array1<f64>,
	log_sigmas: Array1<f64>,
	timesteps: Array1<f64>
}

impl KarrasSigmas {
	/// Derives the sigma table from cumulative alphas.
	pub fn new(alphas_cumprod: ArrayView1<'_, f64>) -> Self {
		let mut sigmas = alphas_cumprod.to_owned();
		sigmas.par_map_inplace(|f| {
			*f = ((1.0 - *f) / *f).sqrt();
		});
		let log_sigmas = sigmas.mapv(f64::ln);
		let timesteps = Array1::range(0.0, sigmas.len() as f64, 1.0);
		Self { sigmas, log_sigmas, timesteps }
	}

	/// Sigma of every training timestep.
	pub fn table(&self) -> ArrayView1<'_, f64> {
		self.sigmas.view()
	}

	/// Smallest sigma of the schedule (at `t = 0`).
	pub fn sigma_min(&self) -> f64 {
		self.sigmas[0]
	}

	/// Largest sigma of the schedule (at `t = T - 1`).
	pub fn sigma_max(&self) -> f64 {
		self.sigmas[self.sigmas.len() - 1]
	}

	/// Sigma at a (possibly fractional) training timestep.
	pub fn t_to_sigma(&self, t: f64) -> f64 {
		if self.sigmas.len() < 2 {
			return self.sigmas[0];
		}
		LinearInterpolator::new(self.timesteps.view(), self.log_sigmas.view()).eval_clamped(t).exp()
	}

	/// The fractional training timestep whose sigma is `sigma`, clamped to `[0, T - 1]`.
	pub fn sigma_to_t(&self, sigma: f64) -> f64 {
		if self.sigmas.len() < 2 {
			return 0.0;
		}
		LinearInterpolator::new(self.log_sigmas.view(), self.timesteps.view()).eval_clamped(sigma.ln())
	}

	/// Noise levels for `steps` sampling steps, from most to least noisy, followed by a final `0`. The returned vector
	/// therefore holds `steps + 1` values.
	pub fn sigmas(&self, steps: usize, spacing: SigmaSpacing) -> Vec<f32> {
		let denom = steps.saturating_sub(1).max(1) as f64;
		let mut sigmas: Vec<f32> = match spacing {
			SigmaSpacing::Linear => {
				let t_max = (self.sigmas.len() - 1) as f64;
				let mut interp = (self.sigmas.len() >= 2).then(|| LinearInterpolator::new(self.timesteps.view(), self.log_sigmas.view()));
				(0..steps)
					.map(|i| {
						let t = t_max * (1.0 - i as f64 / denom);
						match interp.as_mut() {
							Some(interp) => interp.eval_clamped(t).exp() as f32,
							None => self.sigmas[0] as f32
						}
					})
					.collect()
			}
			SigmaSpacing::Karras { rho } => {
				let min_inv_rho = self.sigma_min().powf(1.0 / rho);
				let max_inv_rho = self.sigma_max().powf(1.0 / rho);
				(0..steps)
					.map(|i| (max_inv_rho + i as f64 / denom * (min_inv_rho - max_inv_rho)).powf(rho) as f32)
					.collect()
			}
		};
		sigmas.push(0.0);
		sigmas
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::schedulers::{Schedule, ScheduleConfig};

	#[test]
	fn timestep_sigma_round_trip() {
		let schedule = Schedule::new(&ScheduleConfig::default()).unwrap();
		let sigmas = schedule.karras_sigmas();
		for t in [0.0, 1.5, 250.25, 998.0, 999.0] {
			let back = sigmas.sigma_to_t(sigmas.t_to_sigma(t));
			assert!((back - t).abs() < 1e-6, "{t} -> {back}");
		}
		assert_eq!(sigmas.sigma_to_t(1e-9), 0.0);
		assert_eq!(sigmas.sigma_to_t(1e9), 999.0);
	}

	#[test]
	fn sigma_sequences_descend_to_zero() {
		let schedule = Schedule::new(&ScheduleConfig::default()).unwrap();
		let table = schedule.karras_sigmas();
		for spacing in [SigmaSpacing::Linear, SigmaSpacing::Karras { rho: 7.0 }] {
			let sigmas = table.sigmas(12, spacing);
			assert_eq!(sigmas.len(), 13);
			assert_eq!(*sigmas.last().unwrap(), 0.0);
			assert!(sigmas.windows(2).all(|w| w[0] > w[1]), "{spacing:?}: {sigmas:?}");
			assert!((f64::from(sigmas[0]) - table.sigma_max()).abs() < 1e-3 * table.sigma_max());
		}
	}
}
