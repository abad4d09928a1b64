//! Noise schedules define the forward diffusion process: a sequence of `betas` (per-timestep noise variance) and the
//! derived `alphas_cumprod` (how much of the original signal survives up to each timestep).
//!
//! * [`Schedule`] holds the full training schedule and is built once, then shared by reference with everything that
//!   needs it.
//! * [`ReducedSchedule`] picks a subset of the training timesteps for DDIM-family sampling, fixing the sampling cost.
//! * [`KarrasSigmas`] reparameterizes the same schedule as noise levels `sigma` for the k-diffusion samplers.

use std::{f64::consts::FRAC_PI_2, str::FromStr};

use ndarray::{Array1, Array4, ArrayView1, ArrayView4};
use serde::{Deserialize, Serialize};

mod karras;
mod reduced;

pub use self::karras::{KarrasSigmas, SigmaSpacing};
pub use self::reduced::{Discretization, ReducedSchedule};
use crate::{Result, SamplingError};

/// A mapping from a beta range to a sequence of betas for stepping the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
	/// Linearly spaced in the square-root domain, then squared. This is what Stable Diffusion was trained with.
	Linear,
	/// [Improved DDPM](https://arxiv.org/abs/2102.09672) cosine schedule.
	Cosine,
	/// Betas linearly spaced between `linear_start` and `linear_end`.
	SqrtLinear,
	/// Square root of linearly spaced betas.
	Sqrt
}

impl FromStr for BetaSchedule {
	type Err = SamplingError;

	fn from_str(s: &str) -> Result<Self> {
		match s {
			"linear" => Ok(Self::Linear),
			"cosine" => Ok(Self::Cosine),
			"sqrt_linear" => Ok(Self::SqrtLinear),
			"sqrt" => Ok(Self::Sqrt),
			_ => Err(SamplingError::config(format!("schedule '{s}' unknown")))
		}
	}
}

/// Parameters of the forward diffusion process.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ScheduleConfig {
	/// How betas evolve over the training timesteps.
	pub kind: BetaSchedule,
	/// Number of diffusion steps used to train the model (`T`).
	pub timesteps: usize,
	/// First beta of the `linear`, `sqrt_linear` and `sqrt` schedules.
	pub linear_start: f64,
	/// Last beta of the `linear`, `sqrt_linear` and `sqrt` schedules.
	pub linear_end: f64,
	/// Small offset of the cosine schedule which keeps `beta` from being too small near `t = 0`.
	pub cosine_s: f64,
	/// Pre-trained betas. When present, `kind` and the beta range are ignored.
	pub given_betas: Option<Vec<f64>>
}

impl Default for ScheduleConfig {
	fn default() -> Self {
		Self {
			kind: BetaSchedule::Linear,
			timesteps: 1000,
			linear_start: 1e-4,
			linear_end: 2e-2,
			cosine_s: 8e-3,
			given_betas: None
		}
	}
}

/// Builds `timesteps` betas for the given schedule kind.
///
/// # Errors
/// Returns [`SamplingError::Config`] if `timesteps` is 0 or the resulting betas are not all inside `(0, 1)`.
pub fn make_beta_schedule(kind: BetaSchedule, timesteps: usize, linear_start: f64, linear_end: f64, cosine_s: f64) -> Result<Array1<f64>> {
	if timesteps == 0 {
		return Err(SamplingError::config("number of timesteps must be > 0"));
	}

	let betas = match kind {
		BetaSchedule::Linear => {
			let mut betas = Array1::linspace(linear_start.sqrt(), linear_end.sqrt(), timesteps);
			betas.par_map_inplace(|b| *b = b.powi(2));
			betas
		}
		BetaSchedule::Cosine => {
			let alpha_bar = |t: usize| (((t as f64 / timesteps as f64) + cosine_s) / (1.0 + cosine_s) * FRAC_PI_2).cos().powi(2);
			let first = alpha_bar(0);
			(0..timesteps)
				.map(|t| (1.0 - (alpha_bar(t + 1) / first) / (alpha_bar(t) / first)).clamp(0.0, 0.999))
				.collect::<Array1<_>>()
		}
		BetaSchedule::SqrtLinear => Array1::linspace(linear_start, linear_end, timesteps),
		BetaSchedule::Sqrt => Array1::linspace(linear_start, linear_end, timesteps).mapv_into(f64::sqrt)
	};

	validate_betas(betas.view())?;
	Ok(betas)
}

fn validate_betas(betas: ArrayView1<'_, f64>) -> Result<()> {
	if let Some((t, beta)) = betas.iter().enumerate().find(|(_, b)| !b.is_finite() || **b <= 0.0 || **b >= 1.0) {
		return Err(SamplingError::config(format!("beta at timestep {t} is {beta}, betas must lie in (0, 1)")));
	}
	Ok(())
}

/// Cumulative product of `1 - beta`.
///
/// # Errors
/// Returns [`SamplingError::Precondition`] if `betas` does not hold exactly `timesteps` values.
pub fn cumulative_alphas(betas: ArrayView1<'_, f64>, timesteps: usize) -> Result<Array1<f64>> {
	if betas.len() != timesteps {
		return Err(SamplingError::precondition(format!("alphas have to be defined for each timestep: got {} betas for {timesteps} timesteps", betas.len())));
	}

	Ok(betas
		.iter()
		.scan(1.0, |prod, beta| {
			*prod *= 1.0 - *beta;
			Some(*prod)
		})
		.collect())
}

/// The full training noise schedule.
#[derive(Debug, Clone)]
pub struct Schedule {
	betas: Array1<f64>,
	alphas_cumprod: Array1<f64>
}

impl Schedule {
	/// Builds the schedule described by `config`.
	///
	/// # Errors
	/// See [`make_beta_schedule`] and [`Schedule::from_betas`].
	pub fn new(config: &ScheduleConfig) -> Result<Self> {
		let betas = match &config.given_betas {
			Some(betas) => Array1::from_vec(betas.clone()),
			None => make_beta_schedule(config.kind, config.timesteps, config.linear_start, config.linear_end, config.cosine_s)?
		};
		Self::from_betas(betas)
	}

	/// Wraps pre-computed betas.
	///
	/// # Errors
	/// Returns [`SamplingError::Config`] if `betas` is empty or contains values outside `(0, 1)`.
	pub fn from_betas(betas: Array1<f64>) -> Result<Self> {
		if betas.is_empty() {
			return Err(SamplingError::config("number of timesteps must be > 0"));
		}
		validate_betas(betas.view())?;

		let alphas_cumprod = cumulative_alphas(betas.view(), betas.len())?;
		tracing::debug!(
			timesteps = betas.len(),
			first = alphas_cumprod[0],
			last = alphas_cumprod[alphas_cumprod.len() - 1],
			"built noise schedule"
		);
		Ok(Self { betas, alphas_cumprod })
	}

	/// Number of training timesteps (`T`).
	pub fn len(&self) -> usize {
		self.betas.len()
	}

	/// Always `false`: a schedule holds at least one timestep.
	pub fn is_empty(&self) -> bool {
		self.betas.is_empty()
	}

	/// Per-timestep noise variance.
	pub fn betas(&self) -> ArrayView1<'_, f64> {
		self.betas.view()
	}

	/// Cumulative signal retention per timestep.
	pub fn alphas_cumprod(&self) -> ArrayView1<'_, f64> {
		self.alphas_cumprod.view()
	}

	/// Selects `steps` training timesteps for DDIM-family sampling. See [`ReducedSchedule::new`].
	pub fn reduced(&self, steps: usize, discretization: Discretization, eta: f32) -> Result<ReducedSchedule> {
		ReducedSchedule::new(self.alphas_cumprod.view(), steps, discretization, eta)
	}

	/// Noise levels for the k-diffusion samplers.
	pub fn karras_sigmas(&self) -> KarrasSigmas {
		KarrasSigmas::new(self.alphas_cumprod.view())
	}

	/// Noises `original` to training timestep `timestep`: `sqrt(ac_t) * x0 + sqrt(1 - ac_t) * noise`.
	///
	/// # Errors
	/// Returns [`SamplingError::Precondition`] if `timestep` lies outside the schedule or the shapes differ.
	pub fn add_noise(&self, original: ArrayView4<'_, f32>, noise: ArrayView4<'_, f32>, timestep: usize) -> Result<Array4<f32>> {
		let alpha = *self
			.alphas_cumprod
			.get(timestep)
			.ok_or_else(|| SamplingError::precondition(format!("timestep {timestep} outside schedule of length {}", self.len())))?;
		if original.shape() != noise.shape() {
			return Err(SamplingError::precondition(format!("noise shape {:?} does not match sample shape {:?}", noise.shape(), original.shape())));
		}
		Ok(&original * alpha.sqrt() as f32 + &noise * (1.0 - alpha).sqrt() as f32)
	}
}
