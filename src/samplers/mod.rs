//! Samplers take the noise estimates of a trained model and integrate the reverse diffusion process, turning pure
//! noise into a clean latent over a fixed number of steps.
//!
//! * [`DdimSampler`] and [`PlmsSampler`] step over a [`ReducedSchedule`](crate::schedulers::ReducedSchedule) of
//!   discrete training timesteps.
//! * The `k-diffusion` family ([`EulerSampler`], [`EulerAncestralSampler`], [`HeunSampler`], [`Dpm2Sampler`],
//!   [`Dpm2AncestralSampler`], [`LmsSampler`]) steps over noise levels from
//!   [`KarrasSigmas`](crate::schedulers::KarrasSigmas).
//!
//! Every sampler implements [`Sampler`]; [`AnySampler`] dispatches over all of them by [`SamplerKind`].

use std::{fmt, str::FromStr};

use ndarray::{Array4, ArrayBase, ArrayView4};
use rand::Rng;
use serde::{Deserialize, Serialize};

mod ddim;
mod dpm2;
mod euler;
mod euler_ancestral;
mod heun;
mod k_diffusion;
mod lms;
mod plms;

pub use self::ddim::DdimSampler;
pub use self::dpm2::{Dpm2AncestralSampler, Dpm2Sampler};
pub use self::euler::EulerSampler;
pub use self::euler_ancestral::EulerAncestralSampler;
pub use self::heun::HeunSampler;
pub use self::k_diffusion::ChurnConfig;
pub use self::lms::LmsSampler;
pub use self::plms::PlmsSampler;
use crate::{Result, SamplingError};

/// Position of a model evaluation within a sampling run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepContext {
	/// Forward step index, `0` being the noisiest step.
	pub index: usize,
	/// Total number of steps in the run.
	pub total: usize
}

/// Something that predicts the noise contained in a latent.
///
/// Implemented by [`GuidedModel`](crate::pipelines::GuidedModel) for the real network and by any
/// `FnMut(ArrayView4<f32>, f32, StepContext) -> Result<Array4<f32>>` closure.
pub trait EpsilonModel {
	/// Predicts the noise in `latent` at (possibly fractional) training timestep `timestep`.
	///
	/// # Errors
	/// Errors are returned to the caller of the sampler unchanged.
	fn predict(&mut self, latent: ArrayView4<'_, f32>, timestep: f32, ctx: StepContext) -> Result<Array4<f32>>;
}

impl<F> EpsilonModel for F
where
	F: FnMut(ArrayView4<'_, f32>, f32, StepContext) -> Result<Array4<f32>>
{
	fn predict(&mut self, latent: ArrayView4<'_, f32>, timestep: f32, ctx: StepContext) -> Result<Array4<f32>> {
		self(latent, timestep, ctx)
	}
}

/// The output returned by a sampler's `step` function.
#[derive(Debug, Clone)]
pub struct SamplerStepOutput {
	pub(crate) prev_sample: Array4<f32>,
	pub(crate) pred_original_sample: Option<Array4<f32>>
}

impl SamplerStepOutput {
	/// Computed sample of the next (less noisy) step. `prev_sample` should be used as the model input of the next step.
	pub fn prev_sample(&self) -> ArrayView4<'_, f32> {
		self.prev_sample.view()
	}

	/// The predicted denoised sample (`x_0`) based on the model output from the current step. Can be used to preview
	/// progress.
	pub fn pred_original_sample(&self) -> Option<ArrayView4<'_, f32>> {
		self.pred_original_sample.as_ref().map(ArrayBase::view)
	}

	/// Consumes the output, returning the next sample.
	pub fn into_prev_sample(self) -> Array4<f32> {
		self.prev_sample
	}
}

/// A step-update algorithm over a fixed sequence of steps.
pub trait Sampler {
	/// Number of steps this sampler will run.
	fn num_steps(&self) -> usize;

	/// The training timestep passed to the model at forward step `step`. Fractional for the `k-diffusion` samplers.
	///
	/// # Panics
	/// May panic if `step >= self.num_steps()`.
	fn timestep(&self, step: usize) -> f32;

	/// Scales unit-variance noise into the distribution the first step expects.
	fn prepare_latent(&self, noise: Array4<f32>) -> Array4<f32>;

	/// Runs forward step `step` on `latent`, querying `model` one or more times.
	///
	/// # Errors
	/// - [`SamplingError::Precondition`] if `step` is out of range.
	/// - Any error returned by `model`.
	fn step<M: EpsilonModel + ?Sized, R: Rng + ?Sized>(&mut self, model: &mut M, latent: ArrayView4<'_, f32>, step: usize, rng: &mut R) -> Result<SamplerStepOutput>;
}

pub(crate) fn check_step(step: usize, num_steps: usize) -> Result<()> {
	if step >= num_steps {
		return Err(SamplingError::precondition(format!("step {step} out of range for {num_steps} steps")));
	}
	Ok(())
}

/// The available sampling algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
	/// [Denoising Diffusion Implicit Models](https://arxiv.org/abs/2010.02502).
	Ddim,
	/// [Pseudo linear multistep](https://arxiv.org/abs/2202.09778) on top of DDIM.
	Plms,
	/// Euler method over noise levels.
	Euler,
	/// Ancestral Euler.
	#[serde(rename = "euler_a")]
	EulerAncestral,
	/// DPM-Solver-2 (midpoint).
	Dpm2,
	/// Ancestral DPM-Solver-2.
	#[serde(rename = "dpm2_a")]
	Dpm2Ancestral,
	/// Heun's method (improved Euler).
	Heun,
	/// Linear multistep, order 4.
	Lms
}

impl SamplerKind {
	/// Whether this sampler steps over a [`ReducedSchedule`](crate::schedulers::ReducedSchedule) rather than over
	/// noise levels.
	pub fn uses_reduced_schedule(self) -> bool {
		matches!(self, SamplerKind::Ddim | SamplerKind::Plms)
	}

	/// The name accepted by [`SamplerKind::from_str`].
	pub fn name(self) -> &'static str {
		match self {
			SamplerKind::Ddim => "ddim",
			SamplerKind::Plms => "plms",
			SamplerKind::Euler => "euler",
			SamplerKind::EulerAncestral => "euler_a",
			SamplerKind::Dpm2 => "dpm2",
			SamplerKind::Dpm2Ancestral => "dpm2_a",
			SamplerKind::Heun => "heun",
			SamplerKind::Lms => "lms"
		}
	}
}

impl fmt::Display for SamplerKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

impl FromStr for SamplerKind {
	type Err = SamplingError;

	fn from_str(s: &str) -> Result<Self> {
		match s {
			"ddim" => Ok(Self::Ddim),
			"plms" => Ok(Self::Plms),
			"euler" => Ok(Self::Euler),
			"euler_a" => Ok(Self::EulerAncestral),
			"dpm2" => Ok(Self::Dpm2),
			"dpm2_a" => Ok(Self::Dpm2Ancestral),
			"heun" => Ok(Self::Heun),
			"lms" => Ok(Self::Lms),
			_ => Err(SamplingError::config(format!("sampler '{s}' unknown")))
		}
	}
}

/// Any of the samplers in this module.
#[derive(Debug, Clone)]
pub enum AnySampler {
	#[allow(missing_docs)]
	Ddim(DdimSampler),
	#[allow(missing_docs)]
	Plms(PlmsSampler),
	#[allow(missing_docs)]
	Euler(EulerSampler),
	#[allow(missing_docs)]
	EulerAncestral(EulerAncestralSampler),
	#[allow(missing_docs)]
	Dpm2(Dpm2Sampler),
	#[allow(missing_docs)]
	Dpm2Ancestral(Dpm2AncestralSampler),
	#[allow(missing_docs)]
	Heun(HeunSampler),
	#[allow(missing_docs)]
	Lms(LmsSampler)
}

macro_rules! dispatch {
	($self:expr, $s:ident => $body:expr) => {
		match $self {
			AnySampler::Ddim($s) => $body,
			AnySampler::Plms($s) => $body,
			AnySampler::Euler($s) => $body,
			AnySampler::EulerAncestral($s) => $body,
			AnySampler::Dpm2($s) => $body,
			AnySampler::Dpm2Ancestral($s) => $body,
			AnySampler::Heun($s) => $body,
			AnySampler::Lms($s) => $body
		}
	};
}

impl AnySampler {
	/// Which algorithm this is.
	pub fn kind(&self) -> SamplerKind {
		match self {
			AnySampler::Ddim(_) => SamplerKind::Ddim,
			AnySampler::Plms(_) => SamplerKind::Plms,
			AnySampler::Euler(_) => SamplerKind::Euler,
			AnySampler::EulerAncestral(_) => SamplerKind::EulerAncestral,
			AnySampler::Dpm2(_) => SamplerKind::Dpm2,
			AnySampler::Dpm2Ancestral(_) => SamplerKind::Dpm2Ancestral,
			AnySampler::Heun(_) => SamplerKind::Heun,
			AnySampler::Lms(_) => SamplerKind::Lms
		}
	}
}

impl Sampler for AnySampler {
	fn num_steps(&self) -> usize {
		dispatch!(self, s => s.num_steps())
	}

	fn timestep(&self, step: usize) -> f32 {
		dispatch!(self, s => s.timestep(step))
	}

	fn prepare_latent(&self, noise: Array4<f32>) -> Array4<f32> {
		dispatch!(self, s => s.prepare_latent(noise))
	}

	fn step<M: EpsilonModel + ?Sized, R: Rng + ?Sized>(&mut self, model: &mut M, latent: ArrayView4<'_, f32>, step: usize, rng: &mut R) -> Result<SamplerStepOutput> {
		dispatch!(self, s => s.step(model, latent, step, rng))
	}
}

macro_rules! impl_from {
	($($variant:ident($ty:ty)),*) => {
		$(
			impl From<$ty> for AnySampler {
				fn from(sampler: $ty) -> Self {
					AnySampler::$variant(sampler)
				}
			}
		)*
	};
}

impl_from!(
	Ddim(DdimSampler),
	Plms(PlmsSampler),
	Euler(EulerSampler),
	EulerAncestral(EulerAncestralSampler),
	Dpm2(Dpm2Sampler),
	Dpm2Ancestral(Dpm2AncestralSampler),
	Heun(HeunSampler),
	Lms(LmsSampler)
);
