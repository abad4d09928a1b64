use ndarray::{concatenate, Array1, Array4, ArrayView4, ArrayViewD, Axis};

use super::{DenoisingPipeline, UNetDecoder, UNetEncoder};
use crate::{
	samplers::{EpsilonModel, StepContext},
	Result, SamplingError
};

/// Classifier-free guidance: mixes a conditional and an unconditional noise estimate as
/// `uncond + scale * (cond - uncond)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuidanceMixer {
	scale: f32,
	adaptive_skip: bool
}

impl GuidanceMixer {
	/// Creates a mixer with the given guidance scale. Adaptive skipping is enabled.
	///
	/// # Errors
	/// Returns [`SamplingError::Config`] if `scale` is below 1 or not finite.
	pub fn new(scale: f32) -> Result<Self> {
		if !scale.is_finite() || scale < 1.0 {
			return Err(SamplingError::config(format!("guidance scale ({scale}) must be >= 1")));
		}
		Ok(Self { scale, adaptive_skip: true })
	}

	/// Toggles the adaptive skip heuristic, see [`GuidanceMixer::should_skip`].
	pub fn with_adaptive_skip(mut self, adaptive_skip: bool) -> Self {
		self.adaptive_skip = adaptive_skip;
		self
	}

	/// The guidance scale.
	pub fn scale(&self) -> f32 {
		self.scale
	}

	/// Whether forward step `step` of `total` runs the conditional branch only.
	///
	/// Once the coarse structure is settled (after a third of the run, at most 20 steps) the unconditional branch is
	/// only evaluated every `round(total / 10)` steps (between 1 and 5), halving the cost of the skipped steps. The
	/// period is counted back from the last step, which is always fully guided.
	pub fn should_skip(&self, step: usize, total: usize) -> bool {
		if !self.adaptive_skip || step >= total {
			return false;
		}
		let warmup = (total as f64 / 3.0).min(20.0);
		let period = ((total as f64 / 10.0).round() as usize).clamp(1, 5);
		let remaining = total - 1 - step;
		(step + 1) as f64 >= warmup && remaining % period != 0
	}

	/// Predicts the noise in `latent`, guided by `unconditional` if given.
	///
	/// Runs a single conditional evaluation if there is no unconditional conditioning, the scale is 1, or the step is
	/// skipped; otherwise a single evaluation of the doubled batch `[unconditional; conditioning]`.
	///
	/// # Errors
	/// - [`SamplingError::Precondition`] if `unconditional` does not have the shape of `conditioning`.
	/// - Any error from [`DenoisingPipeline::apply`].
	pub fn guided_estimate<E: UNetEncoder, D: UNetDecoder>(
		&self,
		pipeline: &mut DenoisingPipeline<E, D>,
		latent: ArrayView4<'_, f32>,
		timestep: f32,
		conditioning: ArrayViewD<'_, f32>,
		unconditional: Option<ArrayViewD<'_, f32>>,
		ctx: StepContext
	) -> Result<Array4<f32>> {
		let batch = latent.len_of(Axis(0));
		let unconditional = match unconditional {
			Some(uc) if self.scale != 1.0 && !self.should_skip(ctx.index, ctx.total) => uc,
			_ => {
				tracing::trace!(step = ctx.index, "conditional branch only");
				return pipeline.apply(latent, Array1::from_elem(batch, timestep).view(), conditioning);
			}
		};
		if unconditional.shape() != conditioning.shape() {
			return Err(SamplingError::precondition(format!(
				"unconditional conditioning of shape {:?} does not match conditioning of shape {:?}",
				unconditional.shape(),
				conditioning.shape()
			)));
		}

		let doubled_latent = concatenate(Axis(0), &[latent.view(), latent.view()]).map_err(|e| SamplingError::precondition(e.to_string()))?;
		let doubled_context = concatenate(Axis(0), &[unconditional.view(), conditioning.view()]).map_err(|e| SamplingError::precondition(e.to_string()))?;
		let timesteps = Array1::from_elem(2 * batch, timestep);

		let noise_pred = pipeline.apply(doubled_latent.view(), timesteps.view(), doubled_context.view())?;
		let (noise_pred_uncond, noise_pred_text) = noise_pred.view().split_at(Axis(0), batch);
		Ok(&noise_pred_uncond + &((&noise_pred_text - &noise_pred_uncond) * self.scale))
	}
}

/// The noise-prediction network as seen by a sampler: a [`DenoisingPipeline`] bound to the conditioning of one
/// sampling call, with classifier-free guidance applied.
pub struct GuidedModel<'a, 'c, E, D> {
	pipeline: &'a mut DenoisingPipeline<E, D>,
	mixer: GuidanceMixer,
	conditioning: ArrayViewD<'c, f32>,
	unconditional: Option<ArrayViewD<'c, f32>>
}

impl<'a, 'c, E: UNetEncoder, D: UNetDecoder> GuidedModel<'a, 'c, E, D> {
	/// Binds `pipeline` to the conditioning of one sampling call.
	pub fn new(
		pipeline: &'a mut DenoisingPipeline<E, D>,
		mixer: GuidanceMixer,
		conditioning: ArrayViewD<'c, f32>,
		unconditional: Option<ArrayViewD<'c, f32>>
	) -> Self {
		Self {
			pipeline,
			mixer,
			conditioning,
			unconditional
		}
	}
}

impl<'a, 'c, E: UNetEncoder, D: UNetDecoder> EpsilonModel for GuidedModel<'a, 'c, E, D> {
	fn predict(&mut self, latent: ArrayView4<'_, f32>, timestep: f32, ctx: StepContext) -> Result<Array4<f32>> {
		self.mixer
			.guided_estimate(&mut *self.pipeline, latent, timestep, self.conditioning.view(), self.unconditional.as_ref().map(|uc| uc.view()), ctx)
	}
}

#[cfg(test)]
mod tests {
	use super::GuidanceMixer;

	#[test]
	fn skips_after_warmup_off_period() {
		let mixer = GuidanceMixer::new(7.5).unwrap();
		// 50 steps: warmup 16.7, period 5, counted back from step 49
		let skipped: Vec<usize> = (0..50).filter(|&i| mixer.should_skip(i, 50)).collect();
		assert!(skipped.iter().all(|&i| i >= 16 && (49 - i) % 5 != 0));
		assert!(!mixer.should_skip(15, 50));
		assert!(mixer.should_skip(16, 50));
		assert!(!mixer.should_skip(19, 50));
		assert!(mixer.should_skip(20, 50));
		assert_eq!(skipped.len(), 34 - 7);
	}

	#[test]
	fn last_step_is_always_guided() {
		let mixer = GuidanceMixer::new(7.5).unwrap();
		for total in 1..=200 {
			assert!(!mixer.should_skip(total - 1, total), "{total} steps");
		}
	}

	#[test]
	fn short_runs_never_divide_by_zero() {
		let mixer = GuidanceMixer::new(7.5).unwrap();
		for total in 1..5 {
			// period rounds to 0 and is clamped to 1, so nothing is ever skipped
			assert!((0..total).all(|i| !mixer.should_skip(i, total)));
		}
	}

	#[test]
	fn adaptive_skip_can_be_disabled() {
		let mixer = GuidanceMixer::new(7.5).unwrap().with_adaptive_skip(false);
		assert!((0..100).all(|i| !mixer.should_skip(i, 100)));
	}

	#[test]
	fn rejects_scales_below_one() {
		assert!(GuidanceMixer::new(0.5).is_err());
		assert!(GuidanceMixer::new(f32::NAN).is_err());
		assert!(GuidanceMixer::new(1.0).is_ok());
	}
}
