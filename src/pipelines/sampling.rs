use std::sync::{
	atomic::{AtomicBool, Ordering},
	Arc
};

use ndarray::{Array4, ArrayD, ArrayView4, ArrayViewD, Zip};
use rand::Rng;

use super::{DenoisingPipeline, GuidanceMixer, GuidedModel, UNetDecoder, UNetEncoder};
use crate::{
	noise::{validate_shape, NoiseSource},
	samplers::{
		AnySampler, ChurnConfig, DdimSampler, Dpm2AncestralSampler, Dpm2Sampler, EulerAncestralSampler, EulerSampler, HeunSampler, LmsSampler, PlmsSampler,
		Sampler, SamplerKind
	},
	schedulers::{Discretization, Schedule, SigmaSpacing},
	LatentSamplerConfig, Result, SamplingError
};

/// State of a sampling run after a step, handed to a [`StepCallback`].
#[derive(Debug)]
pub struct StepProgress<'a> {
	/// Forward step index that just completed, starting at 0.
	pub step: usize,
	/// Total number of steps in this run.
	pub total: usize,
	/// The training timestep the model was queried at.
	pub timestep: f32,
	/// The latent after this step.
	pub latent: ArrayView4<'a, f32>,
	/// The sampler's estimate of the fully denoised latent at this step.
	pub estimate: Option<ArrayView4<'a, f32>>
}

/// A callback invoked after sampling steps. It observes the run but cannot change its course.
pub struct StepCallback {
	frequency: usize,
	cb: Box<dyn FnMut(&StepProgress<'_>)>
}

impl StepCallback {
	/// Calls `cb` every `frequency` steps (3 = every 3 steps) and after the final step.
	pub fn new<F>(frequency: usize, cb: F) -> Self
	where
		F: FnMut(&StepProgress<'_>) + 'static
	{
		Self {
			frequency: frequency.max(1),
			cb: Box::new(cb)
		}
	}

	fn invoke(&mut self, progress: &StepProgress<'_>) {
		if progress.step % self.frequency == 0 || progress.step + 1 == progress.total {
			(self.cb)(progress);
		}
	}
}

/// Parameters of one [`LatentSampler::sample`] call.
pub struct SampleOptions {
	/// Number of sampling steps, `1 <= steps <= T`.
	pub steps: usize,
	/// Shape of the latent to generate, `[batch, channels, height, width]`. Not needed if `initial_latent` is set.
	pub shape: Option<[usize; 4]>,
	/// Start from this latent instead of fresh noise, e.g. the output of [`LatentSampler::stochastic_encode`]. Like
	/// fresh noise, it is scaled to the first noise level by sigma-space samplers.
	pub initial_latent: Option<Array4<f32>>,
	/// Seed for the initial noise and every stochastic step. A random seed is used if `None`.
	pub seed: Option<u64>,
	/// The sampling algorithm.
	pub sampler: SamplerKind,
	/// DDIM stochasticity; `0` is deterministic.
	pub eta: f32,
	/// Scale of the noise injected by DDIM steps.
	pub temperature: f32,
	/// Probability of zeroing each element of the DDIM step noise.
	pub noise_dropout: f32,
	/// Classifier-free guidance scale, `>= 1`. `1` disables guidance.
	pub guidance_scale: f32,
	/// Unconditional conditioning for classifier-free guidance, same shape as the conditioning.
	pub unconditional: Option<ArrayD<f32>>,
	/// Inpainting mask, broadcastable to the latent shape. Where it is 1, `masked_target` is kept.
	pub mask: Option<Array4<f32>>,
	/// Latent to keep where `mask` is 1.
	pub masked_target: Option<Array4<f32>>,
	/// Timestep spacing for DDIM and PLMS.
	pub discretization: Discretization,
	/// Noise level spacing for the `k-diffusion` samplers.
	pub sigma_spacing: SigmaSpacing,
	/// Stochastic churn for Euler, Heun and DPM-2.
	pub churn: ChurnConfig,
	/// Run only the `start_step` least noisy DDIM steps.
	pub start_step: Option<usize>,
	/// Whether classifier-free guidance may skip the unconditional branch on some steps, see
	/// [`GuidanceMixer::should_skip`].
	pub adaptive_guidance: bool,
	/// Observes each step.
	pub callback: Option<StepCallback>,
	/// When set by another thread, sampling stops with [`SamplingError::Interrupted`] before the next step.
	pub interrupt: Option<Arc<AtomicBool>>
}

impl Default for SampleOptions {
	fn default() -> Self {
		Self {
			steps: 50,
			shape: None,
			initial_latent: None,
			seed: None,
			sampler: SamplerKind::Ddim,
			eta: 0.0,
			temperature: 1.0,
			noise_dropout: 0.0,
			guidance_scale: 1.0,
			unconditional: None,
			mask: None,
			masked_target: None,
			discretization: Discretization::Uniform,
			sigma_spacing: SigmaSpacing::Linear,
			churn: ChurnConfig::default(),
			start_step: None,
			adaptive_guidance: true,
			callback: None,
			interrupt: None
		}
	}
}

// builder for options
impl SampleOptions {
	/// The number of sampling steps. More steps typically yield a cleaner latent.
	pub fn with_steps(mut self, steps: usize) -> Self {
		self.steps = steps;
		self
	}
	/// The shape of the latent to generate.
	pub fn with_shape(mut self, shape: [usize; 4]) -> Self {
		self.shape = Some(shape);
		self
	}
	/// Start from `latent` instead of fresh noise.
	pub fn with_initial_latent(mut self, latent: Array4<f32>) -> Self {
		self.initial_latent = Some(latent);
		self
	}
	/// Set the seed to use when generating noise.
	pub fn with_seed(mut self, seed: u64) -> Self {
		self.seed = Some(seed);
		self
	}
	/// Use a random seed, so that each run generates a different latent.
	pub fn with_random_seed(mut self) -> Self {
		self.seed = None;
		self
	}
	/// The sampling algorithm to use.
	pub fn with_sampler(mut self, sampler: SamplerKind) -> Self {
		self.sampler = sampler;
		self
	}
	/// DDIM stochasticity.
	pub fn with_eta(mut self, eta: f32) -> Self {
		self.eta = eta;
		self
	}
	/// Scale of the noise injected by DDIM steps.
	pub fn with_temperature(mut self, temperature: f32) -> Self {
		self.temperature = temperature;
		self
	}
	/// Dropout probability of the DDIM step noise.
	pub fn with_noise_dropout(mut self, noise_dropout: f32) -> Self {
		self.noise_dropout = noise_dropout;
		self
	}
	/// The 'guidance scale' for classifier-free guidance, together with the unconditional conditioning to guide away
	/// from. A higher scale follows the conditioning more strictly; `7.5` is a good balance.
	pub fn with_guidance(mut self, guidance_scale: f32, unconditional: ArrayD<f32>) -> Self {
		self.guidance_scale = guidance_scale;
		self.unconditional = Some(unconditional);
		self
	}
	/// Keep `target` where `mask` is 1 and sample freely where it is 0.
	pub fn with_mask(mut self, mask: Array4<f32>, target: Array4<f32>) -> Self {
		self.mask = Some(mask);
		self.masked_target = Some(target);
		self
	}
	/// Timestep spacing for DDIM and PLMS.
	pub fn with_discretization(mut self, discretization: Discretization) -> Self {
		self.discretization = discretization;
		self
	}
	/// Noise level spacing for the `k-diffusion` samplers.
	pub fn with_sigma_spacing(mut self, spacing: SigmaSpacing) -> Self {
		self.sigma_spacing = spacing;
		self
	}
	/// Stochastic churn for Euler, Heun and DPM-2.
	pub fn with_churn(mut self, churn: ChurnConfig) -> Self {
		self.churn = churn;
		self
	}
	/// Run only the `start_step` least noisy DDIM steps.
	pub fn with_start_step(mut self, start_step: usize) -> Self {
		self.start_step = Some(start_step);
		self
	}
	/// Enable or disable adaptive skipping of the unconditional branch.
	pub fn with_adaptive_guidance(mut self, adaptive_guidance: bool) -> Self {
		self.adaptive_guidance = adaptive_guidance;
		self
	}
	/// Call `cb` after every `frequency` steps.
	pub fn callback<F>(mut self, frequency: usize, cb: F) -> Self
	where
		F: FnMut(&StepProgress<'_>) + 'static
	{
		self.callback = Some(StepCallback::new(frequency, cb));
		self
	}
	/// Stop before the next step once `flag` is set.
	pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
		self.interrupt = Some(flag);
		self
	}
}

fn build_sampler(schedule: &Schedule, options: &SampleOptions) -> Result<AnySampler> {
	let kind = options.sampler;
	if options.start_step.is_some() && kind != SamplerKind::Ddim {
		return Err(SamplingError::config(format!("start step is only supported by ddim, not {kind}")));
	}
	if options.churn.s_churn > 0.0 && !matches!(kind, SamplerKind::Euler | SamplerKind::Heun | SamplerKind::Dpm2) {
		return Err(SamplingError::config(format!("churn is not supported by {kind}")));
	}

	let steps = options.steps;
	let spacing = options.sigma_spacing;
	Ok(match kind {
		SamplerKind::Ddim => {
			let reduced = schedule.reduced(steps, options.discretization, options.eta)?;
			let sampler = DdimSampler::new(reduced)
				.with_temperature(options.temperature)
				.with_noise_dropout(options.noise_dropout)?;
			match options.start_step {
				Some(start_step) => sampler.with_start_step(start_step)?.into(),
				None => sampler.into()
			}
		}
		SamplerKind::Plms => PlmsSampler::new(schedule.reduced(steps, options.discretization, options.eta)?)?.into(),
		SamplerKind::Euler => EulerSampler::new(schedule.karras_sigmas(), steps, spacing)?.with_churn(options.churn).into(),
		SamplerKind::EulerAncestral => EulerAncestralSampler::new(schedule.karras_sigmas(), steps, spacing)?.into(),
		SamplerKind::Dpm2 => Dpm2Sampler::new(schedule.karras_sigmas(), steps, spacing)?.with_churn(options.churn).into(),
		SamplerKind::Dpm2Ancestral => Dpm2AncestralSampler::new(schedule.karras_sigmas(), steps, spacing)?.into(),
		SamplerKind::Heun => HeunSampler::new(schedule.karras_sigmas(), steps, spacing)?.with_churn(options.churn).into(),
		SamplerKind::Lms => LmsSampler::new(schedule.karras_sigmas(), steps, spacing)?.into()
	})
}

/// `latent = mask * target + (1 - mask) * latent`
fn composite(latent: &mut Array4<f32>, mask: ArrayView4<'_, f32>, target: ArrayView4<'_, f32>) {
	Zip::from(latent).and(&mask).and(&target).par_for_each(|x, &m, &t| {
		*x = m * t + (1.0 - m) * *x;
	});
}

/// Drives a [`DenoisingPipeline`] through a full sampling run.
pub struct LatentSampler<E, D> {
	schedule: Schedule,
	pipeline: DenoisingPipeline<E, D>
}

impl<E: UNetEncoder, D: UNetDecoder> LatentSampler<E, D> {
	/// Creates a sampler for a model trained with `schedule`.
	pub fn new(schedule: Schedule, pipeline: DenoisingPipeline<E, D>) -> Self {
		Self { schedule, pipeline }
	}

	/// Builds the schedule and pipeline described by `config` around the two network stages.
	///
	/// # Errors
	/// Returns [`SamplingError::Config`] if the configuration is invalid.
	pub fn from_config(config: &LatentSamplerConfig, encoder: E, decoder: D) -> Result<Self> {
		Ok(Self::new(Schedule::new(&config.schedule)?, DenoisingPipeline::new(encoder, decoder, config.pipeline.clone())?))
	}

	/// The training noise schedule.
	pub fn schedule(&self) -> &Schedule {
		&self.schedule
	}

	/// The network pipeline.
	pub fn pipeline(&self) -> &DenoisingPipeline<E, D> {
		&self.pipeline
	}

	/// Mutable access to the network pipeline, e.g. to evaluate it outside of a sampling run.
	pub fn pipeline_mut(&mut self) -> &mut DenoisingPipeline<E, D> {
		&mut self.pipeline
	}

	/// Returns the schedule and the pipeline.
	pub fn into_parts(self) -> (Schedule, DenoisingPipeline<E, D>) {
		(self.schedule, self.pipeline)
	}

	/// Noises the clean latent `x0` to the DDIM step that a run with `steps` steps and
	/// [`SampleOptions::with_start_step`]`(start_step)` begins at, so that such a run denoises it again (img2img).
	///
	/// # Errors
	/// - [`SamplingError::Config`] if `steps` does not fit the schedule or `x0` has an empty dimension.
	/// - [`SamplingError::Precondition`] if `start_step` is 0 or larger than `steps`.
	pub fn stochastic_encode(&self, x0: ArrayView4<'_, f32>, start_step: usize, seed: u64, steps: usize, discretization: Discretization) -> Result<Array4<f32>> {
		let reduced = self.schedule.reduced(steps, discretization, 0.0)?;
		if start_step == 0 || start_step > reduced.len() {
			return Err(SamplingError::precondition(format!("start step {start_step} outside a schedule of {} steps", reduced.len())));
		}
		let (batch, channels, height, width) = x0.dim();
		let noise = NoiseSource::new(seed).sample([batch, channels, height, width])?;
		self.schedule.add_noise(x0, noise.view(), reduced.timesteps()[start_step - 1])
	}

	/// Generates a latent for `conditioning` (batch on axis 0, one entry per latent).
	///
	/// # Errors
	/// - [`SamplingError::Config`] for invalid options (see [`SampleOptions`]).
	/// - [`SamplingError::Precondition`] if the conditioning does not match the latent batch.
	/// - [`SamplingError::Upstream`] if a network stage fails.
	/// - [`SamplingError::Interrupted`] if the interrupt flag was raised.
	pub fn sample(&mut self, conditioning: ArrayViewD<'_, f32>, mut options: SampleOptions) -> Result<Array4<f32>> {
		if options.steps == 0 || options.steps > self.schedule.len() {
			return Err(SamplingError::config(format!("cannot sample {} steps from a schedule of {} timesteps", options.steps, self.schedule.len())));
		}
		if options.eta.is_nan() || options.eta < 0.0 {
			return Err(SamplingError::config(format!("eta ({}) must be >= 0", options.eta)));
		}

		let shape = match (&options.initial_latent, options.shape) {
			(Some(latent), Some(shape)) if latent.shape() != shape.as_slice() => {
				return Err(SamplingError::config(format!("initial latent of shape {:?} does not match requested shape {shape:?}", latent.shape())));
			}
			(Some(latent), _) => {
				let (batch, channels, height, width) = latent.dim();
				[batch, channels, height, width]
			}
			(None, Some(shape)) => shape,
			(None, None) => return Err(SamplingError::config("either a latent shape or an initial latent is required"))
		};
		validate_shape(shape)?;

		let masking = match (&options.mask, &options.masked_target) {
			(None, None) => None,
			(Some(_), Some(_)) if !options.sampler.uses_reduced_schedule() => {
				return Err(SamplingError::config(format!("masking is not supported by {}", options.sampler)));
			}
			(Some(mask), Some(target)) => {
				let mask = mask
					.broadcast(shape)
					.ok_or_else(|| SamplingError::config(format!("mask of shape {:?} does not fit latent shape {shape:?}", mask.shape())))?;
				let target = target
					.broadcast(shape)
					.ok_or_else(|| SamplingError::config(format!("masked target of shape {:?} does not fit latent shape {shape:?}", target.shape())))?;
				Some((mask, target))
			}
			_ => return Err(SamplingError::config("a mask requires a masked target and vice versa"))
		};

		let mixer = GuidanceMixer::new(options.guidance_scale)?.with_adaptive_skip(options.adaptive_guidance);
		let mut sampler = build_sampler(&self.schedule, &options)?;
		let total = sampler.num_steps();

		let seed = options.seed.unwrap_or_else(|| rand::thread_rng().gen::<u64>());
		let noise = NoiseSource::new(seed);
		let mut rng = noise.step_rng();
		let mut latent = sampler.prepare_latent(match options.initial_latent.take() {
			Some(latent) => latent,
			None => noise.sample(shape)?
		});

		tracing::info!(sampler = %options.sampler, steps = total, seed, ?shape, guidance_scale = mixer.scale(), "sampling");

		let unconditional = options.unconditional.as_ref().map(ArrayD::view);
		let interrupt = options.interrupt.as_deref();
		let callback = &mut options.callback;
		let latent = self.pipeline.with_pinned(|pipeline| {
			let mut model = GuidedModel::new(pipeline, mixer, conditioning.view(), unconditional);
			for step in 0..total {
				if interrupt.map_or(false, |flag| flag.load(Ordering::Relaxed)) {
					tracing::info!(step, "sampling interrupted");
					return Err(SamplingError::Interrupted { step });
				}
				if let Some((mask, target)) = &masking {
					composite(&mut latent, mask.view(), target.view());
				}

				let timestep = sampler.timestep(step);
				let output = sampler.step(&mut model, latent.view(), step, &mut rng)?;
				latent = output.prev_sample;
				tracing::trace!(step, timestep, "step done");

				if let Some(callback) = callback.as_mut() {
					callback.invoke(&StepProgress {
						step,
						total,
						timestep,
						latent: latent.view(),
						estimate: output.pred_original_sample.as_ref().map(Array4::view)
					});
				}
			}
			if let Some((mask, target)) = &masking {
				composite(&mut latent, mask.view(), target.view());
			}
			Ok(latent)
		})?;

		tracing::info!(steps = total, "sampling finished");
		Ok(latent)
	}
}
