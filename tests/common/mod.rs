#![allow(dead_code)]

use std::{cell::RefCell, rc::Rc};

use anyhow::bail;
use latent_sampler::{
	samplers::{EpsilonModel, StepContext},
	DenoisingPipeline, Device, EncodedChunk, KarrasSigmas, Offload, PipelineOptions, Precision, Result, UNetDecoder, UNetEncoder
};
use ndarray::{Array4, ArrayD, ArrayView1, ArrayView4, ArrayViewD, Axis, Ix4};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
	Encoder,
	Decoder
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
	Moved(Stage, Device),
	Encoded(usize),
	Decoded(usize)
}

pub type EventLog = Rc<RefCell<Vec<Event>>>;

/// Noise prediction from `(latent, timesteps, context)` of a whole chunk, one timestep per latent.
pub type EpsFn = Box<dyn FnMut(ArrayView4<'_, f32>, &[f32], ArrayViewD<'_, f32>) -> Array4<f32>>;

pub struct StubEncoder {
	pub log: EventLog,
	pub fail_forward: bool,
	pub fail_offload: bool
}

impl Offload for StubEncoder {
	fn to_device(&mut self, device: Device) -> anyhow::Result<()> {
		if self.fail_offload && device == Device::Host {
			bail!("encoder stuck on the accelerator");
		}
		self.log.borrow_mut().push(Event::Moved(Stage::Encoder, device));
		Ok(())
	}
}

impl UNetEncoder for StubEncoder {
	fn forward(&mut self, latent: ArrayView4<'_, f32>, timesteps: ArrayView1<'_, f32>, context: ArrayViewD<'_, f32>) -> anyhow::Result<EncodedChunk> {
		let batch = latent.len_of(Axis(0));
		self.log.borrow_mut().push(Event::Encoded(batch));
		if self.fail_forward {
			bail!("encoder exploded");
		}
		Ok(EncodedChunk {
			hidden: latent.to_owned().into_dyn(),
			embedding: timesteps.to_owned().into_shape((batch, 1))?.into_dyn(),
			skips: vec![(&latent * 0.5).into_dyn(), context.to_owned()]
		})
	}
}

pub struct StubDecoder {
	pub log: EventLog,
	pub eps: EpsFn
}

impl Offload for StubDecoder {
	fn to_device(&mut self, device: Device) -> anyhow::Result<()> {
		self.log.borrow_mut().push(Event::Moved(Stage::Decoder, device));
		Ok(())
	}
}

impl UNetDecoder for StubDecoder {
	fn forward(
		&mut self,
		hidden: ArrayViewD<'_, f32>,
		embedding: ArrayViewD<'_, f32>,
		_precision: Precision,
		skips: &[ArrayViewD<'_, f32>],
		context: ArrayViewD<'_, f32>
	) -> anyhow::Result<Array4<f32>> {
		let latent = hidden.to_owned().into_dimensionality::<Ix4>()?;
		self.log.borrow_mut().push(Event::Decoded(latent.len_of(Axis(0))));
		if skips.len() != 2 || skips[0] != (&latent * 0.5).into_dyn() || skips[1] != context {
			bail!("skip connections do not line up with the chunk");
		}
		let timesteps: Vec<f32> = embedding.iter().copied().collect();
		Ok((self.eps)(latent.view(), &timesteps, context))
	}
}

pub fn stages(eps: EpsFn) -> (StubEncoder, StubDecoder, EventLog) {
	let log = EventLog::default();
	let encoder = StubEncoder {
		log: Rc::clone(&log),
		fail_forward: false,
		fail_offload: false
	};
	let decoder = StubDecoder { log: Rc::clone(&log), eps };
	(encoder, decoder, log)
}

pub fn pipeline(eps: EpsFn, options: PipelineOptions) -> (DenoisingPipeline<StubEncoder, StubDecoder>, EventLog) {
	let (encoder, decoder, log) = stages(eps);
	(DenoisingPipeline::new(encoder, decoder, options).unwrap(), log)
}

pub fn zero_eps() -> EpsFn {
	Box::new(|latent, _, _| Array4::zeros(latent.raw_dim()))
}

/// `0.1 * latent + mean(context)` per sample, plus a timestep-dependent offset.
pub fn context_eps() -> EpsFn {
	Box::new(|latent, timesteps, context| {
		let mut eps = &latent * 0.1;
		for (i, mut sample) in eps.axis_iter_mut(Axis(0)).enumerate() {
			let ctx = context.index_axis(Axis(0), i);
			let mean = ctx.sum() / ctx.len() as f32;
			sample += mean + timesteps[i] * 1e-4;
		}
		eps
	})
}

/// The exact noise of `latent` for a known clean latent `x0`, in discrete-timestep parameterization.
///
/// Chunks only see their own slice of the batch, so each sample finds its clean latent through the index carried in
/// its conditioning, see [`indexed_conditioning`].
pub fn oracle_eps(x0: Array4<f32>, alphas_cumprod: Vec<f64>) -> EpsFn {
	Box::new(move |latent, timesteps, context| {
		let mut eps = latent.to_owned();
		for (i, mut sample) in eps.axis_iter_mut(Axis(0)).enumerate() {
			let alpha = alphas_cumprod[timesteps[i].round() as usize];
			let index = context.index_axis(Axis(0), i).iter().next().copied().unwrap() as usize;
			let x0 = x0.index_axis(Axis(0), index);
			sample -= &(&x0 * alpha.sqrt() as f32);
			sample /= (1.0 - alpha).sqrt() as f32;
		}
		eps
	})
}

/// Forces closures into the signature of the [`EpsilonModel`] blanket impl.
pub fn model_fn<F>(f: F) -> F
where
	F: FnMut(ArrayView4<'_, f32>, f32, StepContext) -> Result<Array4<f32>>
{
	f
}

/// An exact denoiser in noise-level space: for `x = x0 + sigma * n` (scaled by `c_in`) it predicts `n`.
pub struct SigmaOracle {
	pub x0: Array4<f32>,
	pub table: KarrasSigmas,
	pub evaluations: usize
}

impl EpsilonModel for SigmaOracle {
	fn predict(&mut self, latent: ArrayView4<'_, f32>, timestep: f32, _ctx: StepContext) -> Result<Array4<f32>> {
		self.evaluations += 1;
		let sigma = self.table.t_to_sigma(f64::from(timestep));
		let alpha = 1.0 / (1.0 + sigma * sigma);
		Ok((&latent - &(&self.x0 * alpha.sqrt() as f32)) / (1.0 - alpha).sqrt() as f32)
	}
}

/// Predicts zero noise and counts how often it was asked.
#[derive(Default)]
pub struct ZeroModel {
	pub evaluations: usize,
	pub contexts: Vec<StepContext>
}

impl EpsilonModel for ZeroModel {
	fn predict(&mut self, latent: ArrayView4<'_, f32>, _timestep: f32, ctx: StepContext) -> Result<Array4<f32>> {
		self.evaluations += 1;
		self.contexts.push(ctx);
		Ok(Array4::zeros(latent.raw_dim()))
	}
}

/// A smooth, deterministic "clean latent".
pub fn clean_latent(shape: (usize, usize, usize, usize)) -> Array4<f32> {
	Array4::from_shape_fn(shape, |(b, c, h, w)| ((b * 7 + c * 5 + h * 3 + w) as f32 * 0.37).sin())
}

pub fn conditioning(batch: usize, value: f32) -> ArrayD<f32> {
	ArrayD::from_elem(vec![batch, 3, 2], value)
}

/// Conditioning whose entries hold the index of their sample in the batch.
pub fn indexed_conditioning(batch: usize) -> ArrayD<f32> {
	ArrayD::from_shape_fn(vec![batch, 3, 2], |ix| ix[0] as f32)
}

#[track_caller]
pub fn assert_close(actual: ArrayView4<'_, f32>, expected: ArrayView4<'_, f32>, tol: f32) {
	assert_eq!(actual.shape(), expected.shape());
	for (a, e) in actual.iter().zip(expected.iter()) {
		assert!((a - e).abs() <= tol * e.abs().max(1.0), "{a} != {e} (tolerance {tol})");
	}
}
