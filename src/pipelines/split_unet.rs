use anyhow::anyhow;
use ndarray::{concatenate, Array4, ArrayD, ArrayView1, ArrayView4, ArrayViewD, Axis, Slice};
use serde::{Deserialize, Serialize};

use super::{Device, EncodedChunk, Precision, UNetDecoder, UNetEncoder};
use crate::{Result, SamplingError};

/// Options for [`DenoisingPipeline`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PipelineOptions {
	/// Number of latents pushed through a network stage at once. Peak activation memory scales with this, not with the
	/// batch size. Must be > 0.
	pub chunk_size: usize,
	/// Keep both stages on the accelerator for a whole sampling call instead of swapping them on every evaluation.
	/// Much faster, but needs memory for both halves of the network.
	pub turbo: bool,
	/// Precision forwarded to the second stage.
	pub precision: Precision
}

impl Default for PipelineOptions {
	fn default() -> Self {
		Self {
			chunk_size: 1,
			turbo: false,
			precision: Precision::F32
		}
	}
}

/// Which network stages currently occupy the accelerator.
///
/// The pipeline owns this state. Outside of turbo mode at most one stage is ever resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
	/// Both stages are in host memory.
	Offloaded,
	/// Only the encoder stage is resident.
	Encoder,
	/// Only the decoder stage is resident.
	Decoder,
	/// Both stages are resident (turbo mode).
	Pinned
}

impl Residency {
	fn stages(self) -> (bool, bool) {
		match self {
			Residency::Offloaded => (false, false),
			Residency::Encoder => (true, false),
			Residency::Decoder => (false, true),
			Residency::Pinned => (true, true)
		}
	}

	fn from_stages(encoder: bool, decoder: bool) -> Self {
		match (encoder, decoder) {
			(false, false) => Residency::Offloaded,
			(true, false) => Residency::Encoder,
			(false, true) => Residency::Decoder,
			(true, true) => Residency::Pinned
		}
	}
}

/// Stage-one outputs for a whole batch, concatenated along the batch axis.
struct EncodedBatch {
	hidden: ArrayD<f32>,
	embedding: ArrayD<f32>,
	skips: Vec<ArrayD<f32>>
}

impl EncodedBatch {
	fn concatenate(chunks: Vec<EncodedChunk>) -> Result<Self> {
		let num_skips = chunks.first().map_or(0, |c| c.skips.len());
		if let Some(c) = chunks.iter().find(|c| c.skips.len() != num_skips) {
			return Err(SamplingError::Upstream(anyhow!("encoder returned {} skip tensors for one chunk and {num_skips} for another", c.skips.len())));
		}

		let cat = |tensors: Vec<&ArrayD<f32>>, what: &str| -> Result<ArrayD<f32>> {
			let views: Vec<ArrayViewD<'_, f32>> = tensors.into_iter().map(ArrayD::view).collect();
			concatenate(Axis(0), &views).map_err(|e| SamplingError::Upstream(anyhow::Error::new(e).context(format!("encoder chunks disagree on {what} shape"))))
		};

		let hidden = cat(chunks.iter().map(|c| &c.hidden).collect(), "hidden state")?;
		let embedding = cat(chunks.iter().map(|c| &c.embedding).collect(), "embedding")?;
		let skips = (0..num_skips)
			.map(|j| cat(chunks.iter().map(|c| &c.skips[j]).collect(), "skip connection"))
			.collect::<Result<Vec<_>>>()?;
		Ok(Self { hidden, embedding, skips })
	}
}

fn batch_len(shape: &[usize]) -> Option<usize> {
	shape.first().copied()
}

fn check_chunk_batch(what: &str, shape: &[usize], expected: usize) -> Result<()> {
	if batch_len(shape) != Some(expected) {
		return Err(SamplingError::Upstream(anyhow!("{what} has shape {shape:?}, expected a batch of {expected}")));
	}
	Ok(())
}

/// Evaluates a noise-prediction network that is split into an encoder and a decoder half.
///
/// Unless [`PipelineOptions::turbo`] is set, only one half is resident on the accelerator at a time: every
/// [`DenoisingPipeline::apply`] loads the encoder, runs it over the batch, swaps it for the decoder, runs that, and
/// offloads again. Within each stage the batch is processed `chunk_size` latents at a time. Chunking never changes the
/// result, only the peak memory.
pub struct DenoisingPipeline<E, D> {
	encoder: E,
	decoder: D,
	options: PipelineOptions,
	residency: Residency
}

impl<E: UNetEncoder, D: UNetDecoder> DenoisingPipeline<E, D> {
	/// Creates a pipeline from the two network halves. Both are assumed to start in host memory.
	///
	/// # Errors
	/// Returns [`SamplingError::Config`] if `options.chunk_size` is 0.
	pub fn new(encoder: E, decoder: D, options: PipelineOptions) -> Result<Self> {
		if options.chunk_size == 0 {
			return Err(SamplingError::config("chunk size must be > 0"));
		}
		Ok(Self {
			encoder,
			decoder,
			options,
			residency: Residency::Offloaded
		})
	}

	/// The options this pipeline was created with.
	pub fn options(&self) -> &PipelineOptions {
		&self.options
	}

	/// Which stages are currently on the accelerator.
	pub fn residency(&self) -> Residency {
		self.residency
	}

	/// The first network stage.
	pub fn encoder(&self) -> &E {
		&self.encoder
	}

	/// The second network stage.
	pub fn decoder(&self) -> &D {
		&self.decoder
	}

	/// Returns the two network stages.
	pub fn into_parts(self) -> (E, D) {
		(self.encoder, self.decoder)
	}

	fn transition(&mut self, target: Residency) -> Result<()> {
		if self.residency == target {
			return Ok(());
		}
		tracing::debug!(from = ?self.residency, to = ?target, "moving unet stages");

		let (mut encoder, mut decoder) = self.residency.stages();
		let (want_encoder, want_decoder) = target.stages();
		// offload first so the two halves never share the device unless asked to
		if encoder && !want_encoder {
			self.encoder.to_device(Device::Host).map_err(SamplingError::Upstream)?;
			encoder = false;
			self.residency = Residency::from_stages(encoder, decoder);
		}
		if decoder && !want_decoder {
			self.decoder.to_device(Device::Host).map_err(SamplingError::Upstream)?;
			decoder = false;
			self.residency = Residency::from_stages(encoder, decoder);
		}
		if !encoder && want_encoder {
			self.encoder.to_device(Device::Accelerator).map_err(SamplingError::Upstream)?;
			encoder = true;
			self.residency = Residency::from_stages(encoder, decoder);
		}
		if !decoder && want_decoder {
			self.decoder.to_device(Device::Accelerator).map_err(SamplingError::Upstream)?;
			decoder = true;
			self.residency = Residency::from_stages(encoder, decoder);
		}
		Ok(())
	}

	/// Returns both stages to host memory after `result`, preferring `result`'s error over a cleanup failure.
	fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
		match (result, self.transition(Residency::Offloaded)) {
			(Ok(value), Ok(())) => Ok(value),
			(Ok(_), Err(e)) | (Err(e), Ok(())) => Err(e),
			(Err(e), Err(cleanup)) => {
				tracing::warn!(error = %cleanup, "failed to offload unet stages after an error");
				Err(e)
			}
		}
	}

	/// Runs `f` with both stages pinned on the accelerator if turbo mode is enabled, offloading them afterwards even if
	/// `f` fails. Without turbo mode this simply calls `f`.
	///
	/// # Errors
	/// Propagates errors from `f` and from moving the stages.
	pub fn with_pinned<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
		if !self.options.turbo {
			return f(self);
		}

		let result = self.transition(Residency::Pinned).and_then(|_| f(self));
		self.settle(result)
	}

	/// Predicts the noise in `latent`, one timestep and one context entry per latent.
	///
	/// In turbo mode the stages are pinned if they are not already, and stay pinned; use
	/// [`DenoisingPipeline::with_pinned`] to scope that.
	///
	/// # Errors
	/// - [`SamplingError::Precondition`] if `timesteps` or `context` do not have one entry per latent.
	/// - [`SamplingError::Upstream`] if a stage fails or returns inconsistent shapes.
	pub fn apply(&mut self, latent: ArrayView4<'_, f32>, timesteps: ArrayView1<'_, f32>, context: ArrayViewD<'_, f32>) -> Result<Array4<f32>> {
		let batch = latent.len_of(Axis(0));
		if batch == 0 {
			return Err(SamplingError::precondition("cannot evaluate an empty batch"));
		}
		if timesteps.len() != batch {
			return Err(SamplingError::precondition(format!("{} timesteps for a batch of {batch}", timesteps.len())));
		}
		if batch_len(context.shape()) != Some(batch) {
			return Err(SamplingError::precondition(format!("context of shape {:?} for a batch of {batch}", context.shape())));
		}

		if self.options.turbo {
			self.transition(Residency::Pinned)?;
			let encoded = self.encode(latent, timesteps, context.view())?;
			return self.decode(&encoded, context);
		}

		let result = self.transition(Residency::Encoder).and_then(|_| {
			let encoded = self.encode(latent, timesteps, context.view())?;
			self.transition(Residency::Decoder)?;
			self.decode(&encoded, context.view())
		});
		self.settle(result)
	}

	fn encode(&mut self, latent: ArrayView4<'_, f32>, timesteps: ArrayView1<'_, f32>, context: ArrayViewD<'_, f32>) -> Result<EncodedBatch> {
		let batch = latent.len_of(Axis(0));
		let chunk_size = self.options.chunk_size;

		let mut chunks = Vec::with_capacity((batch + chunk_size - 1) / chunk_size);
		for start in (0..batch).step_by(chunk_size) {
			let end = (start + chunk_size).min(batch);
			let slice = Slice::from(start..end);
			let chunk = self
				.encoder
				.forward(latent.slice_axis(Axis(0), slice), timesteps.slice_axis(Axis(0), slice), context.slice_axis(Axis(0), slice))
				.map_err(SamplingError::Upstream)?;

			check_chunk_batch("encoder hidden state", chunk.hidden.shape(), end - start)?;
			check_chunk_batch("encoder embedding", chunk.embedding.shape(), end - start)?;
			for skip in &chunk.skips {
				check_chunk_batch("encoder skip connection", skip.shape(), end - start)?;
			}
			chunks.push(chunk);
		}
		tracing::trace!(batch, chunks = chunks.len(), "encoded batch");

		EncodedBatch::concatenate(chunks)
	}

	fn decode(&mut self, encoded: &EncodedBatch, context: ArrayViewD<'_, f32>) -> Result<Array4<f32>> {
		let batch = batch_len(encoded.hidden.shape()).unwrap_or(0);
		let chunk_size = self.options.chunk_size;
		let precision = self.options.precision;

		let mut outputs = Vec::with_capacity((batch + chunk_size - 1) / chunk_size);
		for start in (0..batch).step_by(chunk_size) {
			let end = (start + chunk_size).min(batch);
			let slice = Slice::from(start..end);
			let skips: Vec<ArrayViewD<'_, f32>> = encoded.skips.iter().map(|s| s.slice_axis(Axis(0), slice)).collect();
			let output = self
				.decoder
				.forward(
					encoded.hidden.slice_axis(Axis(0), slice),
					encoded.embedding.slice_axis(Axis(0), slice),
					precision,
					&skips,
					context.slice_axis(Axis(0), slice)
				)
				.map_err(SamplingError::Upstream)?;
			check_chunk_batch("decoder output", output.shape(), end - start)?;
			outputs.push(output);
		}

		let views: Vec<ArrayView4<'_, f32>> = outputs.iter().map(Array4::view).collect();
		concatenate(Axis(0), &views).map_err(|e| SamplingError::Upstream(anyhow::Error::new(e).context("decoder chunks disagree on output shape")))
	}
}
