//! The noise-prediction network and everything that drives it.
//!
//! The network is consumed as two opaque halves, a [`UNetEncoder`] (input blocks + middle block) and a
//! [`UNetDecoder`] (output blocks), so that only one of them has to occupy accelerator memory at a time. See
//! [`DenoisingPipeline`] for how the halves are scheduled, [`GuidanceMixer`] for classifier-free guidance and
//! [`LatentSampler`] for the sampling entry point.

use ndarray::{Array4, ArrayD, ArrayView1, ArrayView4, ArrayViewD};
use serde::{Deserialize, Serialize};

mod guidance;
mod sampling;
mod split_unet;

pub use self::guidance::{GuidanceMixer, GuidedModel};
pub use self::sampling::{LatentSampler, SampleOptions, StepCallback, StepProgress};
pub use self::split_unet::{DenoisingPipeline, PipelineOptions, Residency};

/// Where a network stage's weights currently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
	/// Host (CPU) memory.
	Host,
	/// The compute device the stages run on.
	Accelerator
}

/// Numeric precision the latents are kept in, forwarded to [`UNetDecoder::forward`] so it can cast its output.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
	/// 32-bit floats.
	#[default]
	F32,
	/// 16-bit floats.
	F16
}

/// A model component whose weights can be moved between host and accelerator memory.
pub trait Offload {
	/// Moves this component's weights to `device`.
	///
	/// # Errors
	/// Implementations return an error if the move fails, e.g. because the accelerator is out of memory.
	fn to_device(&mut self, device: Device) -> anyhow::Result<()>;
}

/// Output of the first network stage for one chunk of the batch.
#[derive(Debug, Clone)]
pub struct EncodedChunk {
	/// Activation entering the output blocks, batch on axis 0.
	pub hidden: ArrayD<f32>,
	/// Timestep embedding, batch on axis 0.
	pub embedding: ArrayD<f32>,
	/// Skip connections from the input blocks, in the order the decoder consumes them. Batch on axis 0.
	pub skips: Vec<ArrayD<f32>>
}

/// First half of the noise-prediction network.
pub trait UNetEncoder: Offload {
	/// Encodes a chunk of latents. `timesteps` and `context` hold one entry per latent, in the same order.
	///
	/// # Errors
	/// Any error is surfaced to the caller of the sampler unchanged.
	fn forward(&mut self, latent: ArrayView4<'_, f32>, timesteps: ArrayView1<'_, f32>, context: ArrayViewD<'_, f32>) -> anyhow::Result<EncodedChunk>;
}

/// Second half of the noise-prediction network.
pub trait UNetDecoder: Offload {
	/// Predicts the noise of a chunk from the encoder's outputs. The returned batch order must match the input order.
	///
	/// # Errors
	/// Any error is surfaced to the caller of the sampler unchanged.
	fn forward(
		&mut self,
		hidden: ArrayViewD<'_, f32>,
		embedding: ArrayViewD<'_, f32>,
		precision: Precision,
		skips: &[ArrayViewD<'_, f32>],
		context: ArrayViewD<'_, f32>
	) -> anyhow::Result<Array4<f32>>;
}
