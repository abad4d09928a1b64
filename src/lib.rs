//! `latent-sampler` is the iterative denoising engine of a latent diffusion model: given a conditioning signal it turns
//! seeded Gaussian noise into a clean latent by repeatedly querying a noise-prediction network.
//!
//! The network itself is not part of this crate. It is consumed as two opaque halves ([`UNetEncoder`] and
//! [`UNetDecoder`]) so that only one of them has to occupy accelerator memory at a time; see [`DenoisingPipeline`].
//! On top of that, the crate provides:
//!
//! * noise schedules ([`Schedule`], [`ReducedSchedule`], [`KarrasSigmas`]),
//! * classifier-free guidance with adaptive skipping ([`GuidanceMixer`]),
//! * the samplers DDIM, PLMS, Euler, Euler-ancestral, Heun, DPM-2, DPM-2-ancestral and LMS ([`samplers`]),
//! * and a sampling loop tying it all together ([`LatentSampler`]).
//!
//! ```ignore
//! use latent_sampler::{DenoisingPipeline, LatentSampler, PipelineOptions, SampleOptions, SamplerKind, Schedule, ScheduleConfig};
//!
//! let schedule = Schedule::new(&ScheduleConfig::default())?;
//! let pipeline = DenoisingPipeline::new(encoder, decoder, PipelineOptions::default())?;
//! let mut sampler = LatentSampler::new(schedule, pipeline);
//!
//! let latent = sampler.sample(
//! 	conditioning.view(),
//! 	SampleOptions::default()
//! 		.with_shape([1, 4, 64, 64])
//! 		.with_steps(50)
//! 		.with_sampler(SamplerKind::Plms)
//! 		.with_guidance(7.5, unconditional)
//! 		.with_seed(42)
//! )?;
//! ```
//!
//! Sampling is logged through [`tracing`]; this crate never installs a subscriber.

#![warn(missing_docs)]
#![warn(rustdoc::all)]
#![warn(clippy::correctness, clippy::suspicious, clippy::complexity, clippy::perf, clippy::style)]
#![allow(clippy::tabs_in_doc_comments)]

mod config;
mod error;
pub mod noise;
pub mod pipelines;
pub mod samplers;
pub mod schedulers;
pub(crate) mod util;

pub use self::config::LatentSamplerConfig;
pub use self::error::{Result, SamplingError};
pub use self::noise::NoiseSource;
pub use self::pipelines::*;
pub use self::samplers::{EpsilonModel, Sampler, SamplerKind, StepContext};
pub use self::schedulers::*;
