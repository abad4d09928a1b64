use std::{
	fs::File,
	io::{BufReader, Read},
	path::Path
};

use serde::{Deserialize, Serialize};

use crate::{pipelines::PipelineOptions, schedulers::ScheduleConfig, Result};

/// Everything needed to set up a [`LatentSampler`](crate::pipelines::LatentSampler) apart from the network stages,
/// usually stored as a `sampler.json` next to the model weights:
///
/// ```json
/// {
/// 	"schedule": { "kind": "linear", "timesteps": 1000, "linear-start": 0.00085, "linear-end": 0.012 },
/// 	"pipeline": { "chunk-size": 2, "turbo": false, "precision": "f16" }
/// }
/// ```
///
/// Every field is optional and falls back to its default.
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LatentSamplerConfig {
	/// The noise schedule the model was trained with.
	pub schedule: ScheduleConfig,
	/// How the network stages are evaluated.
	pub pipeline: PipelineOptions
}

impl LatentSamplerConfig {
	/// Parses a JSON configuration.
	///
	/// # Errors
	/// Returns [`SamplingError::Config`](crate::SamplingError::Config) if the JSON is malformed.
	pub fn from_reader(reader: impl Read) -> Result<Self> {
		Ok(serde_json::from_reader(reader)?)
	}

	/// Reads a JSON configuration file.
	///
	/// # Errors
	/// Returns [`SamplingError::Io`](crate::SamplingError::Io) if the file cannot be read, or
	/// [`SamplingError::Config`](crate::SamplingError::Config) if it is malformed.
	pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
		let file = File::open(path)?;
		Self::from_reader(BufReader::new(file))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{pipelines::Precision, schedulers::BetaSchedule, SamplingError};

	#[test]
	fn parses_partial_config() {
		let config = LatentSamplerConfig::from_reader(
			r#"{ "schedule": { "kind": "cosine", "timesteps": 500 }, "pipeline": { "chunk-size": 4, "precision": "f16" } }"#.as_bytes()
		)
		.unwrap();
		assert_eq!(config.schedule.kind, BetaSchedule::Cosine);
		assert_eq!(config.schedule.timesteps, 500);
		assert_eq!(config.schedule.linear_start, 1e-4);
		assert_eq!(config.pipeline.chunk_size, 4);
		assert!(!config.pipeline.turbo);
		assert_eq!(config.pipeline.precision, Precision::F16);
	}

	#[test]
	fn empty_object_is_default() {
		assert_eq!(LatentSamplerConfig::from_reader("{}".as_bytes()).unwrap(), LatentSamplerConfig::default());
	}

	#[test]
	fn unknown_schedule_kind_is_config_error() {
		let err = LatentSamplerConfig::from_reader(r#"{ "schedule": { "kind": "exponential" } }"#.as_bytes()).unwrap_err();
		assert!(matches!(err, SamplingError::Config(_)));
	}

	#[test]
	fn missing_file_is_io_error() {
		let err = LatentSamplerConfig::from_file("/nonexistent/sampler.json").unwrap_err();
		assert!(matches!(err, SamplingError::Io(_)));
	}
}
