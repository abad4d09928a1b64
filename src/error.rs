use thiserror::Error;

/// Errors raised while building schedules or sampling.
#[derive(Debug, Error)]
pub enum SamplingError {
	/// The requested configuration cannot be honoured (unknown schedule or sampler, `steps > T`, malformed shapes,
	/// incompatible options).
	#[error("invalid configuration: {0}")]
	Config(String),
	/// An internal invariant did not hold, e.g. a schedule whose length does not match its declared size.
	#[error("precondition violated: {0}")]
	Precondition(String),
	/// A failure raised by one of the network stages. Propagated as-is; never retried.
	#[error(transparent)]
	Upstream(anyhow::Error),
	/// The interrupt flag was raised; checked at the top of each step.
	#[error("sampling interrupted before step {step}")]
	Interrupted {
		/// The step that was about to run.
		step: usize
	},
	/// A configuration file could not be read.
	#[error(transparent)]
	Io(#[from] std::io::Error)
}

impl SamplingError {
	pub(crate) fn config(msg: impl Into<String>) -> Self {
		Self::Config(msg.into())
	}

	pub(crate) fn precondition(msg: impl Into<String>) -> Self {
		Self::Precondition(msg.into())
	}
}

impl From<serde_json::Error> for SamplingError {
	fn from(e: serde_json::Error) -> Self {
		Self::Config(format!("malformed sampler config: {e}"))
	}
}

/// Result type used throughout this crate.
pub type Result<T, E = SamplingError> = std::result::Result<T, E>;
