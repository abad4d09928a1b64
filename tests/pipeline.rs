mod common;

use common::{context_eps, pipeline, stages, Event, Stage};
use latent_sampler::{DenoisingPipeline, Device, NoiseSource, PipelineOptions, Residency, SamplingError};
use ndarray::{Array1, Array4, ArrayD};

fn inputs(batch: usize) -> (Array4<f32>, Array1<f32>, ArrayD<f32>) {
	let latent = NoiseSource::new(11).sample([batch, 4, 8, 8]).unwrap();
	let timesteps = Array1::from_iter((0..batch).map(|i| 100.0 * i as f32 + 1.0));
	let context = ArrayD::from_shape_fn(vec![batch, 3, 2], |idx| idx[0] as f32 - 0.5 * idx[2] as f32);
	(latent, timesteps, context)
}

fn options(chunk_size: usize, turbo: bool) -> PipelineOptions {
	PipelineOptions {
		chunk_size,
		turbo,
		..Default::default()
	}
}

#[test]
fn output_is_independent_of_chunk_size() {
	let (latent, timesteps, context) = inputs(5);
	let (mut reference, _) = pipeline(context_eps(), options(5, false));
	let expected = reference.apply(latent.view(), timesteps.view(), context.view()).unwrap();
	assert_eq!(expected.shape(), latent.shape());

	for chunk_size in 1..=7 {
		for turbo in [false, true] {
			let (mut pipeline, _) = pipeline(context_eps(), options(chunk_size, turbo));
			let output = pipeline.apply(latent.view(), timesteps.view(), context.view()).unwrap();
			assert_eq!(output, expected, "chunk size {chunk_size}, turbo {turbo}");
		}
	}
}

#[test]
fn stages_are_swapped_around_each_evaluation() {
	let (latent, timesteps, context) = inputs(5);
	let (mut pipeline, log) = pipeline(context_eps(), options(2, false));
	pipeline.apply(latent.view(), timesteps.view(), context.view()).unwrap();

	assert_eq!(
		*log.borrow(),
		vec![
			Event::Moved(Stage::Encoder, Device::Accelerator),
			Event::Encoded(2),
			Event::Encoded(2),
			Event::Encoded(1),
			Event::Moved(Stage::Encoder, Device::Host),
			Event::Moved(Stage::Decoder, Device::Accelerator),
			Event::Decoded(2),
			Event::Decoded(2),
			Event::Decoded(1),
			Event::Moved(Stage::Decoder, Device::Host),
		]
	);
	assert_eq!(pipeline.residency(), Residency::Offloaded);
}

#[test]
fn at_most_one_stage_is_resident_without_turbo() {
	let (latent, timesteps, context) = inputs(3);
	let (mut pipeline, log) = pipeline(context_eps(), options(1, false));
	for _ in 0..3 {
		pipeline.apply(latent.view(), timesteps.view(), context.view()).unwrap();
	}

	let (mut encoder, mut decoder) = (false, false);
	for event in log.borrow().iter() {
		match event {
			Event::Moved(Stage::Encoder, device) => encoder = *device == Device::Accelerator,
			Event::Moved(Stage::Decoder, device) => decoder = *device == Device::Accelerator,
			Event::Encoded(_) => assert!(encoder && !decoder),
			Event::Decoded(_) => assert!(decoder && !encoder)
		}
		assert!(!(encoder && decoder));
	}
}

#[test]
fn turbo_pins_both_stages_for_the_whole_scope() {
	let (latent, timesteps, context) = inputs(2);
	let (mut pipeline, log) = pipeline(context_eps(), options(1, true));

	pipeline
		.with_pinned(|pipeline| {
			assert_eq!(pipeline.residency(), Residency::Pinned);
			for _ in 0..4 {
				pipeline.apply(latent.view(), timesteps.view(), context.view())?;
				assert_eq!(pipeline.residency(), Residency::Pinned);
			}
			Ok(())
		})
		.unwrap();
	assert_eq!(pipeline.residency(), Residency::Offloaded);

	let moves = log.borrow().iter().filter(|e| matches!(e, Event::Moved(..))).count();
	assert_eq!(moves, 4);
}

#[test]
fn pinned_stages_are_released_on_error() {
	let (mut pipeline, _) = pipeline(context_eps(), options(1, true));
	let result: Result<(), _> = pipeline.with_pinned(|_| Err(SamplingError::Interrupted { step: 3 }));
	assert!(matches!(result, Err(SamplingError::Interrupted { step: 3 })));
	assert_eq!(pipeline.residency(), Residency::Offloaded);
}

#[test]
fn with_pinned_is_transparent_without_turbo() {
	let (mut pipeline, log) = pipeline(context_eps(), options(1, false));
	let value = pipeline
		.with_pinned(|pipeline| {
			assert_eq!(pipeline.residency(), Residency::Offloaded);
			Ok(17)
		})
		.unwrap();
	assert_eq!(value, 17);
	assert!(log.borrow().is_empty());
}

#[test]
fn stage_failures_propagate_unchanged_and_offload() {
	let (latent, timesteps, context) = inputs(2);
	let (mut encoder, decoder, log) = stages(context_eps());
	encoder.fail_forward = true;
	let mut pipeline = DenoisingPipeline::new(encoder, decoder, options(1, false)).unwrap();

	let err = pipeline.apply(latent.view(), timesteps.view(), context.view()).unwrap_err();
	assert!(matches!(err, SamplingError::Upstream(_)));
	assert_eq!(err.to_string(), "encoder exploded");
	assert_eq!(pipeline.residency(), Residency::Offloaded);
	assert_eq!(log.borrow().last(), Some(&Event::Moved(Stage::Encoder, Device::Host)));
	// no retry
	assert_eq!(log.borrow().iter().filter(|e| matches!(e, Event::Encoded(_))).count(), 1);
}

#[test]
fn cleanup_failure_does_not_mask_the_original_error() {
	let (latent, timesteps, context) = inputs(1);
	let (mut encoder, decoder, _) = stages(context_eps());
	encoder.fail_forward = true;
	encoder.fail_offload = true;
	let mut pipeline = DenoisingPipeline::new(encoder, decoder, options(1, false)).unwrap();

	let err = pipeline.apply(latent.view(), timesteps.view(), context.view()).unwrap_err();
	assert_eq!(err.to_string(), "encoder exploded");
}

#[test]
fn inconsistent_decoder_output_is_upstream_error() {
	let (latent, timesteps, context) = inputs(2);
	let (mut pipeline, _) = pipeline(Box::new(|latent, _, _| Array4::zeros((latent.shape()[0] + 1, 4, 8, 8))), options(1, false));
	let err = pipeline.apply(latent.view(), timesteps.view(), context.view()).unwrap_err();
	assert!(matches!(err, SamplingError::Upstream(_)));
	assert_eq!(pipeline.residency(), Residency::Offloaded);
}

#[test]
fn batch_mismatches_are_precondition_errors() {
	let (latent, timesteps, context) = inputs(3);
	let (short_latent, _, short_context) = inputs(2);
	let (mut pipeline, log) = pipeline(context_eps(), options(1, false));

	let err = pipeline.apply(short_latent.view(), timesteps.view(), short_context.view()).unwrap_err();
	assert!(matches!(err, SamplingError::Precondition(_)));
	let err = pipeline.apply(latent.view(), timesteps.view(), short_context.view()).unwrap_err();
	assert!(matches!(err, SamplingError::Precondition(_)));
	let err = pipeline.apply(short_latent.view(), timesteps.view(), context.view()).unwrap_err();
	assert!(matches!(err, SamplingError::Precondition(_)));
	// rejected before anything is moved
	assert!(log.borrow().is_empty());
}

#[test]
fn zero_chunk_size_is_config_error() {
	let (encoder, decoder, _) = stages(context_eps());
	assert!(matches!(DenoisingPipeline::new(encoder, decoder, options(0, false)), Err(SamplingError::Config(_))));
}
