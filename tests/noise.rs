use latent_sampler::{NoiseSource, SamplingError};
use ndarray::{concatenate, Axis};

const SHAPE: [usize; 4] = [5, 4, 8, 8];

#[test]
fn sub_ranges_concatenate_to_full_batch() {
	let noise = NoiseSource::new(42);
	let full = noise.sample(SHAPE).unwrap();
	assert_eq!(full.shape(), &SHAPE);

	for partition in [&[5][..], &[1, 1, 1, 1, 1], &[2, 3], &[4, 1], &[1, 3, 1]] {
		let mut start = 0;
		let parts: Vec<_> = partition
			.iter()
			.map(|&len| {
				let part = noise.sample_range(SHAPE, start..start + len).unwrap();
				start += len;
				part
			})
			.collect();
		let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
		assert_eq!(concatenate(Axis(0), &views).unwrap(), full, "partition {partition:?}");
	}
}

#[test]
fn sample_noise_does_not_depend_on_batch_size() {
	let noise = NoiseSource::new(7);
	let small = noise.sample([2, 4, 8, 8]).unwrap();
	let large = noise.sample([6, 4, 8, 8]).unwrap();
	assert_eq!(small.index_axis(Axis(0), 1), large.index_axis(Axis(0), 1));
}

#[test]
fn seeds_are_reproducible_and_distinct() {
	let a = NoiseSource::new(1).sample(SHAPE).unwrap();
	let b = NoiseSource::new(1).sample(SHAPE).unwrap();
	let c = NoiseSource::new(2).sample(SHAPE).unwrap();
	assert_eq!(a, b);
	assert_ne!(a, c);
	// consecutive samples use consecutive seeds
	assert_eq!(a.index_axis(Axis(0), 1), c.index_axis(Axis(0), 0));
}

#[test]
fn noise_is_roughly_standard_normal() {
	let noise = NoiseSource::new(3).sample([4, 4, 32, 32]).unwrap();
	let n = noise.len() as f32;
	let mean = noise.sum() / n;
	let var = noise.mapv(|v| (v - mean).powi(2)).sum() / n;
	assert!(mean.abs() < 0.05, "{mean}");
	assert!((var - 1.0).abs() < 0.05, "{var}");
}

#[test]
fn malformed_requests_are_config_errors() {
	let noise = NoiseSource::new(0);
	assert!(matches!(noise.sample([1, 0, 8, 8]), Err(SamplingError::Config(_))));
	assert!(matches!(noise.sample_range(SHAPE, 3..6), Err(SamplingError::Config(_))));
}

#[test]
fn step_rng_is_seeded() {
	use rand::Rng;

	let a: u64 = NoiseSource::new(9).step_rng().gen();
	let b: u64 = NoiseSource::new(9).step_rng().gen();
	let c: u64 = NoiseSource::new(10).step_rng().gen();
	assert_eq!(a, b);
	assert_ne!(a, c);
}
