// Copyright 2022-2023 pyke.io
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// 	http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use ndarray::ArrayView1;

/// Remembers the last bracketing interval so that monotone sweeps (which is how sigma tables are walked) rarely need a
/// binary search.
#[derive(Debug, Default, Clone)]
pub(crate) struct InterpolationAccelerator {
	cache: usize
}

fn bsearch(xarr: &ArrayView1<'_, f64>, x: f64, idx_low: usize, idx_high: usize) -> usize {
	let mut ilow = idx_low;
	let mut ihigh = idx_high;

	while ihigh > ilow + 1 {
		let i = (ihigh + ilow) / 2;
		if xarr[i] > x {
			ihigh = i;
		} else {
			ilow = i;
		}
	}
	ilow
}

fn accel_find(xarr: &ArrayView1<'_, f64>, x: f64, acc: &mut InterpolationAccelerator) -> usize {
	let xidx = acc.cache;

	if x < xarr[xidx] {
		acc.cache = bsearch(xarr, x, 0, xidx);
	} else if x >= xarr[xidx + 1] {
		acc.cache = bsearch(xarr, x, xidx, xarr.len() - 1);
	}
	acc.cache
}

/// Piecewise-linear interpolation over strictly increasing knots `x`.
#[derive(Debug, Clone)]
pub(crate) struct LinearInterpolator<'x, 'y> {
	x: ArrayView1<'x, f64>,
	y: ArrayView1<'y, f64>,
	acc: InterpolationAccelerator
}

impl<'x, 'y> LinearInterpolator<'x, 'y> {
	/// `x` must be strictly increasing, hold at least two knots, and be as long as `y`.
	pub fn new(x: ArrayView1<'x, f64>, y: ArrayView1<'y, f64>) -> Self {
		debug_assert!(x.len() >= 2 && x.len() == y.len());
		Self {
			x,
			y,
			acc: InterpolationAccelerator::default()
		}
	}

	/// Interpolates at `x`, holding the first/last value outside the knot range.
	pub fn eval_clamped(&mut self, x: f64) -> f64 {
		let last = self.x.len() - 1;
		if x <= self.x[0] {
			self.y[0]
		} else if x >= self.x[last] {
			self.y[last]
		} else {
			self.eval_inside(x)
		}
	}

	fn eval_inside(&mut self, x: f64) -> f64 {
		let idx = accel_find(&self.x, x, &mut self.acc).min(self.x.len() - 2);

		let x_l = self.x[idx];
		let x_h = self.x[idx + 1];
		let y_l = self.y[idx];
		let y_h = self.y[idx + 1];
		let dx = x_h - x_l;
		if dx > 0.0 { y_l + (x - x_l) / dx * (y_h - y_l) } else { f64::NAN }
	}
}

#[cfg(test)]
mod tests {
	use ndarray::array;

	use super::*;

	#[test]
	fn interpolates_between_knots() {
		let x = array![0.0, 1.0, 2.0, 4.0];
		let y = array![0.0, 10.0, 20.0, 0.0];
		let mut interp = LinearInterpolator::new(x.view(), y.view());
		assert_eq!(interp.eval_clamped(0.5), 5.0);
		assert_eq!(interp.eval_clamped(3.0), 10.0);
		assert_eq!(interp.eval_clamped(3.5), 5.0);
		// walking backwards exercises the accelerator's miss path
		assert_eq!(interp.eval_clamped(1.5), 15.0);
	}

	#[test]
	fn clamps_outside_range() {
		let x = array![-1.0, 1.0];
		let y = array![3.0, 5.0];
		let mut interp = LinearInterpolator::new(x.view(), y.view());
		assert_eq!(interp.eval_clamped(-7.0), 3.0);
		assert_eq!(interp.eval_clamped(7.0), 5.0);
		assert_eq!(interp.eval_clamped(0.0), 4.0);
	}
}
