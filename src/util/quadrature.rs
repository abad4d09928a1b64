const NODES: [f64; 4] = [-0.861_136_311_594_052_6, -0.339_981_043_584_856_3, 0.339_981_043_584_856_3, 0.861_136_311_594_052_6];
const WEIGHTS: [f64; 4] = [0.347_854_845_137_453_8, 0.652_145_154_862_546_1, 0.652_145_154_862_546_1, 0.347_854_845_137_453_8];

/// Four-point Gauss–Legendre quadrature of `f` over `[a, b]`. Exact for polynomials up to degree 7, which covers every
/// Lagrange basis polynomial a linear multistep method of order <= 8 integrates.
///
/// `b < a` is allowed and yields the negated integral, like the usual orientation convention.
pub(crate) fn gauss_legendre<F: Fn(f64) -> f64>(f: F, a: f64, b: f64) -> f64 {
	let half_width = 0.5 * (b - a);
	let center = 0.5 * (a + b);
	NODES
		.iter()
		.zip(WEIGHTS.iter())
		.map(|(node, weight)| weight * f(center + half_width * node))
		.sum::<f64>()
		* half_width
}

#[cfg(test)]
mod tests {
	use super::gauss_legendre;

	#[test]
	fn integrates_cubics_exactly() {
		let f = |x: f64| 4.0 * x.powi(3) - 3.0 * x.powi(2) + 2.0 * x - 1.0;
		// antiderivative: x^4 - x^3 + x^2 - x
		let exact = |x: f64| x.powi(4) - x.powi(3) + x.powi(2) - x;
		let (a, b) = (14.6, 0.03);
		assert!((gauss_legendre(f, a, b) - (exact(b) - exact(a))).abs() < 1e-6);
	}

	#[test]
	fn constant_integrates_to_interval_length() {
		assert!((gauss_legendre(|_| 1.0, 2.0, 5.5) - 3.5).abs() < 1e-12);
		assert!((gauss_legendre(|_| 1.0, 5.5, 2.0) + 3.5).abs() < 1e-12);
	}
}
