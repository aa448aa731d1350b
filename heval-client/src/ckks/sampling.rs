//! Random sampling for CKKS: uniform, ternary, and discrete Gaussian.

use rand::Rng;

use super::ntt::NttTable;
use super::params::SIGMA;
use super::poly::RnsPoly;

/// Sample a polynomial uniform in Z_Q, one independent channel per prime.
pub fn sample_uniform<R: Rng>(degree: usize, basis: &[&NttTable], rng: &mut R) -> RnsPoly {
    let residues = basis
        .iter()
        .map(|t| (0..degree).map(|_| rng.gen_range(0..t.modulus())).collect())
        .collect();
    RnsPoly { residues }
}

/// Sample from the ternary distribution {-1, 0, 1}.
/// P(0) = 0.5, P(-1) = P(1) = 0.25.
pub fn sample_ternary<R: Rng>(n: usize, rng: &mut R) -> Vec<i64> {
    (0..n)
        .map(|_| match rng.gen_range(0u8..4) {
            0 => -1,
            1 => 1,
            _ => 0,
        })
        .collect()
}

/// Sample from the discrete Gaussian with σ = SIGMA, via Box-Muller and
/// rounding, rejecting the tail beyond 6σ.
pub fn sample_gaussian<R: Rng>(n: usize, rng: &mut R) -> Vec<i64> {
    let tail_bound = (SIGMA * 6.0).ceil() as i64;
    let mut coeffs = Vec::with_capacity(n);
    while coeffs.len() < n {
        let u1: f64 = rng.gen_range(1e-15_f64..1.0_f64);
        let u2: f64 = rng.gen_range(0.0_f64..std::f64::consts::TAU);
        let r = (-2.0 * u1.ln()).sqrt() * SIGMA;
        for z in [r * u2.cos(), r * u2.sin()] {
            let s = z.round() as i64;
            if s.abs() <= tail_bound && coeffs.len() < n {
                coeffs.push(s);
            }
        }
    }
    coeffs
}
