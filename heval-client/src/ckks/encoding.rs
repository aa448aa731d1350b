//! SIMD slot packing through the canonical embedding.
//!
//! Z[X]/(X^N + 1) ≅ C^{N/2}: a real vector of up to N/2 values becomes one
//! polynomial, and ring addition and multiplication act slot-wise. Slot i is
//! the evaluation at ψ^{5^i}, so the automorphism X → X^5 rotates the slots
//! left by one.
//!
//! Encoding places the values in a conjugate-symmetric vector, runs an
//! inverse FFT, untwists by ψ^-j and rounds the scaled coefficients.
//! Decoding runs the same steps backwards.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use super::ntt::NttTable;
use super::poly::RnsPoly;
use super::CkksError;

/// Generator of the slot rotation group: 5 has order N/2 mod 2N.
pub const GALOIS_GENERATOR: usize = 5;

/// Coefficients are rounded through i128, so stay well inside it.
const MAX_COEFF_BITS: f64 = 120.0;

/// Where a vector lives among the slots: values in
/// `[k·period, k·period + len)` for every k, zero elsewhere.
///
/// A fresh encryption has `period` equal to the slot count, so there is a
/// single copy. Rotations replicate a vector at smaller periods so that
/// cyclic shifts within each period can be computed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotLayout {
    pub len: usize,
    pub period: usize,
}

impl SlotLayout {
    /// A single copy of `len` values.
    pub fn packed(len: usize, slots: usize) -> Self {
        Self { len, period: slots }
    }

    /// Non-empty, with a power-of-two period between `len` and `slots`.
    pub fn fits(&self, slots: usize) -> bool {
        self.len > 0
            && self.period.is_power_of_two()
            && self.len <= self.period
            && self.period <= slots
            && slots % self.period == 0
    }

    /// Number of copies in `slots` slots.
    pub fn copies(&self, slots: usize) -> usize {
        slots / self.period
    }
}

/// An encoded, unencrypted polynomial together with its scale and level.
#[derive(Clone, Debug, PartialEq)]
pub struct Plaintext {
    pub poly: RnsPoly,
    pub scale: f64,
    pub level: usize,
}

#[derive(Clone, Copy, Debug)]
struct Complex {
    re: f64,
    im: f64,
}

impl Complex {
    const ZERO: Complex = Complex { re: 0.0, im: 0.0 };

    fn from_angle(theta: f64) -> Self {
        Self {
            re: theta.cos(),
            im: theta.sin(),
        }
    }

    fn add(self, o: Self) -> Self {
        Self {
            re: self.re + o.re,
            im: self.im + o.im,
        }
    }

    fn sub(self, o: Self) -> Self {
        Self {
            re: self.re - o.re,
            im: self.im - o.im,
        }
    }

    fn mul(self, o: Self) -> Self {
        Self {
            re: self.re * o.re - self.im * o.im,
            im: self.re * o.im + self.im * o.re,
        }
    }

    fn conj(self) -> Self {
        Self {
            re: self.re,
            im: -self.im,
        }
    }
}

/// Radix-2 FFT, Z_k = Σ_j X_j · e^{2πijk/n}.
fn fft(a: &mut [Complex]) {
    let n = a.len();
    let mut j = 0usize;
    for i in 1..n {
        let mut bit = n >> 1;
        while j & bit != 0 {
            j ^= bit;
            bit >>= 1;
        }
        j ^= bit;
        if i < j {
            a.swap(i, j);
        }
    }

    let mut len = 2;
    while len <= n {
        let half = len / 2;
        let w_len = Complex::from_angle(2.0 * PI / len as f64);
        for start in (0..n).step_by(len) {
            let mut w = Complex { re: 1.0, im: 0.0 };
            for k in 0..half {
                let u = a[start + k];
                let t = a[start + k + half].mul(w);
                a[start + k] = u.add(t);
                a[start + k + half] = u.sub(t);
                w = w.mul(w_len);
            }
        }
        len <<= 1;
    }
}

fn ifft(a: &mut [Complex]) {
    for x in a.iter_mut() {
        *x = x.conj();
    }
    fft(a);
    let inv_n = 1.0 / a.len() as f64;
    for x in a.iter_mut() {
        let c = x.conj();
        *x = Complex {
            re: c.re * inv_n,
            im: c.im * inv_n,
        };
    }
}

/// Canonical-embedding encoder for one ring degree.
#[derive(Clone, Debug)]
pub struct Encoder {
    degree: usize,
    /// Slot i ↔ FFT position (5^i mod 2N - 1) / 2.
    slot_to_fft: Vec<usize>,
}

impl Encoder {
    pub fn new(degree: usize) -> Self {
        let slots = degree / 2;
        let two_n = 2 * degree;
        let mut slot_to_fft = Vec::with_capacity(slots);
        let mut root = 1usize;
        for _ in 0..slots {
            slot_to_fft.push((root - 1) / 2);
            root = (root * GALOIS_GENERATOR) % two_n;
        }
        Self {
            degree,
            slot_to_fft,
        }
    }

    pub fn slots(&self) -> usize {
        self.degree / 2
    }

    /// Encode `values` into slots `0..values.len()`, zero in the rest,
    /// scaled by `scale` and reduced into every prime of `basis`.
    pub fn encode(
        &self,
        values: &[f64],
        scale: f64,
        basis: &[&NttTable],
    ) -> Result<RnsPoly, CkksError> {
        let n = self.degree;
        if values.len() > self.slots() {
            return Err(CkksError::Shape(format!(
                "{} values for {} slots",
                values.len(),
                self.slots()
            )));
        }
        if !scale.is_finite() || scale <= 0.0 {
            return Err(CkksError::ValueOutOfRange(format!("scale {}", scale)));
        }
        if let Some(v) = values.iter().find(|v| !v.is_finite()) {
            return Err(CkksError::ValueOutOfRange(format!("{} is not finite", v)));
        }

        let mut z = vec![Complex::ZERO; n];
        for (&v, &pos) in values.iter().zip(&self.slot_to_fft) {
            z[pos] = Complex { re: v, im: 0.0 };
            z[n - 1 - pos] = Complex { re: v, im: 0.0 };
        }
        ifft(&mut z);

        let modulus_bits: f64 = basis.iter().map(|t| (t.modulus() as f64).log2()).sum();
        let bound = (modulus_bits - 1.0).min(MAX_COEFF_BITS).exp2();
        let psi = PI / n as f64;
        let mut coeffs = Vec::with_capacity(n);
        for (j, c) in z.iter().enumerate() {
            let untwisted = c.mul(Complex::from_angle(-(j as f64) * psi));
            let scaled = (untwisted.re * scale).round();
            if !scaled.is_finite() || scaled.abs() >= bound {
                return Err(CkksError::ValueOutOfRange(format!(
                    "coefficient {:e} at scale 2^{:.1} exceeds the {:.0}-bit modulus",
                    scaled,
                    scale.log2(),
                    modulus_bits
                )));
            }
            coeffs.push(scaled as i128);
        }
        Ok(RnsPoly::from_wide(&coeffs, basis))
    }

    /// Read the first `count` slots from centered coefficients.
    pub fn decode(&self, coeffs: &[f64], scale: f64, count: usize) -> Vec<f64> {
        let n = self.degree;
        let psi = PI / n as f64;
        let mut b: Vec<Complex> = (0..n)
            .map(|j| {
                let v = coeffs.get(j).copied().unwrap_or(0.0) / scale;
                Complex { re: v, im: 0.0 }.mul(Complex::from_angle(j as f64 * psi))
            })
            .collect();
        fft(&mut b);
        self.slot_to_fft
            .iter()
            .take(count)
            .map(|&pos| b[pos].re)
            .collect()
    }
}

/// Galois element for a left rotation by `steps` slots: 5^steps mod 2N.
pub fn galois_element(steps: usize, degree: usize) -> usize {
    let two_n = 2 * degree;
    let mut g = 1usize;
    for _ in 0..steps % (degree / 2) {
        g = (g * GALOIS_GENERATOR) % two_n;
    }
    g
}
