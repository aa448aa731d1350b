//! Polynomials of Z_Q[X]/(X^N + 1) in residue number system form.
//!
//! A polynomial is stored as one residue vector per prime of its basis,
//! values in [0, q). The basis is never stored with the polynomial: every
//! operation takes the NTT tables of the primes the residues are reduced by,
//! since that depends on the level of the ciphertext the polynomial belongs
//! to.

use serde::{Deserialize, Serialize};

use super::ntt::{add_mod, mod_inv, mul_mod, reduce_signed, sub_mod, NttTable};
use super::params::CkksParams;
use super::CkksError;

/// NTT tables for every prime of a parameter set: q0..qL, then P.
#[derive(Clone, Debug)]
pub struct Ring {
    degree: usize,
    tables: Vec<NttTable>,
}

impl Ring {
    pub fn new(params: &CkksParams) -> Result<Self, CkksError> {
        if params.coeff_modulus.len() < 2 {
            return Err(CkksError::InvalidParams(
                "coefficient modulus needs at least two primes".into(),
            ));
        }
        let tables = params
            .coeff_modulus
            .iter()
            .map(|&q| {
                NttTable::new(q, params.degree()).ok_or_else(|| {
                    CkksError::InvalidParams(format!("{} is not an NTT prime", q))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            degree: params.degree(),
            tables,
        })
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn slots(&self) -> usize {
        self.degree / 2
    }

    /// Basis of a ciphertext at `level`: q0..=q_level.
    pub fn level(&self, level: usize) -> Vec<&NttTable> {
        self.tables[..=level].iter().collect()
    }

    /// q0..=q_level followed by the special prime.
    pub fn extended(&self, level: usize) -> Vec<&NttTable> {
        let mut basis = self.level(level);
        basis.push(self.special());
        basis
    }

    pub fn special(&self) -> &NttTable {
        &self.tables[self.tables.len() - 1]
    }
}

/// A polynomial as residues modulo each prime of its basis.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RnsPoly {
    /// `residues[i][j]`: coefficient j modulo prime i.
    pub residues: Vec<Vec<u64>>,
}

impl RnsPoly {
    pub fn zero(degree: usize, channels: usize) -> Self {
        Self {
            residues: vec![vec![0u64; degree]; channels],
        }
    }

    /// Reduce small signed coefficients into every channel of `basis`.
    pub fn from_signed(coeffs: &[i64], basis: &[&NttTable]) -> Self {
        let residues = basis
            .iter()
            .map(|t| {
                let q = t.modulus();
                coeffs.iter().map(|&c| reduce_signed(c as i128, q)).collect()
            })
            .collect();
        Self { residues }
    }

    /// Same as [`from_signed`](Self::from_signed) for coefficients wider
    /// than 64 bits.
    pub fn from_wide(coeffs: &[i128], basis: &[&NttTable]) -> Self {
        let residues = basis
            .iter()
            .map(|t| {
                let q = t.modulus();
                coeffs.iter().map(|&c| reduce_signed(c, q)).collect()
            })
            .collect();
        Self { residues }
    }

    pub fn channels(&self) -> usize {
        self.residues.len()
    }

    pub fn degree(&self) -> usize {
        self.residues.first().map_or(0, Vec::len)
    }

    /// True when there is one channel of `degree` values per prime of
    /// `basis`, each value below its prime.
    pub fn is_reduced(&self, basis: &[&NttTable], degree: usize) -> bool {
        self.residues.len() == basis.len()
            && self.residues.iter().zip(basis).all(|(channel, t)| {
                let q = t.modulus();
                channel.len() == degree && channel.iter().all(|&v| v < q)
            })
    }

    fn zip_with(
        &self,
        other: &RnsPoly,
        basis: &[&NttTable],
        op: impl Fn(u64, u64, u64) -> u64,
    ) -> RnsPoly {
        let residues = self
            .residues
            .iter()
            .zip(&other.residues)
            .zip(basis)
            .map(|((a, b), t)| {
                let q = t.modulus();
                a.iter().zip(b).map(|(&x, &y)| op(x, y, q)).collect()
            })
            .collect();
        RnsPoly { residues }
    }

    pub fn add(&self, other: &RnsPoly, basis: &[&NttTable]) -> RnsPoly {
        self.zip_with(other, basis, add_mod)
    }

    pub fn sub(&self, other: &RnsPoly, basis: &[&NttTable]) -> RnsPoly {
        self.zip_with(other, basis, sub_mod)
    }

    pub fn neg(&self, basis: &[&NttTable]) -> RnsPoly {
        let residues = self
            .residues
            .iter()
            .zip(basis)
            .map(|(a, t)| a.iter().map(|&x| sub_mod(0, x, t.modulus())).collect())
            .collect();
        RnsPoly { residues }
    }

    /// Negacyclic product, one NTT per channel.
    pub fn mul(&self, other: &RnsPoly, basis: &[&NttTable]) -> RnsPoly {
        let residues = self
            .residues
            .iter()
            .zip(&other.residues)
            .zip(basis)
            .map(|((a, b), t)| t.mul(a, b))
            .collect();
        RnsPoly { residues }
    }

    /// Multiply channel i by `scalars[i]`.
    pub fn mul_scalars(&self, scalars: &[u64], basis: &[&NttTable]) -> RnsPoly {
        let residues = self
            .residues
            .iter()
            .zip(scalars)
            .zip(basis)
            .map(|((a, &k), t)| {
                let q = t.modulus();
                a.iter().map(|&x| mul_mod(x, k % q, q)).collect()
            })
            .collect();
        RnsPoly { residues }
    }

    /// Coefficient → evaluation form, channel by channel.
    pub fn forward(&self, basis: &[&NttTable]) -> RnsPoly {
        let residues = self
            .residues
            .iter()
            .zip(basis)
            .map(|(a, t)| t.forward(a))
            .collect();
        RnsPoly { residues }
    }

    pub fn inverse(&self, basis: &[&NttTable]) -> RnsPoly {
        let residues = self
            .residues
            .iter()
            .zip(basis)
            .map(|(a, t)| t.inverse(a))
            .collect();
        RnsPoly { residues }
    }

    /// X → X^galois. `galois` must be odd; X^N = -1 negates wrapped terms.
    pub fn automorphism(&self, galois: usize, basis: &[&NttTable]) -> RnsPoly {
        let n = self.degree();
        let two_n = 2 * n;
        let residues = self
            .residues
            .iter()
            .zip(basis)
            .map(|(channel, t)| {
                let q = t.modulus();
                let mut out = vec![0u64; n];
                for (j, &v) in channel.iter().enumerate() {
                    let idx = (galois * j) % two_n;
                    if idx < n {
                        out[idx] = v;
                    } else {
                        out[idx - n] = sub_mod(0, v, q);
                    }
                }
                out
            })
            .collect();
        RnsPoly { residues }
    }

    /// Keep the first `channels` residues. Dropping trailing primes of the
    /// data basis is a modulus switch to a lower level.
    pub fn truncate(&self, channels: usize) -> RnsPoly {
        RnsPoly {
            residues: self.residues[..channels.min(self.residues.len())].to_vec(),
        }
    }

    /// Divide by the last prime of `basis` with rounding and drop its
    /// channel: round(x / q_last) over the remaining primes.
    pub fn drop_last(&self, basis: &[&NttTable]) -> RnsPoly {
        let k = basis.len() - 1;
        let q_last = basis[k].modulus();
        let half = q_last / 2;
        let last = &self.residues[k];

        let residues = self.residues[..k]
            .iter()
            .zip(&basis[..k])
            .map(|(channel, t)| {
                let q = t.modulus();
                let inv = mod_inv(q_last % q, q);
                channel
                    .iter()
                    .zip(last)
                    .map(|(&x, &r)| {
                        // Centered remainder, so the quotient is rounded.
                        let r = if r > half {
                            r as i128 - q_last as i128
                        } else {
                            r as i128
                        };
                        mul_mod(sub_mod(x, reduce_signed(r, q), q), inv, q)
                    })
                    .collect()
            })
            .collect();
        RnsPoly { residues }
    }

    /// CRT-reconstruct every coefficient into (-Q/2, Q/2] and convert to
    /// f64. Q may exceed any machine integer, so the reconstruction runs in
    /// multi-limb arithmetic.
    pub fn to_centered_f64(&self, basis: &[&NttTable]) -> Vec<f64> {
        let crt = Crt::new(basis);
        (0..self.degree())
            .map(|j| {
                let column: Vec<u64> = self.residues.iter().map(|c| c[j]).collect();
                crt.centered(&column)
            })
            .collect()
    }
}

/// Garner reconstruction for one basis.
struct Crt {
    primes: Vec<u64>,
    /// inv[i][j] = q_j^-1 mod q_i, for j < i
    inv: Vec<Vec<u64>>,
    /// prefix[i] = q0·…·q_{i-1}
    prefix: Vec<Vec<u64>>,
    modulus: Vec<u64>,
    half: Vec<u64>,
}

impl Crt {
    fn new(basis: &[&NttTable]) -> Self {
        let primes: Vec<u64> = basis.iter().map(|t| t.modulus()).collect();
        let limbs = primes.len() + 1;
        let inv = primes
            .iter()
            .enumerate()
            .map(|(i, &qi)| primes[..i].iter().map(|&qj| mod_inv(qj % qi, qi)).collect())
            .collect();

        let mut prefix = Vec::with_capacity(primes.len());
        let mut acc = wide_from_u64(1, limbs);
        for &q in &primes {
            prefix.push(acc.clone());
            acc = wide_mul_u64(&acc, q);
        }
        let half = wide_shr1(&acc);
        Self {
            primes,
            inv,
            prefix,
            modulus: acc,
            half,
        }
    }

    fn centered(&self, residues: &[u64]) -> f64 {
        // Mixed-radix digits v_i < q_i.
        let mut digits = Vec::with_capacity(self.primes.len());
        for (i, &qi) in self.primes.iter().enumerate() {
            let mut u = residues[i];
            for (j, &v) in digits.iter().enumerate() {
                u = mul_mod(sub_mod(u, v % qi, qi), self.inv[i][j], qi);
            }
            digits.push(u);
        }

        let mut value = wide_from_u64(0, self.modulus.len());
        for (prefix, &v) in self.prefix.iter().zip(&digits) {
            value = wide_add(&value, &wide_mul_u64(prefix, v));
        }

        if wide_gt(&value, &self.half) {
            -wide_to_f64(&wide_sub(&self.modulus, &value))
        } else {
            wide_to_f64(&value)
        }
    }
}

fn wide_from_u64(v: u64, limbs: usize) -> Vec<u64> {
    let mut out = vec![0u64; limbs];
    out[0] = v;
    out
}

fn wide_mul_u64(a: &[u64], b: u64) -> Vec<u64> {
    let mut out = vec![0u64; a.len()];
    let mut carry = 0u128;
    for (dst, &limb) in out.iter_mut().zip(a) {
        let prod = limb as u128 * b as u128 + carry;
        *dst = prod as u64;
        carry = prod >> 64;
    }
    out
}

fn wide_add(a: &[u64], b: &[u64]) -> Vec<u64> {
    let mut out = vec![0u64; a.len()];
    let mut carry = 0u128;
    for (i, dst) in out.iter_mut().enumerate() {
        let sum = a[i] as u128 + b.get(i).copied().unwrap_or(0) as u128 + carry;
        *dst = sum as u64;
        carry = sum >> 64;
    }
    out
}

fn wide_sub(a: &[u64], b: &[u64]) -> Vec<u64> {
    let mut out = vec![0u64; a.len()];
    let mut borrow = false;
    for (i, dst) in out.iter_mut().enumerate() {
        let (d1, b1) = a[i].overflowing_sub(b.get(i).copied().unwrap_or(0));
        let (d2, b2) = d1.overflowing_sub(borrow as u64);
        *dst = d2;
        borrow = b1 || b2;
    }
    out
}

fn wide_shr1(a: &[u64]) -> Vec<u64> {
    let n = a.len();
    (0..n)
        .map(|i| {
            let high = if i + 1 < n { a[i + 1] << 63 } else { 0 };
            (a[i] >> 1) | high
        })
        .collect()
}

fn wide_gt(a: &[u64], b: &[u64]) -> bool {
    for i in (0..a.len()).rev() {
        let bv = b.get(i).copied().unwrap_or(0);
        if a[i] != bv {
            return a[i] > bv;
        }
    }
    false
}

fn wide_to_f64(a: &[u64]) -> f64 {
    a.iter()
        .rev()
        .fold(0.0, |acc, &limb| acc * 18446744073709551616.0 + limb as f64)
}
