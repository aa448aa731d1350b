//! CKKS scheme parameters.
//!
//! A parameter set fixes the ring degree N, the modulus chain and the global
//! scale Δ = 2^scale_bits. The chain lists every prime: q0..qL carry
//! ciphertexts, and the final prime P is reserved for key switching. A
//! ciphertext at level l lives modulo Q_l = q0·…·q_l.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::ntt::{find_primitive_root, mod_pow, mul_mod};
use super::CkksError;

/// Smallest accepted ring dimension.
pub const MIN_POLY_MODULUS_DEGREE: usize = 256;

/// Largest accepted ring dimension.
pub const MAX_POLY_MODULUS_DEGREE: usize = 32768;

/// Smallest prime size accepted in the modulus chain.
pub const MIN_PRIME_BITS: u32 = 14;

/// Largest prime size. Residue products must fit in u128.
pub const MAX_PRIME_BITS: u32 = 60;

/// Standard deviation for discrete Gaussian error sampling.
pub const SIGMA: f64 = 3.2;

/// Degree used by the CLI when none is given.
pub const DEFAULT_POLY_MODULUS_DEGREE: usize = 2048;

/// Chain used by the CLI when none is given: a 50-bit base prime, five
/// 30-bit primes consumed by rescales, and a 50-bit key-switching prime.
pub const DEFAULT_COEFF_MOD_BIT_SIZES: [u32; 7] = [50, 30, 30, 30, 30, 30, 50];

/// Δ = 2^30 by default, matching the rescaling primes.
pub const DEFAULT_SCALE_BITS: u32 = 30;

/// Homomorphic scheme identifier, as carried in wire headers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SchemeId {
    Ckks = 1,
}

impl SchemeId {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(SchemeId::Ckks),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Encryption parameters shared by a context and every ciphertext made under it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CkksParams {
    pub poly_modulus_degree: usize,
    /// q0..qL followed by the key-switching prime P; distinct primes ≡ 1 mod 2N.
    pub coeff_modulus: Vec<u64>,
    pub scale_bits: u32,
}

impl CkksParams {
    /// Build a parameter set, picking for each requested bit size the
    /// largest unused prime below 2^bits that is ≡ 1 mod 2N.
    pub fn new(
        poly_modulus_degree: usize,
        coeff_mod_bit_sizes: &[u32],
        scale_bits: u32,
    ) -> Result<Self, CkksError> {
        check_degree(poly_modulus_degree)?;
        if coeff_mod_bit_sizes.len() < 2 {
            return Err(CkksError::InvalidParams(
                "coefficient modulus needs at least one data prime and one special prime".into(),
            ));
        }

        let mut chain: Vec<u64> = Vec::with_capacity(coeff_mod_bit_sizes.len());
        for &bits in coeff_mod_bit_sizes {
            if !(MIN_PRIME_BITS..=MAX_PRIME_BITS).contains(&bits) {
                return Err(CkksError::InvalidParams(format!(
                    "modulus of {} bits is outside [{}, {}]",
                    bits, MIN_PRIME_BITS, MAX_PRIME_BITS
                )));
            }
            let prime = ntt_primes_below(bits, poly_modulus_degree)
                .find(|q| !chain.contains(q))
                .ok_or_else(|| {
                    CkksError::InvalidParams(format!(
                        "no unused {}-bit prime ≡ 1 mod {}",
                        bits,
                        2 * poly_modulus_degree
                    ))
                })?;
            chain.push(prime);
        }

        let params = Self {
            poly_modulus_degree,
            coeff_modulus: chain,
            scale_bits,
        };
        params.validate()?;
        Ok(params)
    }

    /// The chain the CLI uses when none is given.
    pub fn default_chain() -> Result<Self, CkksError> {
        Self::new(
            DEFAULT_POLY_MODULUS_DEGREE,
            &DEFAULT_COEFF_MOD_BIT_SIZES,
            DEFAULT_SCALE_BITS,
        )
    }

    /// Structural check, also applied to parameters decoded from the wire.
    pub fn validate(&self) -> Result<(), CkksError> {
        check_degree(self.poly_modulus_degree)?;
        if self.coeff_modulus.len() < 2 {
            return Err(CkksError::InvalidParams(
                "coefficient modulus needs at least one data prime and one special prime".into(),
            ));
        }
        for (i, &q) in self.coeff_modulus.iter().enumerate() {
            let bits = 64 - q.leading_zeros();
            if !(MIN_PRIME_BITS..=MAX_PRIME_BITS).contains(&bits)
                || !is_prime(q)
                || find_primitive_root(q, self.poly_modulus_degree).is_none()
            {
                return Err(CkksError::InvalidParams(format!(
                    "modulus q{} = {} is not an admissible NTT prime for N = {}",
                    i, q, self.poly_modulus_degree
                )));
            }
            if self.coeff_modulus[..i].contains(&q) {
                return Err(CkksError::InvalidParams(format!(
                    "modulus q{} = {} appears twice",
                    i, q
                )));
            }
        }
        let bits = |q: u64| 64 - q.leading_zeros();
        let special_bits = bits(self.special_prime());
        if let Some(widest) = self.data_primes().iter().map(|&q| bits(q)).max() {
            if special_bits < widest {
                return Err(CkksError::InvalidParams(format!(
                    "{}-bit special prime is narrower than a {}-bit data prime",
                    special_bits, widest
                )));
            }
        }
        let base_bits = bits(self.coeff_modulus[0]);
        if self.scale_bits == 0 || self.scale_bits >= base_bits {
            return Err(CkksError::InvalidParams(format!(
                "scale of 2^{} does not fit the {}-bit base prime",
                self.scale_bits, base_bits
            )));
        }
        Ok(())
    }

    pub fn degree(&self) -> usize {
        self.poly_modulus_degree
    }

    /// Number of SIMD slots, N/2.
    pub fn slot_count(&self) -> usize {
        self.poly_modulus_degree / 2
    }

    /// Top level L. Fresh ciphertexts are created here.
    pub fn max_level(&self) -> usize {
        self.coeff_modulus.len().saturating_sub(2)
    }

    /// q0..qL.
    pub fn data_primes(&self) -> &[u64] {
        &self.coeff_modulus[..self.coeff_modulus.len().saturating_sub(1)]
    }

    /// The key-switching prime P.
    pub fn special_prime(&self) -> u64 {
        self.coeff_modulus.last().copied().unwrap_or_default()
    }

    /// The prime q_level.
    pub fn prime(&self, level: usize) -> u64 {
        self.coeff_modulus[level]
    }

    /// log2(Q_level).
    pub fn modulus_bits_at(&self, level: usize) -> f64 {
        self.coeff_modulus[..=level]
            .iter()
            .map(|&q| (q as f64).log2())
            .sum()
    }

    /// Global scale Δ.
    pub fn scale(&self) -> f64 {
        (self.scale_bits as f64).exp2()
    }

    /// Fingerprint of the parameter set. Two sets are compatible iff their
    /// fingerprints agree.
    pub fn parms_id(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"heval-parms-v2");
        hasher.update([SchemeId::Ckks.as_byte()]);
        hasher.update((self.poly_modulus_degree as u64).to_le_bytes());
        hasher.update((self.coeff_modulus.len() as u64).to_le_bytes());
        for q in &self.coeff_modulus {
            hasher.update(q.to_le_bytes());
        }
        hasher.update(self.scale_bits.to_le_bytes());
        hasher.finalize().into()
    }
}

fn check_degree(n: usize) -> Result<(), CkksError> {
    if !n.is_power_of_two() || !(MIN_POLY_MODULUS_DEGREE..=MAX_POLY_MODULUS_DEGREE).contains(&n) {
        return Err(CkksError::InvalidParams(format!(
            "poly modulus degree {} must be a power of two in [{}, {}]",
            n, MIN_POLY_MODULUS_DEGREE, MAX_POLY_MODULUS_DEGREE
        )));
    }
    Ok(())
}

/// Primes q < 2^bits with q ≡ 1 mod 2N, largest first.
fn ntt_primes_below(bits: u32, degree: usize) -> impl Iterator<Item = u64> {
    let two_n = 2 * degree as u64;
    let top = ((1u64 << bits) - 1) / two_n;
    let floor = (1u64 << (bits - 1)) / two_n;
    (floor.max(1)..=top)
        .rev()
        .map(move |k| k * two_n + 1)
        .filter(|&q| is_prime(q))
}

/// Deterministic Miller-Rabin for 64-bit inputs.
pub(crate) fn is_prime(n: u64) -> bool {
    const WITNESSES: [u64; 12] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];
    if n < 2 {
        return false;
    }
    for &p in &WITNESSES {
        if n % p == 0 {
            return n == p;
        }
    }
    let mut d = n - 1;
    let mut r = 0;
    while d % 2 == 0 {
        d /= 2;
        r += 1;
    }
    'witness: for &a in &WITNESSES {
        let mut x = mod_pow(a, d, n);
        if x == 1 || x == n - 1 {
            continue;
        }
        for _ in 1..r {
            x = mul_mod(x, x, n);
            if x == n - 1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}
