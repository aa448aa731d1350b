//! CKKS key generation based on Ring-LWE.
//!
//! The public key is an RLWE instance (b, a) with b = -(a·s + e) mod Q_L.
//! Evaluation keys use one special prime P: a switching key from s' to s
//! holds, for every data prime q_i, an RLWE sample under s modulo Q_L·P
//! whose body also carries P·s' in channel i. Relinearization keys switch
//! from s², Galois keys from σ_g(s).

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::encoding::galois_element;
use super::params::CkksParams;
use super::poly::{Ring, RnsPoly};
use super::sampling::{sample_gaussian, sample_ternary, sample_uniform};

/// Public encryption key over q0..qL.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    /// b = -(a·s + e)
    pub b: RnsPoly,
    /// Uniform random polynomial
    pub a: RnsPoly,
}

/// Secret decryption key. Never leaves the client.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKey {
    /// Ternary secret, reduced over q0..qL and P.
    pub s: RnsPoly,
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Key switching material: `parts[i] = (b_i, a_i)` over q0..qL, P, kept in
/// evaluation form so switching needs no transform of the key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchKey {
    pub parts: Vec<(RnsPoly, RnsPoly)>,
}

/// Relinearization keys, switching s² back to s.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelinKeys {
    pub key: SwitchKey,
}

/// Rotation keys by slot step. Steps are powers of two below the slot count.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GaloisKeys {
    pub keys: BTreeMap<usize, SwitchKey>,
}

impl GaloisKeys {
    pub fn get(&self, steps: usize) -> Option<&SwitchKey> {
        self.keys.get(&steps)
    }
}

/// Power-of-two rotation steps a full set of Galois keys covers.
pub fn rotation_steps(slots: usize) -> impl Iterator<Item = usize> {
    std::iter::successors(Some(1usize), |s| Some(s << 1)).take_while(move |&s| s < slots)
}

/// Generate a fresh key pair at the top level of `params`.
///
/// 1. s ← ternary
/// 2. a ← uniform mod Q_L
/// 3. e ← discrete Gaussian
/// 4. b = -(a·s + e)
pub fn keygen<R: Rng>(params: &CkksParams, ring: &Ring, rng: &mut R) -> (PublicKey, SecretKey) {
    let n = params.degree();
    let top = params.max_level();
    let data = ring.level(top);

    let s = RnsPoly::from_signed(&sample_ternary(n, rng), &ring.extended(top));
    let s_data = s.truncate(data.len());
    let a = sample_uniform(n, &data, rng);
    let e = RnsPoly::from_signed(&sample_gaussian(n, rng), &data);
    let b = a.mul(&s_data, &data).add(&e, &data).neg(&data);

    (PublicKey { b, a }, SecretKey { s })
}

/// Switching key from `target` (over q0..qL, P) to the secret key.
fn gen_switch_key<R: Rng>(
    params: &CkksParams,
    ring: &Ring,
    sk: &SecretKey,
    target: &RnsPoly,
    rng: &mut R,
) -> SwitchKey {
    let n = params.degree();
    let top = params.max_level();
    let basis = ring.extended(top);
    let p = params.special_prime();

    let parts = (0..=top)
        .map(|i| {
            let a = sample_uniform(n, &basis, rng);
            let e = RnsPoly::from_signed(&sample_gaussian(n, rng), &basis);
            let mut b = a.mul(&sk.s, &basis).add(&e, &basis).neg(&basis);
            // + P·target in channel i only: P·(Q/q_i)·[(Q/q_i)^-1]_{q_i}
            // is P mod q_i there and 0 in every other channel.
            let mut gadget = vec![0u64; basis.len()];
            gadget[i] = p;
            b = b.add(&target.mul_scalars(&gadget, &basis), &basis);
            (b.forward(&basis), a.forward(&basis))
        })
        .collect();
    SwitchKey { parts }
}

/// Generate relinearization keys for `sk`.
pub fn gen_relin_keys<R: Rng>(
    params: &CkksParams,
    ring: &Ring,
    sk: &SecretKey,
    rng: &mut R,
) -> RelinKeys {
    let basis = ring.extended(params.max_level());
    let s_squared = sk.s.mul(&sk.s, &basis);
    RelinKeys {
        key: gen_switch_key(params, ring, sk, &s_squared, rng),
    }
}

/// Generate rotation keys for every power-of-two step.
pub fn gen_galois_keys<R: Rng>(
    params: &CkksParams,
    ring: &Ring,
    sk: &SecretKey,
    rng: &mut R,
) -> GaloisKeys {
    let basis = ring.extended(params.max_level());
    let keys = rotation_steps(params.slot_count())
        .map(|steps| {
            let rotated = sk
                .s
                .automorphism(galois_element(steps, params.degree()), &basis);
            (steps, gen_switch_key(params, ring, sk, &rotated, rng))
        })
        .collect();
    GaloisKeys { keys }
}

/// SHA-256 fingerprint of a public key. Ciphertexts carry it so a server or
/// client can tell which key they were made under.
pub fn key_id(pk: &PublicKey) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"heval-key-id-v2");
    for channel in pk.b.residues.iter().chain(&pk.a.residues) {
        for v in channel {
            hasher.update(v.to_le_bytes());
        }
    }
    hasher.finalize().into()
}
