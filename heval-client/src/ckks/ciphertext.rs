//! CKKS ciphertexts, encryption and decryption.
//!
//! Encrypt: c0 = b·u + e1 + m, c1 = a·u + e2
//! Decrypt: m ≈ c0 + c1·s

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::encoding::{Encoder, SlotLayout};
use super::keys::{key_id, PublicKey, SecretKey};
use super::params::CkksParams;
use super::poly::{Ring, RnsPoly};
use super::sampling::{sample_gaussian, sample_ternary};
use super::CkksError;

/// An encrypted real vector.
///
/// Meaningful only together with a context whose parameters hash to
/// `parms_id`. `key_id` names the public key it was encrypted under.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ciphertext {
    pub parms_id: [u8; 32],
    pub key_id: [u8; 32],
    pub level: usize,
    pub scale: f64,
    pub layout: SlotLayout,
    pub c0: RnsPoly,
    pub c1: RnsPoly,
}

impl Ciphertext {
    /// Ring dimension implied by the ciphertext body.
    pub fn degree(&self) -> usize {
        self.c0.degree()
    }

    /// Number of encrypted values.
    pub fn len(&self) -> usize {
        self.layout.len
    }

    pub fn is_empty(&self) -> bool {
        self.layout.len == 0
    }

    /// Same ciphertext with a different public layout.
    pub fn with_layout(mut self, layout: SlotLayout) -> Self {
        self.layout = layout;
        self
    }
}

/// Encrypt a vector at the top level with scale Δ, one packed copy.
pub fn encrypt<R: Rng>(
    values: &[f64],
    pk: &PublicKey,
    params: &CkksParams,
    rng: &mut R,
) -> Result<Ciphertext, CkksError> {
    let n = params.degree();
    let slots = params.slot_count();
    if values.is_empty() || values.len() > slots {
        return Err(CkksError::Shape(format!(
            "cannot encrypt {} values into {} slots",
            values.len(),
            slots
        )));
    }
    let ring = Ring::new(params)?;
    let level = params.max_level();
    let basis = ring.level(level);
    let scale = params.scale();
    let m = Encoder::new(n).encode(values, scale, &basis)?;

    let u = RnsPoly::from_signed(&sample_ternary(n, rng), &basis);
    let e1 = RnsPoly::from_signed(&sample_gaussian(n, rng), &basis);
    let e2 = RnsPoly::from_signed(&sample_gaussian(n, rng), &basis);

    let c0 = u.mul(&pk.b, &basis).add(&e1, &basis).add(&m, &basis);
    let c1 = u.mul(&pk.a, &basis).add(&e2, &basis);

    Ok(Ciphertext {
        parms_id: params.parms_id(),
        key_id: key_id(pk),
        level,
        scale,
        layout: SlotLayout::packed(values.len(), slots),
        c0,
        c1,
    })
}

/// Decrypt and decode. Callers are responsible for matching `parms_id`
/// and `key_id` first.
pub fn decrypt(ct: &Ciphertext, sk: &SecretKey, params: &CkksParams) -> Result<Vec<f64>, CkksError> {
    if ct.level > params.max_level() {
        return Err(CkksError::LevelMismatch(ct.level, params.max_level()));
    }
    if ct.degree() != params.degree() || !ct.layout.fits(params.slot_count()) {
        return Err(CkksError::Shape(format!(
            "ciphertext of degree {} with layout {:?} under ring dimension {}",
            ct.degree(),
            ct.layout,
            params.degree()
        )));
    }
    if !ct.scale.is_finite() || ct.scale <= 0.0 {
        return Err(CkksError::ScaleMismatch(ct.scale, params.scale()));
    }
    let ring = Ring::new(params)?;
    let basis = ring.level(ct.level);
    if !ct.c0.is_reduced(&basis, params.degree()) || !ct.c1.is_reduced(&basis, params.degree()) {
        return Err(CkksError::Shape(format!(
            "ciphertext body does not match level {}",
            ct.level
        )));
    }
    let s = sk.s.truncate(basis.len());
    let m = ct.c0.add(&ct.c1.mul(&s, &basis), &basis);
    let coeffs = m.to_centered_f64(&basis);
    Ok(Encoder::new(params.degree()).decode(&coeffs, ct.scale, ct.layout.len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ckks::keys::keygen;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn setup() -> (CkksParams, PublicKey, SecretKey, StdRng) {
        let params = CkksParams::new(1024, &[50, 30, 50], 30).unwrap();
        let ring = Ring::new(&params).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let (pk, sk) = keygen(&params, &ring, &mut rng);
        (params, pk, sk, rng)
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let (params, pk, sk, mut rng) = setup();
        let values = vec![0.5, -1.25, 3.0, 0.0, 100.0];
        let ct = encrypt(&values, &pk, &params, &mut rng).unwrap();
        assert_eq!(ct.level, 1);
        assert_eq!(ct.len(), 5);
        assert_eq!(ct.layout.period, 512);
        let out = decrypt(&ct, &sk, &params).unwrap();
        for (a, b) in values.iter().zip(&out) {
            assert!((a - b).abs() < 1e-3, "{} vs {}", a, b);
        }
    }

    #[test]
    fn ciphertext_is_bound_to_params_and_key() {
        let (params, pk, _, mut rng) = setup();
        let ct = encrypt(&[1.0], &pk, &params, &mut rng).unwrap();
        assert_eq!(ct.parms_id, params.parms_id());
        assert_eq!(ct.key_id, key_id(&pk));
    }

    #[test]
    fn encryption_is_randomized() {
        let (params, pk, _, mut rng) = setup();
        let a = encrypt(&[1.0], &pk, &params, &mut rng).unwrap();
        let b = encrypt(&[1.0], &pk, &params, &mut rng).unwrap();
        assert_ne!(a.c0, b.c0);
    }

    #[test]
    fn wrong_key_decrypts_to_noise() {
        let (params, pk, _, mut rng) = setup();
        let ring = Ring::new(&params).unwrap();
        let (_, other_sk) = keygen(&params, &ring, &mut rng);
        let ct = encrypt(&[1.0, 2.0], &pk, &params, &mut rng).unwrap();
        let out = decrypt(&ct, &other_sk, &params).unwrap();
        assert!((out[0] - 1.0).abs() > 1.0 || (out[1] - 2.0).abs() > 1.0);
    }

    #[test]
    fn rejects_empty_and_oversized_inputs() {
        let (params, pk, _, mut rng) = setup();
        assert!(encrypt(&[], &pk, &params, &mut rng).is_err());
        assert!(encrypt(&vec![0.0; 513], &pk, &params, &mut rng).is_err());
    }

    #[test]
    fn truncated_body_is_refused() {
        let (params, pk, sk, mut rng) = setup();
        let mut ct = encrypt(&[1.0], &pk, &params, &mut rng).unwrap();
        ct.c1 = ct.c1.truncate(1);
        assert!(matches!(decrypt(&ct, &sk, &params), Err(CkksError::Shape(_))));
    }
}
