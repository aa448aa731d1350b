//! Homomorphic operations on CKKS ciphertexts.
//!
//! | Operation    | Result scale     | Result level |
//! |--------------|------------------|--------------|
//! | `add`        | unchanged        | unchanged    |
//! | `add_plain`  | unchanged        | unchanged    |
//! | `mul_plain`  | ct · pt          | unchanged    |
//! | `multiply`   | ct · ct          | unchanged    |
//! | `rotate`     | unchanged        | unchanged    |
//! | `rescale`    | scale / q_level  | level - 1    |
//! | `mod_drop_to`| unchanged        | target       |
//!
//! Every product is slot-wise. Operations keep the operand's layout; when
//! an operation moves values, the caller relabels the result.

use super::ciphertext::Ciphertext;
use super::encoding::{galois_element, Encoder, Plaintext, SlotLayout};
use super::keys::{rotation_steps, GaloisKeys, RelinKeys, SwitchKey};
use super::ntt::{reduce_signed, NttTable};
use super::params::CkksParams;
use super::poly::{Ring, RnsPoly};
use super::CkksError;

/// Relative tolerance when comparing scales of two operands.
const SCALE_TOLERANCE: f64 = 1e-9;

/// Evaluator bound to a parameter set and, optionally, the evaluation keys
/// of a context.
pub struct Evaluator<'a> {
    params: &'a CkksParams,
    ring: Ring,
    encoder: Encoder,
    relin_keys: Option<&'a RelinKeys>,
    galois_keys: Option<&'a GaloisKeys>,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        params: &'a CkksParams,
        relin_keys: Option<&'a RelinKeys>,
        galois_keys: Option<&'a GaloisKeys>,
    ) -> Result<Self, CkksError> {
        Ok(Self {
            params,
            ring: Ring::new(params)?,
            encoder: Encoder::new(params.degree()),
            relin_keys,
            galois_keys,
        })
    }

    pub fn params(&self) -> &CkksParams {
        self.params
    }

    pub fn slots(&self) -> usize {
        self.params.slot_count()
    }

    pub fn has_relin_keys(&self) -> bool {
        self.relin_keys.is_some()
    }

    pub fn has_galois_keys(&self) -> bool {
        self.galois_keys.is_some()
    }

    /// Encode `values` into the leading slots at `level`.
    pub fn encode(&self, values: &[f64], scale: f64, level: usize) -> Result<Plaintext, CkksError> {
        if level > self.params.max_level() {
            return Err(CkksError::LevelMismatch(level, self.params.max_level()));
        }
        let poly = self.encoder.encode(values, scale, &self.ring.level(level))?;
        Ok(Plaintext { poly, scale, level })
    }

    /// Encode `values` repeated every `period` slots, zero in between. Under
    /// `mul_plain` and `add_plain` this acts on every copy of a replicated
    /// vector at once.
    pub fn encode_tiled(
        &self,
        values: &[f64],
        period: usize,
        scale: f64,
        level: usize,
    ) -> Result<Plaintext, CkksError> {
        let slots = self.slots();
        if values.is_empty()
            || !period.is_power_of_two()
            || values.len() > period
            || period > slots
        {
            return Err(CkksError::Shape(format!(
                "cannot tile {} values with period {} over {} slots",
                values.len(),
                period,
                slots
            )));
        }
        let mut tiled = vec![0.0; slots];
        for block in tiled.chunks_mut(period) {
            block[..values.len()].copy_from_slice(values);
        }
        self.encode(&tiled, scale, level)
    }

    fn check(&self, ct: &Ciphertext) -> Result<Vec<&NttTable>, CkksError> {
        if ct.parms_id != self.params.parms_id() {
            return Err(CkksError::ParamsMismatch);
        }
        if ct.level > self.params.max_level() {
            return Err(CkksError::LevelMismatch(ct.level, self.params.max_level()));
        }
        let basis = self.ring.level(ct.level);
        let n = self.params.degree();
        if !ct.c0.is_reduced(&basis, n) || !ct.c1.is_reduced(&basis, n) {
            return Err(CkksError::Shape(format!(
                "ciphertext body does not match level {}",
                ct.level
            )));
        }
        Ok(basis)
    }

    fn check_plain(&self, ct: &Ciphertext, pt: &Plaintext) -> Result<Vec<&NttTable>, CkksError> {
        let basis = self.check(ct)?;
        if pt.level != ct.level {
            return Err(CkksError::LevelMismatch(ct.level, pt.level));
        }
        if !pt.poly.is_reduced(&basis, self.params.degree()) {
            return Err(CkksError::Shape("plaintext does not match the ciphertext level".into()));
        }
        Ok(basis)
    }

    fn check_pair(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Vec<&NttTable>, CkksError> {
        let basis = self.check(a)?;
        self.check(b)?;
        if a.level != b.level {
            return Err(CkksError::LevelMismatch(a.level, b.level));
        }
        if a.layout != b.layout {
            return Err(CkksError::Shape(format!(
                "layouts differ: {:?} vs {:?}",
                a.layout, b.layout
            )));
        }
        if a.key_id != b.key_id {
            return Err(CkksError::ParamsMismatch);
        }
        Ok(basis)
    }

    fn check_scales(a: f64, b: f64) -> Result<(), CkksError> {
        if (a - b).abs() > SCALE_TOLERANCE * a.abs().max(b.abs()) {
            return Err(CkksError::ScaleMismatch(a, b));
        }
        Ok(())
    }

    /// ct + ct. Operands must agree on level, scale and layout.
    pub fn add(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, CkksError> {
        let basis = self.check_pair(a, b)?;
        Self::check_scales(a.scale, b.scale)?;
        Ok(Ciphertext {
            c0: a.c0.add(&b.c0, &basis),
            c1: a.c1.add(&b.c1, &basis),
            ..a.clone()
        })
    }

    /// ct + pt. The plaintext scale must equal the ciphertext scale.
    pub fn add_plain(&self, ct: &Ciphertext, pt: &Plaintext) -> Result<Ciphertext, CkksError> {
        let basis = self.check_plain(ct, pt)?;
        Self::check_scales(ct.scale, pt.scale)?;
        Ok(Ciphertext {
            c0: ct.c0.add(&pt.poly, &basis),
            ..ct.clone()
        })
    }

    /// Slot-wise ct · pt. Scales multiply.
    pub fn mul_plain(&self, ct: &Ciphertext, pt: &Plaintext) -> Result<Ciphertext, CkksError> {
        let basis = self.check_plain(ct, pt)?;
        Ok(Ciphertext {
            c0: ct.c0.mul(&pt.poly, &basis),
            c1: ct.c1.mul(&pt.poly, &basis),
            scale: ct.scale * pt.scale,
            ..ct.clone()
        })
    }

    /// Slot-wise ct · ct followed by relinearization.
    pub fn multiply(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, CkksError> {
        let basis = self.check_pair(a, b)?;
        let rk = self.relin_keys.ok_or(CkksError::MissingRelinKeys)?;

        // (a0 + a1·s)(b0 + b1·s) = d0 + d1·s + d2·s²
        let d0 = a.c0.mul(&b.c0, &basis);
        let d1 = a.c0.mul(&b.c1, &basis).add(&a.c1.mul(&b.c0, &basis), &basis);
        let d2 = a.c1.mul(&b.c1, &basis);
        let (k0, k1) = self.key_switch(&d2, a.level, &rk.key)?;

        Ok(Ciphertext {
            c0: d0.add(&k0, &basis),
            c1: d1.add(&k1, &basis),
            scale: a.scale * b.scale,
            ..a.clone()
        })
    }

    pub fn square(&self, ct: &Ciphertext) -> Result<Ciphertext, CkksError> {
        self.multiply(ct, ct)
    }

    /// Rotate slots left by `steps`, using one power-of-two key per set bit.
    pub fn rotate(&self, ct: &Ciphertext, steps: usize) -> Result<Ciphertext, CkksError> {
        let basis = self.check(ct)?;
        let steps = steps % self.slots();
        if steps == 0 {
            return Ok(ct.clone());
        }
        let gk = self.galois_keys.ok_or(CkksError::MissingGaloisKeys)?;
        let mut out = ct.clone();
        for bit in rotation_steps(self.slots()).filter(|b| steps & b != 0) {
            let key = gk.get(bit).ok_or(CkksError::MissingGaloisKeys)?;
            let g = galois_element(bit, self.params.degree());
            let c0 = out.c0.automorphism(g, &basis);
            let c1 = out.c1.automorphism(g, &basis);
            let (k0, k1) = self.key_switch(&c1, out.level, key)?;
            out = Ciphertext {
                c0: c0.add(&k0, &basis),
                c1: k1,
                ..out
            };
        }
        Ok(out)
    }

    /// Copy a vector every `period` slots. The input's copies must sit at a
    /// multiple of `period`, with `len <= period`.
    pub fn replicate(&self, ct: &Ciphertext, period: usize) -> Result<Ciphertext, CkksError> {
        let layout = ct.layout;
        if !period.is_power_of_two() || layout.len > period || period > layout.period {
            return Err(CkksError::Shape(format!(
                "cannot replicate {:?} at period {}",
                layout, period
            )));
        }
        let mut out = ct.clone();
        let mut current = layout.period;
        while current > period {
            current /= 2;
            let shifted = self.rotate(&out, current)?;
            out = self.add(&out, &shifted)?;
        }
        Ok(out.with_layout(SlotLayout {
            len: layout.len,
            period,
        }))
    }

    /// Turn c·s' into an encryption under s, where `key` switches from s'.
    ///
    /// Each residue channel of `c` is a digit: lifted to the basis extended
    /// by P, multiplied with its key part and summed, then divided by P.
    fn key_switch(
        &self,
        c: &RnsPoly,
        level: usize,
        key: &SwitchKey,
    ) -> Result<(RnsPoly, RnsPoly), CkksError> {
        let ext = self.ring.extended(level);
        let key_channels = self.params.coeff_modulus.len();
        let n = self.params.degree();
        if key.parts.len() <= level
            || key.parts.iter().any(|(b, a)| b.channels() != key_channels || a.channels() != key_channels)
        {
            return Err(CkksError::Shape("switching key does not match the parameters".into()));
        }

        let mut acc0 = vec![vec![0u64; n]; ext.len()];
        let mut acc1 = vec![vec![0u64; n]; ext.len()];
        for (i, (kb, ka)) in key.parts.iter().enumerate().take(level + 1) {
            let qi = ext[i].modulus();
            let digit: Vec<i128> = c.residues[i]
                .iter()
                .map(|&v| if v > qi / 2 { v as i128 - qi as i128 } else { v as i128 })
                .collect();
            for (j, t) in ext.iter().enumerate() {
                // The last channel of the extended basis is P, which is the
                // last channel of the key.
                let kc = if j <= level { j } else { key_channels - 1 };
                let q = t.modulus();
                let lifted: Vec<u64> = digit.iter().map(|&x| reduce_signed(x, q)).collect();
                let d = t.forward(&lifted);
                t.mul_acc(&mut acc0[j], &d, &kb.residues[kc]);
                t.mul_acc(&mut acc1[j], &d, &ka.residues[kc]);
            }
        }

        let back = |acc: Vec<Vec<u64>>| RnsPoly {
            residues: acc
                .iter()
                .zip(&ext)
                .map(|(channel, t)| t.inverse(channel))
                .collect(),
        };
        Ok((back(acc0).drop_last(&ext), back(acc1).drop_last(&ext)))
    }

    /// Divide by the last prime of the current level and drop one level.
    pub fn rescale(&self, ct: &Ciphertext) -> Result<Ciphertext, CkksError> {
        let basis = self.check(ct)?;
        if ct.level == 0 {
            return Err(CkksError::LevelExhausted);
        }
        let divisor = self.params.prime(ct.level);
        Ok(Ciphertext {
            c0: ct.c0.drop_last(&basis),
            c1: ct.c1.drop_last(&basis),
            level: ct.level - 1,
            scale: ct.scale / divisor as f64,
            ..ct.clone()
        })
    }

    /// Lower the level without changing the scale.
    pub fn mod_drop_to(&self, ct: &Ciphertext, level: usize) -> Result<Ciphertext, CkksError> {
        self.check(ct)?;
        if level > ct.level {
            return Err(CkksError::LevelMismatch(ct.level, level));
        }
        Ok(Ciphertext {
            c0: ct.c0.truncate(level + 1),
            c1: ct.c1.truncate(level + 1),
            level,
            ..ct.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ckks::ciphertext::{decrypt, encrypt};
    use crate::ckks::keys::{gen_galois_keys, gen_relin_keys, keygen, PublicKey, SecretKey};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct Fixture {
        params: CkksParams,
        pk: PublicKey,
        sk: SecretKey,
        rk: RelinKeys,
        gk: GaloisKeys,
        rng: StdRng,
    }

    fn fixture() -> Fixture {
        let params = CkksParams::new(256, &[50, 30, 30, 50], 30).unwrap();
        let ring = Ring::new(&params).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let (pk, sk) = keygen(&params, &ring, &mut rng);
        let rk = gen_relin_keys(&params, &ring, &sk, &mut rng);
        let gk = gen_galois_keys(&params, &ring, &sk, &mut rng);
        Fixture {
            params,
            pk,
            sk,
            rk,
            gk,
            rng,
        }
    }

    impl Fixture {
        fn encrypt(&mut self, values: &[f64]) -> Ciphertext {
            encrypt(values, &self.pk, &self.params, &mut self.rng).unwrap()
        }

        fn decrypt(&self, ct: &Ciphertext) -> Vec<f64> {
            decrypt(ct, &self.sk, &self.params).unwrap()
        }

        fn evaluator(&self) -> Evaluator<'_> {
            Evaluator::new(&self.params, Some(&self.rk), Some(&self.gk)).unwrap()
        }
    }

    fn assert_close(actual: &[f64], expected: &[f64], tol: f64) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < tol, "got {}, expected {}", a, e);
        }
    }

    #[test]
    fn add_two_ciphertexts() {
        let mut f = fixture();
        let a = f.encrypt(&[1.0, 2.0]);
        let b = f.encrypt(&[0.5, -4.0]);
        let sum = f.evaluator().add(&a, &b).unwrap();
        assert_close(&f.decrypt(&sum), &[1.5, -2.0], 1e-3);
    }

    #[test]
    fn add_plain_at_matching_scale() {
        let mut f = fixture();
        let ct = f.encrypt(&[1.0, 2.0, 3.0]);
        let ev = f.evaluator();
        let pt = ev.encode(&[10.0, 20.0, 30.0], ct.scale, ct.level).unwrap();
        let out = ev.add_plain(&ct, &pt).unwrap();
        assert_close(&f.decrypt(&out), &[11.0, 22.0, 33.0], 1e-3);
    }

    #[test]
    fn add_plain_rejects_scale_mismatch() {
        let mut f = fixture();
        let ct = f.encrypt(&[1.0]);
        let ev = f.evaluator();
        let pt = ev.encode(&[1.0], ct.scale * 2.0, ct.level).unwrap();
        assert!(matches!(ev.add_plain(&ct, &pt), Err(CkksError::ScaleMismatch(..))));
    }

    #[test]
    fn mul_plain_is_slot_wise() {
        let mut f = fixture();
        let ct = f.encrypt(&[1.0, -2.0, 0.5]);
        let ev = f.evaluator();
        let q_top = f.params.prime(ct.level) as f64;
        let pt = ev.encode(&[3.0, 0.5, -4.0], q_top, ct.level).unwrap();
        let rescaled = ev.rescale(&ev.mul_plain(&ct, &pt).unwrap()).unwrap();
        assert_eq!(rescaled.level, 1);
        assert!((rescaled.scale - f.params.scale()).abs() < 1e-6);
        assert_close(&f.decrypt(&rescaled), &[3.0, -1.0, -2.0], 1e-3);
    }

    #[test]
    fn multiply_with_relinearization() {
        let mut f = fixture();
        let a = f.encrypt(&[1.5, 2.0, -1.0]);
        let b = f.encrypt(&[-2.0, 0.25, 3.0]);
        let ev = f.evaluator();
        let product = ev.multiply(&a, &b).unwrap();
        assert_eq!(product.scale, f.params.scale() * f.params.scale());
        let rescaled = ev.rescale(&product).unwrap();
        assert_close(&f.decrypt(&rescaled), &[-3.0, 0.5, -3.0], 1e-3);
    }

    #[test]
    fn square_then_square_again() {
        let mut f = fixture();
        let ct = f.encrypt(&[1.5, -0.5]);
        let ev = f.evaluator();
        let once = ev.rescale(&ev.square(&ct).unwrap()).unwrap();
        let twice = ev.rescale(&ev.square(&once).unwrap()).unwrap();
        assert_eq!(twice.level, 0);
        assert_close(&f.decrypt(&twice), &[5.0625, 0.0625], 1e-2);
    }

    #[test]
    fn multiply_without_relin_keys_fails() {
        let mut f = fixture();
        let a = f.encrypt(&[1.0]);
        let ev = Evaluator::new(&f.params, None, None).unwrap();
        assert_eq!(ev.multiply(&a, &a), Err(CkksError::MissingRelinKeys));
    }

    #[test]
    fn multiply_rejects_differing_layouts() {
        let mut f = fixture();
        let a = f.encrypt(&[1.0, 2.0]);
        let b = f.encrypt(&[1.0]);
        assert!(matches!(f.evaluator().multiply(&a, &b), Err(CkksError::Shape(_))));
    }

    #[test]
    fn rotate_left_by_composite_step() {
        let mut f = fixture();
        let values: Vec<f64> = (0..128).map(|i| i as f64 / 16.0).collect();
        let ct = f.encrypt(&values);
        let rotated = f.evaluator().rotate(&ct, 5).unwrap();
        let expected: Vec<f64> = (0..128).map(|i| ((i + 5) % 128) as f64 / 16.0).collect();
        assert_close(&f.decrypt(&rotated), &expected, 1e-3);
    }

    #[test]
    fn rotate_without_galois_keys_fails() {
        let mut f = fixture();
        let ct = f.encrypt(&[1.0, 2.0]);
        let ev = Evaluator::new(&f.params, Some(&f.rk), None).unwrap();
        assert_eq!(ev.rotate(&ct, 1), Err(CkksError::MissingGaloisKeys));
        // A zero rotation needs no key.
        assert_eq!(ev.rotate(&ct, 128).unwrap(), ct);
    }

    #[test]
    fn replicate_fills_every_period() {
        let mut f = fixture();
        let ct = f.encrypt(&[1.0, 2.0, 3.0]);
        let replicated = f.evaluator().replicate(&ct, 4).unwrap();
        assert_eq!(replicated.layout, SlotLayout { len: 3, period: 4 });

        let all = replicated.with_layout(SlotLayout::packed(128, 128));
        let expected: Vec<f64> = (0..128)
            .map(|i| [1.0, 2.0, 3.0, 0.0][i % 4])
            .collect();
        assert_close(&f.decrypt(&all), &expected, 1e-3);
    }

    #[test]
    fn replicate_rejects_short_periods() {
        let mut f = fixture();
        let ct = f.encrypt(&[1.0, 2.0, 3.0]);
        assert!(matches!(f.evaluator().replicate(&ct, 2), Err(CkksError::Shape(_))));
        assert!(matches!(f.evaluator().replicate(&ct, 6), Err(CkksError::Shape(_))));
    }

    #[test]
    fn encode_tiled_repeats_values() {
        let mut f = fixture();
        let ct = f.encrypt(&[1.0; 8]);
        let ev = f.evaluator();
        let pt = ev.encode_tiled(&[2.0, 3.0], 4, ct.scale, ct.level).unwrap();
        let out = ev.add_plain(&ct, &pt).unwrap();
        assert_close(&f.decrypt(&out), &[3.0, 4.0, 1.0, 1.0, 3.0, 4.0, 1.0, 1.0], 1e-3);
        assert!(ev.encode_tiled(&[1.0; 5], 4, ct.scale, ct.level).is_err());
    }

    #[test]
    fn rescale_at_level_zero_is_exhausted() {
        let mut f = fixture();
        let ct = f.encrypt(&[1.0]);
        let ev = f.evaluator();
        let low = ev.mod_drop_to(&ct, 0).unwrap();
        assert_eq!(ev.rescale(&low), Err(CkksError::LevelExhausted));
        assert_close(&f.decrypt(&low), &[1.0], 1e-3);
    }

    #[test]
    fn foreign_parameters_are_rejected() {
        let mut f = fixture();
        let other = CkksParams::new(256, &[50, 30, 30, 50], 29).unwrap();
        let ev = Evaluator::new(&other, None, None).unwrap();
        let ct = f.encrypt(&[1.0]);
        assert_eq!(ev.rescale(&ct), Err(CkksError::ParamsMismatch));
    }
}
