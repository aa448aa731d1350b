//! Encryption contexts.
//!
//! [`EncryptionContext`] is what a client generates and keeps: parameters,
//! public key, optional relinearization and rotation keys and, while
//! private, the secret key. [`PublicContext`] is its projection for anything that crosses the
//! network. It has no field that could hold a secret key, so a server-side
//! model cannot receive one.

use rand::Rng;
use thiserror::Error;

use crate::ckks::ciphertext::{self, Ciphertext};
use crate::ckks::keys::{
    self, gen_galois_keys, gen_relin_keys, keygen, GaloisKeys, PublicKey, RelinKeys, SecretKey,
};
use crate::ckks::{CkksError, CkksParams, Evaluator, Ring};

/// What to generate alongside the key pair.
#[derive(Clone, Copy, Debug)]
pub struct ContextOptions {
    /// Generate relinearization keys (needed by models that square).
    pub relin_keys: bool,
    /// Generate rotation keys (needed by models that mix slots).
    pub galois_keys: bool,
    /// Keep the secret key in the generated context.
    pub keep_secret: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            relin_keys: true,
            galois_keys: true,
            keep_secret: true,
        }
    }
}

/// Why a local decryption was refused.
#[derive(Debug, Error, PartialEq)]
pub enum DecryptionError {
    #[error("context holds no secret key")]
    NoSecretKey,

    #[error("ciphertext was produced under different encryption parameters")]
    ParamsMismatch,

    #[error("ciphertext is bound to a different public key")]
    KeyMismatch,

    #[error(transparent)]
    Ckks(#[from] CkksError),
}

/// A ciphertext that cannot be evaluated under a given public context.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Incompatibility {
    /// Scheme, degree, parameter or key binding disagreement.
    #[error("{0}")]
    SchemeMismatch(String),

    /// Ciphertext body is inconsistent with the parameters it claims.
    #[error("{0}")]
    Malformed(String),
}

/// Full client-side context.
#[derive(Clone, Debug)]
pub struct EncryptionContext {
    params: CkksParams,
    public_key: PublicKey,
    relin_keys: Option<RelinKeys>,
    galois_keys: Option<GaloisKeys>,
    secret_key: Option<SecretKey>,
}

impl EncryptionContext {
    /// Generate fresh keys for `params`.
    pub fn generate<R: Rng>(
        params: CkksParams,
        options: ContextOptions,
        rng: &mut R,
    ) -> Result<Self, CkksError> {
        let ring = Ring::new(&params)?;
        let (public_key, secret_key) = keygen(&params, &ring, rng);
        let relin_keys = options
            .relin_keys
            .then(|| gen_relin_keys(&params, &ring, &secret_key, rng));
        let galois_keys = options
            .galois_keys
            .then(|| gen_galois_keys(&params, &ring, &secret_key, rng));
        log::debug!(
            "generated context: N={}, levels={}, relin_keys={}, galois_keys={}",
            params.degree(),
            params.max_level() + 1,
            relin_keys.is_some(),
            galois_keys.is_some()
        );
        Ok(Self {
            params,
            public_key,
            relin_keys,
            galois_keys,
            secret_key: options.keep_secret.then_some(secret_key),
        })
    }

    pub(crate) fn from_parts(public: PublicContext, secret_key: Option<SecretKey>) -> Self {
        Self {
            params: public.params,
            public_key: public.public_key,
            relin_keys: public.relin_keys,
            galois_keys: public.galois_keys,
            secret_key,
        }
    }

    pub fn params(&self) -> &CkksParams {
        &self.params
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn relin_keys(&self) -> Option<&RelinKeys> {
        self.relin_keys.as_ref()
    }

    pub fn galois_keys(&self) -> Option<&GaloisKeys> {
        self.galois_keys.as_ref()
    }

    pub fn secret_key(&self) -> Option<&SecretKey> {
        self.secret_key.as_ref()
    }

    /// True while the context still holds its secret key.
    pub fn is_private(&self) -> bool {
        self.secret_key.is_some()
    }

    /// Drop the secret key in place.
    pub fn make_public(&mut self) {
        self.secret_key = None;
    }

    /// Copy of the context without the secret key.
    pub fn public_projection(&self) -> PublicContext {
        PublicContext {
            params: self.params.clone(),
            public_key: self.public_key.clone(),
            relin_keys: self.relin_keys.clone(),
            galois_keys: self.galois_keys.clone(),
        }
    }

    pub fn key_id(&self) -> [u8; 32] {
        keys::key_id(&self.public_key)
    }

    /// Encrypt a vector under the public key.
    pub fn encrypt_with<R: Rng>(&self, values: &[f64], rng: &mut R) -> Result<Ciphertext, CkksError> {
        ciphertext::encrypt(values, &self.public_key, &self.params, rng)
    }

    /// Encrypt with the thread-local RNG.
    pub fn encrypt(&self, values: &[f64]) -> Result<Ciphertext, CkksError> {
        self.encrypt_with(values, &mut rand::thread_rng())
    }

    /// Decrypt locally. Refuses ciphertexts made under other parameters or
    /// another public key.
    pub fn decrypt(&self, ct: &Ciphertext) -> Result<Vec<f64>, DecryptionError> {
        let sk = self.secret_key.as_ref().ok_or(DecryptionError::NoSecretKey)?;
        if ct.parms_id != self.params.parms_id() {
            return Err(DecryptionError::ParamsMismatch);
        }
        if ct.key_id != self.key_id() {
            return Err(DecryptionError::KeyMismatch);
        }
        Ok(ciphertext::decrypt(ct, sk, &self.params)?)
    }
}

/// Context material safe to hand to a server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicContext {
    params: CkksParams,
    public_key: PublicKey,
    relin_keys: Option<RelinKeys>,
    galois_keys: Option<GaloisKeys>,
}

impl PublicContext {
    pub(crate) fn from_parts(
        params: CkksParams,
        public_key: PublicKey,
        relin_keys: Option<RelinKeys>,
        galois_keys: Option<GaloisKeys>,
    ) -> Self {
        Self {
            params,
            public_key,
            relin_keys,
            galois_keys,
        }
    }

    pub fn params(&self) -> &CkksParams {
        &self.params
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn relin_keys(&self) -> Option<&RelinKeys> {
        self.relin_keys.as_ref()
    }

    pub fn galois_keys(&self) -> Option<&GaloisKeys> {
        self.galois_keys.as_ref()
    }

    pub fn key_id(&self) -> [u8; 32] {
        keys::key_id(&self.public_key)
    }

    /// Evaluator over this context's parameters and evaluation keys.
    pub fn evaluator(&self) -> Result<Evaluator<'_>, CkksError> {
        Evaluator::new(
            &self.params,
            self.relin_keys.as_ref(),
            self.galois_keys.as_ref(),
        )
    }

    /// Check that `ct` was made under this context and that its body is
    /// consistent with the level it claims.
    pub fn check_compatible(&self, ct: &Ciphertext) -> Result<(), Incompatibility> {
        if ct.degree() != self.params.degree() {
            return Err(Incompatibility::SchemeMismatch(format!(
                "ciphertext has degree {}, context has degree {}",
                ct.degree(),
                self.params.degree()
            )));
        }
        if ct.parms_id != self.params.parms_id() {
            return Err(Incompatibility::SchemeMismatch(
                "ciphertext was produced under different encryption parameters".into(),
            ));
        }
        if ct.level > self.params.max_level() {
            return Err(Incompatibility::SchemeMismatch(format!(
                "ciphertext level {} exceeds context maximum {}",
                ct.level,
                self.params.max_level()
            )));
        }
        if ct.key_id != self.key_id() {
            return Err(Incompatibility::SchemeMismatch(
                "ciphertext is bound to a different public key".into(),
            ));
        }
        if !ct.layout.fits(self.params.slot_count()) {
            return Err(Incompatibility::Malformed(format!(
                "layout {:?} does not fit {} slots",
                ct.layout,
                self.params.slot_count()
            )));
        }
        let ring = Ring::new(&self.params)
            .map_err(|e| Incompatibility::SchemeMismatch(e.to_string()))?;
        let basis = ring.level(ct.level);
        let n = self.params.degree();
        if !ct.c0.is_reduced(&basis, n) || !ct.c1.is_reduced(&basis, n) {
            return Err(Incompatibility::Malformed(format!(
                "residues out of range for level {}",
                ct.level
            )));
        }
        Ok(())
    }
}
