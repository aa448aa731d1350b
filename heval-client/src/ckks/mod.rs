//! # CKKS backend
//!
//! Leveled Cheon-Kim-Kim-Song encryption over Z_Q[X]/(X^N + 1) with SIMD
//! slot encoding: a vector of up to N/2 reals is packed into one plaintext
//! and every ring operation acts slot-wise.
//!
//! Polynomials are kept in residue number system form over NTT-friendly
//! primes, so products are NTT based and rescaling drops one residue
//! channel. Relinearization and rotations switch keys through one special
//! prime P that never carries ciphertext data.
//!
//! ## Levels
//!
//! A fresh ciphertext sits at the top level L with scale Δ. `rescale`
//! divides by the last prime q_L and drops to L-1; `mod_drop_to` lowers the
//! level without touching the scale.
//!
//! ## Security
//!
//! Parameters are chosen for fast tests and demos, not for a lattice
//! security level.

pub mod ciphertext;
pub mod encoding;
pub mod evaluator;
pub mod keys;
pub mod ntt;
pub mod params;
pub mod poly;
pub mod sampling;

pub use ciphertext::Ciphertext;
pub use encoding::{Encoder, Plaintext, SlotLayout};
pub use evaluator::Evaluator;
pub use keys::{key_id, GaloisKeys, PublicKey, RelinKeys, SecretKey, SwitchKey};
pub use params::{CkksParams, SchemeId};
pub use poly::{Ring, RnsPoly};

use thiserror::Error;

/// Errors raised by the CKKS primitives.
#[derive(Debug, Error, PartialEq)]
pub enum CkksError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("value out of range: {0}")]
    ValueOutOfRange(String),

    #[error("ciphertext is at level 0 and cannot be rescaled")]
    LevelExhausted,

    #[error("level mismatch: {0} vs {1}")]
    LevelMismatch(usize, usize),

    #[error("scale mismatch: {0} vs {1}")]
    ScaleMismatch(f64, f64),

    #[error("shape error: {0}")]
    Shape(String),

    #[error("relinearization keys are not available")]
    MissingRelinKeys,

    #[error("rotation keys are not available")]
    MissingGaloisKeys,

    #[error("operand was produced under different encryption parameters")]
    ParamsMismatch,
}
