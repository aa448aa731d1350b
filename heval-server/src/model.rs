//! The evaluable-model abstraction.
//!
//! A model is a pure function from an encrypted vector to an encrypted
//! vector, computed with homomorphic operations only. It receives a
//! [`PublicContext`], which by construction holds no secret key.

use heval_client::ckks::CkksError;
use heval_client::{Ciphertext, PublicContext};
use thiserror::Error;

/// Reasons a model refuses or fails an evaluation.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model expects {expected} input values, got {actual}")]
    InputShape { expected: usize, actual: usize },

    #[error("input layout {0} is not supported")]
    InputLayout(String),

    #[error("context doesn't hold relinearization keys")]
    MissingRelinKeys,

    #[error("the context doesn't hold galois keys")]
    MissingGaloisKeys,

    #[error("needs {needed} multiplicative levels, ciphertext has {available}")]
    InsufficientLevels { needed: usize, available: usize },

    #[error("{0}")]
    Capacity(String),

    /// Model parameters rejected at construction time.
    #[error("invalid model parameters: {0}")]
    InvalidParameters(String),

    #[error(transparent)]
    Ckks(#[from] CkksError),
}

/// A servable computation on encrypted vectors.
///
/// Implementations must be immutable after registration (interior caches
/// keyed on public data are fine) and must not branch on plaintext values,
/// which they cannot see anyway.
pub trait Model: Send + Sync {
    /// Number of input values the model accepts, when fixed.
    fn input_size(&self) -> Option<usize>;

    /// Number of output values, when fixed.
    fn output_size(&self) -> Option<usize>;

    /// One-line summary for listings.
    fn description(&self) -> &str {
        ""
    }

    /// Evaluate on `input` using only public material from `ctx`.
    fn evaluate(&self, input: &Ciphertext, ctx: &PublicContext) -> Result<Ciphertext, ModelError>;
}

/// Reject inputs whose public length disagrees with `expected`.
pub fn check_input_len(input: &Ciphertext, expected: usize) -> Result<(), ModelError> {
    if input.len() != expected {
        return Err(ModelError::InputShape {
            expected,
            actual: input.len(),
        });
    }
    Ok(())
}
