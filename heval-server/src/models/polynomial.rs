//! Quadratic polynomial `y = c2·x² + c1·x + c0`, slot-wise on an encrypted
//! vector of any length.
//!
//! Evaluated as `x·(c2·x + c1) + c0`: one plaintext multiplication and a
//! rescale, then one ciphertext multiplication with relinearization and a
//! second rescale. Constants are tiled over the occupied slots only, so the
//! input layout carries over unchanged.

use heval_client::{Ciphertext, PublicContext};
use serde::{Deserialize, Serialize};

use crate::model::{Model, ModelError};

pub const DESCRIPTION: &str = "Quadratic polynomial c2·x² + c1·x + c0 applied to every encrypted value; \
needs relinearization keys";

/// Levels one evaluation consumes.
pub const DEPTH: usize = 2;

/// Parameter file contents: coefficients in increasing degree, at most three.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolynomialParams {
    pub coefficients: Vec<f64>,
}

pub struct Polynomial {
    c0: f64,
    c1: f64,
    c2: f64,
}

impl Polynomial {
    pub fn new(params: PolynomialParams) -> Result<Self, ModelError> {
        let coeffs = params.coefficients;
        if coeffs.is_empty() || coeffs.len() > 3 {
            return Err(ModelError::InvalidParameters(format!(
                "expected 1 to 3 coefficients, got {}",
                coeffs.len()
            )));
        }
        if !coeffs.iter().all(|c| c.is_finite()) {
            return Err(ModelError::InvalidParameters(
                "coefficients must be finite".into(),
            ));
        }
        let get = |i: usize| coeffs.get(i).copied().unwrap_or(0.0);
        Ok(Self {
            c0: get(0),
            c1: get(1),
            c2: get(2),
        })
    }

    pub fn apply_plain(&self, x: f64) -> f64 {
        self.c2 * x * x + self.c1 * x + self.c0
    }
}

impl Model for Polynomial {
    fn description(&self) -> &str {
        DESCRIPTION
    }

    fn input_size(&self) -> Option<usize> {
        None
    }

    fn output_size(&self) -> Option<usize> {
        None
    }

    fn evaluate(&self, input: &Ciphertext, ctx: &PublicContext) -> Result<Ciphertext, ModelError> {
        if ctx.relin_keys().is_none() {
            return Err(ModelError::MissingRelinKeys);
        }
        if input.level < DEPTH {
            return Err(ModelError::InsufficientLevels {
                needed: DEPTH,
                available: input.level,
            });
        }

        let ev = ctx.evaluator()?;
        let level = input.level;
        let layout = input.layout;
        let tiled = |c: f64, scale: f64, level: usize| {
            ev.encode_tiled(&vec![c; layout.len], layout.period, scale, level)
        };
        let q = ev.params().prime(level) as f64;

        // v = c2·x + c1 at the input scale, one level down
        let v = ev.rescale(&ev.mul_plain(input, &tiled(self.c2, q, level)?)?)?;
        let v = ev.add_plain(&v, &tiled(self.c1, v.scale, v.level)?)?;

        let x = ev.mod_drop_to(input, v.level)?;
        let y = ev.rescale(&ev.multiply(&x, &v)?)?;
        Ok(ev.add_plain(&y, &tiled(self.c0, y.scale, y.level)?)?)
    }
}
