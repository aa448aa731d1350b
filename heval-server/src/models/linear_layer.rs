//! Linear layer computing `y = x·W + b` on an encrypted vector.
//!
//! Uses the diagonal method over a square block of `p` slots, `p` the next
//! power of two above both dimensions. The input is replicated with period
//! `p`, so a left rotation by `k` brings `x[(j+k) mod p]` to slot `j` of
//! every block, and
//!
//! ```text
//! y[j] = Σ_k diag_k[j] · rot_k(x)[j],   diag_k[j] = W[(j+k) mod p][j]
//! ```
//!
//! with out-of-range weights read as zero. All-zero diagonals are skipped.
//! Every diagonal is encoded at the scale of the prime the product is
//! rescaled by, so the output keeps the input scale one level down.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use heval_client::ckks::{CkksError, Evaluator, Plaintext, SlotLayout};
use heval_client::{Ciphertext, PublicContext};
use serde::{Deserialize, Serialize};

use crate::model::{check_input_len, Model, ModelError};

pub const DESCRIPTION: &str = "Linear layer computing out = x·weight + bias; \
input and output sizes follow the weight matrix; needs galois keys";

/// Parameter sets whose encodings are kept before the cache is reset.
const MAX_CACHED_PARAMS: usize = 8;

/// Parameter file contents: `weight` is `[inputs][outputs]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinearLayerParams {
    pub weight: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
}

struct Diagonal {
    /// Rotation the diagonal multiplies.
    offset: usize,
    plain: Plaintext,
}

/// Diagonal encodings for one parameter set, filled in per level on first
/// use. They depend on the ring, the level and the weights only.
struct ParamsEncodings {
    levels: Vec<OnceLock<Vec<Diagonal>>>,
}

impl ParamsEncodings {
    fn new(max_level: usize) -> Self {
        Self {
            levels: (0..=max_level).map(|_| OnceLock::new()).collect(),
        }
    }

    #[cfg(test)]
    fn filled_levels(&self) -> usize {
        self.levels.iter().filter(|l| l.get().is_some()).count()
    }
}

pub struct LinearLayer {
    weight: Vec<Vec<f64>>,
    bias: Vec<f64>,
    encodings: RwLock<HashMap<[u8; 32], Arc<ParamsEncodings>>>,
}

impl LinearLayer {
    pub fn new(params: LinearLayerParams) -> Result<Self, ModelError> {
        let LinearLayerParams { weight, bias } = params;
        let outputs = bias.len();
        if weight.is_empty() || outputs == 0 {
            return Err(ModelError::InvalidParameters(
                "weight and bias must be non-empty".into(),
            ));
        }
        if let Some(row) = weight.iter().position(|r| r.len() != outputs) {
            return Err(ModelError::InvalidParameters(format!(
                "weight row {} has {} columns, bias has {} entries",
                row,
                weight[row].len(),
                outputs
            )));
        }
        if !weight.iter().flatten().chain(&bias).all(|v| v.is_finite()) {
            return Err(ModelError::InvalidParameters(
                "parameters must be finite".into(),
            ));
        }
        Ok(Self {
            weight,
            bias,
            encodings: RwLock::new(HashMap::new()),
        })
    }

    pub fn inputs(&self) -> usize {
        self.weight.len()
    }

    pub fn outputs(&self) -> usize {
        self.bias.len()
    }

    /// Block size of the diagonal method.
    pub fn period(&self) -> usize {
        self.inputs().max(self.outputs()).next_power_of_two()
    }

    /// Levels consumed on an input with the given layout.
    pub fn depth(&self, layout: SlotLayout) -> usize {
        if layout.period < self.period() {
            2
        } else {
            1
        }
    }

    /// Plaintext reference result, for tests and demos.
    pub fn apply_plain(&self, x: &[f64]) -> Vec<f64> {
        (0..self.outputs())
            .map(|j| {
                x.iter()
                    .zip(&self.weight)
                    .map(|(xi, row)| xi * row[j])
                    .sum::<f64>()
                    + self.bias[j]
            })
            .collect()
    }

    /// Evaluate with an evaluator the caller already holds.
    pub fn apply(&self, ev: &Evaluator<'_>, input: &Ciphertext) -> Result<Ciphertext, ModelError> {
        check_input_len(input, self.inputs())?;
        let p = self.period();
        if p > ev.slots() {
            return Err(ModelError::Capacity(format!(
                "{}x{} weights need blocks of {} slots, the ring has {}",
                self.inputs(),
                self.outputs(),
                p,
                ev.slots()
            )));
        }
        if !ev.has_galois_keys() {
            return Err(ModelError::MissingGaloisKeys);
        }
        let needed = self.depth(input.layout);
        if input.level < needed {
            return Err(ModelError::InsufficientLevels {
                needed,
                available: input.level,
            });
        }

        let x = self.spread(ev, input)?;
        let encodings = self.encodings_for(ev);
        let diagonals = self.diagonals_at(&encodings, ev, x.level)?;

        let mut rotated = x;
        let mut at = 0;
        let mut acc: Option<Ciphertext> = None;
        for d in diagonals {
            if d.offset != at {
                rotated = ev.rotate(&rotated, d.offset - at)?;
                at = d.offset;
            }
            let term = ev.mul_plain(&rotated, &d.plain)?;
            acc = Some(match acc {
                Some(sum) => ev.add(&sum, &term)?,
                None => term,
            });
        }
        let acc = acc.ok_or_else(|| ModelError::InvalidParameters("no diagonals encoded".into()))?;

        let out = ev.rescale(&acc)?;
        let bias = ev.encode_tiled(&self.bias, p, out.scale, out.level)?;
        Ok(ev
            .add_plain(&out, &bias)?
            .with_layout(SlotLayout {
                len: self.outputs(),
                period: p,
            }))
    }

    /// Bring the input to one copy every `p` slots. Copies already closer
    /// than that would overlap, so all but the first are masked away.
    fn spread(&self, ev: &Evaluator<'_>, input: &Ciphertext) -> Result<Ciphertext, ModelError> {
        let p = self.period();
        let layout = input.layout;
        if layout.period >= p {
            return Ok(ev.replicate(input, p)?);
        }
        let level = input.level;
        let mask = ev.encode(&vec![1.0; layout.len], ev.params().prime(level) as f64, level)?;
        let single = ev
            .rescale(&ev.mul_plain(input, &mask)?)?
            .with_layout(SlotLayout::packed(layout.len, ev.slots()));
        Ok(ev.replicate(&single, p)?)
    }

    fn encodings_for(&self, ev: &Evaluator<'_>) -> Arc<ParamsEncodings> {
        let parms_id = ev.params().parms_id();
        if let Some(hit) = self
            .encodings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&parms_id)
        {
            return Arc::clone(hit);
        }
        let mut cache = self.encodings.write().unwrap_or_else(PoisonError::into_inner);
        if !cache.contains_key(&parms_id) && cache.len() >= MAX_CACHED_PARAMS {
            cache.clear();
        }
        Arc::clone(
            cache
                .entry(parms_id)
                .or_insert_with(|| Arc::new(ParamsEncodings::new(ev.params().max_level()))),
        )
    }

    fn diagonals_at<'e>(
        &self,
        encodings: &'e ParamsEncodings,
        ev: &Evaluator<'_>,
        level: usize,
    ) -> Result<&'e [Diagonal], ModelError> {
        let cell = encodings
            .levels
            .get(level)
            .ok_or(CkksError::LevelMismatch(level, ev.params().max_level()))?;
        if let Some(diagonals) = cell.get() {
            return Ok(diagonals);
        }
        let built = self.encode_diagonals(ev, level)?;
        Ok(cell.get_or_init(|| built))
    }

    fn encode_diagonals(&self, ev: &Evaluator<'_>, level: usize) -> Result<Vec<Diagonal>, ModelError> {
        let p = self.period();
        let scale = ev.params().prime(level) as f64;
        let mut diagonals = Vec::new();
        for k in 0..p {
            let diag: Vec<f64> = (0..p)
                .map(|j| {
                    self.weight
                        .get((j + k) % p)
                        .and_then(|row| row.get(j))
                        .copied()
                        .unwrap_or(0.0)
                })
                .collect();
            // The main diagonal stays even when zero so there is always a term.
            if k > 0 && diag.iter().all(|&w| w == 0.0) {
                continue;
            }
            diagonals.push(Diagonal {
                offset: k,
                plain: ev.encode_tiled(&diag, p, scale, level)?,
            });
        }
        log::debug!(
            "encoded {} of {} diagonals at level {}",
            diagonals.len(),
            p,
            level
        );
        Ok(diagonals)
    }
}

impl Model for LinearLayer {
    fn description(&self) -> &str {
        DESCRIPTION
    }

    fn input_size(&self) -> Option<usize> {
        Some(self.inputs())
    }

    fn output_size(&self) -> Option<usize> {
        Some(self.outputs())
    }

    fn evaluate(&self, input: &Ciphertext, ctx: &PublicContext) -> Result<Ciphertext, ModelError> {
        self.apply(&ctx.evaluator()?, input)
    }
}
