//! Fully connected network of three linear layers:
//!
//! ```text
//! x → [linear → square] → [linear → square] → linear → y
//! ```
//!
//! Each square is a ciphertext multiplication followed by a rescale, so a
//! request needs both relinearization and galois keys and at least five
//! levels.

use heval_client::ckks::{Evaluator, SlotLayout};
use heval_client::{Ciphertext, PublicContext};
use serde::{Deserialize, Serialize};

use super::linear_layer::{LinearLayer, LinearLayerParams};
use crate::model::{check_input_len, Model, ModelError};

pub const DESCRIPTION: &str = "Three linear layers with square activations between them; \
needs relinearization and galois keys";

/// Parameter file contents. Each `w` is `[inputs][outputs]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FcParams {
    pub w1: Vec<Vec<f64>>,
    pub b1: Vec<f64>,
    pub w2: Vec<Vec<f64>>,
    pub b2: Vec<f64>,
    pub w3: Vec<Vec<f64>>,
    pub b3: Vec<f64>,
}

pub struct Fc {
    layers: [LinearLayer; 3],
}

impl Fc {
    pub fn new(params: FcParams) -> Result<Self, ModelError> {
        let FcParams {
            w1,
            b1,
            w2,
            b2,
            w3,
            b3,
        } = params;
        let layers = [
            LinearLayer::new(LinearLayerParams { weight: w1, bias: b1 })?,
            LinearLayer::new(LinearLayerParams { weight: w2, bias: b2 })?,
            LinearLayer::new(LinearLayerParams { weight: w3, bias: b3 })?,
        ];
        for (i, pair) in layers.windows(2).enumerate() {
            if pair[0].outputs() != pair[1].inputs() {
                return Err(ModelError::InvalidParameters(format!(
                    "layer {} has {} outputs, layer {} takes {} inputs",
                    i + 1,
                    pair[0].outputs(),
                    i + 2,
                    pair[1].inputs()
                )));
            }
        }
        Ok(Self { layers })
    }

    /// Levels consumed on an input with the given layout.
    pub fn depth(&self, layout: SlotLayout) -> usize {
        let mut layout = layout;
        let mut depth = 0;
        for (i, layer) in self.layers.iter().enumerate() {
            depth += layer.depth(layout);
            layout = SlotLayout {
                len: layer.outputs(),
                period: layer.period(),
            };
            if i < 2 {
                depth += 1;
            }
        }
        depth
    }

    pub fn apply_plain(&self, x: &[f64]) -> Vec<f64> {
        let [l1, l2, l3] = &self.layers;
        let square = |v: Vec<f64>| v.into_iter().map(|y| y * y).collect::<Vec<_>>();
        let h = square(l1.apply_plain(x));
        let h = square(l2.apply_plain(&h));
        l3.apply_plain(&h)
    }

    fn square(ev: &Evaluator<'_>, ct: &Ciphertext) -> Result<Ciphertext, ModelError> {
        Ok(ev.rescale(&ev.square(ct)?)?)
    }
}

impl Model for Fc {
    fn description(&self) -> &str {
        DESCRIPTION
    }

    fn input_size(&self) -> Option<usize> {
        Some(self.layers[0].inputs())
    }

    fn output_size(&self) -> Option<usize> {
        Some(self.layers[2].outputs())
    }

    fn evaluate(&self, input: &Ciphertext, ctx: &PublicContext) -> Result<Ciphertext, ModelError> {
        check_input_len(input, self.layers[0].inputs())?;
        if ctx.galois_keys().is_none() {
            return Err(ModelError::MissingGaloisKeys);
        }
        if ctx.relin_keys().is_none() {
            return Err(ModelError::MissingRelinKeys);
        }
        let needed = self.depth(input.layout);
        if input.level < needed {
            return Err(ModelError::InsufficientLevels {
                needed,
                available: input.level,
            });
        }

        let ev = ctx.evaluator()?;
        let [l1, l2, l3] = &self.layers;
        let h = Self::square(&ev, &l1.apply(&ev, input)?)?;
        let h = Self::square(&ev, &l2.apply(&ev, &h)?)?;
        l3.apply(&ev, &h)
    }
}
