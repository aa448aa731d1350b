//! Built-in model implementations and their parameter files.

pub mod fc;
pub mod linear_layer;
pub mod polynomial;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub use fc::{Fc, FcParams};
pub use linear_layer::{LinearLayer, LinearLayerParams};
pub use polynomial::{Polynomial, PolynomialParams};

use crate::model::Model;

/// Built-in model families, as named in a model manifest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Fc,
    LinearLayer,
    Polynomial,
}

impl ModelKind {
    /// Default description shown by `GET /models`.
    pub fn description(self) -> &'static str {
        match self {
            ModelKind::Fc => fc::DESCRIPTION,
            ModelKind::LinearLayer => linear_layer::DESCRIPTION,
            ModelKind::Polynomial => polynomial::DESCRIPTION,
        }
    }

    /// Build a model from the JSON contents of a parameter file.
    pub fn from_json(self, json: &str) -> anyhow::Result<Arc<dyn Model>> {
        let model: Arc<dyn Model> = match self {
            ModelKind::Fc => {
                let params: FcParams =
                    serde_json::from_str(json).context("parsing fc parameters")?;
                Arc::new(Fc::new(params)?)
            }
            ModelKind::LinearLayer => {
                let params: LinearLayerParams =
                    serde_json::from_str(json).context("parsing linear layer parameters")?;
                Arc::new(LinearLayer::new(params)?)
            }
            ModelKind::Polynomial => {
                let params: PolynomialParams =
                    serde_json::from_str(json).context("parsing polynomial parameters")?;
                Arc::new(Polynomial::new(params)?)
            }
        };
        Ok(model)
    }

    /// Build a model from a parameter file on disk.
    pub fn load(self, path: &Path) -> anyhow::Result<Arc<dyn Model>> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading model parameters {}", path.display()))?;
        self.from_json(&json)
            .with_context(|| format!("loading {}", path.display()))
    }
}
