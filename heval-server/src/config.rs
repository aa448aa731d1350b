use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::models::ModelKind;
use crate::registry::{ModelRegistration, ModelRegistry, ModelSource};

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8000";

/// Upper bound on a `POST /eval` body.
pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Configuration for an evaluation server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to accept HTTP connections on.
    pub listen: SocketAddr,
    /// Worker threads pulling requests off the listener.
    pub workers: usize,
    pub max_body_bytes: usize,
    /// Where `{name}-{version}.json` parameter files live.
    pub data_dir: PathBuf,
    /// Model manifest; the manifest in `data_dir` is used when absent.
    pub manifest: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8000)),
            workers: default_workers(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            data_dir: PathBuf::from("."),
            manifest: None,
        }
    }
}

impl ServerConfig {
    pub fn manifest_path(&self) -> PathBuf {
        self.manifest
            .clone()
            .unwrap_or_else(|| self.data_dir.join("manifest.json"))
    }

    /// Read the manifest and build a registry from it.
    pub fn load_registry(&self) -> anyhow::Result<ModelRegistry> {
        let manifest = Manifest::load(&self.manifest_path())?;
        build_registry(&manifest, &self.data_dir)
    }
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// The set of models a server offers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub models: Vec<ManifestEntry>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub kind: ModelKind,
    pub versions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Manifest {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("parsing model manifest")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading manifest {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("loading {}", path.display()))
    }
}

/// Parameter file for one version of a model.
pub fn parameter_path(data_dir: &Path, name: &str, version: &str) -> PathBuf {
    data_dir.join(format!("{}-{}.json", name, version))
}

/// Register every manifest entry. Parameter files are read on first
/// resolve of each version, not here.
pub fn build_registry(manifest: &Manifest, data_dir: &Path) -> anyhow::Result<ModelRegistry> {
    let registry = ModelRegistry::new();
    for entry in &manifest.models {
        let kind = entry.kind;
        let dir = data_dir.to_path_buf();
        let name = entry.name.clone();
        let source = ModelSource::factory(move |version: &str| {
            kind.load(&parameter_path(&dir, &name, version))
        });
        registry
            .register(ModelRegistration {
                name: entry.name.clone(),
                description: entry
                    .description
                    .clone()
                    .unwrap_or_else(|| kind.description().to_string()),
                versions: entry.versions.clone(),
                default_version: entry.default_version.clone(),
                source,
            })
            .with_context(|| format!("registering {}", entry.name))?;
        log::debug!(
            "registered {} ({:?}) versions {:?}",
            entry.name,
            kind,
            entry.versions
        );
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryError;
    use std::sync::Arc;

    const MANIFEST: &str = r#"{
        "models": [
            {"name": "LinearLayer", "kind": "linear_layer", "versions": ["0.1"], "default_version": "0.1"},
            {"name": "Square", "kind": "polynomial", "versions": ["1.0", "1.10", "1.2"], "description": "x squared"}
        ]
    }"#;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("heval-config-{}-{}", tag, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn parses_manifest() {
        let manifest = Manifest::from_json(MANIFEST).unwrap();
        assert_eq!(manifest.models.len(), 2);
        assert_eq!(manifest.models[0].kind, ModelKind::LinearLayer);
        assert_eq!(manifest.models[1].default_version, None);
        assert!(Manifest::from_json(r#"{"models": [{"name": "x", "kind": "tree"}]}"#).is_err());
    }

    #[test]
    fn registry_from_manifest() {
        let manifest = Manifest::from_json(MANIFEST).unwrap();
        let registry = build_registry(&manifest, Path::new("/nonexistent")).unwrap();
        assert_eq!(registry.len(), 2);

        let square = registry.describe("Square").unwrap();
        assert_eq!(square.description, "x squared");
        assert_eq!(square.default_version, "1.10");

        let layer = registry.describe("LinearLayer").unwrap();
        assert_eq!(layer.description, ModelKind::LinearLayer.description());
    }

    #[test]
    fn parameters_load_lazily() {
        let dir = temp_dir("lazy");
        let manifest = Manifest::from_json(MANIFEST).unwrap();
        let registry = build_registry(&manifest, &dir).unwrap();

        // Missing file only shows up at resolve time.
        assert!(matches!(
            registry.resolve("Square", Some("1.2")),
            Err(RegistryError::LoadFailed { .. })
        ));

        std::fs::write(
            parameter_path(&dir, "Square", "1.2"),
            r#"{"coefficients": [0.0, 0.0, 1.0]}"#,
        )
        .unwrap();
        let first = registry.resolve("Square", Some("1.2")).unwrap();
        let second = registry.resolve("Square", Some("1.2")).unwrap();
        assert!(Arc::ptr_eq(&first.model, &second.model));
        assert_eq!(first.model.input_size(), None);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn manifest_path_defaults_to_data_dir() {
        let config = ServerConfig {
            data_dir: PathBuf::from("/srv/models"),
            ..ServerConfig::default()
        };
        assert_eq!(config.manifest_path(), PathBuf::from("/srv/models/manifest.json"));
        assert_eq!(config.listen.to_string(), DEFAULT_LISTEN);
        assert!(config.workers >= 1);
    }
}
