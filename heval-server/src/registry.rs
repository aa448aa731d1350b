//! Named, versioned model registry.
//!
//! Each (name, version) maps to exactly one model instance. Instances are
//! either supplied at registration or built lazily by a factory on first
//! resolve and then kept for the life of the process.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use heval_client::protocol::ModelDescriptor;
use thiserror::Error;

use crate::model::Model;

/// Builds the instance for one version.
pub type ModelFactory = Arc<dyn Fn(&str) -> anyhow::Result<Arc<dyn Model>> + Send + Sync>;

/// Where a registration's instances come from.
#[derive(Clone)]
pub enum ModelSource {
    /// One instance serves every listed version.
    Instance(Arc<dyn Model>),
    /// Called with the version id the first time that version is resolved.
    Factory(ModelFactory),
}

impl ModelSource {
    pub fn factory<F>(f: F) -> Self
    where
        F: Fn(&str) -> anyhow::Result<Arc<dyn Model>> + Send + Sync + 'static,
    {
        ModelSource::Factory(Arc::new(f))
    }
}

/// Everything needed to register a model.
#[derive(Clone)]
pub struct ModelRegistration {
    pub name: String,
    pub description: String,
    pub versions: Vec<String>,
    /// Latest version when absent.
    pub default_version: Option<String>,
    pub source: ModelSource,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("model {0} is already registered")]
    DuplicateRegistration(String),

    #[error("model name must not be empty")]
    InvalidName,

    #[error("model {0} must list at least one version")]
    EmptyVersions(String),

    #[error("model {model} lists version {version} twice")]
    DuplicateVersion { model: String, version: String },

    #[error("default version {version} is not among the versions of {model}")]
    InvalidDefault { model: String, version: String },

    #[error("unknown model {0}")]
    UnknownModel(String),

    #[error("model {model} has no version {version}")]
    UnknownVersion { model: String, version: String },

    #[error("loading {model} {version} failed: {source:#}")]
    LoadFailed {
        model: String,
        version: String,
        source: anyhow::Error,
    },
}

/// A successful lookup.
#[derive(Clone)]
pub struct ResolvedModel {
    pub name: String,
    pub version: String,
    pub model: Arc<dyn Model>,
}

struct VersionSlot {
    id: String,
    instance: OnceLock<Arc<dyn Model>>,
}

struct Entry {
    description: String,
    default_version: String,
    versions: Vec<Arc<VersionSlot>>,
    factory: Option<ModelFactory>,
}

impl Entry {
    fn descriptor(&self, name: &str) -> ModelDescriptor {
        ModelDescriptor {
            model_name: name.to_string(),
            description: self.description.clone(),
            versions: self.versions.iter().map(|v| v.id.clone()).collect(),
            default_version: self.default_version.clone(),
        }
    }
}

/// Thread-safe model table. Reads never block each other; registration
/// takes the write lock briefly.
#[derive(Default)]
pub struct ModelRegistry {
    models: RwLock<BTreeMap<String, Entry>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a model. Fails if the name is taken; use [`update`](Self::update)
    /// to replace an existing entry.
    pub fn register(&self, registration: ModelRegistration) -> Result<(), RegistryError> {
        let (name, entry) = build_entry(registration)?;
        let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);
        if models.contains_key(&name) {
            return Err(RegistryError::DuplicateRegistration(name));
        }
        log::info!(
            "registered model {} (versions: {}, default {})",
            name,
            entry.versions.len(),
            entry.default_version
        );
        models.insert(name, entry);
        Ok(())
    }

    /// Register or replace a model. In-flight evaluations keep the instance
    /// they already resolved.
    pub fn update(&self, registration: ModelRegistration) -> Result<(), RegistryError> {
        let (name, entry) = build_entry(registration)?;
        let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);
        if models.insert(name.clone(), entry).is_some() {
            log::info!("replaced model {}", name);
        } else {
            log::info!("registered model {}", name);
        }
        Ok(())
    }

    /// Look up a model instance; `version` defaults to the registered default.
    ///
    /// A factory runs without the table lock held, so slow parameter loads
    /// never stall registration or other lookups.
    pub fn resolve(&self, name: &str, version: Option<&str>) -> Result<ResolvedModel, RegistryError> {
        let (version, slot, factory) = {
            let models = self.models.read().unwrap_or_else(PoisonError::into_inner);
            let entry = models
                .get(name)
                .ok_or_else(|| RegistryError::UnknownModel(name.to_string()))?;
            let version = version.unwrap_or(&entry.default_version).to_string();
            let slot = entry
                .versions
                .iter()
                .find(|v| v.id == version)
                .cloned()
                .ok_or_else(|| RegistryError::UnknownVersion {
                    model: name.to_string(),
                    version: version.clone(),
                })?;
            (version, slot, entry.factory.clone())
        };

        let model = match (slot.instance.get(), factory) {
            (Some(model), _) => Arc::clone(model),
            (None, Some(factory)) => {
                log::debug!("loading {} {}", name, version);
                let built = factory(&version).map_err(|source| RegistryError::LoadFailed {
                    model: name.to_string(),
                    version: version.clone(),
                    source,
                })?;
                // A concurrent loader may have won; everyone uses the stored one.
                Arc::clone(slot.instance.get_or_init(|| built))
            }
            (None, None) => {
                return Err(RegistryError::LoadFailed {
                    model: name.to_string(),
                    version,
                    source: anyhow::anyhow!("no instance or factory"),
                })
            }
        };

        Ok(ResolvedModel {
            name: name.to_string(),
            version,
            model,
        })
    }

    pub fn describe(&self, name: &str) -> Result<ModelDescriptor, RegistryError> {
        let models = self.models.read().unwrap_or_else(PoisonError::into_inner);
        models
            .get(name)
            .map(|entry| entry.descriptor(name))
            .ok_or_else(|| RegistryError::UnknownModel(name.to_string()))
    }

    /// All models, sorted by name.
    pub fn list(&self) -> Vec<ModelDescriptor> {
        let models = self.models.read().unwrap_or_else(PoisonError::into_inner);
        models
            .iter()
            .map(|(name, entry)| entry.descriptor(name))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.models.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn build_entry(registration: ModelRegistration) -> Result<(String, Entry), RegistryError> {
    let ModelRegistration {
        name,
        description,
        versions,
        default_version,
        source,
    } = registration;

    if name.trim().is_empty() {
        return Err(RegistryError::InvalidName);
    }
    if versions.is_empty() {
        return Err(RegistryError::EmptyVersions(name));
    }
    for (i, v) in versions.iter().enumerate() {
        if versions[..i].contains(v) {
            return Err(RegistryError::DuplicateVersion {
                model: name,
                version: v.clone(),
            });
        }
    }
    let default_version = match default_version {
        Some(v) if versions.contains(&v) => v,
        Some(v) => {
            return Err(RegistryError::InvalidDefault {
                model: name,
                version: v,
            })
        }
        None => latest_version(&versions),
    };

    let (instance, factory) = match source {
        ModelSource::Instance(model) => (Some(model), None),
        ModelSource::Factory(factory) => (None, Some(factory)),
    };
    let versions = versions
        .into_iter()
        .map(|id| {
            let slot = OnceLock::new();
            if let Some(model) = &instance {
                let _ = slot.set(Arc::clone(model));
            }
            Arc::new(VersionSlot { id, instance: slot })
        })
        .collect();

    Ok((
        name,
        Entry {
            description,
            default_version,
            versions,
            factory,
        },
    ))
}

/// Greatest version under dotted ordering. Components compare numerically
/// when both parse as integers, lexically otherwise.
pub fn latest_version(versions: &[String]) -> String {
    versions
        .iter()
        .max_by(|a, b| compare_versions(a, b))
        .cloned()
        .unwrap_or_default()
}

pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}
