//! Catalog of known system definitions
//!
//! Definitions are read from a directory tree of `*.json` files at startup and
//! may be registered at runtime; registered definitions are written back into
//! the same directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use walkdir::WalkDir;

use super::{DefinitionError, SystemConfiguration, SystemDefinition, SystemRef};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Invalid(#[from] DefinitionError),

    #[error("system {0} is already registered")]
    AlreadyExists(SystemRef),

    #[error("definition file {file} for system {system} already exists")]
    FileConflict { system: SystemRef, file: String },

    #[error("failed to persist definition: {0}")]
    Io(String),
}

/// Indexed set of validated system definitions
pub struct SystemCatalog {
    systems: RwLock<BTreeMap<SystemRef, Arc<SystemDefinition>>>,
    dir: PathBuf,
}

impl SystemCatalog {
    /// Load every definition below `dir`, skipping invalid documents
    pub async fn load(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create systems directory {}", dir.display()))?;

        let root = dir.to_path_buf();
        let files: Vec<PathBuf> = tokio::task::spawn_blocking(move || {
            WalkDir::new(&root)
                .follow_links(true)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path())
                .filter(|path| path.extension().and_then(|s| s.to_str()) == Some("json"))
                .collect()
        })
        .await
        .context("Systems directory scan panicked")?;

        let catalog = Self::empty(dir);
        let mut loaded = 0;

        for path in files {
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to read system definition");
                    continue;
                }
            };

            let sysdef = match serde_json::from_str::<SystemDefinition>(&content) {
                Ok(sysdef) => sysdef,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Malformed system definition");
                    continue;
                }
            };

            match catalog.insert(sysdef).await {
                Ok(sysdef) => {
                    tracing::debug!(system = %sysdef.reference(), path = %path.display(), "Loaded system definition");
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Rejected system definition");
                }
            }
        }

        tracing::info!(loaded = loaded, dir = %dir.display(), "Loaded system catalog");
        Ok(catalog)
    }

    pub fn empty(dir: &Path) -> Self {
        Self {
            systems: RwLock::new(BTreeMap::new()),
            dir: dir.to_path_buf(),
        }
    }

    /// Validate and index a definition without persisting it
    pub async fn insert(&self, sysdef: SystemDefinition) -> Result<Arc<SystemDefinition>, CatalogError> {
        sysdef.validate()?;

        let key = sysdef.reference();
        let mut systems = self.systems.write().await;
        if systems.contains_key(&key) {
            return Err(CatalogError::AlreadyExists(key));
        }

        let sysdef = Arc::new(sysdef);
        systems.insert(key, sysdef.clone());
        Ok(sysdef)
    }

    /// Validate, persist and index a definition submitted at runtime.
    ///
    /// An existing definition file is never overwritten.
    pub async fn register(&self, sysdef: SystemDefinition) -> Result<Arc<SystemDefinition>, CatalogError> {
        sysdef.validate()?;

        let key = sysdef.reference();
        let mut systems = self.systems.write().await;
        if systems.contains_key(&key) {
            return Err(CatalogError::AlreadyExists(key));
        }

        let path = self.dir.join(definition_file_name(&key));
        let json = serde_json::to_vec_pretty(&sysdef).map_err(|e| CatalogError::Io(e.to_string()))?;
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(CatalogError::FileConflict {
                    system: key,
                    file: path.display().to_string(),
                });
            }
            Err(e) => return Err(CatalogError::Io(e.to_string())),
        };
        file.write_all(&json)
            .await
            .map_err(|e| CatalogError::Io(e.to_string()))?;
        file.sync_all()
            .await
            .map_err(|e| CatalogError::Io(e.to_string()))?;

        let sysdef = Arc::new(sysdef);
        systems.insert(key.clone(), sysdef.clone());
        drop(systems);

        tracing::info!(system = %key, file = %path.display(), "Registered system definition");
        Ok(sysdef)
    }

    /// Free-form description of a system, if it documents one
    pub async fn description(&self, system: &SystemRef) -> Option<Option<String>> {
        self.get(system)
            .await
            .map(|sysdef| sysdef.documentation.as_ref().map(|doc| doc.description.clone()))
    }

    pub async fn get(&self, system: &SystemRef) -> Option<Arc<SystemDefinition>> {
        self.systems.read().await.get(system).cloned()
    }

    /// Distinct system names, sorted
    pub async fn names(&self) -> Vec<String> {
        let systems = self.systems.read().await;
        let mut names: Vec<String> = systems.keys().map(|key| key.name.clone()).collect();
        names.dedup();
        names
    }

    pub async fn versions(&self, name: &str) -> Vec<String> {
        self.systems
            .read()
            .await
            .keys()
            .filter(|key| key.name == name)
            .map(|key| key.version.clone())
            .collect()
    }

    pub async fn default_configuration(&self, system: &SystemRef) -> Option<SystemConfiguration> {
        self.get(system)
            .await
            .map(|sysdef| SystemConfiguration::from_sysdef(&sysdef))
    }

    pub async fn len(&self) -> usize {
        self.systems.read().await.len()
    }
}

/// `<name>@<version>.json`; `@` never survives sanitizing, so the split is unambiguous
fn definition_file_name(system: &SystemRef) -> String {
    format!("{}@{}.json", sanitize(&system.name), sanitize(&system.version))
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' { c } else { '_' })
        .collect()
}
