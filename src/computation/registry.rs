//! Computation registry - resolves `(name, version)` to a definition

use crate::core::DecentralizedComputation;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Error types for registry lookups
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("computation {0} is not registered")]
    NotFound(String),

    #[error("failed to load computation {id}: {message}")]
    Load { id: String, message: String },
}

/// Source of decentralized computation definitions
#[async_trait]
pub trait ComputationRegistry: Send + Sync {
    /// Look up an already-added definition
    async fn get(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Arc<DecentralizedComputation>, RegistryError>;

    /// Fetch a definition from cache or source, caching it
    async fn add(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Arc<DecentralizedComputation>, RegistryError>;
}

/// Registry backed by a directory of `<name>--<version>.yaml` files
pub struct LocalComputationRegistry {
    path: Option<PathBuf>,
    cache: RwLock<HashMap<String, Arc<DecentralizedComputation>>>,
}

impl LocalComputationRegistry {
    /// Registry loading definitions from `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Registry holding only inserted definitions
    pub fn in_memory() -> Self {
        Self {
            path: None,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Pre-seed a definition
    pub async fn insert(&self, definition: DecentralizedComputation) -> Arc<DecentralizedComputation> {
        let definition = Arc::new(definition);
        self.cache
            .write()
            .await
            .insert(definition.id(), definition.clone());
        definition
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }
}

#[async_trait]
impl ComputationRegistry for LocalComputationRegistry {
    async fn get(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Arc<DecentralizedComputation>, RegistryError> {
        let id = DecentralizedComputation::registry_id(name, version);
        self.cache
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound(id))
    }

    async fn add(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Arc<DecentralizedComputation>, RegistryError> {
        let id = DecentralizedComputation::registry_id(name, version);
        if let Some(existing) = self.cache.read().await.get(&id) {
            debug!("Computation {} served from cache", id);
            return Ok(existing.clone());
        }

        let dir = self.path.as_ref().ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        let file = dir.join(format!("{}.yaml", id));
        let definition = DecentralizedComputation::from_file(&file).map_err(|e| RegistryError::Load {
            id: id.clone(),
            message: format!("{:#}", e),
        })?;

        if definition.name != name || definition.version != version {
            return Err(RegistryError::Load {
                id,
                message: format!(
                    "file declares {}",
                    DecentralizedComputation::registry_id(&definition.name, &definition.version)
                ),
            });
        }

        info!("Loaded computation {} from {}", id, file.display());
        Ok(self.insert(definition).await)
    }
}
