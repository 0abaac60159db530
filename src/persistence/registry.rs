//! Named store registry
//!
//! Hands out one shared handle per store name and announces new and removed
//! stores to interested pools.

use crate::core::config::StoreConfig;
use crate::persistence::{DocumentStore, InMemoryStore, StoreError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

#[cfg(feature = "sqlite")]
use crate::persistence::store::{self, SqliteStore};

/// Store lifecycle notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLifecycle {
    Created(String),
    Removed(String),
}

enum Backend {
    Memory,
    #[cfg(feature = "sqlite")]
    Sqlite {
        pool: sqlx::SqlitePool,
        poll_interval: Duration,
    },
}

/// Registry of named document stores
pub struct StoreRegistry {
    backend: Backend,
    stores: Mutex<HashMap<String, Arc<dyn DocumentStore>>>,
    lifecycle: broadcast::Sender<StoreLifecycle>,
    destroyed: AtomicBool,
}

impl StoreRegistry {
    fn with_backend(backend: Backend) -> Self {
        let (lifecycle, _) = broadcast::channel(256);
        Self {
            backend,
            stores: Mutex::new(HashMap::new()),
            lifecycle,
            destroyed: AtomicBool::new(false),
        }
    }

    /// Registry of process-local stores
    pub fn in_memory() -> Self {
        Self::with_backend(Backend::Memory)
    }

    /// Registry of stores in a shared SQLite database
    #[cfg(feature = "sqlite")]
    pub fn sqlite(pool: sqlx::SqlitePool, poll_interval: Duration) -> Self {
        Self::with_backend(Backend::Sqlite {
            pool,
            poll_interval,
        })
    }

    /// Build a registry for the configured backend
    pub async fn from_config(config: &StoreConfig, poll_interval: Duration) -> Result<Self, StoreError> {
        match config {
            StoreConfig::Memory => Ok(Self::in_memory()),
            #[cfg(feature = "sqlite")]
            StoreConfig::Sqlite { .. } => {
                let path = config.sqlite_path().unwrap_or_default();
                info!("Opening document stores at {}", path.display());
                let pool = store::connect(&path).await?;
                Ok(Self::sqlite(pool, poll_interval))
            }
            #[cfg(not(feature = "sqlite"))]
            StoreConfig::Sqlite { .. } => {
                let _ = poll_interval;
                tracing::warn!("Built without SQLite support; using in-memory stores");
                Ok(Self::in_memory())
            }
        }
    }

    /// Get the store `name`, opening it on first use
    pub async fn get(&self, name: &str) -> Result<Arc<dyn DocumentStore>, StoreError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(StoreError::Destroyed(name.to_string()));
        }

        let mut stores = self.stores.lock().await;
        if let Some(store) = stores.get(name) {
            return Ok(store.clone());
        }

        let store: Arc<dyn DocumentStore> = match &self.backend {
            Backend::Memory => Arc::new(InMemoryStore::new(name)),
            #[cfg(feature = "sqlite")]
            Backend::Sqlite {
                pool,
                poll_interval,
            } => Arc::new(SqliteStore::open(pool.clone(), name, *poll_interval).await?),
        };
        stores.insert(name.to_string(), store.clone());
        drop(stores);

        debug!("Registered store {}", name);
        let _ = self.lifecycle.send(StoreLifecycle::Created(name.to_string()));
        Ok(store)
    }

    /// An already-open store
    pub async fn existing(&self, name: &str) -> Option<Arc<dyn DocumentStore>> {
        self.stores.lock().await.get(name).cloned()
    }

    /// Names of all open stores
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Subscribe to store creation and removal
    pub fn subscribe(&self) -> broadcast::Receiver<StoreLifecycle> {
        self.lifecycle.subscribe()
    }

    /// Unregister a store, closing it and optionally deleting its documents
    pub async fn clean_up(&self, name: &str, delete_data: bool) -> Result<bool, StoreError> {
        let Some(store) = self.stores.lock().await.remove(name) else {
            return Ok(false);
        };

        if delete_data {
            store.destroy().await?;
        } else {
            store.close();
        }

        debug!("Unregistered store {} (deleted: {})", name, delete_data);
        let _ = self.lifecycle.send(StoreLifecycle::Removed(name.to_string()));
        Ok(true)
    }

    /// Clean up every store; later `get` calls fail
    pub async fn destroy(&self, delete_data: bool) -> Result<(), StoreError> {
        self.destroyed.store(true, Ordering::SeqCst);
        for name in self.names().await {
            self.clean_up(&name, delete_data).await?;
        }
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match self.backend {
            Backend::Memory => "memory",
            #[cfg(feature = "sqlite")]
            Backend::Sqlite { .. } => "sqlite",
        };
        f.debug_struct("StoreRegistry")
            .field("backend", &backend)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
