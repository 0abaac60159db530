//! Node configuration from YAML

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};

/// Which side of a consortium a node runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Participant running local pipelines
    Local,
    /// Aggregator running remote pipelines
    Remote,
}

/// Document store backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Process-local stores, lost on exit
    Memory,
    /// Shared SQLite file; defaults to the user's data directory
    Sqlite {
        #[serde(default)]
        path: Option<PathBuf>,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Sqlite { path: None }
    }
}

impl StoreConfig {
    /// Resolved SQLite path, if this is a SQLite backend
    pub fn sqlite_path(&self) -> Option<PathBuf> {
        match self {
            StoreConfig::Memory => None,
            StoreConfig::Sqlite { path: Some(path) } => Some(path.clone()),
            StoreConfig::Sqlite { path: None } => {
                let data_dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
                Some(data_dir.join("consortium-pipeline").join("stores.db"))
            }
        }
    }
}

/// Top-level node configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub role: NodeRole,

    /// Participant identity; required for local nodes
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub store: StoreConfig,

    /// Change-feed polling interval for SQLite stores
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Directory of `<name>--<version>.yaml` computation definitions
    pub computations_dir: PathBuf,

    /// Restrict the node to these consortium ids
    #[serde(default)]
    pub listen_to: Option<Vec<String>>,
}

fn default_poll_interval_ms() -> u64 {
    250
}

impl NodeConfig {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Load configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: NodeConfig = serde_yaml::from_str(yaml).context("Failed to parse node config")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.role == NodeRole::Local {
            match &self.username {
                Some(name) if !name.trim().is_empty() => {}
                _ => anyhow::bail!("Local nodes require a username"),
            }
        }

        if let Some(username) = &self.username {
            if username.contains('-') && self.role == NodeRole::Local {
                tracing::warn!("Username '{}' contains '-'; run ids never do", username);
            }
        }

        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be greater than zero");
        }

        if let Some(ids) = &self.listen_to {
            if let Some(bad) = ids.iter().find(|id| id.contains('-') || id.is_empty()) {
                anyhow::bail!("Invalid consortium id '{}' in listen_to", bad);
            }
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_node_config() {
        let config = NodeConfig::from_yaml(
            r#"
role: local
username: alice
computations_dir: ./computations
store:
  backend: sqlite
  path: /tmp/stores.db
listen_to: [c1, c2]
"#,
        )
        .unwrap();

        assert_eq!(config.role, NodeRole::Local);
        assert_eq!(config.username.as_deref(), Some("alice"));
        assert_eq!(config.store.sqlite_path(), Some(PathBuf::from("/tmp/stores.db")));
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.listen_to, Some(vec!["c1".to_string(), "c2".to_string()]));
    }

    #[test]
    fn test_memory_backend() {
        let config = NodeConfig::from_yaml(
            "role: remote\ncomputations_dir: .\nstore:\n  backend: memory\n",
        )
        .unwrap();
        assert_eq!(config.store, StoreConfig::Memory);
        assert_eq!(config.store.sqlite_path(), None);
    }

    #[test]
    fn test_default_store_is_sqlite() {
        let config = NodeConfig::from_yaml("role: remote\ncomputations_dir: .\n").unwrap();
        let path = config.store.sqlite_path().unwrap();
        assert!(path.ends_with("consortium-pipeline/stores.db"));
    }

    #[test]
    fn test_local_requires_username() {
        let err = NodeConfig::from_yaml("role: local\ncomputations_dir: .\n").unwrap_err();
        assert!(err.to_string().contains("username"));
    }

    #[test]
    fn test_rejects_dashed_consortium_ids() {
        let result = NodeConfig::from_yaml(
            "role: remote\ncomputations_dir: .\nlisten_to: [a-b]\n",
        );
        assert!(result.is_err());
    }
}
