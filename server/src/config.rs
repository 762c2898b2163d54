//! Storage configuration
//!
//! Constants shared across the crate, plus the JSON-backed
//! `StorageConfig` used to pick and place the storage provider.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

// ===== Key Layout =====

/// Prefix of the listing cache entry for a workspace ("blobs:{workspace_id}")
pub const BLOB_LIST_CACHE_PREFIX: &str = "blobs";

/// Separator between workspace id and blob key in provider keys
pub const WORKSPACE_KEY_SEPARATOR: char = '/';

/// Provider namespace used for workspace blobs
pub const BLOB_NAMESPACE: &str = "blob";

// ===== Defaults =====

/// Default root directory for the filesystem provider
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Log filter used when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = "workspace_blobs=debug,blobctl=debug,info";

/// Which storage provider backs the blob store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Files on local disk under `data_dir`
    #[default]
    Fs,
    /// Process memory; contents are lost on exit
    Memory,
}

/// Storage configuration, loaded from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_DIR)
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            data_dir: default_data_dir(),
        }
    }
}

impl StorageConfig {
    /// Load configuration from a JSON file, falling back to defaults if absent
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).await?;
        let config: StorageConfig = serde_json::from_str(&contents)?;

        tracing::info!("Loaded storage config from {:?}", path);

        Ok(config)
    }

    /// Save configuration as pretty-printed JSON
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).await?;

        tracing::debug!("Saved storage config to {:?}", path);

        Ok(())
    }
}

/// Cache key holding the blob listing of a workspace
pub fn blob_list_cache_key(workspace_id: &str) -> String {
    format!("{}:{}", BLOB_LIST_CACHE_PREFIX, workspace_id)
}
