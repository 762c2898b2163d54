//! Storage module
//!
//! Object storage providers for binary data (images, attachments),
//! and the factory that picks one from configuration.

pub mod fs_provider;
pub mod memory_provider;
pub mod provider;

pub use fs_provider::FsStorageProvider;
pub use memory_provider::MemoryStorageProvider;
pub use provider::{ListObjectsMetadata, StorageProvider};

use crate::config::{ProviderKind, StorageConfig};
use crate::error::Result;
use std::sync::Arc;

/// Build the provider for a storage namespace (e.g. "blob").
///
/// Filesystem providers get their own directory `{data_dir}/{namespace}`.
pub async fn create_provider(
    config: &StorageConfig,
    namespace: &str,
) -> Result<Arc<dyn StorageProvider>> {
    match config.provider {
        ProviderKind::Fs => {
            let provider = FsStorageProvider::new(config.data_dir.join(namespace));
            provider.initialize().await?;
            Ok(Arc::new(provider))
        }
        ProviderKind::Memory => {
            tracing::info!("Using in-memory storage for namespace: {}", namespace);
            Ok(Arc::new(MemoryStorageProvider::new()))
        }
    }
}
