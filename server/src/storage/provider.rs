//! Object storage provider contract
//!
//! Providers store flat string keys. Namespacing (workspace prefixes)
//! is the caller's business; a provider only ever sees full keys.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One entry of a provider listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListObjectsMetadata {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Store `body` under `key`, replacing any previous object.
    /// Fails with `AppError::StorageWrite`.
    async fn put(&self, key: &str, body: &[u8]) -> Result<()>;

    /// Read the object at `key`. Fails with `AppError::BlobNotFound` when absent.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// All objects whose key starts with the literal `prefix`, in key order
    async fn list(&self, prefix: &str) -> Result<Vec<ListObjectsMetadata>>;

    /// Remove the object at `key`. Deleting a missing object is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

#[async_trait]
impl<T: StorageProvider + ?Sized> StorageProvider for Arc<T> {
    async fn put(&self, key: &str, body: &[u8]) -> Result<()> {
        (**self).put(key, body).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        (**self).get(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ListObjectsMetadata>> {
        (**self).list(prefix).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }
}
