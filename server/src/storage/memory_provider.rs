//! In-memory storage provider
//!
//! Keeps objects in an ordered map so listings come back in key order,
//! matching what object stores return.

use super::provider::{ListObjectsMetadata, StorageProvider};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

struct StoredObject {
    body: Vec<u8>,
    last_modified: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemoryStorageProvider {
    objects: RwLock<BTreeMap<String, StoredObject>>,
}

impl MemoryStorageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl StorageProvider for MemoryStorageProvider {
    async fn put(&self, key: &str, body: &[u8]) -> Result<()> {
        let object = StoredObject {
            body: body.to_vec(),
            last_modified: Utc::now(),
        };
        self.objects.write().await.insert(key.to_string(), object);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|object| object.body.clone())
            .ok_or_else(|| AppError::BlobNotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ListObjectsMetadata>> {
        let objects = self.objects.read().await;

        let listing = objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ListObjectsMetadata {
                key: key.clone(),
                size: object.body.len() as u64,
                last_modified: object.last_modified,
            })
            .collect();

        Ok(listing)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.write().await.remove(key);
        Ok(())
    }
}
