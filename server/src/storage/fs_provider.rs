//! Filesystem storage provider
//!
//! Each provider key maps to one file below `<root>/objects`, with `/`
//! in the key becoming a directory level. In-flight writes live in
//! `<root>/tmp` and are renamed into place, so no key can collide with
//! a temp file.
//!
//! Example: key "ws1/images/a.png" is stored at "<root>/objects/ws1/images/a.png"
//!
//! Because keys become paths, a key cannot also be the directory prefix of
//! another key: once "ws1/a" exists, writing "ws1/a/b" fails with
//! `StorageWrite`, and the other way round.

use super::provider::{ListObjectsMetadata, StorageProvider};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

const OBJECTS_DIR: &str = "objects";
const TEMP_DIR: &str = "tmp";

/// Object storage backed by a local directory
#[derive(Clone)]
pub struct FsStorageProvider {
    root: PathBuf,
}

impl FsStorageProvider {
    /// Create a new provider at the given root directory
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Initialize the provider (create directories, clear stale temp files)
    pub async fn initialize(&self) -> Result<()> {
        fs::create_dir_all(self.objects_dir()).await?;

        let temp_dir = self.temp_dir();
        if temp_dir.exists() {
            fs::remove_dir_all(&temp_dir).await?;
        }
        fs::create_dir_all(&temp_dir).await?;

        tracing::info!("Filesystem storage initialized at: {:?}", self.root);
        Ok(())
    }

    /// Get provider root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the stored objects
    pub fn objects_dir(&self) -> PathBuf {
        self.root.join(OBJECTS_DIR)
    }

    fn temp_dir(&self) -> PathBuf {
        self.root.join(TEMP_DIR)
    }

    /// Map a provider key to a path below the objects directory
    fn get_path(&self, key: &str) -> Result<PathBuf> {
        let mut path = self.objects_dir();
        for segment in key.split('/') {
            validate_segment(key, segment)?;
            path.push(segment);
        }
        Ok(path)
    }

    async fn write_file(&self, path: &Path, body: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write to temp file first (atomic write)
        let temp_dir = self.temp_dir();
        fs::create_dir_all(&temp_dir).await?;
        let temp_path = temp_dir.join(Uuid::new_v4().to_string());

        let mut file = fs::File::create(&temp_path).await?;
        let result = match Self::fill(&mut file, body).await {
            // Rename to final location
            Ok(()) => fs::rename(&temp_path, path).await,
            Err(e) => Err(e),
        };

        if result.is_err() {
            let _ = fs::remove_file(&temp_path).await;
        }
        result
    }

    async fn fill(file: &mut fs::File, body: &[u8]) -> std::io::Result<()> {
        file.write_all(body).await?;
        file.sync_all().await
    }

    fn scan_directory<'a>(
        &'a self,
        dir: &'a Path,
        base: String,
        entries_out: &'a mut Vec<ListObjectsMetadata>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if !dir.is_dir() {
                return Ok(());
            }

            let mut entries = fs::read_dir(dir).await?;

            while let Some(entry) = entries.next_entry().await? {
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                let key = if base.is_empty() {
                    name
                } else {
                    format!("{}/{}", base, name)
                };

                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    self.scan_directory(&entry.path(), key, entries_out).await?;
                } else if file_type.is_file() {
                    let metadata = entry.metadata().await?;
                    let last_modified = metadata
                        .modified()
                        .map(DateTime::<Utc>::from)
                        .unwrap_or_else(|_| Utc::now());

                    entries_out.push(ListObjectsMetadata {
                        key,
                        size: metadata.len(),
                        last_modified,
                    });
                }
            }

            Ok(())
        })
    }
}

#[async_trait]
impl StorageProvider for FsStorageProvider {
    async fn put(&self, key: &str, body: &[u8]) -> Result<()> {
        let path = self.get_path(key)?;

        self.write_file(&path, body)
            .await
            .map_err(|e| AppError::StorageWrite(format!("{}: {}", key, e)))?;

        tracing::debug!("Wrote object: {} ({} bytes)", key, body.len());

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.get_path(key)?;

        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::BlobNotFound(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        tracing::debug!("Read object: {} ({} bytes)", key, data.len());

        Ok(data)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ListObjectsMetadata>> {
        // Only walk the deepest directory the prefix pins down
        let (dir, base) = match prefix.rfind('/') {
            Some(idx) => {
                let dir_part = &prefix[..idx];
                (self.get_path(dir_part)?, dir_part.to_string())
            }
            None => (self.objects_dir(), String::new()),
        };

        let mut objects = Vec::new();
        self.scan_directory(&dir, base, &mut objects).await?;

        objects.retain(|object| object.key.starts_with(prefix));
        objects.sort_by(|a, b| a.key.cmp(&b.key));

        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.get_path(key)?;

        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!("Deleted object: {}", key);
                Ok(())
            }
            // Already deleted
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Reject key segments that could escape the objects directory
fn validate_segment(key: &str, segment: &str) -> Result<()> {
    let invalid = segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains('\\')
        || segment.contains('\0');

    if invalid {
        return Err(AppError::InvalidInput(format!(
            "Unsafe storage key: {:?}",
            key
        )));
    }

    Ok(())
}
