//! Workspace blob storage service
//!
//! Reads, writes and lists blobs scoped to a workspace. Blobs live in the
//! storage provider under "{workspace_id}/{key}"; listings are cached per
//! workspace under "blobs:{workspace_id}" and invalidated on every write.
//! Workspace teardown fans out into one deletion event per blob.

use crate::cache::{Cache, CacheExt};
use crate::config::{blob_list_cache_key, WORKSPACE_KEY_SEPARATOR};
use crate::error::{AppError, Result};
use crate::events::{Event, EventBus, EventEmitter, EventHandler, EventName};
use crate::storage::{ListObjectsMetadata, StorageProvider};
use async_trait::async_trait;
use std::sync::Arc;

/// Service for managing workspace blobs
#[derive(Clone)]
pub struct WorkspaceBlobStorage {
    provider: Arc<dyn StorageProvider>,
    cache: Arc<dyn Cache>,
    event: EventEmitter,
}

impl WorkspaceBlobStorage {
    pub fn new(
        provider: Arc<dyn StorageProvider>,
        cache: Arc<dyn Cache>,
        event: EventEmitter,
    ) -> Self {
        Self {
            provider,
            cache,
            event,
        }
    }

    /// Subscribe this service to the workspace deletion topics
    pub fn subscribe_to(self: &Arc<Self>, bus: &mut EventBus) {
        bus.subscribe(EventName::WorkspaceDeleted, self.clone());
        bus.subscribe(EventName::WorkspaceBlobDeleted, self.clone());
    }

    /// The underlying storage provider
    pub fn provider(&self) -> &Arc<dyn StorageProvider> {
        &self.provider
    }

    /// Store a blob, then drop the workspace's cached listing
    pub async fn put(&self, workspace_id: &str, key: &str, blob: &[u8]) -> Result<()> {
        validate_blob_ref(workspace_id, key)?;

        tracing::info!(
            "Storing blob: {} in workspace: {} (size: {} bytes)",
            key,
            workspace_id,
            blob.len()
        );

        self.provider
            .put(&storage_key(workspace_id, key), blob)
            .await?;

        // Only reached after a successful write
        self.invalidate_listing(workspace_id).await
    }

    /// Read a blob straight from the provider
    pub async fn get(&self, workspace_id: &str, key: &str) -> Result<Vec<u8>> {
        validate_blob_ref(workspace_id, key)?;
        self.provider.get(&storage_key(workspace_id, key)).await
    }

    /// List a workspace's blobs, keys relative to the workspace.
    ///
    /// Served from cache when the cached listing is non-empty. Otherwise the
    /// provider is queried and the cached listing replaced wholesale, unless
    /// a write invalidated it while the provider was being read. An empty
    /// workspace cannot be told apart from an unpopulated entry, so it hits
    /// the provider on every call.
    pub async fn list(&self, workspace_id: &str) -> Result<Vec<ListObjectsMetadata>> {
        validate_workspace_id(workspace_id)?;

        let cache_key = blob_list_cache_key(workspace_id);
        let mut generation = self.listing_generation(&cache_key).await;

        match self
            .cache
            .list_as::<ListObjectsMetadata>(&cache_key, 0, -1)
            .await
        {
            Ok(cached) if !cached.is_empty() => return Ok(cached),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    "Blob list cache read failed for workspace {}, using provider: {}",
                    workspace_id,
                    e
                );
                // Drop the unreadable entry so it is rebuilt from scratch
                if let Err(e) = self.cache.delete(&cache_key).await {
                    tracing::warn!("Failed to drop cache entry {}: {}", cache_key, e);
                }
                generation = self.listing_generation(&cache_key).await;
            }
        }

        let prefix = format!("{}{}", workspace_id, WORKSPACE_KEY_SEPARATOR);
        let mut blobs = self.provider.list(&prefix).await?;

        // Trim workspace prefix
        for blob in &mut blobs {
            if let Some(relative) = blob.key.strip_prefix(&prefix) {
                blob.key = relative.to_string();
            }
        }

        if let Some(generation) = generation {
            match self
                .cache
                .replace_all_if_unchanged(&cache_key, &blobs, generation)
                .await
            {
                Ok(true) => {}
                Ok(false) => tracing::debug!(
                    "Blob list for workspace {} changed while listing, not caching",
                    workspace_id
                ),
                Err(e) => tracing::warn!(
                    "Failed to cache blob list for workspace {}: {}",
                    workspace_id,
                    e
                ),
            }
        }

        tracing::debug!(
            "Listed {} blobs for workspace {} from provider",
            blobs.len(),
            workspace_id
        );

        Ok(blobs)
    }

    /// Soft delete. The object stays in the provider until the doc blobs
    /// manager can tell whether any document still references it.
    pub async fn mark_for_deletion(&self, workspace_id: &str, key: &str) -> Result<()> {
        validate_blob_ref(workspace_id, key)?;
        tracing::debug!(
            "Blob {} in workspace {} marked for deletion (kept in storage)",
            key,
            workspace_id
        );
        Ok(())
    }

    /// Delete a blob (soft delete, see `mark_for_deletion`)
    pub async fn delete(&self, workspace_id: &str, key: &str) -> Result<()> {
        self.mark_for_deletion(workspace_id, key).await
    }

    /// Hard delete: remove the object from the provider and drop the
    /// cached listing. Not reachable from deletion events.
    pub async fn purge(&self, workspace_id: &str, key: &str) -> Result<()> {
        validate_blob_ref(workspace_id, key)?;

        tracing::info!("Purging blob: {} from workspace: {}", key, workspace_id);

        self.provider
            .delete(&storage_key(workspace_id, key))
            .await?;

        self.invalidate_listing(workspace_id).await
    }

    /// Sum of blob sizes in a workspace
    pub async fn total_size(&self, workspace_id: &str) -> Result<u64> {
        let blobs = self.list(workspace_id).await?;
        // TODO: skip soft-deleted blobs once listing metadata carries a deletion flag
        Ok(blobs.iter().map(|blob| blob.size).sum())
    }

    /// Fan a workspace deletion out into one blob deletion event per blob.
    /// Returns the number of events emitted.
    pub async fn on_workspace_deleted(&self, workspace_id: &str) -> Result<usize> {
        let blobs = self.list(workspace_id).await?;

        tracing::info!(
            "Workspace {} deleted, scheduling deletion of {} blobs",
            workspace_id,
            blobs.len()
        );

        for blob in &blobs {
            self.event.emit(Event::WorkspaceBlobDeleted {
                workspace_id: workspace_id.to_string(),
                name: blob.key.clone(),
            });
        }

        Ok(blobs.len())
    }

    /// Handle one blob of a deleted workspace (soft delete)
    pub async fn on_workspace_blob_deleted(&self, workspace_id: &str, name: &str) -> Result<()> {
        self.delete(workspace_id, name).await
    }

    /// Generation of the cached listing, or `None` when the cache cannot
    /// tell us; without it the listing is not written back.
    async fn listing_generation(&self, cache_key: &str) -> Option<u64> {
        match self.cache.generation(cache_key).await {
            Ok(generation) => Some(generation),
            Err(e) => {
                tracing::warn!("Failed to read cache generation of {}: {}", cache_key, e);
                None
            }
        }
    }

    async fn invalidate_listing(&self, workspace_id: &str) -> Result<()> {
        let cache_key = blob_list_cache_key(workspace_id);
        self.cache.delete(&cache_key).await.map_err(|e| {
            AppError::Cache(format!("Failed to invalidate {}: {}", cache_key, e))
        })?;
        Ok(())
    }
}

#[async_trait]
impl EventHandler for WorkspaceBlobStorage {
    async fn handle(&self, event: &Event) -> Result<()> {
        match event {
            Event::WorkspaceDeleted { workspace_id } => {
                self.on_workspace_deleted(workspace_id).await?;
            }
            Event::WorkspaceBlobDeleted { workspace_id, name } => {
                self.on_workspace_blob_deleted(workspace_id, name).await?;
            }
        }
        Ok(())
    }
}

/// Provider key of a workspace blob
fn storage_key(workspace_id: &str, key: &str) -> String {
    format!("{}{}{}", workspace_id, WORKSPACE_KEY_SEPARATOR, key)
}

fn validate_workspace_id(workspace_id: &str) -> Result<()> {
    if workspace_id.is_empty() {
        return Err(AppError::InvalidInput(
            "Workspace id must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_blob_ref(workspace_id: &str, key: &str) -> Result<()> {
    validate_workspace_id(workspace_id)?;
    if key.is_empty() {
        return Err(AppError::InvalidInput("Blob key must not be empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::storage::MemoryStorageProvider;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Counts provider listings and can be told to fail writes
    #[derive(Default)]
    struct InstrumentedProvider {
        inner: MemoryStorageProvider,
        list_calls: AtomicUsize,
        fail_writes: AtomicBool,
        /// Delay between reading a listing and returning it
        list_delay_ms: AtomicU64,
    }

    impl InstrumentedProvider {
        fn list_calls(&self) -> usize {
            self.list_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StorageProvider for InstrumentedProvider {
        async fn put(&self, key: &str, body: &[u8]) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(AppError::StorageWrite(format!("{}: disk full", key)));
            }
            self.inner.put(key, body).await
        }

        async fn get(&self, key: &str) -> Result<Vec<u8>> {
            self.inner.get(key).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<ListObjectsMetadata>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            let listing = self.inner.list(prefix).await?;
            let delay = self.list_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            Ok(listing)
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }
    }

    /// Cache whose reads and writes always fail
    struct BrokenCache;

    #[async_trait]
    impl Cache for BrokenCache {
        async fn delete(&self, _key: &str) -> Result<bool> {
            Err(AppError::Generic("connection refused".to_string()))
        }

        async fn list(&self, _key: &str, _start: i64, _end: i64) -> Result<Vec<String>> {
            Err(AppError::Generic("connection refused".to_string()))
        }

        async fn generation(&self, _key: &str) -> Result<u64> {
            Err(AppError::Generic("connection refused".to_string()))
        }

        async fn push_back(&self, _key: &str, _items: Vec<String>) -> Result<usize> {
            Err(AppError::Generic("connection refused".to_string()))
        }

        async fn replace_if_unchanged(
            &self,
            _key: &str,
            _items: Vec<String>,
            _generation: u64,
        ) -> Result<bool> {
            Err(AppError::Generic("connection refused".to_string()))
        }
    }

    /// Memory cache whose next list read can be made to fail once
    #[derive(Default)]
    struct FlakyCache {
        inner: MemoryCache,
        fail_next_list: AtomicBool,
    }

    #[async_trait]
    impl Cache for FlakyCache {
        async fn delete(&self, key: &str) -> Result<bool> {
            self.inner.delete(key).await
        }

        async fn generation(&self, key: &str) -> Result<u64> {
            self.inner.generation(key).await
        }

        async fn list(&self, key: &str, start: i64, end: i64) -> Result<Vec<String>> {
            if self.fail_next_list.swap(false, Ordering::SeqCst) {
                return Err(AppError::Generic("read timed out".to_string()));
            }
            self.inner.list(key, start, end).await
        }

        async fn push_back(&self, key: &str, items: Vec<String>) -> Result<usize> {
            self.inner.push_back(key, items).await
        }

        async fn replace_if_unchanged(
            &self,
            key: &str,
            items: Vec<String>,
            generation: u64,
        ) -> Result<bool> {
            self.inner.replace_if_unchanged(key, items, generation).await
        }
    }

    struct Fixture {
        storage: Arc<WorkspaceBlobStorage>,
        provider: Arc<InstrumentedProvider>,
        cache: Arc<MemoryCache>,
        bus: EventBus,
    }

    fn create_test_service() -> Fixture {
        let provider = Arc::new(InstrumentedProvider::default());
        let cache = Arc::new(MemoryCache::new());
        let mut bus = EventBus::new();

        let storage = Arc::new(WorkspaceBlobStorage::new(
            provider.clone(),
            cache.clone(),
            bus.emitter(),
        ));
        storage.subscribe_to(&mut bus);

        Fixture {
            storage,
            provider,
            cache,
            bus,
        }
    }

    fn keys(blobs: &[ListObjectsMetadata]) -> Vec<&str> {
        blobs.iter().map(|b| b.key.as_str()).collect()
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let fx = create_test_service();

        fx.storage.put("ws1", "a.png", b"image bytes").await.unwrap();

        let data = fx.storage.get("ws1", "a.png").await.unwrap();
        assert_eq!(data, b"image bytes");
        assert_eq!(fx.provider.get("ws1/a.png").await.unwrap(), b"image bytes");
    }

    #[tokio::test]
    async fn test_get_missing_blob() {
        let fx = create_test_service();

        let err = fx.storage.get("ws1", "nope").await.unwrap_err();
        assert!(matches!(err, AppError::BlobNotFound(_)));
    }

    #[tokio::test]
    async fn test_empty_ids_rejected() {
        let fx = create_test_service();

        assert!(matches!(
            fx.storage.put("", "a.png", b"x").await,
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            fx.storage.put("ws1", "", b"x").await,
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            fx.storage.list("").await,
            Err(AppError::InvalidInput(_))
        ));
        assert!(fx.provider.inner.is_empty().await);
    }

    #[tokio::test]
    async fn test_list_strips_prefix_and_caches() {
        let fx = create_test_service();

        fx.storage.put("ws1", "a.png", b"aaaa").await.unwrap();
        fx.storage.put("ws1", "b.png", b"bb").await.unwrap();
        fx.storage.put("ws2", "c.png", b"c").await.unwrap();

        let first = fx.storage.list("ws1").await.unwrap();
        assert_eq!(keys(&first), vec!["a.png", "b.png"]);
        assert_eq!(first[0].size, 4);
        assert_eq!(first[1].size, 2);
        assert_eq!(fx.provider.list_calls(), 1);

        let second = fx.storage.list("ws1").await.unwrap();
        assert_eq!(second, first);
        assert_eq!(fx.provider.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_put_invalidates_listing() {
        let fx = create_test_service();

        fx.storage.put("ws1", "a.png", b"a").await.unwrap();
        assert_eq!(keys(&fx.storage.list("ws1").await.unwrap()), vec!["a.png"]);
        assert!(fx.cache.contains("blobs:ws1").await);

        fx.storage.put("ws1", "b.png", b"b").await.unwrap();
        assert!(!fx.cache.contains("blobs:ws1").await);

        let blobs = fx.storage.list("ws1").await.unwrap();
        assert_eq!(keys(&blobs), vec!["a.png", "b.png"]);
        assert_eq!(fx.provider.list_calls(), 2);
    }

    #[tokio::test]
    async fn test_put_only_invalidates_own_workspace() {
        let fx = create_test_service();

        fx.storage.put("ws1", "a.png", b"a").await.unwrap();
        fx.storage.put("ws2", "b.png", b"b").await.unwrap();
        fx.storage.list("ws1").await.unwrap();
        fx.storage.list("ws2").await.unwrap();

        fx.storage.put("ws2", "c.png", b"c").await.unwrap();

        assert!(fx.cache.contains("blobs:ws1").await);
        assert!(!fx.cache.contains("blobs:ws2").await);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_cache() {
        let fx = create_test_service();

        fx.storage.put("ws1", "a.png", b"a").await.unwrap();
        fx.storage.list("ws1").await.unwrap();

        fx.provider.fail_writes.store(true, Ordering::SeqCst);
        let err = fx.storage.put("ws1", "b.png", b"b").await.unwrap_err();

        assert!(matches!(err, AppError::StorageWrite(_)));
        assert!(fx.cache.contains("blobs:ws1").await);
    }

    #[tokio::test]
    async fn test_undecodable_cache_entry_is_rebuilt() {
        let fx = create_test_service();

        fx.storage.put("ws1", "a.png", b"a").await.unwrap();
        fx.storage.put("ws1", "b.png", b"b").await.unwrap();
        fx.cache
            .push_back("blobs:ws1", vec!["not json".to_string()])
            .await
            .unwrap();

        for _ in 0..5 {
            let blobs = fx.storage.list("ws1").await.unwrap();
            assert_eq!(keys(&blobs), vec!["a.png", "b.png"]);
        }

        let cached = fx.cache.list("blobs:ws1", 0, -1).await.unwrap();
        assert_eq!(cached.len(), 2);
        assert_eq!(fx.provider.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_cache_read_does_not_duplicate_entry() {
        let provider = Arc::new(InstrumentedProvider::default());
        let cache = Arc::new(FlakyCache::default());
        let storage =
            WorkspaceBlobStorage::new(provider.clone(), cache.clone(), EventBus::new().emitter());

        storage.put("ws1", "a.png", b"a").await.unwrap();
        storage.put("ws1", "b.png", b"b").await.unwrap();
        storage.list("ws1").await.unwrap();

        cache.fail_next_list.store(true, Ordering::SeqCst);
        let blobs = storage.list("ws1").await.unwrap();
        assert_eq!(keys(&blobs), vec!["a.png", "b.png"]);

        let cached = cache.inner.list("blobs:ws1", 0, -1).await.unwrap();
        assert_eq!(cached.len(), 2);
        assert_eq!(storage.total_size("ws1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_misses_cache_one_listing() {
        let fx = create_test_service();

        fx.storage.put("ws1", "a.png", &[0u8; 10]).await.unwrap();
        fx.provider.list_delay_ms.store(50, Ordering::SeqCst);

        let (first, second) = tokio::join!(fx.storage.list("ws1"), fx.storage.list("ws1"));
        assert_eq!(keys(&first.unwrap()), vec!["a.png"]);
        assert_eq!(keys(&second.unwrap()), vec!["a.png"]);

        let blobs = fx.storage.list("ws1").await.unwrap();
        assert_eq!(blobs.len(), 1);
        assert_eq!(fx.storage.total_size("ws1").await.unwrap(), 10);
        assert_eq!(fx.provider.list_calls(), 2);
    }

    #[tokio::test]
    async fn test_listing_overlapping_put_is_not_cached() {
        let fx = create_test_service();

        fx.storage.put("ws1", "a.png", b"a").await.unwrap();
        fx.provider.list_delay_ms.store(50, Ordering::SeqCst);

        let (stale, put) = tokio::join!(fx.storage.list("ws1"), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            fx.storage.put("ws1", "b.png", b"b").await
        });
        put.unwrap();

        // The in-flight listing was read before the write
        assert_eq!(keys(&stale.unwrap()), vec!["a.png"]);
        assert!(!fx.cache.contains("blobs:ws1").await);

        fx.provider.list_delay_ms.store(0, Ordering::SeqCst);
        let blobs = fx.storage.list("ws1").await.unwrap();
        assert_eq!(keys(&blobs), vec!["a.png", "b.png"]);
    }

    #[tokio::test]
    async fn test_empty_workspace_requeries_provider() {
        let fx = create_test_service();

        assert!(fx.storage.list("empty").await.unwrap().is_empty());
        assert!(fx.storage.list("empty").await.unwrap().is_empty());

        assert_eq!(fx.provider.list_calls(), 2);
    }

    #[tokio::test]
    async fn test_total_size() {
        let fx = create_test_service();

        fx.storage.put("ws1", "a.png", &[0u8; 10]).await.unwrap();
        fx.storage.put("ws1", "b.png", &[0u8; 32]).await.unwrap();

        assert_eq!(fx.storage.total_size("ws1").await.unwrap(), 42);
        assert_eq!(fx.storage.total_size("ws2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_keeps_blob() {
        let fx = create_test_service();

        fx.storage.put("ws1", "a.png", b"keep me").await.unwrap();
        fx.storage.delete("ws1", "a.png").await.unwrap();

        assert_eq!(fx.storage.get("ws1", "a.png").await.unwrap(), b"keep me");
        assert_eq!(fx.storage.total_size("ws1").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_purge_removes_blob() {
        let fx = create_test_service();

        fx.storage.put("ws1", "a.png", b"a").await.unwrap();
        fx.storage.put("ws1", "b.png", b"b").await.unwrap();
        fx.storage.list("ws1").await.unwrap();

        fx.storage.purge("ws1", "a.png").await.unwrap();

        assert!(matches!(
            fx.storage.get("ws1", "a.png").await,
            Err(AppError::BlobNotFound(_))
        ));
        assert_eq!(keys(&fx.storage.list("ws1").await.unwrap()), vec!["b.png"]);
    }

    #[tokio::test]
    async fn test_workspace_deleted_fans_out() {
        let mut fx = create_test_service();

        fx.storage.put("ws1", "a.png", b"a").await.unwrap();
        fx.storage.put("ws1", "b.png", b"b").await.unwrap();

        let emitted = fx.storage.on_workspace_deleted("ws1").await.unwrap();
        assert_eq!(emitted, 2);

        // Two blob deletion events are queued and handled
        assert_eq!(fx.bus.run_until_idle().await, 2);

        // Soft delete leaves the provider untouched
        assert_eq!(fx.provider.inner.len().await, 2);
    }

    #[tokio::test]
    async fn test_workspace_deleted_through_bus() {
        let mut fx = create_test_service();

        fx.storage.put("ws1", "a.png", b"a").await.unwrap();
        fx.storage.put("ws1", "b.png", b"b").await.unwrap();
        fx.storage.put("ws2", "c.png", b"c").await.unwrap();

        fx.bus.emitter().emit(Event::WorkspaceDeleted {
            workspace_id: "ws1".to_string(),
        });

        // One workspace event plus one event per ws1 blob
        assert_eq!(fx.bus.run_until_idle().await, 3);
        assert_eq!(fx.provider.inner.len().await, 3);
    }

    #[tokio::test]
    async fn test_broken_cache_falls_back_to_provider() {
        let provider = Arc::new(InstrumentedProvider::default());
        provider.inner.put("ws1/a.png", b"a").await.unwrap();

        let storage = WorkspaceBlobStorage::new(
            provider.clone(),
            Arc::new(BrokenCache),
            EventBus::new().emitter(),
        );

        let blobs = storage.list("ws1").await.unwrap();
        assert_eq!(keys(&blobs), vec!["a.png"]);

        // Invalidation failures surface after the write has landed
        let err = storage.put("ws1", "b.png", b"b").await.unwrap_err();
        assert!(matches!(err, AppError::Cache(_)));
        assert_eq!(provider.get("ws1/b.png").await.unwrap(), b"b");
    }
}
