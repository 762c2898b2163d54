//! Application state and initialization
//!
//! Builds the storage provider, cache and event bus from configuration
//! and wires the services together.

use crate::cache::{Cache, MemoryCache};
use crate::config::{StorageConfig, BLOB_NAMESPACE};
use crate::error::Result;
use crate::events::{EventBus, EventEmitter};
use crate::services::WorkspaceBlobStorage;
use crate::storage::create_provider;
use std::sync::Arc;

/// Central application state holding all services
#[derive(Clone)]
pub struct AppState {
    pub blob_storage: Arc<WorkspaceBlobStorage>,
    pub events: EventEmitter,
}

/// Application setup - called once on startup.
///
/// Returns the state and the event bus with every handler registered;
/// the caller decides how the bus is driven.
pub async fn setup(config: &StorageConfig) -> Result<(AppState, EventBus)> {
    tracing::info!("Initializing application with {:?} storage", config.provider);

    let provider = create_provider(config, BLOB_NAMESPACE).await?;
    let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());

    let mut bus = EventBus::new();
    let events = bus.emitter();

    let blob_storage = Arc::new(WorkspaceBlobStorage::new(provider, cache, events.clone()));
    blob_storage.subscribe_to(&mut bus);

    tracing::info!("Application initialized successfully");

    Ok((
        AppState {
            blob_storage,
            events,
        },
        bus,
    ))
}
