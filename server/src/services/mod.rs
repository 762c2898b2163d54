//! Services module
//!
//! Business logic services that coordinate storage providers, caches
//! and the event bus.

pub mod workspace_blobs;

pub use workspace_blobs::WorkspaceBlobStorage;
