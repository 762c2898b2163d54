//! Error types for workspace blob storage
//!
//! All errors use thiserror for structured error handling.
//! These errors serialize to their display string so the API layer
//! can hand them to clients unchanged.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage write failed: {0}")]
    StorageWrite(String),

    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error("{0}")]
    Generic(String),
}

impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
