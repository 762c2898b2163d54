//! Cache module
//!
//! List-valued cache used for derived data such as blob listings.
//! Values travel as JSON strings; `CacheExt` converts typed items.
//! Nothing stored here is authoritative: every entry must be
//! recomputable from its source.
//!
//! Every key carries a generation that `delete` bumps. A reader that
//! rebuilds an entry from its source records the generation first and
//! writes back with `replace_if_unchanged`, so a rebuild that overlaps an
//! invalidation is dropped instead of resurrecting stale data.

pub mod memory;

pub use memory::MemoryCache;

use crate::error::{AppError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

#[async_trait]
pub trait Cache: Send + Sync {
    /// Remove an entry and bump its generation. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Current generation of `key`; unset keys start at 0
    async fn generation(&self, key: &str) -> Result<u64>;

    /// Items `start..=end` of the list at `key`. Negative indices count
    /// from the end, so `(0, -1)` is the whole list. Unset keys read as empty.
    async fn list(&self, key: &str, start: i64, end: i64) -> Result<Vec<String>>;

    /// Append items in order, creating the entry if needed.
    /// Returns the list length afterwards.
    async fn push_back(&self, key: &str, items: Vec<String>) -> Result<usize>;

    /// Set the whole list at `key` to `items`, but only if its generation is
    /// still `generation`. Returns whether the write happened. An empty
    /// `items` leaves the key unset.
    async fn replace_if_unchanged(
        &self,
        key: &str,
        items: Vec<String>,
        generation: u64,
    ) -> Result<bool>;
}

/// Typed helpers over the raw string lists
#[async_trait]
pub trait CacheExt {
    async fn list_as<T>(&self, key: &str, start: i64, end: i64) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Send;

    async fn push_back_all<T>(&self, key: &str, items: &[T]) -> Result<usize>
    where
        T: Serialize + Sync;

    async fn replace_all_if_unchanged<T>(
        &self,
        key: &str,
        items: &[T],
        generation: u64,
    ) -> Result<bool>
    where
        T: Serialize + Sync;
}

#[async_trait]
impl<C: Cache + ?Sized> CacheExt for C {
    async fn list_as<T>(&self, key: &str, start: i64, end: i64) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Send,
    {
        let raw = self.list(key, start, end).await?;
        raw.iter()
            .map(|item| serde_json::from_str(item).map_err(AppError::from))
            .collect()
    }

    async fn push_back_all<T>(&self, key: &str, items: &[T]) -> Result<usize>
    where
        T: Serialize + Sync,
    {
        self.push_back(key, encode_all(items)?).await
    }

    async fn replace_all_if_unchanged<T>(
        &self,
        key: &str,
        items: &[T],
        generation: u64,
    ) -> Result<bool>
    where
        T: Serialize + Sync,
    {
        self.replace_if_unchanged(key, encode_all(items)?, generation)
            .await
    }
}

fn encode_all<T: Serialize>(items: &[T]) -> Result<Vec<String>> {
    items
        .iter()
        .map(|item| serde_json::to_string(item).map_err(AppError::from))
        .collect()
}
