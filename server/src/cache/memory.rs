//! In-process list cache

use super::Cache;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct Entries {
    lists: HashMap<String, Vec<String>>,
    generations: HashMap<String, u64>,
}

/// Lists and generations share one lock so a conditional replace
/// cannot interleave with a delete.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<Entries>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an entry is present
    pub async fn contains(&self, key: &str) -> bool {
        self.entries.read().await.lists.contains_key(key)
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn delete(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.write().await;
        *entries.generations.entry(key.to_string()).or_default() += 1;
        Ok(entries.lists.remove(key).is_some())
    }

    async fn generation(&self, key: &str) -> Result<u64> {
        let entries = self.entries.read().await;
        Ok(entries.generations.get(key).copied().unwrap_or(0))
    }

    async fn list(&self, key: &str, start: i64, end: i64) -> Result<Vec<String>> {
        let entries = self.entries.read().await;

        let Some(items) = entries.lists.get(key) else {
            return Ok(Vec::new());
        };

        Ok(match resolve_range(items.len(), start, end) {
            Some((from, to)) => items[from..=to].to_vec(),
            None => Vec::new(),
        })
    }

    async fn push_back(&self, key: &str, items: Vec<String>) -> Result<usize> {
        let mut entries = self.entries.write().await;

        if items.is_empty() {
            return Ok(entries.lists.get(key).map_or(0, Vec::len));
        }

        let list = entries.lists.entry(key.to_string()).or_default();
        list.extend(items);
        Ok(list.len())
    }

    async fn replace_if_unchanged(
        &self,
        key: &str,
        items: Vec<String>,
        generation: u64,
    ) -> Result<bool> {
        let mut entries = self.entries.write().await;

        let current = entries.generations.get(key).copied().unwrap_or(0);
        if current != generation {
            return Ok(false);
        }

        if items.is_empty() {
            entries.lists.remove(key);
        } else {
            entries.lists.insert(key.to_string(), items);
        }
        Ok(true)
    }
}

/// Turn inclusive, possibly negative indices into a slice range.
/// `None` means the range selects nothing.
fn resolve_range(len: usize, start: i64, end: i64) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }

    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let end = if end < 0 { len + end } else { end.min(len - 1) };

    if start > end || start >= len {
        return None;
    }

    Some((start as usize, end as usize))
}
