//! Cache port
//!
//! Consumed by callers around pipeline operations; the pipeline itself never
//! reads or writes the cache.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Tagged key/value cache
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Option<serde_json::Value>;

    /// Store a value under `key`, associated with every tag in `tags`
    async fn put(&self, key: &str, value: serde_json::Value, tags: &[&str]);

    /// Remove entries carrying `tag`, or everything when `tag` is `None`
    ///
    /// Returns the number of entries removed.
    async fn clear(&self, tag: Option<&str>) -> usize;
}

/// `remember` for any cache
#[async_trait]
pub trait CacheExt: Cache {
    /// Return the cached value, or run `producer` and cache its result
    ///
    /// Errors from `producer` are returned and nothing is cached.
    async fn remember<F, Fut>(&self, key: &str, tags: &[&str], producer: F) -> Result<serde_json::Value>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<serde_json::Value>> + Send,
    {
        if let Some(hit) = self.get(key).await {
            tracing::trace!(key = %key, "Cache hit");
            return Ok(hit);
        }
        let value = producer().await?;
        self.put(key, value.clone(), tags).await;
        Ok(value)
    }
}

impl<C: Cache + ?Sized> CacheExt for C {}

struct CacheEntry {
    value: serde_json::Value,
    tags: HashSet<String>,
}

/// In-memory cache for development and testing
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.read().await.get(key).map(|e| e.value.clone())
    }

    async fn put(&self, key: &str, value: serde_json::Value, tags: &[&str]) {
        let entry = CacheEntry {
            value,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        };
        self.entries.write().await.insert(key.to_string(), entry);
    }

    async fn clear(&self, tag: Option<&str>) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        match tag {
            Some(tag) => entries.retain(|_, e| !e.tags.contains(tag)),
            None => entries.clear(),
        }
        let removed = before - entries.len();
        tracing::debug!(tag = ?tag, removed, "Cache cleared");
        removed
    }
}
