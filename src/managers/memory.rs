//! In-process LRU [`CacheBackend`], grounded on `http-cache`'s
//! `CACacheManager`/`MokaManager` shape but backed by the `lru` crate
//! instead of an external service — the natural choice for C2's L1, which
//! spec §4.2 describes as "small, fast, per-process".

use std::num::NonZeroUsize;
use std::sync::Mutex;

use async_trait::async_trait;
use lru::LruCache;

use crate::backend::CacheBackend;
use crate::error::{CacheError, Result};
use crate::http_value::HttpValue;

/// Bounded in-memory LRU cache.
///
/// Internally synchronous (`std::sync::Mutex` around an `lru::LruCache`) —
/// appropriate for an L1 whose whole point is to avoid any I/O latency.
pub struct MemoryBackend {
    inner: Mutex<LruCache<String, HttpValue>>,
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend").finish_non_exhaustive()
    }
}

impl MemoryBackend {
    /// Creates a new backend holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        let capacity =
            NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self { inner: Mutex::new(LruCache::new(capacity)) }
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// `true` if the backend holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<HttpValue>> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|e| CacheError::LockPoisoned(e.to_string()))?;
        Ok(guard.get(key).cloned())
    }

    async fn put(&self, key: &str, value: HttpValue) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|e| CacheError::LockPoisoned(e.to_string()))?;
        guard.put(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|e| CacheError::LockPoisoned(e.to_string()))?;
        guard.pop(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn value() -> HttpValue {
        HttpValue {
            body: b"hi".to_vec(),
            headers: Default::default(),
            status: 200,
            url: Url::parse("http://example.com/a").unwrap(),
            date_ms: 0,
            content_hash: None,
        }
    }

    #[tokio::test]
    async fn evicts_beyond_capacity() {
        let backend = MemoryBackend::new(1);
        backend.put("a", value()).await.unwrap();
        backend.put("b", value()).await.unwrap();
        assert!(backend.get("a").await.unwrap().is_none());
        assert!(backend.get("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let backend = MemoryBackend::new(4);
        backend.put("a", value()).await.unwrap();
        backend.delete("a").await.unwrap();
        assert!(backend.get("a").await.unwrap().is_none());
    }
}
