//! Shared in-memory [`CacheBackend`] built on [`moka`], ported from
//! `http-cache`'s `MokaManager`.

use std::sync::Arc;

use async_trait::async_trait;
use moka::future::Cache;
use serde::{Deserialize, Serialize};

use crate::backend::CacheBackend;
use crate::error::Result;
use crate::http_value::HttpValue;

/// Implements [`CacheBackend`] with [`moka::future::Cache`] as the backend.
#[derive(Clone)]
pub struct MokaBackend {
    cache: Arc<Cache<String, Arc<Vec<u8>>>>,
}

impl std::fmt::Debug for MokaBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaBackend").finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct Store {
    value: HttpValue,
}

impl MokaBackend {
    /// Wraps a pre-configured moka cache.
    pub fn new(cache: Cache<String, Arc<Vec<u8>>>) -> Self {
        Self { cache: Arc::new(cache) }
    }

    /// A moka cache with a fixed entry-count capacity.
    pub fn with_capacity(capacity: u64) -> Self {
        Self::new(Cache::new(capacity))
    }

    /// Wipes the entire cache.
    pub async fn clear(&self) -> Result<()> {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
        Ok(())
    }
}

impl Default for MokaBackend {
    fn default() -> Self {
        Self::with_capacity(10_000)
    }
}

#[async_trait]
impl CacheBackend for MokaBackend {
    async fn get(&self, key: &str) -> Result<Option<HttpValue>> {
        match self.cache.get(key).await {
            Some(bytes) => {
                let store: Store = postcard::from_bytes(&bytes)?;
                Ok(Some(store.value))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: HttpValue) -> Result<()> {
        let bytes = postcard::to_allocvec(&Store { value })?;
        self.cache.insert(key.to_string(), Arc::new(bytes)).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.cache.invalidate(key).await;
        Ok(())
    }
}
