//! Disk-backed [`CacheBackend`] built on [`cacache`], the same crate
//! `http-cache`'s `CACacheManager` uses — ported here to the simpler
//! key/value [`crate::http_value::HttpValue`] contract instead of the
//! request-keyed `(method, url)` one `CACacheManager` used, since this
//! crate's callers (the two-level HTTP cache and the metadata cache) always
//! hand in a fully-composed string key already.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backend::CacheBackend;
use crate::error::Result;
use crate::http_value::HttpValue;

/// Implements [`CacheBackend`] with [`cacache`] as the on-disk store.
#[derive(Debug, Clone)]
pub struct CaCacheBackend {
    /// Directory the cache is rooted at.
    pub path: String,
}

impl CaCacheBackend {
    /// Creates a backend rooted at `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// Wipes the entire on-disk cache.
    pub async fn clear(&self) -> Result<()> {
        cacache::clear(&self.path).await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct Store {
    value: HttpValue,
}

#[async_trait]
impl CacheBackend for CaCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<HttpValue>> {
        match cacache::read(&self.path, key).await {
            Ok(bytes) => {
                let store: Store = postcard::from_bytes(&bytes)?;
                Ok(Some(store.value))
            }
            // A missing or corrupt entry degrades to a miss rather than an
            // error (spec §7, "cache invalidation failures degrade to MISS
            // silently"); the stale bytes are overwritten on the next put.
            Err(_) => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: HttpValue) -> Result<()> {
        let bytes = postcard::to_allocvec(&Store { value })?;
        cacache::write(&self.path, key, bytes).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        cacache::remove(&self.path, key).await?;
        Ok(())
    }
}
