//! C1 — Cache backend abstraction.
//!
//! A single async contract (`get`/`put`/`delete`) over heterogeneous stores,
//! generalized from `http-cache`'s `CacheManager` trait. No HTTP semantics
//! live here — that's C3 ([`crate::http_cache`]). Implementations must
//! tolerate concurrent calls from arbitrary tasks/threads; the composed
//! two-level cache (C2, [`crate::two_level`]) relies on that.

use async_trait::async_trait;

use crate::error::Result;
use crate::http_value::HttpValue;

/// Uniform async store used by every cache layer in this crate.
///
/// `get`/`put`/`delete` each resolve exactly once. Implementations own their
/// own eviction and size policy; callers must tolerate an entry vanishing
/// between a successful `put` and the next `get` (spec §9).
#[async_trait]
pub trait CacheBackend: Send + Sync + 'static {
    /// Fetches the raw value stored under `key`, if present.
    async fn get(&self, key: &str) -> Result<Option<HttpValue>>;
    /// Stores `value` under `key`, overwriting any prior entry.
    async fn put(&self, key: &str, value: HttpValue) -> Result<()>;
    /// Removes any entry stored under `key`. Not an error if absent.
    async fn delete(&self, key: &str) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use dashmap::DashMap;
    use std::sync::Arc;

    /// An in-memory [`CacheBackend`] used as a test double for both L1 and
    /// L2 layers. Not exported; production backends live under
    /// [`crate::managers`].
    #[derive(Debug, Clone, Default)]
    pub struct FakeBackend {
        map: Arc<DashMap<String, HttpValue>>,
        /// Calls observed, in order, for assertions about fallthrough.
        pub gets: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl FakeBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn contains(&self, key: &str) -> bool {
            self.map.contains_key(key)
        }

        pub fn len(&self) -> usize {
            self.map.len()
        }
    }

    #[async_trait]
    impl CacheBackend for FakeBackend {
        async fn get(&self, key: &str) -> Result<Option<HttpValue>> {
            self.gets.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(self.map.get(key).map(|v| v.clone()))
        }

        async fn put(&self, key: &str, value: HttpValue) -> Result<()> {
            self.map.insert(key.to_string(), value);
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.map.remove(key);
            Ok(())
        }
    }
}
