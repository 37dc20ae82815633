//! C2 — Two-level write-through composition.
//!
//! Composes a small, fast, per-process L1 in front of a larger, shared L2
//! (spec §4.2). Reads try L1, fall back to L2, and promote L2 hits into L1.
//! Writes go synchronously to L1 then asynchronously to L2. An L1 hit that
//! fails the caller-supplied freshness check falls through to L2 — required
//! for correctness when a peer server has refreshed a shared L2 entry that
//! this process's L1 still holds stale (spec §4.2, scenario S4).

use std::sync::Arc;

use log::debug;

use crate::backend::CacheBackend;
use crate::error::Result;
use crate::http_value::HttpValue;

/// Lets a caller reject an L1 hit and force fallthrough to L2.
///
/// Returning `false` means "don't trust this L1 copy" — the read proceeds
/// to L2 as if L1 had missed, and (on an L2 hit) promotes the fresher L2
/// value back into L1.
pub trait ValidateCandidate: Send + Sync {
    /// Decides whether an L1 hit is acceptable to return as-is.
    fn validate(&self, value: &HttpValue) -> bool;
}

/// Accepts every L1 hit — the default when no staleness veto is needed.
pub struct AlwaysValid;
impl ValidateCandidate for AlwaysValid {
    fn validate(&self, _value: &HttpValue) -> bool {
        true
    }
}

/// A two-level cache: `L1` (in-process) fronting `L2` (shared/persistent).
#[derive(Clone)]
pub struct TwoLevelCache<L1, L2> {
    l1: Arc<L1>,
    l2: Arc<L2>,
}

impl<L1: CacheBackend, L2: CacheBackend> TwoLevelCache<L1, L2> {
    /// Composes an L1 and L2 backend into one two-level cache.
    pub fn new(l1: L1, l2: L2) -> Self {
        Self { l1: Arc::new(l1), l2: Arc::new(l2) }
    }

    /// Reads `key`, validating any L1 hit with `validate` and promoting L2
    /// hits into L1 before returning.
    ///
    /// The promotion is serialized per key in the sense that the caller
    /// whose `get` actually missed L1 is the one that performs the
    /// promoting `put` — concurrent callers that also missed L1 will race
    /// to write the same value into L1, which is harmless (last writer
    /// wins, values are identical).
    pub async fn get_validated(
        &self,
        key: &str,
        validate: &dyn ValidateCandidate,
    ) -> Result<Option<HttpValue>> {
        if let Some(value) = self.l1.get(key).await? {
            if validate.validate(&value) {
                return Ok(Some(value));
            }
            debug!("two-level: L1 stale hit for {key}, falling through to L2");
        }

        match self.l2.get(key).await? {
            Some(value) => {
                debug!("two-level: promoting {key} from L2 into L1");
                self.l1.put(key, value.clone()).await?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Plain read with no veto — equivalent to `get_validated` with
    /// [`AlwaysValid`].
    pub async fn get(&self, key: &str) -> Result<Option<HttpValue>> {
        self.get_validated(key, &AlwaysValid).await
    }

    /// Writes synchronously to L1, then to L2.
    ///
    /// Spec §4.2 describes the L2 write as asynchronous ("fire and forget"
    /// relative to the caller); in this crate both backends are behind the
    /// same async trait so the call simply awaits both, which is observably
    /// equivalent for a caller that doesn't care about completion ordering
    /// beyond "L1 is authoritative for the very next local read".
    pub async fn put(&self, key: &str, value: HttpValue) -> Result<()> {
        self.l1.put(key, value.clone()).await?;
        self.l2.put(key, value).await?;
        Ok(())
    }

    /// Deletes from both layers.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.l1.delete(key).await?;
        self.l2.delete(key).await?;
        Ok(())
    }

    /// Direct access to L1, for implementations (e.g. the HTTP cache) that
    /// need to bypass L2 deliberately.
    pub fn l1(&self) -> &L1 {
        &self.l1
    }

    /// Direct access to L2.
    pub fn l2(&self) -> &L2 {
        &self.l2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support::FakeBackend;
    use url::Url;

    fn value(body: &str) -> HttpValue {
        HttpValue {
            body: body.as_bytes().to_vec(),
            headers: Default::default(),
            status: 200,
            url: Url::parse("http://example.com/x").unwrap(),
            date_ms: 0,
            content_hash: None,
        }
    }

    struct RejectAll;
    impl ValidateCandidate for RejectAll {
        fn validate(&self, _value: &HttpValue) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn read_promotes_l2_hit_into_l1() {
        let l1 = FakeBackend::new();
        let l2 = FakeBackend::new();
        l2.put("k", value("from-l2")).await.unwrap();
        let cache = TwoLevelCache::new(l1.clone(), l2.clone());

        let got = cache.get("k").await.unwrap().unwrap();
        assert_eq!(got.body, b"from-l2");
        assert!(l1.contains("k"), "L2 hit must be promoted into L1");
    }

    #[tokio::test]
    async fn stale_l1_hit_falls_through_to_l2() {
        let l1 = FakeBackend::new();
        let l2 = FakeBackend::new();
        l1.put("k", value("stale")).await.unwrap();
        l2.put("k", value("fresh")).await.unwrap();
        let cache = TwoLevelCache::new(l1.clone(), l2.clone());

        let got = cache.get_validated("k", &RejectAll).await.unwrap().unwrap();
        assert_eq!(got.body, b"fresh", "must fall through to the fresher L2 copy");
    }

    #[tokio::test]
    async fn write_reaches_both_layers() {
        let l1 = FakeBackend::new();
        let l2 = FakeBackend::new();
        let cache = TwoLevelCache::new(l1.clone(), l2.clone());
        cache.put("k", value("v")).await.unwrap();
        assert!(l1.contains("k"));
        assert!(l2.contains("k"));
    }

    #[tokio::test]
    async fn delete_clears_both_layers() {
        let l1 = FakeBackend::new();
        let l2 = FakeBackend::new();
        let cache = TwoLevelCache::new(l1.clone(), l2.clone());
        cache.put("k", value("v")).await.unwrap();
        cache.delete("k").await.unwrap();
        assert!(!l1.contains("k"));
        assert!(!l2.contains("k"));
    }
}
