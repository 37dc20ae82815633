//! C8 — Metadata (rewrite-result) cache.
//!
//! Stores [`Partition`] records keyed by [`Fingerprint`], backed by C1/C2
//! like the HTTP cache but storing structured records rather than HTTP
//! responses (spec §4.8). Records are postcard-encoded into
//! [`HttpValue::body`] so this cache can reuse the same [`CacheBackend`]
//! implementations the HTTP cache does, without reusing any of C3's HTTP
//! semantics (freshness headers, sentinels, ETag synthesis don't apply
//! here).

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::backend::CacheBackend;
use crate::clock::Clock;
use crate::error::Result;
use crate::hasher::Hasher;
use crate::http_cache::{DefaultFreshnessPolicy, FindResult, HttpCache};
use crate::http_value::HttpValue;
use crate::resource::InputDescriptor;
use crate::stats::MetadataCacheStats;
use crate::two_level::TwoLevelCache;

/// The key a [`Partition`] is stored under: a hash of {ordered input URLs,
/// transformation id, options signature, optional user-agent bucket}
/// (spec §3 "Fingerprint").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    /// Computes a fingerprint. Input order matters and is NOT normalized —
    /// two invocations transforming the same URLs in a different order
    /// produce different fingerprints, since the transformation result can
    /// itself depend on input order (e.g. CSS combination). Hashing goes
    /// through the injected [`Hasher`] rather than calling `blake3`
    /// directly (spec §4.10 "the hasher").
    pub fn compute(
        input_urls: &[&str],
        transformation_id: &str,
        options_signature: &str,
        user_agent_bucket: Option<&str>,
        hasher: &dyn Hasher,
    ) -> Self {
        let mut buf = Vec::new();
        for url in input_urls {
            buf.extend_from_slice(url.as_bytes());
            buf.push(0);
        }
        buf.extend_from_slice(transformation_id.as_bytes());
        buf.push(0);
        buf.extend_from_slice(options_signature.as_bytes());
        if let Some(bucket) = user_agent_bucket {
            buf.push(0);
            buf.extend_from_slice(bucket.as_bytes());
        }
        Self(hasher.hash_hex(&buf))
    }
}

/// A metadata-cache record describing one rewrite outcome (spec §3
/// "Partition").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Partition {
    /// Descriptors for every input that contributed to this outcome.
    pub inputs: Vec<InputDescriptor>,
    /// Output URL(s) produced, empty if `optimizable` is false.
    pub outputs: Vec<String>,
    /// `false` memoizes "optimization did not help or could not run"
    /// (spec §4.8 "Outcome encoding") — still a valid cache entry.
    pub optimizable: bool,
    /// Per-filter opaque side data.
    pub filter_side_data: HashMap<String, String>,
    /// When this partition was written, for staleness-threshold grace.
    pub written_at_ms: i64,
}

/// Outcome of [`MetadataCache::read`].
#[derive(Debug, Clone)]
pub enum MetadataLookup {
    /// Every input validated; safe to use `partition.outputs` directly.
    Hit(Partition),
    /// At least one input failed validation, but the partition is within
    /// the staleness threshold: serve it while a refresh is queued.
    StaleHit(Partition),
    /// No usable partition.
    Miss,
}

/// Validates every input of `partition` against the HTTP cache: present,
/// unexpired, and (if a content hash was recorded) still hashing to that
/// value (spec §4.8 step 2, spec §8 invariant 2).
pub async fn validate_partition<L1, L2>(
    partition: &Partition,
    http_cache: &HttpCache<L1, L2>,
    fragment: &str,
    now_ms: i64,
    hasher: &dyn Hasher,
) -> Result<bool>
where
    L1: CacheBackend,
    L2: CacheBackend,
{
    let policy = DefaultFreshnessPolicy;
    for input in &partition.inputs {
        let Some(url) = &input.url else { continue };
        if now_ms >= input.expiration_ms {
            return Ok(false);
        }
        match http_cache.find(url, fragment, &policy).await? {
            FindResult::Found(value) => {
                if let Some(expected_hash) = &input.content_hash {
                    let actual = hasher.hash_hex(&value.body);
                    if &actual != expected_hash {
                        return Ok(false);
                    }
                }
            }
            _ => return Ok(false),
        }
    }
    Ok(true)
}

/// C8: metadata/rewrite-result cache.
pub struct MetadataCache<L1, L2> {
    cache: TwoLevelCache<L1, L2>,
    clock: Arc<dyn Clock>,
    hasher: Arc<dyn Hasher>,
    staleness_threshold_ms: i64,
    stats: MetadataCacheStats,
}

fn dummy_metadata_url(fingerprint: &str) -> Url {
    // Partitions have no real URL; a "metadata:" scheme placeholder keeps
    // `HttpValue` usable as the generic envelope without implying any HTTP
    // semantics apply to this entry.
    Url::parse(&format!("metadata:{fingerprint}")).expect("fingerprint is a valid urn path")
}

impl<L1: CacheBackend, L2: CacheBackend> MetadataCache<L1, L2> {
    /// Composes an L1/L2 pair into a metadata cache.
    pub fn new(
        l1: L1,
        l2: L2,
        clock: Arc<dyn Clock>,
        hasher: Arc<dyn Hasher>,
        staleness_threshold_ms: i64,
    ) -> Self {
        Self {
            cache: TwoLevelCache::new(l1, l2),
            clock,
            hasher,
            staleness_threshold_ms,
            stats: MetadataCacheStats::default(),
        }
    }

    /// Counters for this cache instance.
    pub fn stats(&self) -> &MetadataCacheStats {
        &self.stats
    }

    async fn get_partition(&self, fingerprint: &Fingerprint) -> Result<Option<Partition>> {
        let Some(raw) = self.cache.get(&fingerprint.0).await? else {
            return Ok(None);
        };
        let partition: Partition = postcard::from_bytes(&raw.body)?;
        Ok(Some(partition))
    }

    /// Stores `partition` under `fingerprint` (spec §4.8 step 4).
    pub async fn store(&self, fingerprint: &Fingerprint, partition: Partition) -> Result<()> {
        let body = postcard::to_allocvec(&partition)?;
        let value = HttpValue {
            body,
            headers: HashMap::new(),
            status: 200,
            url: dummy_metadata_url(&fingerprint.0),
            date_ms: partition.written_at_ms,
            content_hash: None,
        };
        self.cache.put(&fingerprint.0, value).await
    }

    /// Looks up `fingerprint`, validating every input against `http_cache`
    /// (spec §4.8 step 2).
    pub async fn read<HL1, HL2>(
        &self,
        fingerprint: &Fingerprint,
        http_cache: &HttpCache<HL1, HL2>,
        fragment: &str,
    ) -> Result<MetadataLookup>
    where
        HL1: CacheBackend,
        HL2: CacheBackend,
    {
        let now_ms = self.clock.now_ms();
        let Some(partition) = self.get_partition(fingerprint).await? else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(MetadataLookup::Miss);
        };

        if validate_partition(&partition, http_cache, fragment, now_ms, self.hasher.as_ref()).await? {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(MetadataLookup::Hit(partition));
        }

        if now_ms - partition.written_at_ms <= self.staleness_threshold_ms {
            self.stats.stale_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(MetadataLookup::StaleHit(partition));
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        Ok(MetadataLookup::Miss)
    }

    /// Deletes any partition stored under `fingerprint`.
    pub async fn delete(&self, fingerprint: &Fingerprint) -> Result<()> {
        self.cache.delete(&fingerprint.0).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::hasher::Blake3Hasher;
    use crate::http_cache::HttpCacheOptions;
    use crate::managers::memory::MemoryBackend;

    fn partition(written_at_ms: i64) -> Partition {
        Partition {
            inputs: Vec::new(),
            outputs: vec!["http://example.com/a.pagespeed.ce.hash.css".to_string()],
            optimizable: true,
            filter_side_data: HashMap::new(),
            written_at_ms,
        }
    }

    #[tokio::test]
    async fn store_then_read_with_no_inputs_is_a_hit() {
        let clock = Arc::new(FixedClock::new(0));
        let hasher: Arc<dyn Hasher> = Arc::new(Blake3Hasher);
        let meta = MetadataCache::new(
            MemoryBackend::new(16),
            MemoryBackend::new(16),
            clock.clone(),
            hasher.clone(),
            0,
        );
        let http_cache = HttpCache::new(
            MemoryBackend::new(16),
            MemoryBackend::new(16),
            clock.clone(),
            HttpCacheOptions::default(),
        );
        let fp = Fingerprint::compute(&["http://example.com/a.css"], "ce", "sig", None, hasher.as_ref());
        meta.store(&fp, partition(0)).await.unwrap();
        match meta.read(&fp, &http_cache, "example.com").await.unwrap() {
            MetadataLookup::Hit(p) => assert!(p.optimizable),
            other => panic!("expected Hit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_fingerprint_is_a_miss() {
        let clock = Arc::new(FixedClock::new(0));
        let hasher: Arc<dyn Hasher> = Arc::new(Blake3Hasher);
        let meta = MetadataCache::new(
            MemoryBackend::new(16),
            MemoryBackend::new(16),
            clock.clone(),
            hasher.clone(),
            0,
        );
        let http_cache = HttpCache::new(
            MemoryBackend::new(16),
            MemoryBackend::new(16),
            clock,
            HttpCacheOptions::default(),
        );
        let fp = Fingerprint::compute(&["http://example.com/a.css"], "ce", "sig", None, hasher.as_ref());
        assert!(matches!(
            meta.read(&fp, &http_cache, "example.com").await.unwrap(),
            MetadataLookup::Miss
        ));
    }

    #[test]
    fn fingerprint_is_stable_for_identical_inputs() {
        let hasher = Blake3Hasher;
        let a = Fingerprint::compute(&["http://example.com/a.css"], "ce", "sig", None, &hasher);
        let b = Fingerprint::compute(&["http://example.com/a.css"], "ce", "sig", None, &hasher);
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_changes_with_input_order() {
        let hasher = Blake3Hasher;
        let a = Fingerprint::compute(&["a", "b"], "ce", "sig", None, &hasher);
        let b = Fingerprint::compute(&["b", "a"], "ce", "sig", None, &hasher);
        assert_ne!(a, b);
    }
}
