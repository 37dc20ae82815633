//! C3 — HTTP cache: the HTTP-semantic layer over the two-level cache (C2).
//!
//! Keys are composed as `version-prefix/fragment/url` (spec §3, §4.3);
//! `fragment` is typically the request `Host` so tenants sharing one backend
//! don't poison each other's entries, and `version-prefix` is a global
//! epoch bumped to invalidate everything in O(1) (spec §8 invariant 6).
//!
//! Freshness itself is computed from `Cache-Control`/`Expires` the way
//! `http-cache`'s `HttpCache::run` drives `http-cache-semantics`'s
//! `CachePolicy`; this module stays a level below full request/response
//! orchestration (that's the fetcher/session's job) and exposes the
//! primitives spec §4.3 names: `find`, `put`, `remember_failure`, and the
//! conditional-refresh helpers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use log::{debug, trace, warn};
use url::Url;

use crate::backend::CacheBackend;
use crate::clock::Clock;
use crate::error::Result;
use crate::http_value::{FailureKind, HitOrMiss, HttpValue};
use crate::stats::HttpCacheStats;
use crate::two_level::{TwoLevelCache, ValidateCandidate};

const DEFAULT_TTL_MS: i64 = 300_000;
const LOAD_SHED_TTL_MS: i64 = 10_000;

/// Per-[`FailureKind`] memoization TTL (spec §4.3 "Remember-failure"),
/// grounded on `original_source/net/instaweb/http/public/http_cache.h`'s
/// `remember_failure_policy_` table.
#[derive(Debug, Clone)]
pub struct RememberFailurePolicy {
    ttl_ms: HashMap<FailureKind, i64>,
}

impl Default for RememberFailurePolicy {
    fn default() -> Self {
        let mut ttl_ms = HashMap::new();
        ttl_ms.insert(FailureKind::Dropped, LOAD_SHED_TTL_MS);
        for kind in [
            FailureKind::Fetch4xx,
            FailureKind::UncacheableOk,
            FailureKind::UncacheableError,
            FailureKind::Empty,
            FailureKind::OtherError,
            FailureKind::NotCacheable,
        ] {
            ttl_ms.insert(kind, DEFAULT_TTL_MS);
        }
        Self { ttl_ms }
    }
}

impl RememberFailurePolicy {
    /// TTL, in milliseconds, a sentinel for `kind` should be remembered.
    pub fn ttl_ms(&self, kind: FailureKind) -> i64 {
        *self.ttl_ms.get(&kind).unwrap_or(&DEFAULT_TTL_MS)
    }

    /// Overrides the TTL for one kind.
    pub fn set_ttl_ms(&mut self, kind: FailureKind, ttl_ms: i64) {
        self.ttl_ms.insert(kind, ttl_ms);
    }
}

/// Outcome of [`HttpCache::find`] (spec §4.3 "Find").
#[derive(Debug, Clone)]
pub enum FindResult {
    /// A valid, fresh entry.
    Found(HttpValue),
    /// No usable entry and no memoized failure.
    NotFound,
    /// Expired but within the staleness threshold: the caller should treat
    /// this as a miss for refresh-scheduling purposes while still having a
    /// value on hand to serve as a fallback (spec §4.3 step 5).
    NotFoundWithFallback(HttpValue),
    /// A sentinel written by [`HttpCache::remember_failure`] is still
    /// within its memoization window.
    RecentFailure(FailureKind),
}

/// Caller-supplied veto hooks for a single `find` (spec §4.3 step 4:
/// "IsCacheValid" and "IsFresh").
pub trait FreshnessPolicy: Send + Sync {
    /// Invalidation-timestamp veto: `false` forces a miss regardless of TTL
    /// (e.g. the entry predates a config reload epoch).
    fn is_cache_valid(&self, _value: &HttpValue) -> bool {
        true
    }

    /// Proactive-freshening veto, layered on top of header-derived
    /// freshness: `false` treats an otherwise-fresh entry as expired.
    fn is_fresh(&self, value: &HttpValue, now_ms: i64) -> bool {
        header_is_fresh(value, now_ms)
    }
}

/// The default policy: header-derived freshness only, no extra vetoes.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFreshnessPolicy;
impl FreshnessPolicy for DefaultFreshnessPolicy {}

/// `If-None-Match`/`If-Modified-Since` pair for a conditional refresh.
#[derive(Debug, Default, Clone)]
pub struct ConditionalHeaders {
    /// Value for `If-None-Match`, if the stored entry carried an `ETag`.
    pub if_none_match: Option<String>,
    /// Value for `If-Modified-Since`, if the stored entry carried
    /// `Last-Modified`.
    pub if_modified_since: Option<String>,
}

/// Tunables for one [`HttpCache`] instance (spec §6 "Configuration
/// surface").
#[derive(Debug, Clone)]
pub struct HttpCacheOptions {
    /// Grace window (ms) after expiry during which a stale entry may still
    /// be served as a fallback while a refresh is triggered.
    pub staleness_threshold_ms: i64,
    /// Largest response body `put` will accept. `-1` means unlimited.
    pub max_cacheable_response_content_length: i64,
    /// If set, `put` silently drops entries with an error status instead of
    /// caching them.
    pub ignore_failure_puts: bool,
    /// If set, `put` bypasses the proxy-cacheability check.
    pub force_caching: bool,
    /// If set, `text/html` responses fetched over `https` are never cached.
    pub disable_html_caching_on_https: bool,
    /// Per-[`FailureKind`] memoization TTL table.
    pub remember_failure_policy: RememberFailurePolicy,
}

impl Default for HttpCacheOptions {
    fn default() -> Self {
        Self {
            staleness_threshold_ms: 0,
            max_cacheable_response_content_length: -1,
            ignore_failure_puts: false,
            force_caching: false,
            disable_html_caching_on_https: false,
            remember_failure_policy: RememberFailurePolicy::default(),
        }
    }
}

/// HTTP-semantic cache over an [`L1`, `L2`] [`TwoLevelCache`].
pub struct HttpCache<L1, L2> {
    cache: TwoLevelCache<L1, L2>,
    clock: Arc<dyn Clock>,
    version_prefix: AtomicU64,
    options: HttpCacheOptions,
    stats: HttpCacheStats,
}

struct FreshnessCandidate<'a> {
    policy: &'a dyn FreshnessPolicy,
    now_ms: i64,
}

impl ValidateCandidate for FreshnessCandidate<'_> {
    fn validate(&self, value: &HttpValue) -> bool {
        // Sentinels are never subject to freshness fallthrough; `find`
        // classifies them itself after the two-level lookup returns.
        if value.sentinel_kind().is_some() {
            return true;
        }
        self.policy.is_cache_valid(value) && self.policy.is_fresh(value, self.now_ms)
    }
}

impl<L1: CacheBackend, L2: CacheBackend> HttpCache<L1, L2> {
    /// Composes an L1/L2 pair into an HTTP cache.
    pub fn new(
        l1: L1,
        l2: L2,
        clock: Arc<dyn Clock>,
        options: HttpCacheOptions,
    ) -> Self {
        Self {
            cache: TwoLevelCache::new(l1, l2),
            clock,
            version_prefix: AtomicU64::new(0),
            options,
            stats: HttpCacheStats::default(),
        }
    }

    /// Counters for this cache instance.
    pub fn stats(&self) -> &HttpCacheStats {
        &self.stats
    }

    /// Bumps the global epoch, making every prior entry unreachable via
    /// `find` without touching the backing store (spec §8 invariant 6).
    pub fn bump_version_prefix(&self) -> u64 {
        self.version_prefix.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Builds the composite key `version-prefix/fragment/key`.
    pub fn composite_key(&self, fragment: &str, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.version_prefix.load(Ordering::SeqCst),
            fragment,
            key
        )
    }

    /// Looks up `key` within `fragment`, applying `policy`'s veto hooks.
    pub async fn find(
        &self,
        key: &str,
        fragment: &str,
        policy: &dyn FreshnessPolicy,
    ) -> Result<FindResult> {
        let composite = self.composite_key(fragment, key);
        let now_ms = self.clock.now_ms();
        trace!("http_cache: find {composite}");

        let candidate = FreshnessCandidate { policy, now_ms };
        let raw = self.cache.get_validated(&composite, &candidate).await?;

        let Some(value) = raw else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(FindResult::NotFound);
        };

        if let Some(kind) = value.sentinel_kind() {
            let ttl = self.options.remember_failure_policy.ttl_ms(kind);
            if now_ms < value.date_ms + ttl {
                self.stats.remembered_failures.fetch_add(1, Ordering::Relaxed);
                return Ok(FindResult::RecentFailure(kind));
            }
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(FindResult::NotFound);
        }

        if value.needs_sanitizing() {
            warn!("http_cache: {composite} carried hop-by-hop headers, treating as miss");
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(FindResult::NotFound);
        }

        if !policy.is_cache_valid(&value) {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(FindResult::NotFound);
        }

        let mut value = value;
        value.sanitize();

        if policy.is_fresh(&value, now_ms) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(FindResult::Found(value));
        }

        let expires_ms = header_expires_ms(&value).unwrap_or(value.date_ms);
        let stale_for_ms = now_ms - expires_ms;
        if stale_for_ms <= self.options.staleness_threshold_ms {
            debug!("http_cache: {composite} stale by {stale_for_ms}ms, serving as fallback");
            self.stats.fallback_hits.fetch_add(1, Ordering::Relaxed);
            Ok(FindResult::NotFoundWithFallback(value))
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            Ok(FindResult::NotFound)
        }
    }

    /// `true` if a response for `url` with the given content type is
    /// eligible for caching at all (scheme and HTML-over-HTTPS policy).
    pub fn may_cache_url(&self, url: &Url, content_type: Option<&str>) -> bool {
        if url.scheme() != "http" && url.scheme() != "https" {
            return false;
        }
        if self.options.disable_html_caching_on_https
            && url.scheme() == "https"
            && content_type.is_some_and(|ct| ct.starts_with("text/html"))
        {
            return false;
        }
        true
    }

    /// Stores `value` under `key`/`fragment`, applying spec §4.3's "Put"
    /// acceptance rules. Rejections are silent (not an error): the caller
    /// already has the response in hand and simply won't see it cached.
    pub async fn put(
        &self,
        key: &str,
        fragment: &str,
        mut value: HttpValue,
    ) -> Result<()> {
        let composite = self.composite_key(fragment, key);

        if self.options.ignore_failure_puts
            && value.sentinel_kind().is_none()
            && (400..600).contains(&value.status)
        {
            self.stats.insert_rejections.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        if value.sentinel_kind().is_none() {
            let content_type = value.header("content-type").map(str::to_string);
            if !self.may_cache_url(&value.url, content_type.as_deref()) {
                self.stats.insert_rejections.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }

            if !self.options.force_caching && !is_proxy_cacheable(&value) {
                self.stats.insert_rejections.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }

            let limit = self.options.max_cacheable_response_content_length;
            if limit >= 0 && value.body.len() as i64 > limit {
                self.stats.insert_rejections.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }

            value.sanitize();
            if value.header("etag").is_none() {
                let hash = blake3::hash(&value.body);
                value.set_header("etag", format!("W/\"PSA-{}\"", hash.to_hex()));
            }
            value.date_ms = self.clock.now_ms();
        }

        self.cache.put(&composite, value).await?;
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes a synthetic "recent failure" sentinel (spec §4.3
    /// "Remember-failure").
    pub async fn remember_failure(
        &self,
        key: &str,
        fragment: &str,
        url: Url,
        kind: FailureKind,
    ) -> Result<()> {
        let composite = self.composite_key(fragment, key);
        let now_ms = self.clock.now_ms();
        debug!("http_cache: remembering failure {kind:?} for {composite}");
        self.cache
            .put(&composite, HttpValue::sentinel(kind, url, now_ms))
            .await?;
        Ok(())
    }

    /// Deletes any entry stored under `key`/`fragment`.
    pub async fn delete(&self, key: &str, fragment: &str) -> Result<()> {
        let composite = self.composite_key(fragment, key);
        self.cache.delete(&composite).await
    }

    /// Builds the `If-None-Match`/`If-Modified-Since` pair a fetcher should
    /// send when revalidating `value` (spec §4.3 "Conditional refresh").
    pub fn conditional_headers(&self, value: &HttpValue) -> ConditionalHeaders {
        ConditionalHeaders {
            if_none_match: value.header("etag").map(str::to_string),
            if_modified_since: value.header("last-modified").map(str::to_string),
        }
    }

    /// Applies a 304 response to a stale cached entry: headers are
    /// replaced, the body is reused verbatim, and `num_conditional_refreshes`
    /// is incremented. Returns the refreshed value and re-stores it.
    pub async fn complete_conditional_refresh(
        &self,
        key: &str,
        fragment: &str,
        mut cached: HttpValue,
        fresh_headers: &http::response::Parts,
    ) -> Result<HttpValue> {
        cached.remove_warning();
        cached.update_headers(fresh_headers)?;
        cached.date_ms = self.clock.now_ms();
        self.stats.num_conditional_refreshes.fetch_add(1, Ordering::Relaxed);
        let composite = self.composite_key(fragment, key);
        self.cache.put(&composite, cached.clone()).await?;
        Ok(cached)
    }

    /// Records a `111 Revalidation failed` warning on a stale entry whose
    /// revalidation attempt couldn't reach the origin, and marks it HIT so
    /// callers serving it know it's stale-but-best-effort.
    pub fn mark_revalidation_failed(&self, value: &mut HttpValue, host: &str) {
        value.add_warning(host, 111, "Revalidation failed");
        value.set_cache_status(HitOrMiss::Hit);
    }
}

fn parse_max_age_secs(cache_control: &str) -> Option<i64> {
    cache_control.split(',').find_map(|directive| {
        let directive = directive.trim();
        directive.strip_prefix("max-age=")?.parse::<i64>().ok()
    })
}

fn header_expires_ms(value: &HttpValue) -> Option<i64> {
    if let Some(cc) = value.header("cache-control") {
        if let Some(max_age) = parse_max_age_secs(cc) {
            return Some(value.date_ms + max_age * 1000);
        }
    }
    let expires = value.header("expires")?;
    let parsed = httpdate::parse_http_date(expires).ok()?;
    let ms = parsed.duration_since(UNIX_EPOCH).ok()?.as_millis() as i64;
    Some(ms)
}

fn header_is_fresh(value: &HttpValue, now_ms: i64) -> bool {
    if let Some(cc) = value.header("cache-control") {
        let lower = cc.to_ascii_lowercase();
        if lower.contains("no-store") || lower.contains("no-cache") {
            return false;
        }
    }
    match header_expires_ms(value) {
        Some(expires_ms) => now_ms < expires_ms,
        // No freshness information at all: conservatively treat as stale
        // rather than caching indefinitely.
        None => false,
    }
}

fn is_proxy_cacheable(value: &HttpValue) -> bool {
    if let Some(cc) = value.header("cache-control") {
        let lower = cc.to_ascii_lowercase();
        if lower.contains("no-store") || lower.contains("private") {
            return false;
        }
    }
    if value.header("vary").is_some_and(|v| v.trim() == "*") {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::managers::memory::MemoryBackend;

    fn cache() -> HttpCache<MemoryBackend, MemoryBackend> {
        HttpCache::new(
            MemoryBackend::new(16),
            MemoryBackend::new(16),
            Arc::new(FixedClock::new(0)),
            HttpCacheOptions::default(),
        )
    }

    fn fresh_value(body: &str, max_age_secs: i64) -> HttpValue {
        let mut v = HttpValue {
            body: body.as_bytes().to_vec(),
            headers: Default::default(),
            status: 200,
            url: Url::parse("http://example.com/a.css").unwrap(),
            date_ms: 0,
            content_hash: None,
        };
        v.set_header("cache-control", format!("max-age={max_age_secs}"));
        v
    }

    #[tokio::test]
    async fn cold_miss_then_hit_after_put() {
        let cache = cache();
        let policy = DefaultFreshnessPolicy;
        assert!(matches!(
            cache.find("a.css", "example.com", &policy).await.unwrap(),
            FindResult::NotFound
        ));
        cache.put("a.css", "example.com", fresh_value("body", 3600)).await.unwrap();
        match cache.find("a.css", "example.com", &policy).await.unwrap() {
            FindResult::Found(v) => assert_eq!(v.body, b"body"),
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn remembered_failure_expires_after_ttl() {
        let clock = Arc::new(FixedClock::new(0));
        let cache = HttpCache::new(
            MemoryBackend::new(16),
            MemoryBackend::new(16),
            clock.clone(),
            HttpCacheOptions::default(),
        );
        let url = Url::parse("http://example.com/a.css").unwrap();
        cache
            .remember_failure("a.css", "example.com", url, FailureKind::Fetch4xx)
            .await
            .unwrap();

        let policy = DefaultFreshnessPolicy;
        match cache.find("a.css", "example.com", &policy).await.unwrap() {
            FindResult::RecentFailure(FailureKind::Fetch4xx) => {}
            other => panic!("expected RecentFailure, got {other:?}"),
        }

        // 20-year jump (spec scenario S2): the sentinel's 300s TTL has long
        // since elapsed, so it reads as a plain miss.
        clock.advance_ms(20 * 365 * 24 * 60 * 60 * 1000);
        assert!(matches!(
            cache.find("a.css", "example.com", &policy).await.unwrap(),
            FindResult::NotFound
        ));
    }

    #[tokio::test]
    async fn expired_within_threshold_serves_fallback() {
        let clock = Arc::new(FixedClock::new(0));
        let mut options = HttpCacheOptions::default();
        options.staleness_threshold_ms = 10_000;
        let cache = HttpCache::new(
            MemoryBackend::new(16),
            MemoryBackend::new(16),
            clock.clone(),
            options,
        );
        cache.put("a.css", "example.com", fresh_value("body", 1)).await.unwrap();
        clock.advance_ms(5_000);
        let policy = DefaultFreshnessPolicy;
        match cache.find("a.css", "example.com", &policy).await.unwrap() {
            FindResult::NotFoundWithFallback(v) => assert_eq!(v.body, b"body"),
            other => panic!("expected NotFoundWithFallback, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_beyond_threshold_is_plain_miss() {
        let clock = Arc::new(FixedClock::new(0));
        let cache = HttpCache::new(
            MemoryBackend::new(16),
            MemoryBackend::new(16),
            clock.clone(),
            HttpCacheOptions::default(),
        );
        cache.put("a.css", "example.com", fresh_value("body", 1)).await.unwrap();
        clock.advance_ms(5_000);
        let policy = DefaultFreshnessPolicy;
        assert!(matches!(
            cache.find("a.css", "example.com", &policy).await.unwrap(),
            FindResult::NotFound
        ));
    }

    #[tokio::test]
    async fn version_prefix_bump_invalidates_everything() {
        let cache = cache();
        cache.put("a.css", "example.com", fresh_value("body", 3600)).await.unwrap();
        cache.bump_version_prefix();
        let policy = DefaultFreshnessPolicy;
        assert!(matches!(
            cache.find("a.css", "example.com", &policy).await.unwrap(),
            FindResult::NotFound
        ));
    }

    #[tokio::test]
    async fn etag_synthesized_when_origin_omits_one() {
        let cache = cache();
        cache.put("a.css", "example.com", fresh_value("body", 3600)).await.unwrap();
        let policy = DefaultFreshnessPolicy;
        let FindResult::Found(v) = cache.find("a.css", "example.com", &policy).await.unwrap()
        else {
            panic!("expected hit");
        };
        assert!(v.header("etag").unwrap().starts_with("W/\"PSA-"));
    }

    #[tokio::test]
    async fn etag_preserved_when_origin_supplies_one() {
        let cache = cache();
        let mut v = fresh_value("body", 3600);
        v.set_header("etag", "\"origin-etag\"");
        cache.put("a.css", "example.com", v).await.unwrap();
        let policy = DefaultFreshnessPolicy;
        let FindResult::Found(v) = cache.find("a.css", "example.com", &policy).await.unwrap()
        else {
            panic!("expected hit");
        };
        assert_eq!(v.header("etag"), Some("\"origin-etag\""));
    }
}
