//! C9 — Rewrite session: per-request state spawned from a
//! [`crate::server_context::ServerContext`] (spec §4.9).
//!
//! Derives the effective [`RewriteOptions`] for one request, builds (or
//! reuses, if pooled) the corresponding [`FilterChain`], and owns the
//! refcounted map of [`Resource`]s created while the request is being
//! rewritten.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use url::Url;

use crate::backend::CacheBackend;
use crate::error::Result;
use crate::hasher::Hasher;
use crate::options::{options_signature, QueryParamScanner, RewriteOptions};
use crate::resource::Resource;
use crate::server_context::{ServerContext, WorkerPool};
use crate::url_codec::NamingContext;

/// The ordered set of filters a session runs with, derived once from a
/// signature's options and reusable across every session that shares that
/// signature (spec §4.9 step 5 "pooled reuse").
#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    /// Enabled filter ids, in sorted order.
    pub enabled_filters: Vec<String>,
}

impl FilterChain {
    /// Builds a filter chain from `options`'s enabled-filter set.
    pub fn build(options: &RewriteOptions) -> Self {
        let mut enabled: Vec<String> = options
            .filter_enabled
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(id, _)| id.clone())
            .collect();
        enabled.sort();
        Self { enabled_filters: enabled }
    }
}

/// A free-list of built [`FilterChain`]s keyed by options-signature, so a
/// server handling many requests with identical options doesn't rebuild the
/// same chain per request (spec §4.9 step 5).
#[derive(Default)]
pub struct SessionPool {
    free_list: DashMap<String, Vec<FilterChain>>,
}

impl SessionPool {
    /// An empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a previously-released chain for `options`'s signature, or
    /// builds a fresh one.
    pub fn acquire(&self, options: &RewriteOptions, hasher: &dyn Hasher) -> FilterChain {
        let signature = options_signature(options, hasher);
        if let Some(mut free) = self.free_list.get_mut(&signature) {
            if let Some(chain) = free.pop() {
                return chain;
            }
        }
        FilterChain::build(options)
    }

    /// Returns a chain to the pool for the given `options`'s signature.
    pub fn release(&self, options: &RewriteOptions, hasher: &dyn Hasher, chain: FilterChain) {
        let signature = options_signature(options, hasher);
        self.free_list.entry(signature).or_default().push(chain);
    }
}

/// Per-request state for one rewrite (spec §3 "RewriteSession").
pub struct RewriteSession<L1, L2, ML1, ML2> {
    /// The process-wide registry this session was spawned from.
    pub context: Arc<ServerContext<L1, L2, ML1, ML2>>,
    /// This request's fully-derived options.
    pub options: RewriteOptions,
    /// `options`'s signature — the options-hash component of cache keys.
    pub signature: String,
    /// The HTML request's own URL, used as the fragment/base for resources
    /// resolved relative to it.
    pub request_url: Url,
    /// The filter chain this session runs with.
    pub filter_chain: FilterChain,
    resources: DashMap<String, Arc<Mutex<Resource>>>,
    pooled: bool,
}

impl<L1, L2, ML1, ML2> RewriteSession<L1, L2, ML1, ML2>
where
    L1: CacheBackend,
    L2: CacheBackend,
    ML1: CacheBackend,
    ML2: CacheBackend,
{
    /// Derives this request's effective options (spec §4.9 steps 1-4):
    /// start from the baseline (or a domain-specific override, if one
    /// applies), overlay query/header/cookie `PageSpeed*` directives, then
    /// disable filters unsafe to run on an XHR response.
    pub fn derive_options(
        baseline: &RewriteOptions,
        domain_override: Option<&RewriteOptions>,
        scanner: &QueryParamScanner,
        query_params: &[(&str, &str)],
        is_xhr: bool,
    ) -> Result<RewriteOptions> {
        let starting = domain_override.unwrap_or(baseline);
        let mut options = scanner.overlay(starting, query_params)?;
        if is_xhr {
            // Filters that rewrite in ways a non-browser XHR consumer can't
            // tolerate (deferred/lazy content, inlined script execution).
            options.disable_filters(&["inline_javascript", "defer_javascript", "lazyload_images"]);
        }
        Ok(options)
    }

    /// Builds a pooled session: its filter chain is taken from `pool` (or
    /// built and later returned to it on [`Self::release`]).
    pub fn new_pooled(
        context: Arc<ServerContext<L1, L2, ML1, ML2>>,
        request_url: Url,
        options: RewriteOptions,
        pool: &SessionPool,
    ) -> Self {
        let filter_chain = pool.acquire(&options, context.hasher.as_ref());
        let signature = options_signature(&options, context.hasher.as_ref());
        Self {
            context,
            options,
            signature,
            request_url,
            filter_chain,
            resources: DashMap::new(),
            pooled: true,
        }
    }

    /// Builds an unmanaged session: its filter chain is built fresh and
    /// never returned to any pool (spec §4.9 "unmanaged mode" — used for
    /// one-off requests, e.g. an admin/debug endpoint, where reuse would
    /// just grow the free-list without ever being drawn from again).
    pub fn new_unmanaged(
        context: Arc<ServerContext<L1, L2, ML1, ML2>>,
        request_url: Url,
        options: RewriteOptions,
    ) -> Self {
        let filter_chain = FilterChain::build(&options);
        let signature = options_signature(&options, context.hasher.as_ref());
        Self {
            context,
            options,
            signature,
            request_url,
            filter_chain,
            resources: DashMap::new(),
            pooled: false,
        }
    }

    /// Returns this session's filter chain to `pool` for reuse, if this
    /// session was built pooled. A no-op for unmanaged sessions.
    pub fn release(self, pool: &SessionPool) {
        if self.pooled {
            let hasher = self.context.hasher.clone();
            pool.release(&self.options, hasher.as_ref(), self.filter_chain);
        }
    }

    /// The cache fragment this session's resources should be partitioned
    /// under — the request's own host (spec §4.1 "fragment").
    pub fn fragment(&self) -> &str {
        self.request_url.host_str().unwrap_or("")
    }

    /// Returns the [`Resource`] handle for `url`, creating a fresh unloaded
    /// one the first time it's asked for during this session (spec §4.6
    /// "one handle per input URL per parse").
    pub fn get_or_create_resource(&self, url: Url) -> Arc<Mutex<Resource>> {
        self.resources
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Resource::new(url))))
            .clone()
    }

    /// Number of distinct resources touched so far this session.
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Host to actually fetch `html_host`-attributed resources from
    /// (spec §4.5 "Origin vs rewrite mapping"), delegating to the
    /// context's [`crate::url_codec::DomainMaps`].
    pub fn fetch_host<'a>(&'a self, html_host: &'a str) -> &'a str {
        self.context.domain_maps.fetch_host(html_host)
    }

    /// Host that should appear in output URLs for `html_host`-attributed
    /// resources, delegating to the context's
    /// [`crate::url_codec::DomainMaps`].
    pub fn output_host<'a>(&'a self, html_host: &'a str) -> &'a str {
        self.context.domain_maps.output_host(html_host)
    }

    /// Bundles this session's URL-naming parameters (the context's hasher
    /// length, length budget, and output shards) for
    /// [`crate::output_resource::OutputResource::write`].
    pub fn naming_context(&self) -> NamingContext {
        NamingContext {
            hash_length: self.context.hasher.hex_len(),
            signature_length: 0,
            budget: self.context.url_length_budget,
            shards: self.context.output_shards.clone(),
        }
    }

    /// Which worker pool a rewrite of `resource` should be dispatched onto
    /// (spec §4.10 "Worker pools"): background fetches are routed to the
    /// low-priority pool so they never compete with in-request work.
    pub fn worker_pool_for(&self, resource: &Resource) -> WorkerPool {
        if resource.is_background_fetch {
            WorkerPool::LowPriorityRewrite
        } else {
            WorkerPool::Rewrite
        }
    }

    /// Races `rewrite` against `self.options.rewrite_deadline_ms`, driven by
    /// the context's [`crate::clock::Clock`] so a
    /// [`crate::clock::FixedClock`] can make this deterministic in tests
    /// (spec §5 "Deadline racing"): if `rewrite` finishes first, its output
    /// is returned directly. If the deadline elapses first, the rewrite
    /// keeps running in the background (spec §8 invariant: a deadline miss
    /// must still eventually write a result, C8) and its
    /// [`tokio::task::JoinHandle`] is returned instead, so the caller can
    /// serve the original resource now and let the optimized one land
    /// later.
    pub async fn race_against_deadline<T, F>(&self, rewrite: F) -> DeadlineOutcome<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let mut boxed: Pin<Box<dyn Future<Output = T> + Send + 'static>> = Box::pin(rewrite);
        tokio::select! {
            biased;
            output = &mut boxed => DeadlineOutcome::Completed(output),
            _ = self.context.clock.sleep_ms(self.options.rewrite_deadline_ms) => {
                DeadlineOutcome::DeadlineExceeded(tokio::spawn(boxed))
            }
        }
    }
}

/// Outcome of [`RewriteSession::race_against_deadline`].
pub enum DeadlineOutcome<T> {
    /// The rewrite finished within the deadline.
    Completed(T),
    /// The deadline elapsed first; the rewrite is still running in the
    /// background under this handle.
    DeadlineExceeded(JoinHandle<T>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::fetcher::test_support::FakeFetcher;
    use crate::http_cache::HttpCache;
    use crate::http_cache::HttpCacheOptions;
    use crate::managers::memory::MemoryBackend;
    use crate::metadata_cache::MetadataCache;

    fn context() -> Arc<ServerContext<MemoryBackend, MemoryBackend, MemoryBackend, MemoryBackend>> {
        let clock = Arc::new(FixedClock::new(0));
        let http_cache = Arc::new(HttpCache::new(
            MemoryBackend::new(16),
            MemoryBackend::new(16),
            clock.clone(),
            HttpCacheOptions::default(),
        ));
        let metadata_cache = Arc::new(MetadataCache::new(
            MemoryBackend::new(16),
            MemoryBackend::new(16),
            clock.clone(),
            Arc::new(crate::hasher::Blake3Hasher),
            0,
        ));
        Arc::new(ServerContext::new(
            RewriteOptions::default(),
            clock,
            http_cache,
            metadata_cache,
            Arc::new(FakeFetcher::new()),
        ))
    }

    #[test]
    fn pooled_session_release_then_acquire_drains_the_free_list() {
        let pool = SessionPool::new();
        let ctx = context();
        let url = Url::parse("http://example.com/index.html").unwrap();
        let options = RewriteOptions::default();

        let s1 = RewriteSession::new_pooled(ctx.clone(), url.clone(), options.clone(), &pool);
        s1.release(&pool);
        let signature = options_signature(&options, ctx.hasher.as_ref());
        assert_eq!(pool.free_list.get(&signature).unwrap().len(), 1);

        let s2 = RewriteSession::new_pooled(ctx, url, options, &pool);
        // The chain released by s1 was drawn back out rather than a fresh
        // one being built, so the free list for this signature is empty.
        assert!(pool.free_list.get(&s2.signature).map(|v| v.is_empty()).unwrap_or(true));
    }

    #[test]
    fn unmanaged_session_never_touches_the_pool() {
        let pool = SessionPool::new();
        let ctx = context();
        let url = Url::parse("http://example.com/index.html").unwrap();
        let session = RewriteSession::new_unmanaged(ctx, url, RewriteOptions::default());
        session.release(&pool);
        assert!(pool.free_list.is_empty());
    }

    #[test]
    fn resources_are_created_once_per_url() {
        let ctx = context();
        let url = Url::parse("http://example.com/index.html").unwrap();
        let session = RewriteSession::new_unmanaged(ctx, url, RewriteOptions::default());
        let a = session.get_or_create_resource(Url::parse("http://example.com/a.css").unwrap());
        let b = session.get_or_create_resource(Url::parse("http://example.com/a.css").unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(session.resource_count(), 1);
    }

    #[tokio::test]
    async fn deadline_race_returns_completed_when_rewrite_is_fast() {
        let ctx = context();
        let url = Url::parse("http://example.com/index.html").unwrap();
        let mut options = RewriteOptions::default();
        options.rewrite_deadline_ms = 10_000;
        let session = RewriteSession::new_unmanaged(ctx, url, options);

        let outcome = session.race_against_deadline(async { 42 }).await;
        assert!(matches!(outcome, DeadlineOutcome::Completed(42)));
    }

    #[tokio::test]
    async fn deadline_race_returns_join_handle_once_deadline_elapses() {
        let fixed_clock = Arc::new(FixedClock::new(0));
        let http_cache = Arc::new(HttpCache::new(
            MemoryBackend::new(16),
            MemoryBackend::new(16),
            fixed_clock.clone() as Arc<dyn crate::clock::Clock>,
            HttpCacheOptions::default(),
        ));
        let metadata_cache = Arc::new(MetadataCache::new(
            MemoryBackend::new(16),
            MemoryBackend::new(16),
            fixed_clock.clone() as Arc<dyn crate::clock::Clock>,
            Arc::new(crate::hasher::Blake3Hasher),
            0,
        ));
        let ctx = Arc::new(ServerContext::new(
            RewriteOptions::default(),
            fixed_clock.clone() as Arc<dyn crate::clock::Clock>,
            http_cache,
            metadata_cache,
            Arc::new(FakeFetcher::new()),
        ));

        let url = Url::parse("http://example.com/index.html").unwrap();
        let mut options = RewriteOptions::default();
        options.rewrite_deadline_ms = 5;
        let session = RewriteSession::new_unmanaged(ctx, url, options);

        // FixedClock's sleep_ms only resolves once something advances it
        // past the deadline, so race a real task pushing it forward.
        let advancer = fixed_clock.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            advancer.advance_ms(50);
        });

        let outcome = session
            .race_against_deadline(async move {
                // Never resolves on its own within this test's window; the
                // deadline must win the race instead.
                std::future::pending::<u32>().await
            })
            .await;
        match outcome {
            DeadlineOutcome::Completed(_) => panic!("expected the deadline to win"),
            DeadlineOutcome::DeadlineExceeded(handle) => {
                // The spawned rewrite is still running; abort it rather
                // than leaking a task that awaits forever.
                handle.abort();
            }
        }
    }

    #[test]
    fn worker_pool_routes_background_fetches_to_low_priority() {
        let ctx = context();
        let url = Url::parse("http://example.com/index.html").unwrap();
        let session = RewriteSession::new_unmanaged(ctx, url, RewriteOptions::default());

        let mut bg = Resource::new(Url::parse("http://example.com/a.css").unwrap());
        bg.is_background_fetch = true;
        assert_eq!(session.worker_pool_for(&bg), WorkerPool::LowPriorityRewrite);

        let fg = Resource::new(Url::parse("http://example.com/b.css").unwrap());
        assert_eq!(session.worker_pool_for(&fg), WorkerPool::Rewrite);
    }

    #[test]
    fn naming_context_reflects_context_hasher_and_budget() {
        let ctx = context();
        let url = Url::parse("http://example.com/index.html").unwrap();
        let session = RewriteSession::new_unmanaged(ctx.clone(), url, RewriteOptions::default());
        let naming = session.naming_context();
        assert_eq!(naming.hash_length, ctx.hasher.hex_len());
        assert_eq!(naming.shards, ctx.output_shards);
    }

    #[test]
    fn fetch_host_and_output_host_delegate_to_domain_maps() {
        let ctx = context();
        let url = Url::parse("http://example.com/index.html").unwrap();
        let session = RewriteSession::new_unmanaged(ctx, url, RewriteOptions::default());
        // No mappings registered: both pass through unchanged.
        assert_eq!(session.fetch_host("example.com"), "example.com");
        assert_eq!(session.output_host("example.com"), "example.com");
    }

    #[test]
    fn xhr_requests_disable_unsafe_filters() {
        let scanner = QueryParamScanner::default();
        let mut baseline = RewriteOptions::default();
        baseline.filter_enabled.insert("inline_javascript".to_string(), true);
        let derived =
            RewriteSession::<MemoryBackend, MemoryBackend, MemoryBackend, MemoryBackend>::derive_options(
                &baseline, None, &scanner, &[], true,
            )
            .unwrap();
        assert!(!derived.filter_enabled("inline_javascript"));
    }
}
