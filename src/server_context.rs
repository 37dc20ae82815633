//! C10 — Server context: the process-wide registry a
//! [`crate::session::RewriteSession`] is spawned from (spec §4.10).
//!
//! Holds everything that must be shared across every request a process
//! handles: the baseline options, the clock, the two caches, the named-lock
//! registry, the domain maps, and the fetcher. A real embedding owns exactly
//! one of these per process (or per virtual host, for multi-tenant setups).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::warn;

use crate::backend::CacheBackend;
use crate::clock::Clock;
use crate::fetcher::Fetcher;
use crate::hasher::{Blake3Hasher, Hasher};
use crate::http_cache::HttpCache;
use crate::lock_registry::NamedLockRegistry;
use crate::metadata_cache::MetadataCache;
use crate::options::RewriteOptions;
use crate::url_codec::{DomainMaps, LengthBudget};

/// Which worker pool a rewrite is dispatched onto (spec §4.10 "Worker
/// pools"). Modeled here as a routing decision rather than an executor:
/// this core doesn't run a thread pool of its own (spec §1 Non-goals), it
/// only classifies which pool an embedding's executor should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPool {
    /// HTML-parsing and filter-application work for the request in flight.
    Html,
    /// A synchronous, in-request rewrite (the common case for small
    /// resources under the rewrite deadline).
    Rewrite,
    /// A background rewrite dispatched after a deadline miss (spec §5
    /// "Deadline racing") or a prefetch — never blocks a request.
    LowPriorityRewrite,
}

/// Process-wide registry (spec §4.10 "Server context").
///
/// `L1`/`L2` back the HTTP cache (C3); `ML1`/`ML2` back the metadata cache
/// (C8). They're independent type parameters because a deployment
/// frequently wants different backends for the two caches (e.g. disk for
/// HTTP bodies, a small in-memory LRU for metadata records).
pub struct ServerContext<L1, L2, ML1, ML2> {
    /// Baseline options every session's per-request options are derived
    /// from (spec §4.9 step 1).
    pub baseline_options: RewriteOptions,
    /// Shared clock, swappable for a [`crate::clock::FixedClock`] in tests.
    pub clock: Arc<dyn Clock>,
    /// C3.
    pub http_cache: Arc<HttpCache<L1, L2>>,
    /// C8.
    pub metadata_cache: Arc<MetadataCache<ML1, ML2>>,
    /// C4.
    pub lock_registry: NamedLockRegistry,
    /// C5's origin/rewrite host mappings.
    pub domain_maps: DomainMaps,
    /// C5's URL length ceilings.
    pub url_length_budget: LengthBudget,
    /// Shared hasher, swappable for a test double the way [`Clock`] is
    /// (spec §4.10 "the hasher").
    pub hasher: Arc<dyn Hasher>,
    /// Shard authorities output URLs may be distributed across (spec §4.5
    /// "Sharding"), empty to disable sharding.
    pub output_shards: Vec<String>,
    /// The external fetcher collaborator (spec §1 Non-goals).
    pub fetcher: Arc<dyn Fetcher>,
    shutting_down: AtomicBool,
    active_sessions: AtomicUsize,
}

impl<L1, L2, ML1, ML2> ServerContext<L1, L2, ML1, ML2>
where
    L1: CacheBackend,
    L2: CacheBackend,
    ML1: CacheBackend,
    ML2: CacheBackend,
{
    /// Assembles a server context out of its already-constructed pieces.
    pub fn new(
        baseline_options: RewriteOptions,
        clock: Arc<dyn Clock>,
        http_cache: Arc<HttpCache<L1, L2>>,
        metadata_cache: Arc<MetadataCache<ML1, ML2>>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            lock_registry: NamedLockRegistry::new(clock.clone()),
            baseline_options,
            clock,
            http_cache,
            metadata_cache,
            domain_maps: DomainMaps::default(),
            url_length_budget: LengthBudget::default(),
            hasher: Arc::new(Blake3Hasher),
            output_shards: Vec::new(),
            fetcher,
            shutting_down: AtomicBool::new(false),
            active_sessions: AtomicUsize::new(0),
        }
    }

    /// `true` once [`Self::begin_shutdown`] has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Number of sessions currently in flight.
    pub fn active_session_count(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }

    /// Registers one in-flight session, returning a guard that
    /// decrements the count on drop. New sessions are refused once
    /// shutdown has begun (spec §4.10 "Shutdown and draining").
    pub fn begin_session(self: &Arc<Self>) -> Option<SessionGuard<L1, L2, ML1, ML2>> {
        if self.is_shutting_down() {
            return None;
        }
        self.active_sessions.fetch_add(1, Ordering::SeqCst);
        Some(SessionGuard { context: self.clone() })
    }

    /// Marks the context as draining: no further sessions may begin, and
    /// waits (polling) up to `drain_timeout` for in-flight sessions to
    /// finish. Sessions still outstanding past the timeout are logged and
    /// abandoned rather than forcibly killed — the core has no authority
    /// to interrupt work already in flight (spec §4.10 step 3).
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let poll_interval = Duration::from_millis(20);
        let mut waited = Duration::ZERO;
        while self.active_session_count() > 0 && waited < drain_timeout {
            tokio::time::sleep(poll_interval).await;
            waited += poll_interval;
        }
        let remaining = self.active_session_count();
        if remaining > 0 {
            warn!(
                "server_context: shutdown drain timed out with {remaining} session(s) still active"
            );
        }
    }
}

/// RAII guard returned by [`ServerContext::begin_session`].
pub struct SessionGuard<L1, L2, ML1, ML2> {
    context: Arc<ServerContext<L1, L2, ML1, ML2>>,
}

impl<L1, L2, ML1, ML2> Drop for SessionGuard<L1, L2, ML1, ML2> {
    fn drop(&mut self) {
        self.context.active_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}
