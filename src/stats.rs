//! Lock-free counters, mirroring `original_source`'s `Variable` names for
//! the HTTP cache (spec §4.3, §9 "counters are lock-free variables").

use std::sync::atomic::{AtomicU64, Ordering};

/// HTTP cache (C3) counters.
#[derive(Debug, Default)]
pub struct HttpCacheStats {
    /// `Find` calls returning `Found`.
    pub hits: AtomicU64,
    /// `Find` calls returning `NotFound` with no fallback served.
    pub misses: AtomicU64,
    /// `Find` calls returning `RecentFailure`.
    pub remembered_failures: AtomicU64,
    /// Expired-but-within-staleness-threshold entries served as fallback.
    pub fallback_hits: AtomicU64,
    /// Successful `Put` calls.
    pub inserts: AtomicU64,
    /// Entries rejected by `Put` (uncacheable, too large, bad URL).
    pub insert_rejections: AtomicU64,
    /// 304-driven header-only refreshes.
    pub num_conditional_refreshes: AtomicU64,
}

impl HttpCacheStats {
    /// Snapshot helper for tests and debug headers.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Snapshot helper for tests and debug headers.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Snapshot helper for tests and debug headers.
    pub fn remembered_failures(&self) -> u64 {
        self.remembered_failures.load(Ordering::Relaxed)
    }

    /// Snapshot helper for tests and debug headers.
    pub fn fallback_hits(&self) -> u64 {
        self.fallback_hits.load(Ordering::Relaxed)
    }

    /// Snapshot helper for tests and debug headers.
    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }

    /// Snapshot helper for tests and debug headers.
    pub fn num_conditional_refreshes(&self) -> u64 {
        self.num_conditional_refreshes.load(Ordering::Relaxed)
    }
}

/// Metadata cache (C8) counters.
#[derive(Debug, Default)]
pub struct MetadataCacheStats {
    /// Full hits (all inputs validated).
    pub hits: AtomicU64,
    /// Misses that triggered a rewrite.
    pub misses: AtomicU64,
    /// Hits served stale while a background refresh was queued.
    pub stale_hits: AtomicU64,
}
