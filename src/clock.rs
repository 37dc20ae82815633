//! Deterministic time control.
//!
//! Spec §5/§8 scenarios require advancing time by arbitrary amounts ("20
//! years" in S2) to exercise TTL and staleness-threshold boundaries, which
//! `SystemTime::now()` cannot do directly. [`FixedClock`] is the Rust
//! analogue of `original_source`'s `MockTimer`/`AdvanceTimeMs`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

/// A source of wall-clock time, in milliseconds since the Unix epoch, with
/// a suspension primitive every timed wait in this crate (lock leases,
/// rewrite deadlines) goes through instead of calling `tokio::time::sleep`
/// directly — that's what lets a [`FixedClock`] drive those waits
/// deterministically in tests (spec §5 "a cooperative scheduler provides
/// timed alarms... for testing with a mock clock").
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current time, in milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;

    /// Suspends for approximately `ms` milliseconds of this clock's own
    /// time. Negative or zero `ms` returns immediately.
    async fn sleep_ms(&self, ms: i64);
}

/// The real wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    async fn sleep_ms(&self, ms: i64) {
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms as u64)).await;
        }
    }
}

/// A clock a test can advance explicitly.
#[derive(Debug)]
pub struct FixedClock {
    now_ms: AtomicI64,
}

impl FixedClock {
    /// Creates a clock starting at `now_ms`.
    pub fn new(now_ms: i64) -> Self {
        Self { now_ms: AtomicI64::new(now_ms) }
    }

    /// Moves the clock forward by `delta_ms` (may be any magnitude, e.g. a
    /// 20-year jump for spec scenario S2).
    pub fn advance_ms(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute time.
    pub fn set_ms(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

#[async_trait]
impl Clock for FixedClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    /// Doesn't sleep in real time at all: spins on [`Self::now_ms`],
    /// yielding between polls, until a test's [`Self::advance_ms`]/
    /// [`Self::set_ms`] call (from another task) pushes the clock past the
    /// deadline. This is what lets a test race a real `tokio::select!`
    /// against a mock deadline without ever waiting on wall-clock time.
    async fn sleep_ms(&self, ms: i64) {
        let deadline = self.now_ms() + ms.max(0);
        while self.now_ms() < deadline {
            tokio::task::yield_now().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_by_arbitrary_amount() {
        let clock = FixedClock::new(0);
        const TWENTY_YEARS_MS: i64 = 20 * 365 * 24 * 60 * 60 * 1000;
        clock.advance_ms(TWENTY_YEARS_MS);
        assert_eq!(clock.now_ms(), TWENTY_YEARS_MS);
    }

    #[tokio::test]
    async fn fixed_clock_sleep_resolves_once_advanced_past_deadline() {
        use std::sync::Arc;

        let clock = Arc::new(FixedClock::new(0));
        let advancer = clock.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            advancer.advance_ms(50);
        });
        clock.sleep_ms(20).await;
        assert!(clock.now_ms() >= 20);
    }
}
