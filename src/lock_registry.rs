//! C4 — Named-lock registry.
//!
//! Enforces at-most-one in-flight rewrite per key while letting unrelated
//! keys proceed in parallel (spec §4.4). Locks are advisory and stealable:
//! a lease held longer than its `break_ms` can be forcibly taken by another
//! caller, bounding the damage a crashed builder can do. There is no
//! cross-process coordination here — that would require a shared backing
//! store, which spec §1's Non-goals explicitly excludes.

use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, warn};
use tokio::sync::Notify;

use crate::clock::Clock;

struct Lease {
    held_since_ms: i64,
    notify: Arc<Notify>,
}

/// A held lock. Releases on drop.
pub struct LockGuard {
    registry: Arc<NamedLockRegistryInner>,
    key: String,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

struct NamedLockRegistryInner {
    leases: DashMap<String, Lease>,
    clock: Arc<dyn Clock>,
}

impl NamedLockRegistryInner {
    fn release(&self, key: &str) {
        if let Some((_, lease)) = self.leases.remove(key) {
            lease.notify.notify_waiters();
        }
    }

    fn notify_for(&self, key: &str) -> Arc<Notify> {
        self.leases
            .get(key)
            .map(|l| l.notify.clone())
            .unwrap_or_else(|| Arc::new(Notify::new()))
    }
}

/// Registry of [`LockGuard`]s keyed by a caller-chosen string — typically a
/// stable hash of `(transformation id, fingerprint)` (spec §3 "Creation
/// lock").
#[derive(Clone)]
pub struct NamedLockRegistry {
    inner: Arc<NamedLockRegistryInner>,
}

impl NamedLockRegistry {
    /// Creates an empty registry using `clock` for lease-age accounting.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(NamedLockRegistryInner {
                leases: DashMap::new(),
                clock,
            }),
        }
    }

    /// Non-blocking: succeeds immediately if `key` is free, or if its
    /// current lease has been held longer than `break_ms`.
    pub fn try_lock_steal_old(&self, key: &str, break_ms: i64) -> Option<LockGuard> {
        let now_ms = self.inner.clock.now_ms();
        let mut stolen = false;
        let acquired = match self.inner.leases.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Lease { held_since_ms: now_ms, notify: Arc::new(Notify::new()) });
                true
            }
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if now_ms - entry.get().held_since_ms > break_ms {
                    stolen = true;
                    entry.insert(Lease { held_since_ms: now_ms, notify: Arc::new(Notify::new()) });
                    true
                } else {
                    false
                }
            }
        };

        if !acquired {
            return None;
        }
        if stolen {
            warn!("lock_registry: stole lease for {key} after {break_ms}ms");
        } else {
            debug!("lock_registry: acquired {key}");
        }
        Some(LockGuard { registry: self.inner.clone(), key: key.to_string() })
    }

    /// Waits up to `block_ms` for `key` to become free; if it's still held
    /// once `block_ms` has elapsed, forcibly steals it regardless of
    /// `break_ms` (a caller willing to wait that long wants the lock more
    /// than it wants to respect a crashed holder's lease).
    ///
    /// The deadline is computed from the registry's own [`Clock`] rather
    /// than real wall-clock time, so a [`crate::clock::FixedClock`] in
    /// tests can drive this wait the same way it drives C3's freshness
    /// checks.
    pub async fn lock_timed_wait_steal_old(
        &self,
        key: &str,
        block_ms: i64,
        break_ms: i64,
    ) -> LockGuard {
        let deadline_ms = self.inner.clock.now_ms() + block_ms.max(0);
        loop {
            if let Some(guard) = self.try_lock_steal_old(key, break_ms) {
                return guard;
            }
            let notify = self.inner.notify_for(key);
            let remaining_ms = deadline_ms - self.inner.clock.now_ms();
            if remaining_ms <= 0 {
                return self.force_steal(key);
            }
            tokio::select! {
                _ = notify.notified() => {}
                _ = self.inner.clock.sleep_ms(remaining_ms) => {}
            }
        }
    }

    fn force_steal(&self, key: &str) -> LockGuard {
        let now_ms = self.inner.clock.now_ms();
        warn!("lock_registry: force-stealing {key} after block_ms elapsed");
        self.inner
            .leases
            .insert(key.to_string(), Lease { held_since_ms: now_ms, notify: Arc::new(Notify::new()) });
        LockGuard { registry: self.inner.clone(), key: key.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use std::time::Duration;

    #[test]
    fn try_lock_succeeds_when_free() {
        let registry = NamedLockRegistry::new(Arc::new(FixedClock::new(0)));
        let guard = registry.try_lock_steal_old("k", 30_000);
        assert!(guard.is_some());
    }

    #[test]
    fn try_lock_fails_while_held_and_fresh() {
        let registry = NamedLockRegistry::new(Arc::new(FixedClock::new(0)));
        let _guard = registry.try_lock_steal_old("k", 30_000).unwrap();
        assert!(registry.try_lock_steal_old("k", 30_000).is_none());
    }

    #[test]
    fn try_lock_steals_once_break_ms_elapsed() {
        let clock = Arc::new(FixedClock::new(0));
        let registry = NamedLockRegistry::new(clock.clone());
        let guard = registry.try_lock_steal_old("k", 30_000).unwrap();
        clock.advance_ms(30_001);
        let stolen = registry.try_lock_steal_old("k", 30_000);
        assert!(stolen.is_some(), "lease older than break_ms must be stealable");
        drop(guard);
    }

    #[test]
    fn release_on_drop_frees_the_key() {
        let registry = NamedLockRegistry::new(Arc::new(FixedClock::new(0)));
        let guard = registry.try_lock_steal_old("k", 30_000).unwrap();
        drop(guard);
        assert!(registry.try_lock_steal_old("k", 30_000).is_some());
    }

    #[tokio::test]
    async fn timed_wait_acquires_once_holder_releases() {
        let registry = NamedLockRegistry::new(Arc::new(FixedClock::new(0)));
        let guard = registry.try_lock_steal_old("k", 30_000).unwrap();

        let registry2 = registry.clone();
        let waiter = tokio::spawn(async move {
            registry2.lock_timed_wait_steal_old("k", 5_000, 30_000).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        let second = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should complete")
            .expect("task should not panic");
        drop(second);
    }
}
