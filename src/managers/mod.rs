//! Concrete [`crate::backend::CacheBackend`] implementations.
//!
//! Mirrors `http-cache`'s `managers` module layout: each backend is gated
//! behind its own feature so consumers only pull in the storage crates they
//! actually use.

/// An in-process LRU backend, typically used as the L1 of a
/// [`crate::two_level::TwoLevelCache`].
pub mod memory;

/// A disk-backed backend built on [`cacache`], typically used as an L2.
#[cfg(feature = "manager-cacache")]
pub mod cacache;

/// A shared in-memory backend built on [`moka`], typically used as an L2
/// fronting multiple processes' L1s via a network-attached deployment.
#[cfg(feature = "manager-moka")]
pub mod moka;
