//! `rewrite-cache`: an HTTP resource cache and rewrite-result memoization
//! core for a web-optimization engine (spec §1 "Overview").
//!
//! Built as ten composed modules, C1 through C10, laid out roughly
//! bottom-up: a generic async [`backend`] contract, a [`two_level`]
//! L1/L2 composition over it, concrete [`managers`], HTTP caching
//! semantics in [`http_cache`], a [`lock_registry`] for single-flight
//! rewrites, a [`url_codec`] for the `*.pagespeed.*` URL grammar, and the
//! [`resource`]/[`output_resource`]/[`metadata_cache`] layers that sit on
//! top of all of it. [`session`] and [`server_context`] are the per-request
//! and process-wide composition roots a real embedding constructs once and
//! drives per request.
//!
//! None of this crate performs HTML parsing, filter execution, or actual
//! network I/O — those are the engine's job, not this core's (spec §1
//! Non-goals). [`fetcher::Fetcher`] is the seam where a real fetcher plugs
//! in.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// C1 — the `CacheBackend` trait and its error contract.
pub mod backend;
/// Shared error type for the whole crate.
pub mod error;
/// The canonical in-memory HTTP response form, sentinels, and warnings.
pub mod http_value;
/// C2 — L1/L2 composition with a validate-or-fallthrough hook.
pub mod two_level;

/// Concrete `CacheBackend` implementations (memory, cacache, moka).
pub mod managers;

/// Deterministic time control (`Clock`/`SystemClock`/`FixedClock`).
pub mod clock;
/// Shared hashing abstraction (`Hasher`/`Blake3Hasher`).
pub mod hasher;
/// Lock-free counters for the HTTP and metadata caches.
pub mod stats;

/// C3 — HTTP caching semantics: freshness, sentinels, conditional refresh.
pub mod http_cache;

/// C4 — named-lock registry for single-flight rewrites.
pub mod lock_registry;

/// C5 — the `*.pagespeed.*` URL codec and domain mappings.
pub mod url_codec;

/// The external fetcher seam (spec §1 Non-goals).
pub mod fetcher;

/// C6 — `Resource`, an in-memory handle for one input URL.
pub mod resource;

/// C7 — `OutputResource`, cache-control merging and URL construction for
/// rewrite outputs.
pub mod output_resource;

/// C8 — the metadata (rewrite-result) cache.
pub mod metadata_cache;

/// Configuration surface: `RewriteOptions` and the query-param scanner.
pub mod options;

/// C9 — per-request `RewriteSession` and its pool.
pub mod session;

/// C10 — process-wide `ServerContext`.
pub mod server_context;

pub use error::{CacheError, Result};
