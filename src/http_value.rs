//! The canonical in-memory form for anything stored by the HTTP cache (C3).
//!
//! Mirrors `http-cache`'s `HttpResponse`, generalized with the fields the
//! rewrite core needs: a synthesized weak ETag, an optional content hash for
//! partition validation (spec §4.8), and the sentinel status codes used to
//! memoize recent failures (spec §7).

use std::{collections::HashMap, fmt, time::SystemTime};

use http::{header::CACHE_CONTROL, response, HeaderValue};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{CacheError, Result};

/// `x-cache` header: HIT if served from cache, MISS otherwise.
pub const XCACHE: &str = "x-cache";
/// `x-cache-lookup` header: HIT if an entry existed in cache at all.
pub const XCACHELOOKUP: &str = "x-cache-lookup";
const WARNING: &str = "warning";

/// First status code in the block reserved for synthetic "remember failure"
/// sentinel entries (spec §6, §7). Never surfaced to callers directly; see
/// [`HttpValue::sentinel_kind`].
pub const SENTINEL_STATUS_BASE: u16 = 900;

/// Hit/miss outcome, used for the `x-cache`/`x-cache-lookup` headers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HitOrMiss {
    /// There was a hit.
    Hit,
    /// There was no hit.
    Miss,
}

impl fmt::Display for HitOrMiss {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Hit => write!(f, "HIT"),
            Self::Miss => write!(f, "MISS"),
        }
    }
}

/// The reason a fetch or rewrite did not produce a usable result.
///
/// These are spec §7's error kinds. They are data, not `Result::Err` — a
/// `FailureKind` gets memoized as a sentinel cache entry (spec §4.3
/// `RememberFailure`) rather than propagated to the caller.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// Load shedding refused to dispatch the fetch.
    Dropped,
    /// Origin returned a 4xx.
    Fetch4xx,
    /// A 200 with disqualifying cache-control.
    UncacheableOk,
    /// A non-200 with disqualifying cache-control.
    UncacheableError,
    /// Zero-byte successful fetch.
    Empty,
    /// Transport failure or timeout.
    OtherError,
    /// Response forbids caching outright (e.g. `no-store`).
    NotCacheable,
}

impl FailureKind {
    /// Maps a failure kind onto one of the reserved sentinel status codes.
    pub fn to_sentinel_status(self) -> u16 {
        SENTINEL_STATUS_BASE
            + match self {
                FailureKind::Dropped => 0,
                FailureKind::Fetch4xx => 1,
                FailureKind::UncacheableOk => 2,
                FailureKind::UncacheableError => 3,
                FailureKind::Empty => 4,
                FailureKind::OtherError => 5,
                FailureKind::NotCacheable => 6,
            }
    }

    /// Inverse of [`Self::to_sentinel_status`]. Returns `None` for any
    /// status outside the reserved block, i.e. a real response.
    pub fn from_sentinel_status(status: u16) -> Option<Self> {
        if !(SENTINEL_STATUS_BASE..SENTINEL_STATUS_BASE + 7).contains(&status)
        {
            return None;
        }
        Some(match status - SENTINEL_STATUS_BASE {
            0 => FailureKind::Dropped,
            1 => FailureKind::Fetch4xx,
            2 => FailureKind::UncacheableOk,
            3 => FailureKind::UncacheableError,
            4 => FailureKind::Empty,
            5 => FailureKind::OtherError,
            _ => FailureKind::NotCacheable,
        })
    }
}

/// A contiguous byte buffer holding headers and body: the value half of an
/// HTTP cache entry (spec §3 "HTTP cache entry").
///
/// A [`HttpValue`] with a status in the sentinel block (see
/// [`FailureKind::to_sentinel_status`]) is a synthetic "recent failure"
/// marker, not a real response; `sentinel_kind` is how callers tell the two
/// apart without leaking the magic status codes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpValue {
    /// Response body. Empty for sentinel entries.
    pub body: Vec<u8>,
    /// Response headers, lower-cased keys, multi-value per RFC 7230.
    pub headers: HashMap<String, Vec<String>>,
    /// HTTP status code, or a sentinel code from the reserved block.
    pub status: u16,
    /// URL this value was fetched from (post any origin-map rewrite).
    pub url: Url,
    /// Wall-clock time this value was stored, used for staleness math that
    /// isn't already covered by `http-cache-semantics`'s `CachePolicy`.
    pub date_ms: i64,
    /// Content hash of `body`, if the caller requested one be computed.
    /// Populated for resources that partitions (C8) validate against.
    pub content_hash: Option<String>,
}

impl HttpValue {
    /// Builds a synthetic sentinel entry recording a recent failure.
    pub fn sentinel(kind: FailureKind, url: Url, date_ms: i64) -> Self {
        Self {
            body: Vec::new(),
            headers: HashMap::new(),
            status: kind.to_sentinel_status(),
            url,
            date_ms,
            content_hash: None,
        }
    }

    /// `Some(kind)` if this value is a synthetic failure sentinel.
    pub fn sentinel_kind(&self) -> Option<FailureKind> {
        FailureKind::from_sentinel_status(self.status)
    }

    /// Header getter, case-insensitive, first value only.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    /// Sets a header, replacing any existing values.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), vec![value.into()]);
    }

    /// Removes a header entirely.
    pub fn remove_header(&mut self, name: &str) {
        self.headers.remove(&name.to_ascii_lowercase());
    }

    /// Strips headers that must never survive a cache round trip: hop-by-hop
    /// headers and anything that would leak session state (spec §4.3 step
    /// 3). Sanitization failures degrade to a no-op removal, never a panic,
    /// per spec §7 ("cache invalidation failures degrade to MISS silently").
    pub fn sanitize(&mut self) {
        for hop_by_hop in
            ["connection", "transfer-encoding", "set-cookie", "set-cookie2"]
        {
            self.remove_header(hop_by_hop);
        }
    }

    /// `true` if sanitization would have removed anything — used by the
    /// read path to force a synthetic MISS on polluted entries (spec §4.3
    /// step 3) instead of serving a half-sanitized value.
    pub fn needs_sanitizing(&self) -> bool {
        ["connection", "transfer-encoding", "set-cookie", "set-cookie2"]
            .iter()
            .any(|h| self.headers.contains_key(*h))
    }

    /// Returns `response::Parts` for feeding into `http-cache-semantics`.
    pub fn parts(&self) -> Result<response::Parts> {
        let mut builder = http::Response::builder()
            .status(if self.status >= SENTINEL_STATUS_BASE {
                // Sentinels never reach http-cache-semantics; synthesize a
                // harmless 504 so construction can't fail.
                504
            } else {
                self.status
            })
            .body(())?;
        {
            let headers = builder.headers_mut();
            for (name, values) in &self.headers {
                let header_name = http::header::HeaderName::from_bytes(
                    name.as_bytes(),
                )
                .map_err(|_| CacheError::BadHeader)?;
                for value in values {
                    headers.append(
                        header_name.clone(),
                        HeaderValue::from_str(value)
                            .map_err(|_| CacheError::BadHeader)?,
                    );
                }
            }
        }
        Ok(builder.into_parts().0)
    }

    /// Returns the numeric warning code present on the `Warning` header, if
    /// any (RFC 7234 §5.5 encodes it as the first 3 digits).
    pub fn warning_code(&self) -> Option<u32> {
        self.header(WARNING).and_then(|hdr| {
            hdr.chars().take(3).collect::<String>().parse().ok()
        })
    }

    /// Adds an RFC 2616 §14.46-shaped `Warning` header.
    pub fn add_warning(&mut self, host: &str, code: u32, message: &str) {
        let escaped = message.replace('"', "'").replace(['\n', '\r'], " ");
        self.set_header(
            WARNING,
            format!(
                "{code} {host} \"{escaped}\" \"{}\"",
                httpdate::fmt_http_date(SystemTime::now())
            ),
        );
    }

    /// Removes the `Warning` header (RFC 7234 requires dropping 1xx warnings
    /// on update; the HTTP cache calls this when refreshing a stored value).
    pub fn remove_warning(&mut self) {
        self.remove_header(WARNING);
    }

    /// `true` if `Cache-Control` carries `must-revalidate`.
    pub fn must_revalidate(&self) -> bool {
        self.header(CACHE_CONTROL.as_str())
            .is_some_and(|v| v.to_ascii_lowercase().contains("must-revalidate"))
    }

    /// Merges headers from a fresh `response::Parts`, as done after a 304.
    pub fn update_headers(&mut self, parts: &response::Parts) -> Result<()> {
        for (name, value) in parts.headers.iter() {
            self.headers
                .entry(name.as_str().to_ascii_lowercase())
                .or_default()
                .push(value.to_str()?.to_string());
        }
        Ok(())
    }

    /// Adds the `x-cache`/`x-cache-lookup` status headers.
    pub fn set_cache_status(&mut self, status: HitOrMiss) {
        self.set_header(XCACHE, status.to_string());
    }

    /// Adds the `x-cache-lookup` status header.
    pub fn set_cache_lookup_status(&mut self, status: HitOrMiss) {
        self.set_header(XCACHELOOKUP, status.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("http://example.com/a.css").unwrap()
    }

    #[test]
    fn sentinel_round_trips() {
        let v = HttpValue::sentinel(FailureKind::Fetch4xx, url(), 1_000);
        assert_eq!(v.sentinel_kind(), Some(FailureKind::Fetch4xx));
        assert!(v.status >= SENTINEL_STATUS_BASE);
    }

    #[test]
    fn non_sentinel_has_no_kind() {
        let v = HttpValue {
            body: vec![],
            headers: HashMap::new(),
            status: 200,
            url: url(),
            date_ms: 0,
            content_hash: None,
        };
        assert_eq!(v.sentinel_kind(), None);
    }

    #[test]
    fn sanitize_strips_hop_by_hop_and_cookies() {
        let mut v = HttpValue {
            body: vec![],
            headers: HashMap::new(),
            status: 200,
            url: url(),
            date_ms: 0,
            content_hash: None,
        };
        v.set_header("Set-Cookie", "a=b");
        v.set_header("Connection", "keep-alive");
        assert!(v.needs_sanitizing());
        v.sanitize();
        assert!(!v.needs_sanitizing());
        assert!(v.header("set-cookie").is_none());
    }

    #[test]
    fn warning_round_trip() {
        let mut v = HttpValue {
            body: vec![],
            headers: HashMap::new(),
            status: 200,
            url: url(),
            date_ms: 0,
            content_hash: None,
        };
        v.add_warning("example.com", 112, "Disconnected operation");
        assert_eq!(v.warning_code(), Some(112));
        v.remove_warning();
        assert_eq!(v.warning_code(), None);
    }
}
