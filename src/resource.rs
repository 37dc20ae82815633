//! C6 — Resource: an in-memory handle for one input URL (spec §3, §4.6).

use std::collections::HashMap;
use std::io::Read;
use std::sync::OnceLock;

use url::Url;

use crate::error::{CacheError, Result};
use crate::hasher::Hasher;
use crate::http_value::FailureKind;

/// Outcome of a fetch attempt (spec §3 "fetch outcome tag").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Not yet loaded.
    Unset,
    /// 2xx, cacheable or at least usable.
    Ok,
    /// Load shedding refused to dispatch the fetch.
    DroppedByLoadShedding,
    /// Origin returned a 4xx.
    Fetch4xx,
    /// A 200 with disqualifying cache-control.
    Uncacheable200,
    /// A non-200 with disqualifying cache-control.
    UncacheableError,
    /// Zero-byte successful fetch.
    Empty,
    /// Transport failure or timeout.
    OtherError,
}

impl FetchOutcome {
    /// Maps a failure outcome onto the [`FailureKind`] the HTTP cache (C3)
    /// memoizes. `None` for `Unset`/`Ok`, which aren't failures.
    pub fn as_failure_kind(self) -> Option<FailureKind> {
        match self {
            FetchOutcome::DroppedByLoadShedding => Some(FailureKind::Dropped),
            FetchOutcome::Fetch4xx => Some(FailureKind::Fetch4xx),
            FetchOutcome::Uncacheable200 => Some(FailureKind::UncacheableOk),
            FetchOutcome::UncacheableError => Some(FailureKind::UncacheableError),
            FetchOutcome::Empty => Some(FailureKind::Empty),
            FetchOutcome::OtherError => Some(FailureKind::OtherError),
            FetchOutcome::Unset | FetchOutcome::Ok => None,
        }
    }
}

/// Per-input descriptor stored in a metadata-cache [`crate::metadata_cache::Partition`]
/// (spec §3 "Partition"), produced by [`Resource::fill_in_partition_input_info`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct InputDescriptor {
    /// The input's URL, if it has one (inline inputs may not).
    pub url: Option<String>,
    /// `Last-Modified`, in epoch milliseconds, if present.
    pub last_modified_ms: Option<i64>,
    /// Expiration, in epoch milliseconds.
    pub expiration_ms: i64,
    /// `Date`/fetch time, in epoch milliseconds.
    pub date_ms: i64,
    /// Content hash, if the caller requested one be computed.
    pub content_hash: Option<String>,
}

/// Load policy for [`Resource::load_async`]-style callers (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPolicy {
    /// Fail the load if the response turns out not to be cacheable.
    ReportFailureIfNotCacheable,
    /// Accept the response even if it isn't cacheable (the caller still
    /// wants the bytes, just won't get them memoized).
    LoadEvenIfNotCacheable,
}

/// An in-memory handle for one input URL (spec §3 "Resource").
///
/// Once [`Self::mark_loaded`] has been called, headers and bytes are
/// immutable for the rest of the resource's lifetime — calling it twice is
/// an internal invariant violation, not a normal error path.
#[derive(Debug, Clone)]
pub struct Resource {
    url: Url,
    content_type: Option<String>,
    headers: HashMap<String, Vec<String>>,
    raw_body: Vec<u8>,
    decompressed: OnceLock<Vec<u8>>,
    outcome: FetchOutcome,
    expiration_ms: i64,
    date_ms: i64,
    loaded: bool,
    /// Fetched on behalf of a background process rather than an inbound
    /// request (affects priority, not correctness, here).
    pub is_background_fetch: bool,
    /// Whether the vary policy must be honored when judging cacheability.
    pub respect_vary: bool,
    /// `Cache-Control: no-transform` disables rewriting outright if set.
    pub disable_rewrite_on_no_transform: bool,
    /// Whether this resource's domain is on the configured authorized list
    /// (affects whether uncacheable content may still be rewritten).
    pub is_authorized_domain: bool,
}

impl Resource {
    /// Creates an unloaded handle for `url`.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            content_type: None,
            headers: HashMap::new(),
            raw_body: Vec::new(),
            decompressed: OnceLock::new(),
            outcome: FetchOutcome::Unset,
            expiration_ms: 0,
            date_ms: 0,
            loaded: false,
            is_background_fetch: false,
            respect_vary: true,
            disable_rewrite_on_no_transform: true,
            is_authorized_domain: false,
        }
    }

    /// The resource's canonical URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// `true` once [`Self::mark_loaded`] has been called.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// The fetch outcome, [`FetchOutcome::Unset`] before loading.
    pub fn outcome(&self) -> FetchOutcome {
        self.outcome
    }

    /// Header getter, case-insensitive, first value only.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).and_then(|v| v.first()).map(String::as_str)
    }

    /// Names of headers present on this resource that aren't in
    /// `blocklist`, for output-resource header merging (spec §4.7 step 2).
    pub fn non_blocklisted_header_names(&self, blocklist: &[&str]) -> Vec<String> {
        self.headers.keys().filter(|name| !blocklist.contains(&name.as_str())).cloned().collect()
    }

    /// Populates the resource from a completed fetch. Errors (rather than
    /// panics) if called on an already-loaded resource, since that's an
    /// internal invariant violation, not a path any caller should hit in
    /// normal operation.
    pub fn mark_loaded(
        &mut self,
        outcome: FetchOutcome,
        headers: HashMap<String, Vec<String>>,
        body: Vec<u8>,
        date_ms: i64,
        expiration_ms: i64,
    ) -> Result<()> {
        if self.loaded {
            return Err(CacheError::General(anyhow::anyhow!(
                "resource {} loaded twice",
                self.url
            )));
        }
        self.content_type = headers
            .get("content-type")
            .and_then(|v| v.first())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
        self.headers = headers;
        self.raw_body = body;
        self.outcome = outcome;
        self.date_ms = date_ms;
        self.expiration_ms = expiration_ms;
        self.loaded = true;
        Ok(())
    }

    /// Spec §8 invariant 1: `IsValidAndCacheable ⇒ now < expiration`.
    pub fn is_valid_and_cacheable(&self, now_ms: i64) -> bool {
        self.loaded
            && self.outcome == FetchOutcome::Ok
            && now_ms < self.expiration_ms
            && self.is_proxy_cacheable_under_vary()
    }

    fn is_proxy_cacheable_under_vary(&self) -> bool {
        if !self.respect_vary {
            return true;
        }
        !self.header("vary").is_some_and(|v| v.trim() == "*")
    }

    /// `true` iff safe to hand to a transformation, per spec §4.6: status
    /// OK AND (cacheable OR `rewrite_uncacheable`) AND no
    /// `Cache-Control: no-transform` AND no `X-Sendfile`/`X-Accel-Redirect`
    /// AND non-empty body. Collects human-readable reasons rather than
    /// reducing to a bool (spec §9 "Failure taxonomy over Booleans").
    pub fn is_safe_to_rewrite(&self, rewrite_uncacheable: bool) -> (bool, Vec<String>) {
        let mut reasons = Vec::new();

        if !self.loaded || self.outcome != FetchOutcome::Ok {
            reasons.push("fetch did not return a usable response".to_string());
        }
        if !self.is_proxy_cacheable_under_vary() && !rewrite_uncacheable {
            reasons.push("response is not cacheable and rewrite_uncacheable_resources is off".to_string());
        }
        if self.disable_rewrite_on_no_transform
            && self.header("cache-control").is_some_and(|v| v.to_ascii_lowercase().contains("no-transform"))
        {
            reasons.push("Cache-Control: no-transform forbids rewriting".to_string());
        }
        if self.header("x-sendfile").is_some() || self.header("x-accel-redirect").is_some() {
            reasons.push("X-Sendfile/X-Accel-Redirect responses are not rewritable".to_string());
        }
        if self.loaded && self.raw_body.is_empty() {
            reasons.push("body is empty".to_string());
        }

        (reasons.is_empty(), reasons)
    }

    /// `true` if the response is gzip-encoded on the wire.
    fn is_gzip_encoded(&self) -> bool {
        self.header("content-encoding").is_some_and(|v| v.to_ascii_lowercase().contains("gzip"))
    }

    /// Lazily gunzips the body if it's gzip-encoded, caching the result
    /// (spec §4.6 "ExtractUncompressedContents"; supplemented from
    /// `original_source`, see `SPEC_FULL.md` §5).
    pub fn extract_uncompressed_contents(&self) -> Result<&[u8]> {
        if !self.is_gzip_encoded() {
            return Ok(&self.raw_body);
        }
        if let Some(cached) = self.decompressed.get() {
            return Ok(cached);
        }
        let mut decoder = flate2::read::GzDecoder::new(self.raw_body.as_slice());
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| CacheError::General(anyhow::anyhow!("gunzip failed: {e}")))?;
        Ok(self.decompressed.get_or_init(|| out))
    }

    /// Populates a [`InputDescriptor`] for this resource, for storage in a
    /// metadata-cache partition (spec §4.6 "FillInPartitionInputInfo").
    /// Hashing goes through the injected [`Hasher`] rather than calling
    /// `blake3` directly (spec §4.10 "the hasher").
    pub fn fill_in_partition_input_info(
        &self,
        include_hash: bool,
        hasher: &dyn Hasher,
    ) -> InputDescriptor {
        InputDescriptor {
            url: Some(self.url.to_string()),
            last_modified_ms: self.header("last-modified").and_then(|v| {
                httpdate::parse_http_date(v)
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as i64)
            }),
            expiration_ms: self.expiration_ms,
            date_ms: self.date_ms,
            content_hash: include_hash.then(|| hasher.hash_hex(&self.raw_body)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn url() -> Url {
        Url::parse("http://example.com/a.css").unwrap()
    }

    #[test]
    fn valid_and_cacheable_requires_unexpired_ok_response() {
        let mut r = Resource::new(url());
        r.mark_loaded(FetchOutcome::Ok, HashMap::new(), b"body".to_vec(), 0, 3600_000).unwrap();
        assert!(r.is_valid_and_cacheable(0));
        assert!(!r.is_valid_and_cacheable(3600_001));
    }

    #[test]
    fn mark_loaded_twice_is_an_error() {
        let mut r = Resource::new(url());
        r.mark_loaded(FetchOutcome::Ok, HashMap::new(), b"body".to_vec(), 0, 1000).unwrap();
        assert!(r.mark_loaded(FetchOutcome::Ok, HashMap::new(), b"body".to_vec(), 0, 1000).is_err());
    }

    #[test]
    fn unsafe_to_rewrite_accumulates_reasons() {
        let mut r = Resource::new(url());
        let mut headers = HashMap::new();
        headers.insert("cache-control".to_string(), vec!["no-transform".to_string()]);
        r.mark_loaded(FetchOutcome::Fetch4xx, headers, Vec::new(), 0, 0).unwrap();
        let (safe, reasons) = r.is_safe_to_rewrite(false);
        assert!(!safe);
        assert!(reasons.len() >= 2, "expected multiple accumulated reasons, got {reasons:?}");
    }

    #[test]
    fn gzip_round_trips_through_extract() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"hello world").unwrap();
        let gz = encoder.finish().unwrap();

        let mut r = Resource::new(url());
        let mut headers = HashMap::new();
        headers.insert("content-encoding".to_string(), vec!["gzip".to_string()]);
        r.mark_loaded(FetchOutcome::Ok, headers, gz, 0, 1000).unwrap();
        assert_eq!(r.extract_uncompressed_contents().unwrap(), b"hello world");
        // Second call hits the cached path.
        assert_eq!(r.extract_uncompressed_contents().unwrap(), b"hello world");
    }

    #[test]
    fn fill_in_partition_input_info_includes_hash_when_requested() {
        use crate::hasher::Blake3Hasher;
        let hasher = Blake3Hasher;
        let mut r = Resource::new(url());
        r.mark_loaded(FetchOutcome::Ok, HashMap::new(), b"body".to_vec(), 10, 1000).unwrap();
        let info = r.fill_in_partition_input_info(true, &hasher);
        assert!(info.content_hash.is_some());
        let info = r.fill_in_partition_input_info(false, &hasher);
        assert!(info.content_hash.is_none());
    }
}
