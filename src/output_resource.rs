//! C7 — Output resource: a handle for one optimized artifact (spec §3, §4.7).

use std::collections::HashMap;

use url::Url;

use crate::error::{CacheError, Result};
use crate::hasher::Hasher;
use crate::http_value::HttpValue;
use crate::resource::Resource;
use crate::url_codec::{check_length, shard_authority, NamingContext, ResourceNamer};

/// One year in milliseconds — the default max-age for generated output
/// before input cache-control narrows it (spec §4.7 `kGeneratedMaxAgeMs`).
const GENERATED_MAX_AGE_MS: i64 = 365 * 24 * 60 * 60 * 1000;

/// Headers `MergeNonCachingResponseHeaders` must never copy from inputs
/// (spec §4.7 step 2, spec §8 invariant 7).
const NON_CACHING_BLOCKLIST: &[&str] = &[
    "cache-control",
    "content-encoding",
    "content-length",
    "content-type",
    "date",
    "etag",
    "expires",
    "last-modified",
    "set-cookie",
    "set-cookie2",
    "transfer-encoding",
    "vary",
];

/// What kind of output this is (spec §3 "Output resource").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Computed per-request, never persisted under its own URL.
    OnTheFly,
    /// A rewritten variant of one or more inputs, persisted under an
    /// encoded URL.
    Rewritten,
    /// Content moved out of the HTML into its own resource (e.g. outlined
    /// CSS/JS).
    Outlined,
    /// Embedded directly into the HTML; has no URL of its own.
    Inline,
}

/// A handle for one optimized artifact (spec §3 "Output resource").
#[derive(Debug, Clone)]
pub struct OutputResource {
    /// Base URL after origin/rewrite mapping has been applied.
    pub resolved_base: Url,
    /// Base URL before any mapping.
    pub unmapped_base: Url,
    /// Base URL exactly as it appeared in the originating HTML.
    pub original_base: Url,
    /// Structured leaf encoding (spec §3 "ResourceNamer").
    pub namer: ResourceNamer,
    /// Output kind.
    pub kind: OutputKind,
}

/// Merged cache-control result of [`apply_input_cache_control`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergedCacheControl {
    /// Effective max-age, in seconds.
    pub max_age_secs: i64,
    /// `true` if any input was `private`.
    pub private: bool,
    /// `true` if any input was `no-store`.
    pub no_store: bool,
}

impl MergedCacheControl {
    /// Renders as a `Cache-Control` header value.
    pub fn to_header_value(self) -> String {
        let mut parts = vec![format!("max-age={}", self.max_age_secs)];
        if self.private {
            parts.push("private".to_string());
        }
        if self.no_store {
            parts.push("no-store".to_string());
        }
        parts.join(", ")
    }
}

fn parse_max_age_secs(cache_control: &str) -> Option<i64> {
    cache_control.split(',').find_map(|directive| {
        directive.trim().strip_prefix("max-age=")?.parse::<i64>().ok()
    })
}

/// Computes the merged cache-control for an output built from `inputs`
/// (spec §4.7 step 1 `ApplyInputCacheControl`): starts from
/// [`GENERATED_MAX_AGE_MS`] and takes the stricter of each input's
/// max-age/privacy; `private`/`no-store` propagate, `no-cache` forces
/// `max-age=0`.
pub fn apply_input_cache_control(inputs: &[&Resource]) -> MergedCacheControl {
    let mut result = MergedCacheControl {
        max_age_secs: GENERATED_MAX_AGE_MS / 1000,
        private: false,
        no_store: false,
    };
    for input in inputs {
        let Some(cc) = input.header("cache-control") else { continue };
        let lower = cc.to_ascii_lowercase();
        if lower.contains("no-store") {
            result.no_store = true;
        }
        if lower.contains("private") {
            result.private = true;
        }
        if lower.contains("no-cache") {
            result.max_age_secs = 0;
        }
        if let Some(max_age) = parse_max_age_secs(&lower) {
            result.max_age_secs = result.max_age_secs.min(max_age);
        }
    }
    result
}

/// Copies non-caching response headers from `inputs`, skipping
/// [`NON_CACHING_BLOCKLIST`] (spec §4.7 step 2). Idempotent and never
/// emits a blocklisted header (spec §8 invariant 7): later inputs
/// overwrite earlier ones for the same header name, and re-running over
/// the result of a prior merge changes nothing since blocklisted headers
/// are never present in the output to begin with.
pub fn merge_non_caching_response_headers(
    inputs: &[&Resource],
) -> HashMap<String, Vec<String>> {
    let mut merged = HashMap::new();
    for input in inputs {
        for name in input.non_blocklisted_header_names(NON_CACHING_BLOCKLIST) {
            if let Some(value) = input.header(&name) {
                merged.insert(name, vec![value.to_string()]);
            }
        }
    }
    merged
}

/// Result of [`OutputResource::write`].
#[derive(Debug, Clone)]
pub struct WriteResult {
    /// The constructed cache value. For non-inline kinds this is what the
    /// caller should `put` through C3 under `encoded_url`; for
    /// [`OutputKind::Inline`] it carries no URL and is keyed by content
    /// hash only.
    pub value: HttpValue,
    /// The encoded output URL, `None` for [`OutputKind::Inline`].
    pub encoded_url: Option<String>,
}

impl OutputResource {
    /// Builds the cache value for this output (spec §4.7 "Write").
    ///
    /// Inline outputs skip steps 4-5 (no `X-Original-Content-Length`, no
    /// URL) and are keyed by content hash only. For non-inline kinds, the
    /// constructed leaf is checked against `naming.budget` before the URL
    /// is joined (spec §4.5, §6), and distributed across `naming.shards`
    /// when sharding is configured.
    pub fn write(
        &self,
        inputs: &[&Resource],
        bytes: Vec<u8>,
        content_type: &str,
        charset: Option<&str>,
        hasher: &dyn Hasher,
        naming: &NamingContext,
    ) -> Result<WriteResult> {
        let merged_cc = apply_input_cache_control(inputs);
        let mut headers = merge_non_caching_response_headers(inputs);
        headers.insert("cache-control".to_string(), vec![merged_cc.to_header_value()]);

        let content_type = match charset {
            Some(charset) => format!("{content_type}; charset=\"{charset}\""),
            None => content_type.to_string(),
        };
        headers.insert("content-type".to_string(), vec![content_type]);

        if self.kind == OutputKind::Inline {
            let content_hash = hasher.hash_hex(&bytes);
            let value = HttpValue {
                body: bytes,
                headers,
                status: 200,
                url: self.resolved_base.clone(),
                date_ms: 0,
                content_hash: Some(content_hash),
            };
            return Ok(WriteResult { value, encoded_url: None });
        }

        let total_input_len: usize = inputs
            .iter()
            .map(|r| r.extract_uncompressed_contents().map(|b| b.len()).unwrap_or(0))
            .sum();
        headers.insert(
            "x-original-content-length".to_string(),
            vec![total_input_len.to_string()],
        );

        let encoded_leaf = self.namer.encode();
        check_length(
            self.resolved_base.as_str().len(),
            &self.namer,
            naming.hash_length,
            naming.signature_length,
            &naming.budget,
        )?;

        let mut url = self
            .resolved_base
            .join(&encoded_leaf)
            .map_err(CacheError::InvalidUrl)?;
        if let Some(shard) = shard_authority(&naming.shards, &encoded_leaf, hasher) {
            url.set_host(Some(shard)).map_err(CacheError::InvalidUrl)?;
        }

        let value = HttpValue {
            body: bytes,
            headers,
            status: 200,
            url: url.clone(),
            date_ms: 0,
            content_hash: None,
        };
        Ok(WriteResult { value, encoded_url: Some(url.to_string()) })
    }
}
