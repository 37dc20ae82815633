//! Configuration surface: `RewriteOptions` and the query-parameter scanner
//! (spec §4.9, §6 "Configuration surface", `SPEC_FULL.md` §3).

use std::collections::HashMap;

use crate::error::{CacheError, Result};
use crate::hasher::Hasher;
use crate::http_cache::RememberFailurePolicy;

/// Process-wide (baseline) or per-session (overlaid) rewrite configuration.
///
/// Copy-on-write per session (spec §4.9): a session clones the baseline
/// and overlays domain/query/header/cookie-derived options on top, never
/// mutating the shared baseline in place.
#[derive(Debug, Clone)]
pub struct RewriteOptions {
    /// `-1` means unlimited.
    pub max_cacheable_response_content_length: i64,
    /// Ceiling on `base + leaf` together.
    pub max_url_size: usize,
    /// Ceiling on the leaf alone.
    pub max_url_segment_size: usize,
    /// Per-[`crate::http_value::FailureKind`] memoization TTL table.
    pub remember_failure_policy: RememberFailurePolicy,
    /// Grace window after expiry during which a stale metadata-cache
    /// partition may still be served while a refresh runs.
    pub metadata_cache_staleness_threshold_ms: i64,
    /// Honor `Vary` when judging cacheability.
    pub respect_vary: bool,
    /// Bypass the proxy-cacheability check on `put`.
    pub force_caching: bool,
    /// Never cache `text/html` fetched over `https`.
    pub disable_html_caching_on_https: bool,
    /// Deadline for a single rewrite, in milliseconds (spec §5).
    pub rewrite_deadline_ms: i64,
    /// In-place resource requests block for the optimized result rather
    /// than serving the original while it's built.
    pub in_place_wait_for_optimized: bool,
    /// Allow rewriting resources whose response isn't itself cacheable.
    pub rewrite_uncacheable_resources: bool,
    /// Embed the options stub into output URLs (spec §6).
    pub add_options_to_urls: bool,
    /// Per-filter enable/disable flags, keyed by filter id.
    pub filter_enabled: HashMap<String, bool>,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        Self {
            max_cacheable_response_content_length: -1,
            max_url_size: 1024,
            max_url_segment_size: 1024,
            remember_failure_policy: RememberFailurePolicy::default(),
            metadata_cache_staleness_threshold_ms: 0,
            respect_vary: true,
            force_caching: false,
            disable_html_caching_on_https: false,
            rewrite_deadline_ms: 20,
            in_place_wait_for_optimized: false,
            rewrite_uncacheable_resources: false,
            add_options_to_urls: false,
            filter_enabled: HashMap::new(),
        }
    }
}

impl RewriteOptions {
    /// `true` if `filter_id` is enabled, defaulting to `false` for unknown
    /// filters.
    pub fn filter_enabled(&self, filter_id: &str) -> bool {
        self.filter_enabled.get(filter_id).copied().unwrap_or(false)
    }

    /// Disables every filter in `filter_ids` — used when overlaying
    /// XHR-specific restrictions (spec §4.9 step 4).
    pub fn disable_filters(&mut self, filter_ids: &[&str]) {
        for id in filter_ids {
            self.filter_enabled.insert(id.to_string(), false);
        }
    }
}

/// Computes a stable signature for `options`, used as the options-hash
/// component of every cache key (spec §4.9 step 5). Iterates
/// `filter_enabled` in sorted key order so the signature is stable under
/// reordering of options with identical values (spec §8 "Round-trips and
/// laws"). Hashing goes through the injected [`Hasher`] rather than
/// calling `blake3` directly (spec §4.10 "the hasher").
pub fn options_signature(options: &RewriteOptions, hasher: &dyn Hasher) -> String {
    let mut buf = Vec::new();
    buf.extend_from_slice(options.max_cacheable_response_content_length.to_string().as_bytes());
    buf.extend_from_slice(options.max_url_size.to_string().as_bytes());
    buf.extend_from_slice(options.max_url_segment_size.to_string().as_bytes());
    buf.extend_from_slice(options.metadata_cache_staleness_threshold_ms.to_string().as_bytes());
    buf.extend_from_slice(options.rewrite_deadline_ms.to_string().as_bytes());
    buf.extend_from_slice(&[
        options.respect_vary as u8,
        options.force_caching as u8,
        options.disable_html_caching_on_https as u8,
        options.in_place_wait_for_optimized as u8,
        options.rewrite_uncacheable_resources as u8,
        options.add_options_to_urls as u8,
    ]);
    let mut filters: Vec<(&String, &bool)> = options.filter_enabled.iter().collect();
    filters.sort_by_key(|(name, _)| name.as_str());
    for (name, enabled) in filters {
        buf.extend_from_slice(name.as_bytes());
        buf.push(*enabled as u8);
    }
    hasher.hash_hex(&buf)
}

/// Allow-list-driven parser for the reserved `PageSpeed*` query/header/
/// cookie convention (spec §4.9 step 3, §9 "Query-parameter-driven
/// options"). Unknown keys are a hard parse error, never silently ignored.
pub struct QueryParamScanner {
    allowed_keys: Vec<&'static str>,
}

impl Default for QueryParamScanner {
    fn default() -> Self {
        Self {
            allowed_keys: vec![
                "PageSpeedFilters",
                "PageSpeedCssInlineMaxBytes",
                "PageSpeedJsInlineMaxBytes",
                "PageSpeedImageInlineMaxBytes",
                "PageSpeedRewriteDeadlinePerFlushMs",
            ],
        }
    }
}

impl QueryParamScanner {
    /// Registers an additional recognized key.
    pub fn allow(&mut self, key: &'static str) {
        self.allowed_keys.push(key);
    }

    /// Overlays `params` (already split `key=value` pairs) onto `base`,
    /// cloning it first (copy-on-write, spec §4.9). Returns an
    /// `InvalidRequestOptions` error on the first unrecognized
    /// `PageSpeed*` key, short-circuiting the whole request (spec §7
    /// "Options parsing failures").
    pub fn overlay(
        &self,
        base: &RewriteOptions,
        params: &[(&str, &str)],
    ) -> Result<RewriteOptions> {
        let mut options = base.clone();
        for (key, value) in params {
            if !key.starts_with("PageSpeed") {
                continue;
            }
            if !self.allowed_keys.contains(key) {
                return Err(CacheError::InvalidRequestOptions(key.to_string()));
            }
            apply_known_key(&mut options, key, value)?;
        }
        Ok(options)
    }
}

fn apply_known_key(options: &mut RewriteOptions, key: &str, value: &str) -> Result<()> {
    match key {
        "PageSpeedFilters" => {
            for filter in value.split(',') {
                let filter = filter.trim();
                if let Some(disabled) = filter.strip_prefix('-') {
                    options.filter_enabled.insert(disabled.to_string(), false);
                } else {
                    let enabled = filter.strip_prefix('+').unwrap_or(filter);
                    options.filter_enabled.insert(enabled.to_string(), true);
                }
            }
        }
        "PageSpeedRewriteDeadlinePerFlushMs" => {
            options.rewrite_deadline_ms = value
                .parse()
                .map_err(|_| CacheError::InvalidRequestOptions(key.to_string()))?;
        }
        // Inline-max-bytes knobs are recognized but not modeled by this
        // core (they govern an optimizer's behavior, not caching) —
        // accepted and otherwise ignored rather than rejected.
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_key_is_a_hard_error() {
        let scanner = QueryParamScanner::default();
        let base = RewriteOptions::default();
        let err = scanner.overlay(&base, &[("PageSpeedBogus", "1")]).unwrap_err();
        assert!(matches!(err, CacheError::InvalidRequestOptions(_)));
    }

    #[test]
    fn non_pagespeed_keys_are_ignored() {
        let scanner = QueryParamScanner::default();
        let base = RewriteOptions::default();
        let overlaid = scanner.overlay(&base, &[("unrelated", "1")]).unwrap();
        assert_eq!(overlaid.rewrite_deadline_ms, base.rewrite_deadline_ms);
    }

    #[test]
    fn filters_directive_parses_plus_and_minus_prefixes() {
        let scanner = QueryParamScanner::default();
        let base = RewriteOptions::default();
        let overlaid =
            scanner.overlay(&base, &[("PageSpeedFilters", "+combine_css,-inline_css")]).unwrap();
        assert!(overlaid.filter_enabled("combine_css"));
        assert!(!overlaid.filter_enabled("inline_css"));
    }

    #[test]
    fn deadline_override_parses_to_integer() {
        let scanner = QueryParamScanner::default();
        let base = RewriteOptions::default();
        let overlaid = scanner
            .overlay(&base, &[("PageSpeedRewriteDeadlinePerFlushMs", "500")])
            .unwrap();
        assert_eq!(overlaid.rewrite_deadline_ms, 500);
    }

    #[test]
    fn baseline_is_not_mutated_by_overlay() {
        let scanner = QueryParamScanner::default();
        let base = RewriteOptions::default();
        let _ = scanner.overlay(&base, &[("PageSpeedRewriteDeadlinePerFlushMs", "500")]).unwrap();
        assert_eq!(base.rewrite_deadline_ms, 20);
    }
}
