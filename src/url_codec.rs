//! C5 — URL codec.
//!
//! Encodes/decodes rewritten-resource leaves of the form
//! `name.pagespeed[.variant].id.hash[.sig].ext` (spec §3 "ResourceNamer",
//! §6 "URL grammar"), grounded on
//! `original_source/net/instaweb/rewriter/public/resource_namer.h`'s
//! `id_`/`options_`/`name_`/`hash_`/`ext_`/`experiment_`/`signature_` field
//! set. The original's `Decode` takes `hash_length`/`signature_length`
//! explicitly (from the configured hasher) to disambiguate the grammar
//! rather than guessing from content — this codec does the same.
//!
//! **Open question resolved:** spec §9 leaves it to implementers whether
//! the optional experiment and PSOL-options segments can coexist. This
//! codec follows the original's narrower grammar (`[.(EXPT|OPTS)]`, never
//! both) by modeling them as one [`Variant`] enum — one optional segment,
//! unambiguous to decode given which kind the caller expects.

use percent_encoding::{percent_decode_str, percent_encode, AsciiSet, CONTROLS};

use crate::error::{CacheError, Result};
use crate::hasher::Hasher;

const SUFFIX: &str = "pagespeed";

const PLUS_ESCAPE: &AsciiSet = &CONTROLS.add(b'+').add(b'%');

/// The single optional segment between `pagespeed` and the transformation
/// id: either an A/B experiment tag or a serialized PSOL-options stub, per
/// `add_options_to_urls` (spec §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Variant {
    /// A/B experiment framework tag.
    Experiment(String),
    /// Serialized options stub, present when `add_options_to_urls` is set.
    Options(String),
}

/// Tells [`ResourceNamer::decode`] which kind of segment to expect, since
/// the wire grammar alone can't distinguish [`Variant::Experiment`] from
/// [`Variant::Options`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantKind {
    /// No optional segment is expected to be present.
    None,
    /// A leftover segment, if present, is an experiment tag.
    Experiment,
    /// A leftover segment, if present, is an options stub.
    Options,
}

/// Structured encoding of a rewritten-resource leaf (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNamer {
    /// 2-letter transformation code.
    pub id: String,
    /// The un-suffixed, un-hashed original leaf name.
    pub name: String,
    /// Content hash, length fixed by the configured hasher.
    pub hash: String,
    /// File extension, no leading dot.
    pub ext: String,
    /// Optional experiment/options segment.
    pub variant: Option<Variant>,
    /// Optional signature, present when request signing is enabled.
    pub signature: Option<String>,
}

impl ResourceNamer {
    /// Encodes into `name.pagespeed[.variant].id.hash[.sig].ext`. Total and
    /// deterministic (spec §4.5).
    pub fn encode(&self) -> String {
        let mut leaf = format!("{}.{SUFFIX}", self.name);
        match &self.variant {
            Some(Variant::Experiment(tag)) => leaf.push_str(&format!(".{tag}")),
            Some(Variant::Options(opts)) => leaf.push_str(&format!(".{opts}")),
            None => {}
        }
        leaf.push_str(&format!(".{}.{}", self.id, self.hash));
        if let Some(sig) = &self.signature {
            leaf.push_str(&format!(".{sig}"));
        }
        leaf.push_str(&format!(".{}", self.ext));
        leaf
    }

    /// Decodes a leaf produced by [`Self::encode`]. Total: any string not
    /// matching the grammar returns `None` rather than erroring, per spec
    /// §4.5 ("decoding is total: any URL not matching the grammar is not a
    /// pagespeed resource").
    pub fn decode(
        encoded: &str,
        hash_length: usize,
        signature_length: usize,
        variant_kind: VariantKind,
    ) -> Option<Self> {
        let marker = format!(".{SUFFIX}.");
        let marker_pos = encoded.find(&marker)?;
        let name = encoded[..marker_pos].to_string();
        if name.is_empty() {
            return None;
        }

        let rest = &encoded[marker_pos + marker.len()..];
        let mut segs: Vec<&str> = rest.split('.').collect();
        // Need at least id, hash, ext.
        if segs.len() < 3 {
            return None;
        }

        let ext = segs.pop()?.to_string();

        let signature = if signature_length > 0 {
            let last = *segs.last()?;
            if last.len() == signature_length {
                segs.pop();
                Some(last.to_string())
            } else {
                None
            }
        } else {
            None
        };

        let hash = segs.pop()?.to_string();
        if hash_length > 0 && hash.len() != hash_length {
            return None;
        }

        let id = segs.pop()?.to_string();
        if id.len() != 2 {
            return None;
        }

        let variant = match (variant_kind, segs.pop()) {
            (VariantKind::None, None) => None,
            (VariantKind::None, Some(_)) => return None,
            (VariantKind::Experiment, Some(seg)) => Some(Variant::Experiment(seg.to_string())),
            (VariantKind::Options, Some(seg)) => Some(Variant::Options(seg.to_string())),
            (VariantKind::Experiment | VariantKind::Options, None) => None,
        };

        if !segs.is_empty() {
            // Leftover segments the name should have absorbed: the name
            // itself contained a literal ".pagespeed." substring, which
            // isn't a pagespeed leaf at all.
            return None;
        }

        Some(Self { id, name, hash, ext, variant, signature })
    }

    /// Resolves an inbound request leaf as a rewritten-resource reference
    /// (spec §4.5 request resolution). `decode` itself must stay total
    /// (spec §4.5), so this wrapper doesn't change its behavior for a leaf
    /// that simply isn't a pagespeed URL at all (no `.pagespeed.` marker —
    /// returns `Ok(None)`, same as `decode` returning `None`). But a leaf
    /// that *does* carry the marker and still fails to parse (wrong hash
    /// length, malformed variant segment, truncated grammar) is no longer
    /// silently treated as "not ours" — it's escalated to
    /// [`CacheError::BadEncodedUrl`], since a corrupt-but-clearly-intended
    /// rewritten-resource URL is a hard failure, not a pass-through.
    pub fn decode_or_reject(
        encoded: &str,
        hash_length: usize,
        signature_length: usize,
        variant_kind: VariantKind,
    ) -> Result<Option<Self>> {
        match Self::decode(encoded, hash_length, signature_length, variant_kind) {
            Some(namer) => Ok(Some(namer)),
            None if encoded.contains(&format!(".{SUFFIX}.")) => {
                Err(CacheError::BadEncodedUrl(encoded.to_string()))
            }
            None => Ok(None),
        }
    }

    /// Length the encoded leaf will eventually have once `hash`/`signature`
    /// are filled in, without requiring them to be set yet — the Rust
    /// analogue of `ResourceNamer::EventualSize`.
    pub fn eventual_len(&self, hash_length: usize, signature_length: usize) -> usize {
        let mut len = self.name.len() + 1 + SUFFIX.len();
        match &self.variant {
            Some(Variant::Experiment(tag)) => len += 1 + tag.len(),
            Some(Variant::Options(opts)) => len += 1 + opts.len(),
            None => {}
        }
        len += 1 + 2; // id
        len += 1 + hash_length;
        if signature_length > 0 {
            len += 1 + signature_length;
        }
        len += 1 + self.ext.len();
        len
    }
}

/// Length limits a codec-produced URL must respect (spec §4.5, §6).
#[derive(Debug, Clone, Copy)]
pub struct LengthBudget {
    /// Ceiling on `base + leaf` together.
    pub max_url_size: usize,
    /// Ceiling on the leaf alone.
    pub max_url_segment_size: usize,
    /// Slack reserved for downstream filters appending further suffixes.
    pub url_slack: usize,
}

impl Default for LengthBudget {
    fn default() -> Self {
        Self { max_url_size: 1024, max_url_segment_size: 1024, url_slack: 8 }
    }
}

/// Checks `namer`'s eventual encoded length against `budget`, given a
/// resolved base of `base_len` bytes.
pub fn check_length(
    base_len: usize,
    namer: &ResourceNamer,
    hash_length: usize,
    signature_length: usize,
    budget: &LengthBudget,
) -> Result<()> {
    let leaf_len = namer.eventual_len(hash_length, signature_length);
    if leaf_len + budget.url_slack > budget.max_url_segment_size {
        return Err(CacheError::SegmentTooLong(leaf_len, budget.max_url_segment_size));
    }
    let total_len = base_len + 1 + leaf_len;
    if total_len + budget.url_slack > budget.max_url_size {
        return Err(CacheError::SegmentTooLong(total_len, budget.max_url_size));
    }
    Ok(())
}

/// Joins multiple input URLs into one `+`-escaped multipart name segment,
/// for combining filters that fold N inputs into one output (spec §4.5,
/// §6 "combining encoder").
pub fn encode_multipart_name(urls: &[&str]) -> String {
    urls.iter()
        .map(|u| percent_encode(u.as_bytes(), PLUS_ESCAPE).to_string())
        .collect::<Vec<_>>()
        .join("+")
}

/// Inverse of [`encode_multipart_name`].
pub fn decode_multipart_name(name: &str) -> Vec<String> {
    name.split('+')
        .map(|seg| percent_decode_str(seg).decode_utf8_lossy().into_owned())
        .collect()
}

/// Picks a shard authority for `leaf` out of a fixed, ordered `shards` set
/// via a stable hash (spec §4.5 "Sharding"). `None` if `shards` is empty.
/// Hashing goes through the injected [`Hasher`] rather than calling
/// `blake3` directly (spec §4.10 "the hasher").
pub fn shard_authority<'a>(shards: &'a [String], leaf: &str, hasher: &dyn Hasher) -> Option<&'a str> {
    if shards.is_empty() {
        return None;
    }
    let digest = hasher.hash_hex(leaf.as_bytes());
    let prefix = u64::from_str_radix(&digest[..16.min(digest.len())], 16).unwrap_or(0);
    let idx = (prefix as usize) % shards.len();
    Some(&shards[idx])
}

/// Parameters shared by every call to [`crate::output_resource::OutputResource::write`]
/// for non-inline kinds (spec §4.5): the length budget the constructed
/// URL must respect, the configured hasher's hash/signature lengths (for
/// [`check_length`]'s eventual-length math), and the shard set output
/// URLs may be distributed across.
#[derive(Debug, Clone, Default)]
pub struct NamingContext {
    /// Hex length of the content hash the configured hasher produces.
    pub hash_length: usize,
    /// Length of the optional request-signing segment, `0` if disabled.
    pub signature_length: usize,
    /// Length ceilings the constructed URL must respect.
    pub budget: LengthBudget,
    /// Shard authorities to distribute output URLs across, empty to
    /// disable sharding.
    pub shards: Vec<String>,
}

/// Origin-map (fetch host) vs rewrite-map (output host) for one authority,
/// kept distinct so neither mapping leaks into the HTTP cache key (spec
/// §4.5 "Origin vs rewrite mapping") — callers must always key the cache
/// off the canonical HTML-referenced host, never off `fetch_host`/
/// `output_host`.
#[derive(Debug, Clone, Default)]
pub struct DomainMaps {
    origin_map: std::collections::HashMap<String, String>,
    rewrite_map: std::collections::HashMap<String, String>,
}

impl DomainMaps {
    /// Registers a fetch-only origin mapping: HTML references `html_host`
    /// but the resource is actually fetched from `fetch_host`.
    pub fn add_origin_mapping(&mut self, html_host: impl Into<String>, fetch_host: impl Into<String>) {
        self.origin_map.insert(html_host.into(), fetch_host.into());
    }

    /// Registers a rewrite mapping: optimized output for `html_host`
    /// appears under `output_host` (e.g. a CDN).
    pub fn add_rewrite_mapping(&mut self, html_host: impl Into<String>, output_host: impl Into<String>) {
        self.rewrite_map.insert(html_host.into(), output_host.into());
    }

    /// Host to actually fetch from for a resource HTML attributes to
    /// `html_host`.
    pub fn fetch_host<'a>(&'a self, html_host: &'a str) -> &'a str {
        self.origin_map.get(html_host).map(String::as_str).unwrap_or(html_host)
    }

    /// Host that should appear in output URLs for a resource HTML
    /// attributes to `html_host`.
    pub fn output_host<'a>(&'a self, html_host: &'a str) -> &'a str {
        self.rewrite_map.get(html_host).map(String::as_str).unwrap_or(html_host)
    }
}
