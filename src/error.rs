use miette::Diagnostic;
use thiserror::Error;

/// A `Result` typedef to use with the [`CacheError`] type.
pub type Result<T> = std::result::Result<T, CacheError>;

/// A generic error for the rewrite cache core.
#[derive(Error, Diagnostic, Debug)]
pub enum CacheError {
    /// A general error used as a catch all for internal invariant violations.
    #[error(transparent)]
    #[diagnostic(code(rewrite_cache::general))]
    General(#[from] anyhow::Error),
    /// Error from `http`.
    #[error(transparent)]
    #[diagnostic(code(rewrite_cache::http))]
    Http(#[from] http::Error),
    /// There was an error converting a header value to a string.
    #[error(transparent)]
    #[diagnostic(code(rewrite_cache::header_to_str))]
    HeaderToStr(#[from] http::header::ToStrError),
    /// There was an error parsing an HTTP header value.
    #[error(transparent)]
    #[diagnostic(code(rewrite_cache::invalid_header_value))]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),
    /// There was an error parsing an HTTP header name.
    #[error(transparent)]
    #[diagnostic(code(rewrite_cache::invalid_header_name))]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),
    /// There was an error parsing the URL.
    #[error(transparent)]
    #[diagnostic(code(rewrite_cache::invalid_url))]
    InvalidUrl(#[from] url::ParseError),
    /// Error from the disk cache backend.
    #[cfg(feature = "manager-cacache")]
    #[error(transparent)]
    #[diagnostic(code(rewrite_cache::cacache))]
    CaCache(#[from] cacache::Error),
    /// Error (de)serializing a cache record.
    #[cfg(feature = "manager-bincode")]
    #[error(transparent)]
    #[diagnostic(code(rewrite_cache::bincode))]
    Bincode(#[from] Box<bincode::ErrorKind>),
    /// Error (de)serializing a cache record via postcard.
    #[error(transparent)]
    #[diagnostic(code(rewrite_cache::postcard))]
    Postcard(#[from] postcard::Error),
    /// A header value failed to parse into the expected shape.
    #[error("error parsing header value")]
    #[diagnostic(code(rewrite_cache::bad_header))]
    BadHeader,
    /// A leaf URL did not match the rewritten-resource grammar (spec §6).
    #[error("url does not match the rewritten-resource grammar: {0}")]
    #[diagnostic(code(rewrite_cache::bad_encoded_url))]
    BadEncodedUrl(String),
    /// The encoded leaf or resolved base exceeded a configured length budget.
    #[error("encoded url segment too long: {0} bytes (limit {1})")]
    #[diagnostic(code(rewrite_cache::segment_too_long))]
    SegmentTooLong(usize, usize),
    /// A request carried an unrecognized `PageSpeed*` option key.
    ///
    /// Per spec §9, this is a hard parse failure rather than a silent
    /// no-op, so typos in query options don't appear to "work".
    #[error("invalid request option: {0}")]
    #[diagnostic(code(rewrite_cache::invalid_request_options))]
    InvalidRequestOptions(String),
    /// A named lock's internal mutex was poisoned by a panicking holder.
    #[error("named lock poisoned: {0}")]
    #[diagnostic(code(rewrite_cache::lock_poisoned))]
    LockPoisoned(String),
}
