//! Stand-in for spec §6's fetcher contract.
//!
//! The core treats fetching as an external collaborator (spec §1
//! Non-goals: "the raw HTTP fetcher" is out of scope). This trait is the
//! minimal async seam [`crate::resource::Resource`] and
//! [`crate::session::RewriteSession`] need to drive a load; a real server
//! would implement it over whatever HTTP client it already embeds.

use std::collections::HashMap;

use async_trait::async_trait;
use url::Url;

use crate::error::Result;

/// The result of fetching one URL.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers, lower-cased keys.
    pub headers: HashMap<String, Vec<String>>,
    /// Response body, as delivered (possibly gzip-encoded on the wire).
    pub body: Vec<u8>,
}

/// Fetches one URL, optionally passing conditional-request headers (spec
/// §4.3 "Conditional refresh" supplies `If-None-Match`/`If-Modified-Since`
/// here when revalidating).
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Performs the fetch. `request_headers` carries any conditional
    /// validators the caller wants to send.
    async fn fetch(
        &self,
        url: &Url,
        request_headers: &HashMap<String, String>,
    ) -> Result<FetchResponse>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use dashmap::DashMap;
    use std::sync::Arc;

    /// An in-memory [`Fetcher`] test double keyed by URL string.
    #[derive(Debug, Clone, Default)]
    pub struct FakeFetcher {
        responses: Arc<DashMap<String, FetchResponse>>,
    }

    impl FakeFetcher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set(&self, url: &str, response: FetchResponse) {
            self.responses.insert(url.to_string(), response);
        }
    }

    #[async_trait]
    impl Fetcher for FakeFetcher {
        async fn fetch(
            &self,
            url: &Url,
            _request_headers: &HashMap<String, String>,
        ) -> Result<FetchResponse> {
            self.responses
                .get(url.as_str())
                .map(|r| r.clone())
                .ok_or_else(|| {
                    crate::error::CacheError::General(anyhow::anyhow!(
                        "no fake response registered for {url}"
                    ))
                })
        }
    }
}
