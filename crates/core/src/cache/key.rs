//! Normalized request keys.
//!
//! An entry is addressed by `(method, absolute URL)`. The URL is normalized
//! (fragment dropped, host lowercased by the URL parser) so equivalent requests
//! share one entry, and the pair is hashed into a fixed-width storage key.

use sha2::{Digest, Sha256};
use url::Url;

use crate::Error;

/// The only method that is ever used as a cache key.
pub const GET: &str = "GET";

/// Normalized `(method, absolute URL)` pair identifying a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    method: String,
    url: String,
}

impl RequestKey {
    /// Key for a GET request to `url`.
    pub fn get(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self { method: GET.to_string(), url: url.to_string() }
    }

    /// Key for an arbitrary request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for any method other than GET, since only
    /// GET requests are ever cached.
    pub fn new(method: &str, url: &Url) -> Result<Self, Error> {
        if !method.eq_ignore_ascii_case(GET) {
            return Err(Error::InvalidInput(format!("{method} requests are never cached")));
        }
        Ok(Self::get(url))
    }

    /// Parse and normalize a URL string, then key it as a GET.
    pub fn parse(url: &str) -> Result<Self, Error> {
        let parsed = Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))?;
        Ok(Self::get(&parsed))
    }

    /// Rebuild a key from stored columns without re-normalizing.
    pub(crate) fn from_stored(method: String, url: String) -> Self {
        Self { method, url }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Storage key: SHA-256 over method and URL, hex encoded.
    pub fn hash(&self) -> String {
        compute_cache_key(&self.method, &self.url)
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// Compute the storage key for a request.
pub fn compute_cache_key(method: &str, url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.to_ascii_uppercase().as_bytes());
    hasher.update(b"\n");
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}
