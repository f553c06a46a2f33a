//! URL resolution and origin checks for intercepted requests.

use url::Url;

/// Error type for request target resolution failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UrlError {
    #[error("empty URL")]
    Empty,

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

/// Resolve a request target into an absolute URL.
///
/// Absolute targets (forward-proxy style) are parsed as they are; anything
/// else is joined onto `origin`. Fragments are dropped and the host is
/// lowercased by the parser. Non-http schemes are kept so the router can
/// bypass them.
pub fn resolve(target: &str, origin: &Url) -> Result<Url, UrlError> {
    let trimmed = target.trim();

    if trimmed.is_empty() {
        return Err(UrlError::Empty);
    }

    let mut parsed = match Url::parse(trimmed) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            origin.join(trimmed).map_err(|e| UrlError::InvalidUrl(e.to_string()))?
        }
        Err(e) => return Err(UrlError::InvalidUrl(e.to_string())),
    };

    parsed.set_fragment(None);

    Ok(parsed)
}

/// Whether `url` uses a scheme the network layer can fetch.
pub fn is_fetchable(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

/// Whether two URLs share scheme, host and port.
pub fn same_origin(a: &Url, b: &Url) -> bool {
    a.origin() == b.origin()
}
