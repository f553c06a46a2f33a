//! Dynamic endpoint patterns.

use url::Url;

/// A `host` or `host/path-prefix` that is always fetched live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicEndpoint {
    host: String,
    path_prefix: String,
}

impl DynamicEndpoint {
    /// Parse `host` or `host/path-prefix`. A leading scheme is ignored.
    pub fn parse(entry: &str) -> Option<Self> {
        let entry = entry.trim();
        let entry = entry.split_once("://").map_or(entry, |(_, rest)| rest);
        let (host, path) = match entry.find('/') {
            Some(idx) => (&entry[..idx], &entry[idx..]),
            None => (entry, "/"),
        };
        if host.is_empty() {
            return None;
        }
        Some(Self { host: host.to_ascii_lowercase(), path_prefix: path.to_string() })
    }

    /// Matches the host itself or any subdomain, then the path prefix.
    pub fn matches(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host_match = host == self.host || host.ends_with(&format!(".{}", self.host));
        host_match && url.path().starts_with(&self.path_prefix)
    }
}
