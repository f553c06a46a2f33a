//! Request classification.
//!
//! Rules are evaluated in order and the first match wins:
//!
//! 1. non-GET or non-http(s) → [`Strategy::Bypass`]
//! 2. dynamic endpoint → [`Strategy::NetworkOnly`]
//! 3. navigation, directory document or app-shell resource → [`Strategy::NetworkFirst`]
//! 4. cross-origin → [`Strategy::NetworkFirst`]
//! 5. same-origin static asset → [`Strategy::CacheFirst`]

use reqwest::{Method, Url};
use shelf_core::{AppConfig, DynamicEndpoint};

use crate::fetch::{ResourceRequest, is_fetchable, same_origin};

/// How a request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Not intercepted; goes straight to the network, never cached.
    Bypass,
    /// Always the network, never read from or written to the store.
    NetworkOnly,
    /// Network, falling back to the store and then a synthesized response.
    NetworkFirst,
    /// Store, falling back to the network.
    CacheFirst,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Bypass => "bypass",
            Strategy::NetworkOnly => "network-only",
            Strategy::NetworkFirst => "network-first",
            Strategy::CacheFirst => "cache-first",
        }
    }
}

/// Result of classifying a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub strategy: Strategy,
    /// Whether an offline fallback for this request should be an HTML page.
    pub document: bool,
}

/// Classifies intercepted requests into strategies.
#[derive(Debug, Clone)]
pub struct StrategyRouter {
    origin: Url,
    app_shell: Vec<String>,
    dynamic: Vec<DynamicEndpoint>,
}

impl StrategyRouter {
    pub fn new(origin: Url, app_shell: Vec<String>, dynamic: Vec<DynamicEndpoint>) -> Self {
        let app_shell = app_shell
            .into_iter()
            .filter_map(|entry| origin.join(&entry).ok())
            .filter(|url| same_origin(url, &origin))
            .map(|url| url.path().to_string())
            .collect();
        Self { origin, app_shell, dynamic }
    }

    /// Build from the application configuration. Unparseable dynamic
    /// endpoint entries are skipped with a warning.
    pub fn from_config(config: &AppConfig, origin: Url) -> Self {
        let dynamic = config
            .dynamic_endpoints
            .iter()
            .filter_map(|entry| {
                let parsed = DynamicEndpoint::parse(entry);
                if parsed.is_none() {
                    tracing::warn!(entry = %entry, "ignoring unparseable dynamic endpoint");
                }
                parsed
            })
            .collect();
        Self::new(origin, config.app_shell.clone(), dynamic)
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// App-shell resources as absolute URLs, in configured order.
    pub fn app_shell_urls(&self) -> Vec<Url> {
        self.app_shell.iter().filter_map(|path| self.origin.join(path).ok()).collect()
    }

    /// App-shell resources that can stand in for any document.
    pub fn shell_documents(&self) -> Vec<Url> {
        self.app_shell_urls().into_iter().filter(looks_like_document).collect()
    }

    pub fn classify(&self, request: &ResourceRequest) -> Route {
        let same = same_origin(&request.url, &self.origin);
        let document = request.navigate || (same && looks_like_document(&request.url));

        let strategy = if request.method != Method::GET || !is_fetchable(&request.url) {
            Strategy::Bypass
        } else if self.dynamic.iter().any(|d| d.matches(&request.url)) {
            Strategy::NetworkOnly
        } else if document || !same || self.is_app_shell(&request.url) {
            Strategy::NetworkFirst
        } else {
            Strategy::CacheFirst
        };

        Route { strategy, document }
    }

    fn is_app_shell(&self, url: &Url) -> bool {
        self.app_shell.iter().any(|path| path == url.path())
    }
}

fn looks_like_document(url: &Url) -> bool {
    let path = url.path();
    path.ends_with('/') || path.ends_with(".html") || path.ends_with(".htm")
}
