//! Network side of the caching engine.
//!
//! ### Requests
//! - [`ResourceRequest`] is an intercepted request: method, absolute URL,
//!   headers, body and whether it is a top-level navigation.
//!
//! ### Responses
//! - [`NetworkResponse`] holds the fully read body as [`Bytes`], so cloning it
//!   yields independent readable copies. One copy can go to the store while
//!   the other is returned to the caller.
//! - Non-2xx statuses are responses, not errors; only transport failures,
//!   timeouts and oversized bodies are errors.
//!
//! ### Network
//! - [`Network`] is the seam between strategies and the wire. [`FetchClient`]
//!   implements it with reqwest.

pub mod url;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, StatusCode, Url};
use std::time::{Duration, Instant};

use shelf_core::{CacheEntry, Error, RequestKey, ResponseSnapshot, ResponseType};

pub use self::url::{UrlError, is_fetchable, resolve, same_origin};

/// Hop-by-hop headers that must not be forwarded by a proxy.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Per-user state that is relayed to the caller but never stored.
const UNCACHEABLE: &[&str] = &["set-cookie", "set-cookie2"];

/// Whether a header is connection-scoped and must be dropped when relaying.
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Whether a header must be left out of a stored snapshot.
pub fn is_uncacheable(name: &HeaderName) -> bool {
    is_hop_by_hop(name) || UNCACHEABLE.contains(&name.as_str())
}

/// An intercepted outbound request.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Top-level navigation to a document.
    pub navigate: bool,
}

impl ResourceRequest {
    /// A plain GET subresource request.
    pub fn get(url: Url) -> Self {
        Self { method: Method::GET, url, headers: HeaderMap::new(), body: Bytes::new(), navigate: false }
    }

    /// A top-level document navigation.
    pub fn navigation(url: Url) -> Self {
        Self { navigate: true, ..Self::get(url) }
    }

    /// The cache key for this request, or None when it can never be cached.
    pub fn key(&self) -> Option<RequestKey> {
        RequestKey::new(self.method.as_str(), &self.url).ok()
    }
}

/// Response from the network, the store, or a synthesized fallback.
#[derive(Debug, Clone)]
pub struct NetworkResponse {
    /// The URL that produced the response (after redirects).
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub response_type: ResponseType,
    /// Time taken to fetch in milliseconds (0 when not from the network).
    pub fetch_ms: u64,
}

impl NetworkResponse {
    /// Whether the status is in the 2xx range.
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Capture an independent copy suitable for storing.
    pub fn snapshot(&self) -> ResponseSnapshot {
        ResponseSnapshot {
            status: self.status.as_u16(),
            status_text: self.status.canonical_reason().unwrap_or_default().to_string(),
            headers: self
                .headers
                .iter()
                .filter(|(name, _)| !is_uncacheable(name))
                .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
                .collect(),
            body: self.body.clone(),
            response_type: self.response_type,
        }
    }

    /// Rebuild a response from a stored entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptEntry`] if the stored URL, status or headers
    /// no longer parse.
    pub fn from_entry(entry: CacheEntry) -> Result<Self, Error> {
        let url = Url::parse(entry.key.url()).map_err(|e| Error::CorruptEntry(format!("{}: {e}", entry.key)))?;
        let status = StatusCode::from_u16(entry.payload.status)
            .map_err(|e| Error::CorruptEntry(format!("{}: {e}", entry.key)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &entry.payload.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::CorruptEntry(format!("{}: header {name}: {e}", entry.key)))?;
            let value = HeaderValue::from_bytes(value)
                .map_err(|e| Error::CorruptEntry(format!("{}: header {name}: {e}", entry.key)))?;
            headers.append(name, value);
        }

        Ok(Self {
            url,
            status,
            headers,
            body: entry.payload.body,
            response_type: entry.payload.response_type,
            fetch_ms: 0,
        })
    }

    /// Content-Type header value, if any.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }
}

/// Performs requests on behalf of the caching engine.
#[async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, request: &ResourceRequest) -> Result<NetworkResponse, Error>;
}

/// Configuration for the fetch client.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// The application's own origin; responses from it are `basic`.
    pub origin: Url,

    /// User agent string (default: "shelf/0.1")
    pub user_agent: String,

    /// Maximum response body size in bytes (default: 5MB)
    pub max_bytes: usize,

    /// Request timeout (default: 20s)
    pub timeout: Duration,

    /// Maximum number of redirects to follow (default: 5)
    pub max_redirects: usize,
}

impl FetchConfig {
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            user_agent: "shelf/0.1".to_string(),
            max_bytes: 5 * 1024 * 1024,
            timeout: Duration::from_millis(20000),
            max_redirects: 5,
        }
    }

    /// Build from the application configuration.
    pub fn from_app(config: &shelf_core::AppConfig) -> Result<Self, Error> {
        let origin = config
            .origin_url()
            .map_err(|e| Error::InvalidUrl(e.to_string()))?;
        Ok(Self {
            user_agent: config.user_agent.clone(),
            max_bytes: config.max_bytes,
            timeout: config.timeout(),
            ..Self::new(origin)
        })
    }
}

/// reqwest-backed [`Network`].
pub struct FetchClient {
    http: Client,
    config: FetchConfig,
}

impl FetchClient {
    /// Create a new fetch client with the given configuration.
    pub fn new(config: FetchConfig) -> Result<Self, Error> {
        let http = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .use_rustls_tls()
            .build()
            .map_err(|e| Error::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { http, config })
    }

    /// Get reference to the configuration.
    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    fn classify(&self, final_url: &Url) -> ResponseType {
        if same_origin(final_url, &self.config.origin) { ResponseType::Basic } else { ResponseType::Cors }
    }
}

#[async_trait]
impl Network for FetchClient {
    async fn fetch(&self, request: &ResourceRequest) -> Result<NetworkResponse, Error> {
        if !is_fetchable(&request.url) {
            return Err(Error::InvalidUrl(format!("unsupported scheme: {}", request.url.scheme())));
        }

        let start = Instant::now();

        let mut headers = HeaderMap::with_capacity(request.headers.len());
        for (name, value) in request.headers.iter().filter(|(name, _)| !is_hop_by_hop(name)) {
            headers.append(name.clone(), value.clone());
        }

        let mut builder = self
            .http
            .request(request.method.clone(), request.url.clone())
            .headers(headers);
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await.map_err(|e| map_reqwest_error(&request.url, e))?;

        if let Some(len) = response.content_length()
            && len as usize > self.config.max_bytes
        {
            return Err(Error::FetchTooLarge(format!("{len} bytes exceeds {}", self.config.max_bytes)));
        }

        let status = response.status();
        let final_url = response.url().clone();
        let headers = response.headers().clone();

        let body = response.bytes().await.map_err(|e| map_reqwest_error(&request.url, e))?;

        if body.len() > self.config.max_bytes {
            return Err(Error::FetchTooLarge(format!("{} bytes exceeds {}", body.len(), self.config.max_bytes)));
        }

        let fetch_ms = start.elapsed().as_millis() as u64;

        tracing::debug!(
            method = %request.method,
            url = %request.url,
            status = status.as_u16(),
            fetch_ms,
            bytes = body.len(),
            "fetched"
        );

        Ok(NetworkResponse { response_type: self.classify(&final_url), url: final_url, status, headers, body, fetch_ms })
    }
}

fn map_reqwest_error(url: &Url, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::FetchTimeout(format!("{url}: {err}"))
    } else {
        Error::Network(format!("{url}: {err}"))
    }
}
