//! HTTP front end.
//!
//! Every request outside `/__shelf/` is intercepted. Origin-form targets are
//! resolved against the configured origin; absolute-form targets (forward
//! proxy use) are fetched as given. Until the lifecycle is active, requests
//! are relayed to the network untouched.
//!
//! `GET /__shelf/clients` upgrades to a WebSocket control channel and
//! `GET /__shelf/status` reports the lifecycle phase.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, Request, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use shelf_client::fetch::{is_hop_by_hop, resolve};
use shelf_client::{Network, NetworkResponse, ResourceFetcher, ResourceRequest, Served, StrategyRouter};
use shelf_core::{AppConfig, ConfigError, Error, SqliteRegistry, SqliteStore};
use tokio::sync::OnceCell;

use crate::clients::ClientRegistry;
use crate::control::ControlChannel;
use crate::error::ProxyError;
use crate::lifecycle::{LifecycleController, LifecycleSettings, Phase};

pub type Lifecycle<N> = LifecycleController<SqliteRegistry, N>;
pub type Control<N> = ControlChannel<SqliteRegistry, N>;

const SERVED_HEADER: &str = "x-shelf-served";

/// Shared state behind every handler.
pub struct AppState<N: Network> {
    network: Arc<N>,
    lifecycle: Arc<Lifecycle<N>>,
    control: Control<N>,
    router: StrategyRouter,
    fetcher: OnceCell<ResourceFetcher<N, SqliteStore>>,
    max_body: usize,
    version: String,
}

impl<N> AppState<N>
where
    N: Network + 'static,
{
    pub fn from_config(config: &AppConfig, registry: Arc<SqliteRegistry>, network: Arc<N>) -> Result<Self, ConfigError> {
        let origin = config.origin_url()?;
        let clients = Arc::new(ClientRegistry::new());
        let lifecycle = Arc::new(LifecycleController::new(
            LifecycleSettings::from_config(config)?,
            registry.clone(),
            network.clone(),
            clients.clone(),
        ));
        let control = ControlChannel::new(lifecycle.clone(), registry, clients, origin.clone(), config.version.clone());

        Ok(Self {
            network,
            lifecycle,
            control,
            router: StrategyRouter::from_config(config, origin),
            fetcher: OnceCell::new(),
            max_body: config.max_bytes,
            version: config.version.clone(),
        })
    }

    /// Drive the lifecycle to active and start serving from the store.
    pub async fn run_lifecycle(&self) -> Result<(), Error> {
        let store = self.lifecycle.run().await?;
        let fetcher = ResourceFetcher::new(self.network.clone(), store, self.router.clone());
        if self.fetcher.set(fetcher).is_err() {
            tracing::debug!("fetcher already active");
        }
        Ok(())
    }

    fn active_fetcher(&self) -> Option<&ResourceFetcher<N, SqliteStore>> {
        if self.lifecycle.phase() == Phase::Active { self.fetcher.get() } else { None }
    }
}

pub fn router<N: Network + 'static>(state: Arc<AppState<N>>) -> Router {
    Router::new()
        .route("/__shelf/clients", get(connect::<N>))
        .route("/__shelf/status", get(status::<N>))
        .route("/__shelf/{*rest}", any(reserved))
        .fallback(intercept::<N>)
        .with_state(state)
}

async fn intercept<N: Network + 'static>(State(state): State<Arc<AppState<N>>>, request: Request) -> Response {
    match relay(&state, request).await {
        Ok((response, served)) => into_http(response, served),
        Err(e) => e.into_response(),
    }
}

async fn relay<N: Network + 'static>(
    state: &AppState<N>,
    request: Request,
) -> Result<(NetworkResponse, Served), ProxyError> {
    let (parts, body) = request.into_parts();
    let body =
        axum::body::to_bytes(body, state.max_body).await.map_err(|_| ProxyError::PayloadTooLarge(state.max_body))?;

    let target = parts.uri.to_string();
    let url = resolve(&target, state.router.origin()).map_err(|e| ProxyError::InvalidTarget(e.to_string()))?;
    let navigate = is_navigation(&parts.method, &parts.headers);
    let request = ResourceRequest { method: parts.method, url, headers: parts.headers, body, navigate };

    match state.active_fetcher() {
        Some(fetcher) => {
            let outcome = fetcher.respond(&request).await?;
            tracing::debug!(
                url = %request.url,
                strategy = outcome.route.strategy.as_str(),
                served = outcome.served.as_str(),
                status = outcome.response.status.as_u16(),
                "served"
            );
            Ok((outcome.response, outcome.served))
        }
        None => {
            let response = state.network.fetch(&request).await?;
            Ok((response, Served::Passthrough))
        }
    }
}

fn is_navigation(method: &Method, headers: &HeaderMap) -> bool {
    let has = |name: &str, expected: &[u8]| headers.get(name).is_some_and(|v| v.as_bytes() == expected);
    if has("sec-fetch-mode", b"navigate") || has("sec-fetch-dest", b"document") {
        return true;
    }
    method == Method::GET
        && headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|accept| accept.contains("text/html"))
}

fn into_http(response: NetworkResponse, served: Served) -> Response {
    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = response.status;
    let headers = out.headers_mut();
    for (name, value) in response.headers.iter().filter(|(name, _)| !is_hop_by_hop(name)) {
        headers.append(name.clone(), value.clone());
    }
    headers.insert(HeaderName::from_static(SERVED_HEADER), HeaderValue::from_static(served.as_str()));
    out
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    phase: Phase,
    generation_id: String,
    version: String,
    clients: usize,
}

async fn status<N: Network + 'static>(State(state): State<Arc<AppState<N>>>) -> Json<StatusReport> {
    Json(StatusReport {
        phase: state.lifecycle.phase(),
        generation_id: state.lifecycle.generation_id().to_string(),
        version: state.version.clone(),
        clients: state.control.clients().count().await,
    })
}

async fn reserved() -> Response {
    let body = serde_json::json!({ "error": "unknown control endpoint", "reason": "NOT_FOUND" });
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    /// Generation the connecting page is currently controlled by.
    controller: Option<String>,
}

async fn connect<N: Network + 'static>(
    State(state): State<Arc<AppState<N>>>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| client_session(state, socket, params.controller))
}

async fn client_session<N: Network + 'static>(state: Arc<AppState<N>>, socket: WebSocket, controller: Option<String>) {
    let clients = state.control.clients().clone();
    let (id, mut outbox) = clients.register(controller).await;
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(reply) = outbox.recv().await {
            let text = match serde_json::to_string(&reply) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(client = id, error = %e, "could not encode control reply");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => state.control.handle_raw(id, text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(client = id, error = %e, "control socket error");
                break;
            }
        }
    }

    clients.unregister(id).await;
    writer.abort();
}

#[cfg(test)]
mod tests {
    use axum::http::Request as HttpRequest;
    use shelf_client::testing::ScriptedNetwork;
    use shelf_core::CacheDb;
    use tower::ServiceExt;

    use super::*;

    const ORIGIN: &str = "https://shop.example";

    fn config() -> AppConfig {
        AppConfig {
            origin: ORIGIN.into(),
            precache: vec!["/".into(), "/index.html".into(), "/style.css".into()],
            dynamic_endpoints: vec!["shop.example/api/".into()],
            max_bytes: 64,
            ..Default::default()
        }
    }

    fn network() -> ScriptedNetwork {
        ScriptedNetwork::new(ORIGIN)
            .ok("/", "text/html", "<h1>home</h1>")
            .ok("/index.html", "text/html", "<h1>index</h1>")
            .ok("/style.css", "text/css", "body{}")
            .ok("/api/orders", "application/json", "[]")
    }

    async fn setup() -> (Router, Arc<AppState<ScriptedNetwork>>, Arc<ScriptedNetwork>) {
        let registry = Arc::new(SqliteRegistry::new(CacheDb::open_in_memory().await.unwrap()));
        let network = Arc::new(network());
        let state = Arc::new(AppState::from_config(&config(), registry, network.clone()).unwrap());
        (router(state.clone()), state, network)
    }

    async fn send(app: &Router, request: HttpRequest<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, body.to_vec())
    }

    fn get(uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn navigate(uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder().uri(uri).header("sec-fetch-mode", "navigate").body(Body::empty()).unwrap()
    }

    fn served(headers: &HeaderMap) -> &str {
        headers.get(SERVED_HEADER).and_then(|v| v.to_str().ok()).unwrap_or_default()
    }

    #[tokio::test]
    async fn test_passthrough_before_activation() {
        let (app, _, network) = setup().await;

        let (status, headers, body) = send(&app, get("/style.css")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(served(&headers), "passthrough");
        assert_eq!(body, b"body{}");
        assert_eq!(network.fetches_of("/style.css").await, 1);
    }

    #[tokio::test]
    async fn test_cache_first_after_activation() {
        let (app, state, network) = setup().await;
        state.run_lifecycle().await.unwrap();
        network.go_offline();

        let (status, headers, body) = send(&app, get("/style.css")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(served(&headers), "cache");
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "text/css");
        assert_eq!(body, b"body{}");
    }

    #[tokio::test]
    async fn test_absolute_form_target_is_fetched_as_given() {
        let (app, state, network) = setup().await;
        state.run_lifecycle().await.unwrap();

        let (status, _, _) = send(&app, get("http://cdn.example/lib.js")).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(network.fetches_of("http://cdn.example/lib.js").await, 1);
    }

    #[tokio::test]
    async fn test_offline_navigation_falls_back_to_shell() {
        let (app, state, network) = setup().await;
        state.run_lifecycle().await.unwrap();
        network.go_offline();

        let (status, headers, body) = send(&app, navigate("/products/42")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(served(&headers), "fallback");
        assert_eq!(body, b"<h1>home</h1>");
    }

    #[tokio::test]
    async fn test_offline_asset_miss_is_503_json() {
        let (app, state, network) = setup().await;
        state.run_lifecycle().await.unwrap();
        network.go_offline();

        let (status, headers, body) = send(&app, get("/missing.png")).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(served(&headers), "offline");
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["reason"], "NETWORK_ERROR");
    }

    #[tokio::test]
    async fn test_dynamic_endpoint_is_never_cached() {
        let (app, state, network) = setup().await;
        state.run_lifecycle().await.unwrap();

        send(&app, get("/api/orders")).await;
        network.go_offline();
        let (status, _, _) = send(&app, get("/api/orders")).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(network.fetches_of("/api/orders").await, 2);
    }

    #[tokio::test]
    async fn test_bypass_network_failure_is_bad_gateway() {
        let (app, state, network) = setup().await;
        state.run_lifecycle().await.unwrap();
        network.go_offline();

        let request = HttpRequest::builder().method(Method::POST).uri("/cart").body(Body::from("{}")).unwrap();
        let (status, _, body) = send(&app, request).await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["reason"], "NETWORK_ERROR");
    }

    #[tokio::test]
    async fn test_oversized_request_body_rejected() {
        let (app, _, _) = setup().await;

        let request =
            HttpRequest::builder().method(Method::POST).uri("/upload").body(Body::from(vec![0u8; 128])).unwrap();
        let (status, _, _) = send(&app, request).await;

        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_status_reports_phase() {
        let (app, state, _) = setup().await;

        let (_, _, body) = send(&app, get("/__shelf/status")).await;
        let before: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(before["phase"], "installing");

        state.run_lifecycle().await.unwrap();
        let (status, _, body) = send(&app, get("/__shelf/status")).await;
        let after: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(status, StatusCode::OK);
        assert_eq!(after["phase"], "active");
        assert_eq!(after["generationId"], "shelf-v1");
        assert_eq!(after["version"], "1.0.0");
        assert_eq!(after["clients"], 0);
    }

    #[tokio::test]
    async fn test_unknown_reserved_path_is_404() {
        let (app, _, network) = setup().await;

        let (status, _, _) = send(&app, get("/__shelf/nope")).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(network.fetch_count().await, 0);
    }

    #[test]
    fn test_navigation_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_navigation(&Method::GET, &headers));

        headers.insert(header::ACCEPT, HeaderValue::from_static("text/html,application/xhtml+xml"));
        assert!(is_navigation(&Method::GET, &headers));
        assert!(!is_navigation(&Method::POST, &headers));

        let mut fetch_meta = HeaderMap::new();
        fetch_meta.insert("sec-fetch-mode", HeaderValue::from_static("cors"));
        assert!(!is_navigation(&Method::GET, &fetch_meta));
        fetch_meta.insert("sec-fetch-dest", HeaderValue::from_static("document"));
        assert!(is_navigation(&Method::GET, &fetch_meta));
    }
}
