// Integration test for FetchClient against a local fake upstream.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::extract::Request;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use reqwest::{Method, Url};
use tokio::net::TcpListener;

use shelf_client::{FetchClient, FetchConfig, Network, ResourceRequest};
use shelf_core::{Error, ResponseType};

const LOGO: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0xff];

async fn echo(req: Request) -> impl IntoResponse {
    let body = axum::body::to_bytes(req.into_body(), 1024).await.unwrap_or_default();
    (StatusCode::CREATED, body)
}

async fn slow() -> impl IntoResponse {
    tokio::time::sleep(Duration::from_secs(2)).await;
    "late"
}

async fn start_upstream() -> SocketAddr {
    let app = Router::new()
        .route("/", get(|| async { ([(header::CONTENT_TYPE, "text/html")], "<h1>home</h1>") }))
        .route("/logo.png", get(|| async { ([(header::CONTENT_TYPE, "image/png")], LOGO) }))
        .route("/big.bin", get(|| async { vec![7u8; 4096] }))
        .route("/slow", get(slow))
        .route("/orders", post(echo));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    addr
}

fn client_for(origin: &str) -> FetchClient {
    FetchClient::new(FetchConfig { timeout: Duration::from_millis(500), ..FetchConfig::new(Url::parse(origin).unwrap()) })
        .unwrap()
}

fn url(addr: SocketAddr, path: &str) -> Url {
    Url::parse(&format!("http://{addr}{path}")).unwrap()
}

#[tokio::test]
async fn test_same_origin_response_is_basic_and_byte_exact() {
    let addr = start_upstream().await;
    let client = client_for(&format!("http://{addr}"));

    let response = client.fetch(&ResourceRequest::get(url(addr, "/logo.png"))).await.unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.response_type, ResponseType::Basic);
    assert_eq!(response.content_type(), Some("image/png"));
    assert_eq!(response.body.as_ref(), LOGO);
}

#[tokio::test]
async fn test_cross_origin_response_is_cors() {
    let addr = start_upstream().await;
    let client = client_for("https://app.example");

    let response = client.fetch(&ResourceRequest::get(url(addr, "/"))).await.unwrap();

    assert_eq!(response.response_type, ResponseType::Cors);
    assert_eq!(response.body.as_ref(), b"<h1>home</h1>");
}

#[tokio::test]
async fn test_not_found_is_a_response_not_an_error() {
    let addr = start_upstream().await;
    let client = client_for(&format!("http://{addr}"));

    let response = client.fetch(&ResourceRequest::get(url(addr, "/missing.css"))).await.unwrap();

    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert!(!response.ok());
}

#[tokio::test]
async fn test_post_body_is_forwarded() {
    let addr = start_upstream().await;
    let client = client_for(&format!("http://{addr}"));
    let mut request = ResourceRequest::get(url(addr, "/orders"));
    request.method = Method::POST;
    request.body = bytes::Bytes::from_static(b"{\"id\":1}");

    let response = client.fetch(&request).await.unwrap();

    assert_eq!(response.status, StatusCode::CREATED);
    assert_eq!(response.body.as_ref(), b"{\"id\":1}");
}

#[tokio::test]
async fn test_body_limit_enforced() {
    let addr = start_upstream().await;
    let client = FetchClient::new(FetchConfig {
        max_bytes: 1024,
        ..FetchConfig::new(Url::parse(&format!("http://{addr}")).unwrap())
    })
    .unwrap();

    let result = client.fetch(&ResourceRequest::get(url(addr, "/big.bin"))).await;

    assert!(matches!(result, Err(Error::FetchTooLarge(_))));
}

#[tokio::test]
async fn test_timeout_maps_to_fetch_timeout() {
    let addr = start_upstream().await;
    let client = client_for(&format!("http://{addr}"));

    let result = client.fetch(&ResourceRequest::get(url(addr, "/slow"))).await;

    assert!(matches!(result, Err(Error::FetchTimeout(_))));
}

#[tokio::test]
async fn test_connection_refused_is_network_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let client = client_for(&format!("http://{addr}"));

    let result = client.fetch(&ResourceRequest::get(url(addr, "/"))).await;

    assert!(matches!(result, Err(Error::Network(_))));
}
