//! Synthesized responses for when neither the network nor the store can answer.

use bytes::Bytes;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{StatusCode, Url};
use serde::Serialize;
use shelf_core::{Error, ResponseType};

use crate::fetch::NetworkResponse;

const OFFLINE_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Offline</title>
<style>
body { font-family: system-ui, sans-serif; display: flex; align-items: center; justify-content: center; min-height: 100vh; margin: 0; background: #f5f5f5; color: #333; }
main { text-align: center; padding: 2rem; }
button { margin-top: 1rem; padding: .5rem 1.5rem; font-size: 1rem; cursor: pointer; }
</style>
</head>
<body>
<main>
<h1>You are offline</h1>
<p>This page is not available without a connection. Check your network and try again.</p>
<button onclick="location.reload()">Retry</button>
</main>
</body>
</html>
"#;

#[derive(Serialize)]
struct OfflinePayload<'a> {
    error: String,
    reason: &'a str,
}

/// Static offline HTML page, served with status 200 so the surrounding
/// application can render it.
pub fn offline_document(url: &Url) -> NetworkResponse {
    synthesized(url, StatusCode::OK, "text/html; charset=utf-8", Bytes::from_static(OFFLINE_PAGE.as_bytes()))
}

/// `{"error": ..., "reason": ...}` JSON body with status 503.
pub fn offline_error(url: &Url, cause: &Error) -> NetworkResponse {
    let payload = OfflinePayload { error: format!("offline: {url} is unavailable"), reason: cause.code() };
    let body = serde_json::to_vec(&payload).unwrap_or_else(|_| br#"{"error":"offline"}"#.to_vec());
    synthesized(url, StatusCode::SERVICE_UNAVAILABLE, "application/json", Bytes::from(body))
}

fn synthesized(url: &Url, status: StatusCode, content_type: &'static str, body: Bytes) -> NetworkResponse {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    NetworkResponse { url: url.clone(), status, headers, body, response_type: ResponseType::Basic, fetch_ms: 0 }
}
