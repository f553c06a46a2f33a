//! Errors surfaced by the HTTP front end.
//!
//! These render as JSON bodies of the form `{"error": .., "reason": ..}`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The request target could not be resolved to a URL.
    #[error("INVALID_URL: {0}")]
    InvalidTarget(String),

    /// The request body exceeded the configured limit.
    #[error("PAYLOAD_TOO_LARGE: request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    /// A pass-through request failed at the network.
    #[error("{0}")]
    Upstream(#[from] shelf_core::Error),
}

impl ProxyError {
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::InvalidTarget(_) => "INVALID_URL",
            ProxyError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            ProxyError::Upstream(e) => e.code(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
            ProxyError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::Upstream(shelf_core::Error::FetchTimeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        tracing::debug!(error = %self, "request failed");
        let body = serde_json::json!({ "error": self.to_string(), "reason": self.code() });
        (self.status(), Json(body)).into_response()
    }
}
