//! Unified error types for shelf.
//!
//! Every variant renders with an upper-case code prefix so the code can be
//! surfaced to clients as a machine-readable reason.

use tokio_rusqlite::rusqlite;

/// Unified error types for the shelf caching engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input parameters (e.g., a request that cannot be keyed).
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    /// The generation store could not be opened.
    #[error("STORE_OPEN_FAILED: {0}")]
    StoreOpen(String),

    /// Database operation failed.
    #[error("CACHE_ERROR: {0}")]
    Database(tokio_rusqlite::Error),

    /// Migration failed to apply.
    #[error("CACHE_ERROR: migration failed: {0}")]
    MigrationFailed(String),

    /// A stored entry could not be decoded.
    #[error("CACHE_ERROR: corrupt entry: {0}")]
    CorruptEntry(String),

    /// Invalid URL.
    #[error("INVALID_URL: {0}")]
    InvalidUrl(String),

    /// The network could not be reached or the connection failed mid-flight.
    #[error("NETWORK_ERROR: {0}")]
    Network(String),

    /// Fetch timeout.
    #[error("FETCH_TIMEOUT: {0}")]
    FetchTimeout(String),

    /// Fetch response too large.
    #[error("FETCH_TOO_LARGE: {0}")]
    FetchTooLarge(String),

    /// HTTP error response (non-2xx where success was required).
    #[error("HTTP_ERROR: {0}")]
    HttpError(String),
}

impl Error {
    /// The machine-readable code carried in the display prefix.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "INVALID_INPUT",
            Error::StoreOpen(_) => "STORE_OPEN_FAILED",
            Error::Database(_) | Error::MigrationFailed(_) | Error::CorruptEntry(_) => "CACHE_ERROR",
            Error::InvalidUrl(_) => "INVALID_URL",
            Error::Network(_) => "NETWORK_ERROR",
            Error::FetchTimeout(_) => "FETCH_TIMEOUT",
            Error::FetchTooLarge(_) => "FETCH_TOO_LARGE",
            Error::HttpError(_) => "HTTP_ERROR",
        }
    }

    /// Whether the error came from the network side rather than the store.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::FetchTimeout(_) | Error::FetchTooLarge(_) | Error::HttpError(_)
        )
    }
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
            tokio_rusqlite::Error::Close(c) => Error::Database(tokio_rusqlite::Error::Close(c)),
            _ => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        Error::Database(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(tokio_rusqlite::Error::Error(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Network("connection refused".to_string());
        assert!(err.to_string().contains("NETWORK_ERROR"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_code_matches_display_prefix() {
        let errors = [
            Error::InvalidInput("x".into()),
            Error::StoreOpen("x".into()),
            Error::MigrationFailed("x".into()),
            Error::InvalidUrl("x".into()),
            Error::Network("x".into()),
            Error::FetchTimeout("x".into()),
            Error::FetchTooLarge("x".into()),
            Error::HttpError("x".into()),
        ];
        for err in errors {
            assert!(err.to_string().starts_with(err.code()), "{err}");
        }
    }

    #[test]
    fn test_is_network() {
        assert!(Error::Network("down".into()).is_network());
        assert!(Error::FetchTimeout("slow".into()).is_network());
        assert!(!Error::StoreOpen("locked".into()).is_network());
        assert!(!Error::CorruptEntry("bad".into()).is_network());
    }
}
