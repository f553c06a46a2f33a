//! Configuration validation rules.
//!
//! This module provides validation logic for `AppConfig` values
//! after they have been loaded from environment, files, or defaults.

use crate::config::{AppConfig, DynamicEndpoint};
use thiserror::Error;
use url::Url;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { field: field.into(), reason: reason.into() }
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - `generation_id`, `version` or `user_agent` is empty
    /// - `origin` is not an absolute http(s) URL
    /// - a `precache` entry cannot be resolved against `origin`
    /// - a `dynamic_endpoints` entry is blank
    /// - `max_bytes` is 0 or exceeds 50MB
    /// - `timeout_ms` is less than 100ms or exceeds 5 minutes
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.generation_id.trim().is_empty() {
            return Err(invalid("generation_id", "must not be empty"));
        }
        if self.version.trim().is_empty() {
            return Err(invalid("version", "must not be empty"));
        }
        if self.user_agent.is_empty() {
            return Err(invalid("user_agent", "must not be empty"));
        }

        let precache = self.precache_urls()?;

        if self.dynamic_endpoints.iter().any(|e| e.trim().is_empty()) {
            return Err(invalid("dynamic_endpoints", "entries must not be blank"));
        }

        if self.max_bytes == 0 {
            return Err(invalid("max_bytes", "must be greater than 0"));
        }
        if self.max_bytes > 50 * 1024 * 1024 {
            return Err(invalid("max_bytes", "must not exceed 50MB"));
        }

        if self.timeout_ms < 100 {
            return Err(invalid("timeout_ms", "must be at least 100ms"));
        }
        if self.timeout_ms > 300_000 {
            return Err(invalid("timeout_ms", "must not exceed 5 minutes (300000ms)"));
        }

        for url in self.dynamic_precache(&precache) {
            tracing::warn!(
                url = %url,
                "precache entry is a dynamic endpoint; it will be stored but never served from cache"
            );
        }

        Ok(())
    }

    /// Precache URLs that a dynamic endpoint would route to the network.
    fn dynamic_precache<'a>(&self, precache: &'a [Url]) -> Vec<&'a Url> {
        let endpoints: Vec<DynamicEndpoint> =
            self.dynamic_endpoints.iter().filter_map(|e| DynamicEndpoint::parse(e)).collect();
        precache.iter().filter(|url| endpoints.iter().any(|e| e.matches(url))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_config() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_empty_generation_id() {
        let config = AppConfig { generation_id: "  ".into(), ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "generation_id"));
    }

    #[test]
    fn test_validate_empty_version() {
        let config = AppConfig { version: String::new(), ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "version"));
    }

    #[test]
    fn test_validate_relative_origin() {
        let config = AppConfig { origin: "/app".into(), ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "origin"));
    }

    #[test]
    fn test_validate_blank_dynamic_endpoint() {
        let config = AppConfig { dynamic_endpoints: vec!["api.example.com".into(), "".into()], ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "dynamic_endpoints"));
    }

    #[test]
    fn test_validate_dynamic_precache_only_warns() {
        let config = AppConfig {
            origin: "https://app.example".into(),
            precache: vec!["/api/status".into()],
            dynamic_endpoints: vec!["app.example/api".into()],
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        let precache = config.precache_urls().unwrap();
        assert_eq!(config.dynamic_precache(&precache).len(), 1);
    }

    #[test]
    fn test_dynamic_precache_matches_like_router() {
        let config = AppConfig {
            origin: "https://shop.example".into(),
            dynamic_endpoints: vec!["https://script.example.com".into(), "shop.example/api/".into()],
            ..Default::default()
        };
        let precache: Vec<Url> = [
            "https://script.example.com/macros/s/1",
            "https://shop.example/api/orders",
            "https://shop.example.evil/api/orders",
            "https://cdn.shop.example/api/x",
            "https://shop.example/index.html",
        ]
        .iter()
        .map(|u| Url::parse(u).unwrap())
        .collect();

        let matched: Vec<&str> = config.dynamic_precache(&precache).into_iter().map(Url::as_str).collect();

        assert_eq!(
            matched,
            vec![
                "https://script.example.com/macros/s/1",
                "https://shop.example/api/orders",
                "https://cdn.shop.example/api/x",
            ]
        );
    }

    #[test]
    fn test_validate_max_bytes_zero() {
        let config = AppConfig { max_bytes: 0, ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "max_bytes"));
    }

    #[test]
    fn test_validate_max_bytes_exceeds_limit() {
        let config = AppConfig { max_bytes: 51 * 1024 * 1024, ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "max_bytes"));
    }

    #[test]
    fn test_validate_timeout_bounds() {
        let low = AppConfig { timeout_ms: 50, ..Default::default() };
        assert!(matches!(low.validate(), Err(ConfigError::Invalid { field, .. }) if field == "timeout_ms"));

        let high = AppConfig { timeout_ms: 301_000, ..Default::default() };
        assert!(matches!(high.validate(), Err(ConfigError::Invalid { field, .. }) if field == "timeout_ms"));

        let edge = AppConfig { max_bytes: 1, timeout_ms: 100, ..Default::default() };
        assert!(edge.validate().is_ok());
    }

    #[test]
    fn test_validate_empty_user_agent() {
        let config = AppConfig { user_agent: String::new(), ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "user_agent"));
    }
}
