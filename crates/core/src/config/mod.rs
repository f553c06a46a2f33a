//! Application configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (SHELF_*)
//! 2. TOML config file (if SHELF_CONFIG_FILE set)
//! 3. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use url::Url;

mod dynamic;
mod validation;

pub use dynamic::DynamicEndpoint;
pub use validation::ConfigError;

/// Application configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (SHELF_*)
/// 2. TOML config file (if SHELF_CONFIG_FILE set)
/// 3. Built-in defaults
///
/// List-valued fields take TOML array syntax in environment variables,
/// e.g. `SHELF_PRECACHE='["/", "/app.css"]'`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Id of the generation this instance populates and serves from.
    ///
    /// Set via SHELF_GENERATION_ID environment variable.
    #[serde(default = "default_generation_id")]
    pub generation_id: String,

    /// Version string reported to clients.
    ///
    /// Set via SHELF_VERSION environment variable.
    #[serde(default = "default_version")]
    pub version: String,

    /// The application's own origin. Requests to it are same-origin.
    ///
    /// Set via SHELF_ORIGIN environment variable.
    #[serde(default = "default_origin")]
    pub origin: String,

    /// Address the HTTP front end binds to.
    ///
    /// Set via SHELF_LISTEN_ADDR environment variable.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Path to SQLite cache database.
    ///
    /// Set via SHELF_DB_PATH environment variable.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Resources fetched and stored while installing a generation.
    /// Relative entries resolve against `origin`.
    #[serde(default = "default_app_shell")]
    pub precache: Vec<String>,

    /// Well-known app-shell paths, always served network-first.
    #[serde(default = "default_app_shell")]
    pub app_shell: Vec<String>,

    /// `host` or `host/path-prefix` entries that are never cached.
    #[serde(default)]
    pub dynamic_endpoints: Vec<String>,

    /// Activate as soon as install completes instead of waiting for old
    /// clients to go away.
    ///
    /// Set via SHELF_SKIP_WAITING_ON_INSTALL environment variable.
    #[serde(default = "default_true")]
    pub skip_waiting_on_install: bool,

    /// User-Agent string for outbound requests.
    ///
    /// Set via SHELF_USER_AGENT environment variable.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Network request timeout in milliseconds.
    ///
    /// Set via SHELF_TIMEOUT_MS environment variable.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum response body size in bytes.
    ///
    /// Set via SHELF_MAX_BYTES environment variable.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
}

fn default_generation_id() -> String {
    "shelf-v1".into()
}

fn default_version() -> String {
    "1.0.0".into()
}

fn default_origin() -> String {
    "http://localhost:8080".into()
}

fn default_listen_addr() -> String {
    "127.0.0.1:8787".into()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./shelf-cache.sqlite")
}

fn default_app_shell() -> Vec<String> {
    vec!["/".into(), "/index.html".into(), "/manifest.json".into()]
}

fn default_true() -> bool {
    true
}

fn default_user_agent() -> String {
    "shelf/0.1".into()
}

fn default_timeout_ms() -> u64 {
    20_000
}

fn default_max_bytes() -> usize {
    5_242_880 // 5MB
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            generation_id: default_generation_id(),
            version: default_version(),
            origin: default_origin(),
            listen_addr: default_listen_addr(),
            db_path: default_db_path(),
            precache: default_app_shell(),
            app_shell: default_app_shell(),
            dynamic_endpoints: Vec::new(),
            skip_waiting_on_install: true,
            user_agent: default_user_agent(),
            timeout_ms: default_timeout_ms(),
            max_bytes: default_max_bytes(),
        }
    }
}

impl AppConfig {
    /// Timeout as Duration for use with reqwest/tokio.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// The configured origin as a parsed URL.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if `origin` is not an absolute http(s) URL.
    pub fn origin_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.origin)
            .map_err(|e| ConfigError::Invalid { field: "origin".into(), reason: e.to_string() })?;
        match url.scheme() {
            "http" | "https" if url.host_str().is_some() => Ok(url),
            _ => Err(ConfigError::Invalid { field: "origin".into(), reason: "must be an absolute http(s) URL".into() }),
        }
    }

    /// Pre-population resources resolved to absolute URLs.
    pub fn precache_urls(&self) -> Result<Vec<Url>, ConfigError> {
        let origin = self.origin_url()?;
        self.precache
            .iter()
            .map(|entry| {
                origin.join(entry).map_err(|e| ConfigError::Invalid {
                    field: "precache".into(),
                    reason: format!("{entry}: {e}"),
                })
            })
            .collect()
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `SHELF_`
    /// 2. TOML file from `SHELF_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let config: Self = Self::figment()
            .extract()
            .map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    fn figment() -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("SHELF_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment.merge(
            Env::prefixed("SHELF_")
                .ignore(&["CONFIG_FILE"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        )
    }
}
