//! Control messages exchanged with connected clients.
//!
//! Inbound messages are JSON objects with a `type` field. Anything that does
//! not parse into a known [`ControlMessage`] is ignored.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shelf_client::Network;
use shelf_core::{GenerationRegistry, RequestKey, Store};
use url::Url;

use crate::clients::{ClientId, ClientRegistry};
use crate::lifecycle::LifecycleController;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    SkipWaiting,
    /// Delete every generation.
    ClearCache,
    /// Delete one entry from the active generation.
    ClearCacheUrl(String),
    GetVersion,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    url: Option<String>,
}

impl ControlMessage {
    pub fn parse(raw: &str) -> Option<Self> {
        let message: RawMessage = serde_json::from_str(raw).ok()?;
        match (message.kind.as_str(), message.url) {
            ("SKIP_WAITING", _) => Some(Self::SkipWaiting),
            ("CLEAR_CACHE", Some(url)) => Some(Self::ClearCacheUrl(url)),
            ("CLEAR_CACHE", None) => Some(Self::ClearCache),
            ("GET_VERSION", _) => Some(Self::GetVersion),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlReply {
    #[serde(rename = "CACHE_CLEARED")]
    CacheCleared { success: bool },
    #[serde(rename = "VERSION")]
    Version {
        version: String,
        #[serde(rename = "cacheName")]
        generation_id: String,
    },
}

/// Dispatches control messages to the lifecycle, the registry and clients.
pub struct ControlChannel<R: GenerationRegistry, N> {
    lifecycle: Arc<LifecycleController<R, N>>,
    registry: Arc<R>,
    clients: Arc<ClientRegistry>,
    origin: Url,
    version: String,
}

impl<R, N> ControlChannel<R, N>
where
    R: GenerationRegistry,
    N: Network,
{
    pub fn new(
        lifecycle: Arc<LifecycleController<R, N>>,
        registry: Arc<R>,
        clients: Arc<ClientRegistry>,
        origin: Url,
        version: String,
    ) -> Self {
        Self { lifecycle, registry, clients, origin, version }
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    /// Parse and dispatch one raw text frame from `source`.
    pub async fn handle_raw(&self, source: ClientId, raw: &str) {
        match ControlMessage::parse(raw) {
            Some(message) => self.dispatch(source, message).await,
            None => tracing::debug!(client = source, "ignoring unrecognized control message"),
        }
    }

    pub async fn dispatch(&self, source: ClientId, message: ControlMessage) {
        tracing::debug!(client = source, ?message, "control message");
        match message {
            ControlMessage::SkipWaiting => self.lifecycle.skip_waiting(),
            ControlMessage::ClearCache => self.clear_all().await,
            ControlMessage::ClearCacheUrl(target) => self.clear_url(&target).await,
            ControlMessage::GetVersion => {
                let reply = ControlReply::Version {
                    version: self.version.clone(),
                    generation_id: self.lifecycle.generation_id().to_string(),
                };
                if !self.clients.send(source, reply).await {
                    tracing::debug!(client = source, "version reply dropped; client gone");
                }
            }
        }
    }

    async fn clear_all(&self) {
        let success = match self.registry.delete_all().await {
            Ok(report) => report.is_clean(),
            Err(e) => {
                tracing::warn!(error = %e, "cache clear failed");
                false
            }
        };
        let delivered = self.clients.broadcast(ControlReply::CacheCleared { success }).await;
        tracing::info!(success, delivered, "cache cleared");
    }

    async fn clear_url(&self, target: &str) {
        let Some(store) = self.lifecycle.store() else {
            tracing::debug!(url = %target, "no active store; nothing to clear");
            return;
        };
        let key = match self.origin.join(target) {
            Ok(url) => RequestKey::get(&url),
            Err(e) => {
                tracing::debug!(url = %target, error = %e, "ignoring clear for unparseable url");
                return;
            }
        };
        match store.delete(&key).await {
            Ok(existed) => tracing::info!(url = %key.url(), existed, "cache entry cleared"),
            Err(e) => tracing::warn!(url = %key.url(), error = %e, "cache entry clear failed"),
        }
    }
}
