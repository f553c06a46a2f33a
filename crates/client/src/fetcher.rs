//! Strategy execution against the store and the network.
//!
//! [`ResourceFetcher::respond`] is the entry point: it classifies the request,
//! runs the chosen strategy and turns strategy failures into synthesized
//! offline responses, so intercepted requests always get an answer.
//!
//! Store writes happen on a spawned task from an independent copy of the
//! response. The caller gets the original immediately; the write's handle is
//! returned in [`FetchOutcome::pending_write`] and may simply be dropped.

use std::sync::Arc;

use reqwest::StatusCode;
use shelf_core::{Error, RequestKey, ResponseType, Store};
use tokio::task::JoinHandle;

use crate::fetch::{Network, NetworkResponse, ResourceRequest};
use crate::offline::{offline_document, offline_error};
use crate::router::{Route, Strategy, StrategyRouter};

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Served {
    /// Not intercepted; relayed from the network untouched.
    Passthrough,
    /// Fresh from the network.
    Network,
    /// From the store without touching the network.
    Cache,
    /// From the store after the network failed.
    Fallback,
    /// Synthesized because neither the network nor the store could answer.
    Offline,
}

impl Served {
    pub fn as_str(&self) -> &'static str {
        match self {
            Served::Passthrough => "passthrough",
            Served::Network => "network",
            Served::Cache => "cache",
            Served::Fallback => "fallback",
            Served::Offline => "offline",
        }
    }
}

/// A response plus how it was produced.
#[derive(Debug)]
pub struct FetchOutcome {
    pub response: NetworkResponse,
    pub route: Route,
    pub served: Served,
    /// Background store write started for this response, if any.
    pub pending_write: Option<JoinHandle<()>>,
}

impl FetchOutcome {
    fn new(response: NetworkResponse, route: Route, served: Served) -> Self {
        Self { response, route, served, pending_write: None }
    }

    /// Wait for the background store write, if one was started.
    pub async fn settled(mut self) -> Self {
        if let Some(handle) = self.pending_write.take()
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "store write task aborted");
        }
        self
    }
}

/// Executes cache-first and network-first strategies.
pub struct ResourceFetcher<N, S> {
    network: Arc<N>,
    store: Arc<S>,
    router: StrategyRouter,
}

impl<N, S> ResourceFetcher<N, S>
where
    N: Network + 'static,
    S: Store + 'static,
{
    pub fn new(network: Arc<N>, store: Arc<S>, router: StrategyRouter) -> Self {
        Self { network, store, router }
    }

    pub fn router(&self) -> &StrategyRouter {
        &self.router
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn network(&self) -> &Arc<N> {
        &self.network
    }

    /// Classify `request` and serve it.
    ///
    /// # Errors
    ///
    /// Only bypassed requests can fail: they are not intercepted, so a network
    /// error reaches the caller unchanged.
    pub async fn respond(&self, request: &ResourceRequest) -> Result<FetchOutcome, Error> {
        let route = self.router.classify(request);
        tracing::trace!(url = %request.url, strategy = route.strategy.as_str(), "routing request");

        let outcome = match (route.strategy, request.key()) {
            (Strategy::Bypass, _) | (_, None) => {
                let response = self.network.fetch(request).await?;
                FetchOutcome::new(response, route, Served::Passthrough)
            }
            (Strategy::NetworkOnly, Some(_)) => match self.network.fetch(request).await {
                Ok(response) => FetchOutcome::new(response, route, Served::Network),
                Err(e) => {
                    tracing::debug!(url = %request.url, error = %e, "dynamic endpoint unreachable");
                    FetchOutcome::new(offline_error(&request.url, &e), route, Served::Offline)
                }
            },
            (Strategy::NetworkFirst, Some(key)) => self.network_first(request, key, route).await,
            (Strategy::CacheFirst, Some(key)) => match self.cache_first(request, key, route).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::debug!(url = %request.url, error = %e, "asset unavailable offline");
                    FetchOutcome::new(offline_error(&request.url, &e), route, Served::Offline)
                }
            },
        };

        Ok(outcome)
    }

    /// Serve from the store when possible, otherwise from the network.
    ///
    /// A network response is stored only when it is a 200 `basic` response.
    ///
    /// # Errors
    ///
    /// Returns the network error on a store miss when the network fails.
    pub async fn cache_first(
        &self, request: &ResourceRequest, key: RequestKey, route: Route,
    ) -> Result<FetchOutcome, Error> {
        if let Some(response) = self.lookup(&key).await {
            tracing::debug!(url = %request.url, "serving from cache");
            return Ok(FetchOutcome::new(response, route, Served::Cache));
        }

        let response = self.network.fetch(request).await?;
        let cacheable = response.status == StatusCode::OK && response.response_type == ResponseType::Basic;
        let pending_write = cacheable.then(|| self.store_in_background(key, &response));

        Ok(FetchOutcome { response, route, served: Served::Network, pending_write })
    }

    /// Serve from the network, falling back to the store and then to a
    /// synthesized offline response.
    pub async fn network_first(&self, request: &ResourceRequest, key: RequestKey, route: Route) -> FetchOutcome {
        let error = match self.network.fetch(request).await {
            Ok(response) => {
                let cacheable = response.status == StatusCode::OK
                    && matches!(response.response_type, ResponseType::Basic | ResponseType::Cors);
                let pending_write = cacheable.then(|| self.store_in_background(key, &response));
                return FetchOutcome { response, route, served: Served::Network, pending_write };
            }
            Err(e) => e,
        };

        if let Some(response) = self.lookup(&key).await {
            tracing::debug!(url = %request.url, error = %error, "network failed, serving from cache");
            return FetchOutcome::new(response, route, Served::Fallback);
        }

        if route.document {
            for shell in self.router.shell_documents() {
                if let Some(response) = self.lookup(&RequestKey::get(&shell)).await {
                    tracing::debug!(url = %request.url, shell = %shell, "network failed, serving app shell");
                    return FetchOutcome::new(response, route, Served::Fallback);
                }
            }
            tracing::debug!(url = %request.url, error = %error, "no app shell cached, serving offline page");
            return FetchOutcome::new(offline_document(&request.url), route, Served::Offline);
        }

        tracing::debug!(url = %request.url, error = %error, "network failed and nothing cached");
        FetchOutcome::new(offline_error(&request.url, &error), route, Served::Offline)
    }

    /// Store lookup that treats read failures as misses.
    async fn lookup(&self, key: &RequestKey) -> Option<NetworkResponse> {
        let entry = match self.store.get(key).await {
            Ok(entry) => entry?,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "store read failed");
                return None;
            }
        };

        match NetworkResponse::from_entry(entry) {
            Ok(response) => Some(response),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "discarding unreadable entry");
                None
            }
        }
    }

    fn store_in_background(&self, key: RequestKey, response: &NetworkResponse) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let snapshot = response.snapshot();
        tokio::spawn(async move {
            if let Err(e) = store.put(key.clone(), snapshot).await {
                tracing::warn!(key = %key, error = %e, "failed to store response");
            }
        })
    }
}
