//! Install, wait and activate a cache generation.
//!
//! The controller moves through [`Phase::Installing`], [`Phase::Waiting`],
//! [`Phase::Activating`] and [`Phase::Active`]. Until it is active the proxy
//! relays requests straight to the network.
//!
//! Install opens the generation and populates it with the precache list.
//! A failure to open the store aborts the lifecycle; a failure to fetch any
//! single precache resource does not.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use shelf_client::{Network, ResourceRequest};
use shelf_core::{AppConfig, DeletionReport, Error, GenerationRegistry, RequestKey, Store};
use tokio::sync::{OnceCell, watch};
use url::Url;

use crate::clients::ClientRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Installing,
    Waiting,
    Activating,
    Active,
}

/// Which precache resources made it into the store.
#[derive(Debug, Default)]
pub struct InstallReport {
    pub stored: Vec<Url>,
    pub skipped: Vec<(Url, String)>,
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub generation_id: String,
    pub precache: Vec<Url>,
    pub skip_waiting_on_install: bool,
}

impl LifecycleSettings {
    pub fn from_config(config: &AppConfig) -> Result<Self, shelf_core::ConfigError> {
        Ok(Self {
            generation_id: config.generation_id.clone(),
            precache: config.precache_urls()?,
            skip_waiting_on_install: config.skip_waiting_on_install,
        })
    }
}

pub struct LifecycleController<R: GenerationRegistry, N> {
    settings: LifecycleSettings,
    registry: Arc<R>,
    network: Arc<N>,
    clients: Arc<ClientRegistry>,
    phase: watch::Sender<Phase>,
    skip_waiting: watch::Sender<bool>,
    store: OnceCell<Arc<R::Store>>,
}

impl<R, N> LifecycleController<R, N>
where
    R: GenerationRegistry,
    N: Network,
{
    pub fn new(settings: LifecycleSettings, registry: Arc<R>, network: Arc<N>, clients: Arc<ClientRegistry>) -> Self {
        let (phase, _) = watch::channel(Phase::Installing);
        let (skip_waiting, _) = watch::channel(false);
        Self { settings, registry, network, clients, phase, skip_waiting, store: OnceCell::new() }
    }

    pub fn generation_id(&self) -> &str {
        &self.settings.generation_id
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// The generation's store, once install has opened it.
    pub fn store(&self) -> Option<Arc<R::Store>> {
        self.store.get().cloned()
    }

    /// Let a waiting generation activate without waiting for old clients.
    pub fn skip_waiting(&self) {
        if !self.skip_waiting.send_replace(true) {
            tracing::info!(generation = %self.settings.generation_id, "skip waiting requested");
        }
    }

    /// Install, wait, then activate. Returns the active store.
    pub async fn run(&self) -> Result<Arc<R::Store>, Error> {
        self.install().await?;
        self.wait_for_activation().await;
        self.activate().await;
        self.store().ok_or_else(|| Error::StoreOpen(format!("{}: store not open", self.settings.generation_id)))
    }

    /// Open the generation and populate it with the precache list.
    ///
    /// Safe to repeat: the generation is reused and entries are overwritten.
    pub async fn install(&self) -> Result<InstallReport, Error> {
        self.set_phase(Phase::Installing);
        let id = &self.settings.generation_id;

        let store = match self.registry.open(id).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::error!(generation = %id, error = %e, "install failed: store could not be opened");
                return Err(e);
            }
        };

        let report = populate(self.network.as_ref(), store.as_ref(), &self.settings.precache).await;
        tracing::info!(
            generation = %id,
            stored = report.stored.len(),
            skipped = report.skipped.len(),
            "install complete"
        );

        if self.store.set(store).is_err() {
            tracing::debug!(generation = %id, "store already open");
        }
        self.set_phase(Phase::Waiting);
        if self.settings.skip_waiting_on_install {
            self.skip_waiting();
        }
        Ok(report)
    }

    /// Block until activation may proceed: skip-waiting was requested or no
    /// connected client is controlled by another generation.
    pub async fn wait_for_activation(&self) {
        let mut skip = self.skip_waiting.subscribe();
        let mut clients = self.clients.subscribe();
        let id = &self.settings.generation_id;

        loop {
            if *skip.borrow_and_update() {
                return;
            }
            clients.borrow_and_update();
            let blocking = self.clients.controlled_by_other(id).await;
            if blocking == 0 {
                return;
            }
            tracing::info!(generation = %id, blocking, "waiting for clients of older generations");

            tokio::select! {
                changed = skip.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                changed = clients.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Delete every other generation and claim all clients.
    ///
    /// Deletion failures are logged and reported but never stop activation.
    pub async fn activate(&self) -> DeletionReport {
        self.set_phase(Phase::Activating);
        let id = &self.settings.generation_id;

        let report = match self.registry.delete_except(id).await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(generation = %id, error = %e, "could not list generations for cleanup");
                DeletionReport::default()
            }
        };

        let claimed = self.clients.claim(id).await;
        self.set_phase(Phase::Active);
        tracing::info!(
            generation = %id,
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            claimed,
            "generation active"
        );
        report
    }

    fn set_phase(&self, phase: Phase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            tracing::debug!(generation = %self.settings.generation_id, ?previous, ?phase, "phase change");
        }
    }
}

/// Fetch every URL and store each 2xx response.
///
/// Fetches run concurrently and each failure is isolated to its resource.
pub async fn populate<N, S>(network: &N, store: &S, urls: &[Url]) -> InstallReport
where
    N: Network + ?Sized,
    S: Store + ?Sized,
{
    let results = join_all(urls.iter().map(|url| async move {
        let outcome = match network.fetch(&ResourceRequest::get(url.clone())).await {
            Ok(response) if response.ok() => {
                store.put(RequestKey::get(url), response.snapshot()).await.map_err(|e| e.to_string())
            }
            Ok(response) => Err(format!("HTTP {}", response.status.as_u16())),
            Err(e) => Err(e.to_string()),
        };
        (url.clone(), outcome)
    }))
    .await;

    let mut report = InstallReport::default();
    for (url, outcome) in results {
        match outcome {
            Ok(()) => report.stored.push(url),
            Err(reason) => {
                tracing::warn!(url = %url, reason = %reason, "precache skipped");
                report.skipped.push((url, reason));
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use shelf_client::testing::{FailingStore, ScriptedNetwork};
    use shelf_core::{CacheDb, SqliteRegistry};

    use super::*;

    const ORIGIN: &str = "https://shop.example";

    fn network() -> ScriptedNetwork {
        ScriptedNetwork::new(ORIGIN)
            .ok("/", "text/html", "<h1>home</h1>")
            .ok("/index.html", "text/html", "<h1>index</h1>")
            .status("/style.css", 404, "missing")
    }

    fn settings(id: &str, skip: bool) -> LifecycleSettings {
        let origin = Url::parse(ORIGIN).unwrap();
        LifecycleSettings {
            generation_id: id.into(),
            precache: ["/", "/index.html", "/style.css"].iter().map(|p| origin.join(p).unwrap()).collect(),
            skip_waiting_on_install: skip,
        }
    }

    async fn controller(
        id: &str,
        skip: bool,
    ) -> (LifecycleController<SqliteRegistry, ScriptedNetwork>, Arc<SqliteRegistry>, Arc<ClientRegistry>) {
        let registry = Arc::new(SqliteRegistry::new(CacheDb::open_in_memory().await.unwrap()));
        let clients = Arc::new(ClientRegistry::new());
        let lifecycle = LifecycleController::new(settings(id, skip), registry.clone(), Arc::new(network()), clients.clone());
        (lifecycle, registry, clients)
    }

    fn url(path: &str) -> Url {
        Url::parse(ORIGIN).unwrap().join(path).unwrap()
    }

    struct BrokenRegistry;

    #[async_trait]
    impl GenerationRegistry for BrokenRegistry {
        type Store = FailingStore;

        async fn open(&self, id: &str) -> Result<FailingStore, Error> {
            Err(Error::StoreOpen(format!("{id}: disk full")))
        }

        async fn list(&self) -> Result<Vec<String>, Error> {
            Ok(vec![])
        }

        async fn delete(&self, _id: &str) -> Result<bool, Error> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_install_skips_failed_resources() {
        let (lifecycle, _, _) = controller("shelf-v1", false).await;

        let report = lifecycle.install().await.unwrap();

        assert_eq!(report.stored.len(), 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, url("/style.css"));
        assert_eq!(lifecycle.phase(), Phase::Waiting);

        let store = lifecycle.store().unwrap();
        assert!(store.get(&RequestKey::get(&url("/"))).await.unwrap().is_some());
        assert!(store.get(&RequestKey::get(&url("/index.html"))).await.unwrap().is_some());
        assert!(store.get(&RequestKey::get(&url("/style.css"))).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_install_survives_network_failure() {
        let registry = Arc::new(SqliteRegistry::new(CacheDb::open_in_memory().await.unwrap()));
        let network = ScriptedNetwork::new(ORIGIN).ok("/", "text/html", "home").fail("/index.html");
        let lifecycle =
            LifecycleController::new(settings("shelf-v1", false), registry, Arc::new(network), Arc::new(ClientRegistry::new()));

        let report = lifecycle.install().await.unwrap();

        assert_eq!(report.stored, vec![url("/")]);
        assert_eq!(report.skipped.len(), 2);
    }

    #[tokio::test]
    async fn test_install_is_idempotent() {
        let (lifecycle, registry, _) = controller("shelf-v1", false).await;

        lifecycle.install().await.unwrap();
        let first = stored_urls(&lifecycle).await;
        lifecycle.install().await.unwrap();

        assert!(!first.is_empty());
        assert_eq!(registry.list().await.unwrap(), vec!["shelf-v1".to_string()]);
        assert_eq!(stored_urls(&lifecycle).await, first);
    }

    async fn stored_urls(lifecycle: &LifecycleController<SqliteRegistry, ScriptedNetwork>) -> Vec<String> {
        let mut urls: Vec<String> =
            lifecycle.store().unwrap().keys().await.unwrap().iter().map(|k| k.url().to_string()).collect();
        urls.sort();
        urls
    }

    #[tokio::test]
    async fn test_store_open_failure_blocks_activation() {
        let lifecycle = LifecycleController::new(
            settings("shelf-v1", true),
            Arc::new(BrokenRegistry),
            Arc::new(network()),
            Arc::new(ClientRegistry::new()),
        );

        let result = lifecycle.run().await;

        assert!(matches!(result, Err(Error::StoreOpen(_))));
        assert_eq!(lifecycle.phase(), Phase::Installing);
        assert!(lifecycle.store().is_none());
    }

    #[tokio::test]
    async fn test_activation_leaves_only_active_generation() {
        let (lifecycle, registry, _) = controller("shelf-v2", true).await;
        registry.open("shelf-v1").await.unwrap();
        registry.open("shelf-v2-beta").await.unwrap();

        lifecycle.run().await.unwrap();

        assert_eq!(lifecycle.phase(), Phase::Active);
        assert_eq!(registry.list().await.unwrap(), vec!["shelf-v2".to_string()]);
    }

    #[tokio::test]
    async fn test_activation_claims_clients() {
        let (lifecycle, _, clients) = controller("shelf-v2", true).await;
        let (old, _rx1) = clients.register(Some("shelf-v1".into())).await;
        let (fresh, _rx2) = clients.register(None).await;

        lifecycle.run().await.unwrap();

        assert_eq!(clients.controller_of(old).await.as_deref(), Some("shelf-v2"));
        assert_eq!(clients.controller_of(fresh).await.as_deref(), Some("shelf-v2"));
    }

    #[tokio::test]
    async fn test_waits_while_old_clients_remain() {
        let (lifecycle, _, clients) = controller("shelf-v2", false).await;
        let (old, _rx) = clients.register(Some("shelf-v1".into())).await;
        lifecycle.install().await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), lifecycle.wait_for_activation()).await;
        assert!(blocked.is_err());
        assert_eq!(lifecycle.phase(), Phase::Waiting);

        clients.unregister(old).await;
        tokio::time::timeout(Duration::from_secs(1), lifecycle.wait_for_activation()).await.unwrap();
    }

    #[tokio::test]
    async fn test_skip_waiting_releases_wait() {
        let (lifecycle, _, clients) = controller("shelf-v2", false).await;
        let (_old, _rx) = clients.register(Some("shelf-v1".into())).await;
        lifecycle.install().await.unwrap();

        let waiting = async {
            lifecycle.wait_for_activation().await;
            lifecycle.phase()
        };
        let release = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            lifecycle.skip_waiting();
        };
        let (phase, ()) = tokio::time::timeout(Duration::from_secs(1), async { tokio::join!(waiting, release) })
            .await
            .unwrap();

        assert_eq!(phase, Phase::Waiting);
    }

    #[tokio::test]
    async fn test_no_old_clients_means_no_wait() {
        let (lifecycle, _, clients) = controller("shelf-v1", false).await;
        let (_fresh, _rx) = clients.register(None).await;
        lifecycle.install().await.unwrap();

        tokio::time::timeout(Duration::from_millis(100), lifecycle.wait_for_activation()).await.unwrap();
    }
}
