//! Worker lifecycle: install, activate, and fetch interception.

use std::sync::Arc;

use futures::future::join_all;
use sampleflow_net::{NetworkTransport, Request, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

use crate::cache::{CacheEntry, CacheStorage};
use crate::config::{CacheGeneration, DeployConfig};
use crate::pages::PageRegistry;
use crate::WorkerError;

/// Worker lifecycle state.
///
/// The host runtime's implicit ordering (install precedes activate precedes
/// fetch handling) becomes an explicit state machine: each transition is a
/// named operation and out-of-order calls are typed errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// Precaching the asset manifest.
    Installing,
    /// Installed; pruning stale caches before taking control.
    Activating,
    /// Controlling pages and intercepting fetches.
    Active,
}

/// Outcome of a precache run.
#[derive(Debug, Clone, Default)]
pub struct InstallReport {
    /// Manifest paths attempted.
    pub attempted: usize,

    /// Paths fetched and stored.
    pub cached: usize,

    /// Paths skipped after a failed or non-success fetch.
    pub skipped: Vec<String>,
}

impl InstallReport {
    /// Check whether every manifest asset was cached.
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty() && self.cached == self.attempted
    }
}

/// How a fetch was satisfied.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Live network response; the cache was not consulted.
    Network(Response),
    /// The network failed; served from a cached entry.
    Cached(CacheEntry),
    /// Non-GET request, not intercepted.
    Passthrough,
}

/// The SampleFlow offline worker.
///
/// One worker instance per deployed generation. The cache store and page
/// registry are process-wide: a new generation's worker shares them with its
/// predecessors until activation cleanup prunes the stale caches.
pub struct ServiceWorker {
    config: DeployConfig,
    state: WorkerState,
    transport: Arc<dyn NetworkTransport>,
    storage: Arc<RwLock<CacheStorage>>,
    pages: Arc<RwLock<PageRegistry>>,
}

impl ServiceWorker {
    /// Create a worker over fresh process state.
    pub fn new(config: DeployConfig, transport: Arc<dyn NetworkTransport>) -> Self {
        Self::with_shared(
            config,
            transport,
            Arc::new(RwLock::new(CacheStorage::new())),
            Arc::new(RwLock::new(PageRegistry::new())),
        )
    }

    /// Create a worker over an existing store and registry: a new generation
    /// taking over from a previous one.
    pub fn with_shared(
        config: DeployConfig,
        transport: Arc<dyn NetworkTransport>,
        storage: Arc<RwLock<CacheStorage>>,
        pages: Arc<RwLock<PageRegistry>>,
    ) -> Self {
        Self {
            config,
            state: WorkerState::Installing,
            transport,
            storage,
            pages,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// This worker's generation identifier.
    pub fn generation(&self) -> &CacheGeneration {
        &self.config.generation
    }

    /// Deployment configuration.
    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    /// Handle to the process-wide cache store.
    pub fn storage(&self) -> Arc<RwLock<CacheStorage>> {
        Arc::clone(&self.storage)
    }

    /// Handle to the process-wide page registry.
    pub fn pages(&self) -> Arc<RwLock<PageRegistry>> {
        Arc::clone(&self.pages)
    }

    /// Precache the asset manifest.
    ///
    /// Signals skip-waiting, then fetches every manifest path concurrently
    /// and stores whatever succeeds into this generation's cache. Per-asset
    /// failures are logged as warnings and skipped; they never abort the
    /// install. Only an out-of-state call fails.
    pub async fn install(&mut self) -> Result<InstallReport, WorkerError> {
        self.expect_state(WorkerState::Installing)?;

        // Skip-waiting is signalled before precache begins.
        self.pages.write().await.skip_waiting();

        let generation = self.config.generation.clone();
        info!(
            generation = %generation,
            assets = self.config.assets.len(),
            "Installing worker"
        );

        let this: &Self = self;
        let attempts = this.config.assets.paths().map(|path| {
            let path = path.to_string();
            async move {
                let fetched = this.precache_asset(&path).await;
                (path, fetched)
            }
        });
        let results = join_all(attempts).await;

        let mut report = InstallReport {
            attempted: self.config.assets.len(),
            ..Default::default()
        };

        {
            let mut storage = self.storage.write().await;
            let cache = storage.open(generation.as_str());
            for (path, fetched) in results {
                match fetched {
                    Some((request, entry)) => {
                        cache.put(&request, entry);
                        report.cached += 1;
                    }
                    None => report.skipped.push(path),
                }
            }
        }

        self.state = WorkerState::Activating;
        info!(
            generation = %generation,
            cached = report.cached,
            skipped = report.skipped.len(),
            "Install complete"
        );
        Ok(report)
    }

    /// Fetch one manifest asset. Any failure is logged and absorbed.
    async fn precache_asset(&self, path: &str) -> Option<(Request, CacheEntry)> {
        let url = match self.config.asset_url(path) {
            Ok(url) => url,
            Err(e) => {
                warn!(asset = %path, error = %e, "Skipping unresolvable asset");
                return None;
            }
        };

        let request = Request::get(url);
        match self.transport.fetch(&request).await {
            Ok(response) if response.ok() => {
                trace!(asset = %path, status = %response.status, "Asset precached");
                let entry = CacheEntry::from_response(&request, &response);
                Some((request, entry))
            }
            Ok(response) => {
                warn!(
                    asset = %path,
                    status = %response.status,
                    "Skipping asset with non-success status"
                );
                None
            }
            Err(e) => {
                warn!(asset = %path, error = %e, "Skipping missing asset");
                None
            }
        }
    }

    /// Prune caches from previous generations, then claim all open pages.
    ///
    /// Every deletion completes before any page is claimed, so no page is
    /// ever handed to a worker that has not finished pruning. An out-of-state
    /// call is a typed error and nothing is claimed.
    pub async fn activate(&mut self) -> Result<(), WorkerError> {
        self.expect_state(WorkerState::Activating)?;

        let generation = self.config.generation.clone();
        let stale: Vec<String> = {
            let storage = self.storage.read().await;
            storage
                .keys()
                .into_iter()
                .filter(|name| name != generation.as_str())
                .collect()
        };

        if !stale.is_empty() {
            let mut storage = self.storage.write().await;
            for name in &stale {
                if storage.delete(name) {
                    info!(cache = %name, "Cleaned up old cache");
                } else {
                    // Already gone; deletion is idempotent.
                    debug!(cache = %name, "Stale cache disappeared before cleanup");
                }
            }
        }

        self.pages.write().await.claim(generation.as_str());
        self.state = WorkerState::Active;
        info!(generation = %generation, "Worker active, pages claimed");
        Ok(())
    }

    /// Handle an outgoing request from a controlled page.
    ///
    /// Non-GET requests pass through untouched (the cache is never consulted,
    /// so mutating API calls are unaffected). GET requests go network-first;
    /// on transport failure the lookup falls back across every stored cache,
    /// and a miss surfaces the original network error.
    pub async fn handle_fetch(&self, request: &Request) -> Result<FetchOutcome, WorkerError> {
        self.expect_state(WorkerState::Active)?;

        if !request.is_get() {
            trace!(
                url = %request.url,
                method = %request.method,
                "Passing through non-GET request"
            );
            return Ok(FetchOutcome::Passthrough);
        }

        match self.transport.fetch(request).await {
            Ok(response) => {
                trace!(url = %request.url, status = %response.status, "Served from network");
                Ok(FetchOutcome::Network(response))
            }
            Err(net_err) => {
                let storage = self.storage.read().await;
                match storage.match_any(request) {
                    Some(entry) => {
                        debug!(url = %request.url, "Network failed, served from cache");
                        Ok(FetchOutcome::Cached(entry.clone()))
                    }
                    None => {
                        debug!(
                            url = %request.url,
                            error = %net_err,
                            "Network failed, no cached match"
                        );
                        Err(WorkerError::Network(net_err))
                    }
                }
            }
        }
    }

    fn expect_state(&self, expected: WorkerState) -> Result<(), WorkerError> {
        if self.state != expected {
            return Err(WorkerError::State {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AssetManifest, CacheGeneration};
    use async_trait::async_trait;
    use bytes::Bytes;
    use hashbrown::HashMap;
    use http::{HeaderMap, StatusCode};
    use sampleflow_net::NetError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use url::Url;

    /// Transport serving scripted bodies, with switchable connectivity.
    struct ScriptedTransport {
        routes: Mutex<HashMap<String, (u16, Vec<u8>)>>,
        offline: AtomicBool,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new() -> Self {
            Self {
                routes: Mutex::new(HashMap::new()),
                offline: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            }
        }

        fn route(&self, url: &str, status: u16, body: &[u8]) {
            self.routes
                .lock()
                .unwrap()
                .insert(url.to_string(), (status, body.to_vec()));
        }

        fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl NetworkTransport for ScriptedTransport {
        async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            if self.offline.load(Ordering::SeqCst) {
                return Err(NetError::Offline("scripted offline".to_string()));
            }

            let routes = self.routes.lock().unwrap();
            match routes.get(request.url.as_str()) {
                Some((status, body)) => Ok(Response::new(
                    request.url.clone(),
                    StatusCode::from_u16(*status).unwrap(),
                    HeaderMap::new(),
                    Bytes::copy_from_slice(body),
                )),
                None => Err(NetError::RequestFailed(format!(
                    "no route for {}",
                    request.url
                ))),
            }
        }
    }

    fn test_config() -> DeployConfig {
        DeployConfig::new(
            CacheGeneration::new("sampleflow-v10").unwrap(),
            Url::parse("https://sampleflow.test").unwrap(),
            AssetManifest::new(["/", "/index.html", "/icon-192.png"]),
        )
    }

    /// Transport with a route for every manifest asset of `config`.
    fn transport_serving_all(config: &DeployConfig) -> Arc<ScriptedTransport> {
        let transport = ScriptedTransport::new();
        for path in config.assets.paths() {
            let url = config.asset_url(path).unwrap();
            transport.route(url.as_str(), 200, format!("body of {path}").as_bytes());
        }
        Arc::new(transport)
    }

    fn asset_request(config: &DeployConfig, path: &str) -> Request {
        Request::get(config.asset_url(path).unwrap())
    }

    async fn active_worker(
        config: DeployConfig,
        transport: Arc<ScriptedTransport>,
    ) -> ServiceWorker {
        let mut worker = ServiceWorker::new(config, transport);
        worker.install().await.unwrap();
        worker.activate().await.unwrap();
        worker
    }

    #[tokio::test]
    async fn test_install_precaches_manifest() {
        let config = test_config();
        let transport = transport_serving_all(&config);
        let mut worker = ServiceWorker::new(config.clone(), transport);

        let report = worker.install().await.unwrap();

        assert!(report.is_complete());
        assert_eq!(report.cached, 3);
        assert_eq!(worker.state(), WorkerState::Activating);

        let storage = worker.storage();
        let mut storage = storage.write().await;
        let cache = storage.open("sampleflow-v10");
        assert_eq!(cache.len(), 3);
        assert!(cache
            .match_request(&asset_request(&config, "/index.html"))
            .is_some());
    }

    #[tokio::test]
    async fn test_install_signals_skip_waiting() {
        let config = test_config();
        let transport = transport_serving_all(&config);
        let mut worker = ServiceWorker::new(config, transport);

        worker.install().await.unwrap();

        let pages = worker.pages();
        assert!(pages.read().await.skip_waiting_requested());
    }

    #[tokio::test]
    async fn test_install_tolerates_missing_asset() {
        let config = test_config();
        let transport = transport_serving_all(&config);
        // Drop the icon route so its fetch fails.
        transport
            .routes
            .lock()
            .unwrap()
            .remove(config.asset_url("/icon-192.png").unwrap().as_str());
        let mut worker = ServiceWorker::new(config.clone(), transport);

        let report = worker.install().await.unwrap();

        assert!(!report.is_complete());
        assert_eq!(report.cached, 2);
        assert_eq!(report.skipped, vec!["/icon-192.png".to_string()]);
        assert_eq!(worker.state(), WorkerState::Activating);

        let storage = worker.storage();
        let storage = storage.read().await;
        assert!(storage
            .match_any(&asset_request(&config, "/index.html"))
            .is_some());
        assert!(storage
            .match_any(&asset_request(&config, "/icon-192.png"))
            .is_none());
    }

    #[tokio::test]
    async fn test_install_skips_non_success_status() {
        let config = test_config();
        let transport = transport_serving_all(&config);
        let icon_url = config.asset_url("/icon-192.png").unwrap();
        transport.route(icon_url.as_str(), 404, b"not found");
        let mut worker = ServiceWorker::new(config, transport);

        let report = worker.install().await.unwrap();

        assert_eq!(report.cached, 2);
        assert_eq!(report.skipped, vec!["/icon-192.png".to_string()]);
    }

    #[tokio::test]
    async fn test_install_is_idempotent_across_workers() {
        let config = test_config();
        let transport = transport_serving_all(&config);
        let storage = Arc::new(RwLock::new(CacheStorage::new()));
        let pages = Arc::new(RwLock::new(PageRegistry::new()));

        let mut first = ServiceWorker::with_shared(
            config.clone(),
            transport.clone(),
            Arc::clone(&storage),
            Arc::clone(&pages),
        );
        first.install().await.unwrap();

        let keys_after_first = storage.read().await.keys();
        let len_after_first = {
            let mut s = storage.write().await;
            s.open("sampleflow-v10").len()
        };

        let mut second =
            ServiceWorker::with_shared(config, transport, Arc::clone(&storage), pages);
        second.install().await.unwrap();

        assert_eq!(storage.read().await.keys(), keys_after_first);
        let len_after_second = {
            let mut s = storage.write().await;
            s.open("sampleflow-v10").len()
        };
        assert_eq!(len_after_second, len_after_first);
    }

    #[tokio::test]
    async fn test_activate_prunes_stale_generations() {
        let config = test_config();
        let transport = transport_serving_all(&config);
        let storage = Arc::new(RwLock::new(CacheStorage::new()));
        let pages = Arc::new(RwLock::new(PageRegistry::new()));

        {
            let mut s = storage.write().await;
            let old = s.open("sampleflow-v8");
            let request = Request::get(Url::parse("https://sampleflow.test/old.css").unwrap());
            let response = Response::new(
                request.url.clone(),
                StatusCode::OK,
                HeaderMap::new(),
                Bytes::from_static(b"old"),
            );
            old.put(&request, CacheEntry::from_response(&request, &response));
            s.open("sampleflow-v9");
        }

        let mut worker =
            ServiceWorker::with_shared(config, transport, Arc::clone(&storage), pages);
        worker.install().await.unwrap();
        worker.activate().await.unwrap();

        let keys = storage.read().await.keys();
        assert_eq!(keys, vec!["sampleflow-v10".to_string()]);
        assert_eq!(worker.state(), WorkerState::Active);
    }

    #[tokio::test]
    async fn test_activate_claims_open_pages() {
        let config = test_config();
        let transport = transport_serving_all(&config);
        let mut worker = ServiceWorker::new(config, transport);

        let pages = worker.pages();
        let page_id = pages
            .write()
            .await
            .register(Url::parse("https://sampleflow.test/flows").unwrap());

        worker.install().await.unwrap();
        assert_eq!(pages.read().await.controlled_by(&page_id), None);

        worker.activate().await.unwrap();
        assert_eq!(
            pages.read().await.controlled_by(&page_id),
            Some("sampleflow-v10")
        );
    }

    #[tokio::test]
    async fn test_fetch_non_get_passes_through() {
        let config = test_config();
        let transport = transport_serving_all(&config);
        let worker = active_worker(config, Arc::clone(&transport)).await;

        let calls_before = transport.calls();
        let request = Request::post(
            Url::parse("https://sampleflow.test/api/flows").unwrap(),
            Bytes::from_static(b"{}"),
        );
        let outcome = worker.handle_fetch(&request).await.unwrap();

        assert!(matches!(outcome, FetchOutcome::Passthrough));
        // Neither the network nor the cache was touched.
        assert_eq!(transport.calls(), calls_before);
    }

    #[tokio::test]
    async fn test_fetch_prefers_network_when_online() {
        let config = test_config();
        let transport = transport_serving_all(&config);
        let worker = active_worker(config.clone(), Arc::clone(&transport)).await;

        // The cache holds the install-time body; the route now serves a newer one.
        let shell_url = config.asset_url("/index.html").unwrap();
        transport.route(shell_url.as_str(), 200, b"fresh shell");

        let outcome = worker
            .handle_fetch(&asset_request(&config, "/index.html"))
            .await
            .unwrap();

        match outcome {
            FetchOutcome::Network(response) => {
                assert_eq!(response.body().as_ref(), b"fresh shell");
            }
            other => panic!("Expected network outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_falls_back_to_cache_offline() {
        let config = test_config();
        let transport = transport_serving_all(&config);
        let worker = active_worker(config.clone(), Arc::clone(&transport)).await;

        transport.set_offline(true);

        let outcome = worker
            .handle_fetch(&asset_request(&config, "/index.html"))
            .await
            .unwrap();

        match outcome {
            FetchOutcome::Cached(entry) => {
                assert_eq!(entry.body, b"body of /index.html");
            }
            other => panic!("Expected cached outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_offline_uncached_fails() {
        let config = test_config();
        let transport = transport_serving_all(&config);
        let worker = active_worker(config.clone(), Arc::clone(&transport)).await;

        transport.set_offline(true);

        let request = Request::get(Url::parse("https://sampleflow.test/never-cached").unwrap());
        let result = worker.handle_fetch(&request).await;

        assert!(matches!(result, Err(WorkerError::Network(_))));
    }

    #[tokio::test]
    async fn test_fetch_fallback_matches_across_all_caches() {
        let config = test_config();
        let transport = transport_serving_all(&config);
        let worker = active_worker(config.clone(), Arc::clone(&transport)).await;

        // An entry cached outside the current generation still satisfies the
        // fallback lookup.
        let request = Request::get(Url::parse("https://sampleflow.test/legacy.css").unwrap());
        {
            let storage = worker.storage();
            let mut storage = storage.write().await;
            let response = Response::new(
                request.url.clone(),
                StatusCode::OK,
                HeaderMap::new(),
                Bytes::from_static(b"body{}"),
            );
            storage
                .open("sampleflow-extras")
                .put(&request, CacheEntry::from_response(&request, &response));
        }

        transport.set_offline(true);

        let outcome = worker.handle_fetch(&request).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Cached(_)));
    }

    #[tokio::test]
    async fn test_lifecycle_order_is_enforced() {
        let config = test_config();
        let transport = transport_serving_all(&config);
        let mut worker = ServiceWorker::new(config.clone(), transport);

        // Activate before install.
        assert!(matches!(
            worker.activate().await,
            Err(WorkerError::State { .. })
        ));

        // Fetch before active.
        let request = asset_request(&config, "/");
        assert!(matches!(
            worker.handle_fetch(&request).await,
            Err(WorkerError::State { .. })
        ));

        worker.install().await.unwrap();

        // Install twice on the same instance.
        assert!(matches!(
            worker.install().await,
            Err(WorkerError::State { .. })
        ));

        worker.activate().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Active);
        assert!(worker.handle_fetch(&request).await.is_ok());
    }
}
