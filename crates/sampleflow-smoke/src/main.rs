//! SampleFlow Smoke Harness
//!
//! Exercises the offline worker engine end to end with a scripted transport:
//! install (with one asset deliberately missing), activation over stale
//! caches, and a fetch matrix covering online, offline-cached, offline-miss,
//! and non-GET requests. Prints a JSON summary of what each step observed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, StatusCode};
use serde_json::json;
use tracing::{info, warn};
use url::Url;

use sampleflow_common::{init_logging, LogConfig, SampleFlowError};
use sampleflow_net::{NetError, NetworkTransport, Request, Response};
use sampleflow_sw::{DeployConfig, FetchOutcome, ServiceWorker, WorkerState};

/// Transport serving scripted bodies with a connectivity toggle.
struct ScriptedTransport {
    routes: Mutex<HashMap<String, Vec<u8>>>,
    offline: AtomicBool,
}

impl ScriptedTransport {
    fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
        }
    }

    fn route(&self, url: &Url, body: &[u8]) {
        self.routes
            .lock()
            .expect("routes lock")
            .insert(url.to_string(), body.to_vec());
    }

    fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl NetworkTransport for ScriptedTransport {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline("harness offline".to_string()));
        }

        let routes = self.routes.lock().expect("routes lock");
        match routes.get(request.url.as_str()) {
            Some(body) => Ok(Response::new(
                request.url.clone(),
                StatusCode::OK,
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

fn outcome_label(outcome: &FetchOutcome) -> &'static str {
    match outcome {
        FetchOutcome::Network(_) => "network",
        FetchOutcome::Cached(_) => "cache",
        FetchOutcome::Passthrough => "passthrough",
    }
}

#[tokio::main]
async fn main() -> Result<(), SampleFlowError> {
    init_logging(LogConfig::default().with_filter("info,sampleflow_sw=debug"));

    let config = DeployConfig::sampleflow_v10();
    let transport = Arc::new(ScriptedTransport::new());

    // Serve every manifest asset except the large icon, to exercise the
    // partial-failure path.
    for path in config.assets.paths() {
        if path == "/icon-512.png" {
            continue;
        }
        let url = config
            .asset_url(path)
            .map_err(|e| SampleFlowError::worker_with_source("resolving manifest asset", e))?;
        transport.route(&url, format!("scripted body for {path}").as_bytes());
    }

    let mut worker = ServiceWorker::new(config.clone(), Arc::clone(&transport) as Arc<dyn NetworkTransport>);

    // Simulate a page open before the new worker takes over, plus a stale
    // cache left behind by the previous deployment.
    let pages = worker.pages();
    let page_id = pages.write().await.register(
        config
            .asset_url("/flows")
            .map_err(|e| SampleFlowError::worker_with_source("resolving page url", e))?,
    );
    {
        let storage = worker.storage();
        storage.write().await.open("sampleflow-v9");
    }

    // Install.
    let started = Instant::now();
    let report = worker
        .install()
        .await
        .map_err(|e| SampleFlowError::worker_with_source("install failed", e))?;
    let install_ms = started.elapsed().as_secs_f64() * 1000.0;
    if !report.is_complete() {
        warn!(skipped = ?report.skipped, "Install completed with skipped assets");
    }

    // Activate.
    let started = Instant::now();
    worker
        .activate()
        .await
        .map_err(|e| SampleFlowError::worker_with_source("activate failed", e))?;
    let activate_ms = started.elapsed().as_secs_f64() * 1000.0;
    assert_eq!(worker.state(), WorkerState::Active);

    let surviving_caches = worker.storage().read().await.keys();
    let controller = pages
        .read()
        .await
        .controlled_by(&page_id)
        .map(str::to_string);

    // Fetch matrix.
    let shell = Request::get(
        config
            .asset_url("/index.html")
            .map_err(|e| SampleFlowError::worker_with_source("resolving shell url", e))?,
    );
    let uncached = Request::get(
        config
            .asset_url("/uncached.json")
            .map_err(|e| SampleFlowError::worker_with_source("resolving url", e))?,
    );
    let mutation = Request::post(
        config
            .asset_url("/api/flows")
            .map_err(|e| SampleFlowError::worker_with_source("resolving api url", e))?,
        Bytes::from_static(b"{}"),
    );

    let online_shell = worker
        .handle_fetch(&shell)
        .await
        .map_err(|e| SampleFlowError::worker_with_source("online fetch failed", e))?;

    transport.set_offline(true);

    let offline_shell = worker
        .handle_fetch(&shell)
        .await
        .map_err(|e| SampleFlowError::worker_with_source("offline fetch failed", e))?;
    let offline_uncached = worker.handle_fetch(&uncached).await;
    let post_outcome = worker
        .handle_fetch(&mutation)
        .await
        .map_err(|e| SampleFlowError::worker_with_source("post fetch failed", e))?;

    let summary = json!({
        "generation": config.generation.as_str(),
        "install": {
            "ms": (install_ms * 100.0).round() / 100.0,
            "attempted": report.attempted,
            "cached": report.cached,
            "skipped": report.skipped,
        },
        "activate": {
            "ms": (activate_ms * 100.0).round() / 100.0,
            "surviving_caches": surviving_caches,
            "page_controller": controller,
        },
        "fetch": {
            "online_shell": outcome_label(&online_shell),
            "offline_shell": outcome_label(&offline_shell),
            "offline_uncached": offline_uncached.is_err().then_some("error"),
            "post_passthrough": outcome_label(&post_outcome),
        },
    });

    info!("Smoke run complete");
    println!("{}", serde_json::to_string_pretty(&summary).expect("summary is serializable"));

    Ok(())
}
