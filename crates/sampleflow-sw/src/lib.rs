//! # SampleFlow SW
//!
//! Offline worker engine for the SampleFlow web application.
//!
//! ## Features
//!
//! - **Install**: precache a fixed asset manifest, tolerating per-asset failures
//! - **Activate**: prune caches from previous generations, then claim open pages
//! - **Fetch**: network-first for GET requests, falling back to cache offline
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorker (one per deployed generation)
//!     │
//!     ├── DeployConfig
//!     │       ├── CacheGeneration ("sampleflow-v10")
//!     │       └── AssetManifest   ("/", "/index.html", ...)
//!     │
//!     ├── NetworkTransport (trait, sampleflow-net)
//!     │
//!     ├── CacheStorage (process-wide)
//!     │       └── Cache (per generation)
//!     │               └── Request → CacheEntry
//!     │
//!     └── PageRegistry (process-wide)
//!             └── Page (controller tracking)
//! ```
//!
//! The browser's event-driven lifecycle maps to an explicit three-state
//! machine: `Installing → Activating → Active`, with each transition a named
//! async operation on [`ServiceWorker`].

use thiserror::Error;

pub mod cache;
pub mod config;
pub mod pages;
pub mod worker;

pub use cache::{Cache, CacheEntry, CacheStorage};
pub use config::{AssetManifest, CacheGeneration, DeployConfig};
pub use pages::{Page, PageRegistry};
pub use worker::{FetchOutcome, InstallReport, ServiceWorker, WorkerState};

/// Errors that can occur in worker operations.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Invalid generation identifier: {0:?}")]
    InvalidGeneration(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid state: expected {expected:?}, was {actual:?}")]
    State {
        expected: WorkerState,
        actual: WorkerState,
    },

    #[error("Network error: {0}")]
    Network(#[from] sampleflow_net::NetError),
}
