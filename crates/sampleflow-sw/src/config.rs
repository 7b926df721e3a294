//! Deploy-time configuration: cache generation and asset manifest.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::WorkerError;

/// Version tag distinguishing successive deployments' caches.
///
/// Changing this value is the only mechanism that invalidates previously
/// cached assets; it must be bumped on every deployment that alters the asset
/// list or asset contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheGeneration(String);

impl CacheGeneration {
    /// Create a generation identifier. Must be non-empty and contain no
    /// whitespace.
    pub fn new(value: impl Into<String>) -> Result<Self, WorkerError> {
        let value = value.into();
        if value.is_empty() || value.chars().any(char::is_whitespace) {
            return Err(WorkerError::InvalidGeneration(value));
        }
        Ok(Self(value))
    }

    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheGeneration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CacheGeneration {
    type Error = WorkerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CacheGeneration> for String {
    fn from(generation: CacheGeneration) -> Self {
        generation.0
    }
}

/// Fixed, ordered list of resource paths to precache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetManifest(Vec<String>);

impl AssetManifest {
    /// Create a manifest from a list of paths.
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(paths.into_iter().map(Into::into).collect())
    }

    /// Iterate over the manifest paths in order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Number of paths in the manifest.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the manifest is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Deployment configuration for a worker generation.
///
/// Constructed in code or deserialized from the JSON shipped alongside a
/// deployment. Not a runtime flag surface: operators edit this per release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Generation identifier for this deployment's cache.
    pub generation: CacheGeneration,

    /// Origin that manifest paths are resolved against. Implicit in a browser
    /// deployment, explicit here because the engine is embeddable.
    pub origin: Url,

    /// Paths to precache on install.
    pub assets: AssetManifest,
}

impl DeployConfig {
    /// Create a deployment configuration.
    pub fn new(generation: CacheGeneration, origin: Url, assets: AssetManifest) -> Self {
        Self {
            generation,
            origin,
            assets,
        }
    }

    /// Parse a deployment configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self, WorkerError> {
        serde_json::from_str(json).map_err(|e| WorkerError::Config(e.to_string()))
    }

    /// The SampleFlow v10 deployment: the app shell, web manifest, and icons.
    pub fn sampleflow_v10() -> Self {
        Self {
            generation: CacheGeneration("sampleflow-v10".to_string()),
            origin: Url::parse("https://sampleflow.app").expect("static origin is valid"),
            assets: AssetManifest::new([
                "/",
                "/index.html",
                "/manifest.json",
                "/icon-192.png",
                "/icon-512.png",
            ]),
        }
    }

    /// Resolve a manifest path against the deployment origin.
    pub fn asset_url(&self, path: &str) -> Result<Url, WorkerError> {
        self.origin
            .join(path)
            .map_err(|e| WorkerError::Config(format!("unresolvable asset path {path:?}: {e}")))
    }
}
