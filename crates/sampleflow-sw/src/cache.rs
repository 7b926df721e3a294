//! Named cache store: generation-keyed caches of request/response pairs.

use hashbrown::HashMap;
use sampleflow_net::{Request, Response};
use serde::{Deserialize, Serialize};

/// A cached request/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Build an entry from a fetched response.
    pub fn from_response(request: &Request, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            url: request.url.to_string(),
            method: request.method.to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body().to_vec(),
            cached_at: now_ms(),
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A single named cache mapping requests (method + URL) to stored responses.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Cache {
    /// Cache name (the generation identifier).
    pub name: String,

    /// Cached entries keyed by request.
    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Store an entry for a request. Re-adding the same request overwrites.
    pub fn put(&mut self, request: &Request, entry: CacheEntry) {
        self.entries.insert(request.cache_key(), entry);
    }

    /// Look up a matching entry for a request.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        self.entries.get(&request.cache_key())
    }

    /// Remove the entry for a request.
    pub fn delete(&mut self, request: &Request) -> bool {
        self.entries.remove(&request.cache_key()).is_some()
    }

    /// Get all entry keys.
    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The process-wide cache store, partitioned by generation identifier.
///
/// Survives individual worker instances; a new generation's worker operates
/// on the same store as its predecessors until activation cleanup prunes
/// their caches.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cache, creating it if absent.
    pub fn open(&mut self, name: &str) -> &mut Cache {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Check if a cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a cache and all its entries.
    pub fn delete(&mut self, name: &str) -> bool {
        self.caches.remove(name).is_some()
    }

    /// Get all cache names.
    pub fn keys(&self) -> Vec<String> {
        self.caches.keys().cloned().collect()
    }

    /// Match a request across every cache in the store.
    ///
    /// Deliberately not scoped to one generation: a response cached by any
    /// surviving cache satisfies the lookup.
    pub fn match_any(&self, request: &Request) -> Option<&CacheEntry> {
        self.caches
            .values()
            .find_map(|cache| cache.match_request(request))
    }
}
