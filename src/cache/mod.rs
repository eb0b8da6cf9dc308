use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::providers::GenerationResponse;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            ttl_secs: 300,
        }
    }
}

/// Deterministic fingerprint of (backend id, model id, full prompt). Hashing
/// the whole prompt rules out false hits between prompts sharing a prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(backend_id: &str, model_id: &str, prompt: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(backend_id.as_bytes());
        hasher.update([0]);
        hasher.update(model_id.as_bytes());
        hasher.update([0]);
        hasher.update(prompt.as_bytes());
        let digest = hasher.finalize();

        let mut hex = String::with_capacity(64);
        for byte in digest {
            hex.push_str(&format!("{:02x}", byte));
        }
        CacheKey(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    response: GenerationResponse,
    inserted_at: Instant,
}

/// Bounded TTL cache of successful responses, shared across concurrent
/// dispatches. All operations serialize through one lock.
#[derive(Debug)]
pub struct ResponseCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    capacity: usize,
    ttl: Duration,
    hits: Mutex<u64>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: config.capacity.max(1),
            ttl: Duration::from_secs(config.ttl_secs),
            hits: Mutex::new(0),
        }
    }

    /// Returns a clone of the cached response if it is still within TTL.
    /// Expired entries are removed lazily on lookup.
    pub fn get(&self, key: &CacheKey) -> Option<GenerationResponse> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                debug!("Cache hit for key {}", key.as_str());
                *self.hits.lock() += 1;
                Some(entry.response.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Inserts a response, evicting the single oldest entry if the cache
    /// would exceed its capacity.
    pub fn put(&self, key: CacheKey, response: GenerationResponse) {
        let mut entries = self.entries.lock();
        entries.insert(
            key,
            CacheEntry {
                response,
                inserted_at: Instant::now(),
            },
        );

        if entries.len() > self.capacity {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(key, _)| key.clone())
            {
                debug!("Cache over capacity, evicting oldest entry {}", oldest.as_str());
                entries.remove(&oldest);
            }
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn hit_count(&self) -> u64 {
        *self.hits.lock()
    }
}
