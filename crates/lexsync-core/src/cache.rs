//! Local TTL cache over the persistent store boundary.
//!
//! Every entry is a JSON envelope `{data, timestamp, expires_at}` stored
//! under `<namespace_prefix><logical_key>`. The cache never surfaces errors:
//! storage failures and corrupt entries degrade to misses (with a log line),
//! so callers can always treat `None` as "go to the network".

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::DEFAULT_TTL_MS;
use crate::store::KeyValueStore;
use crate::utils::clock::Clock;

/// Network-reachability probe consulted by `is_connected()`.
///
/// Callers use it to decide whether a cache miss is worth a network retry;
/// the embedder supplies the platform-specific implementation.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn is_connected(&self) -> bool;
}

/// Probe that always reports connectivity. Default when the embedder has no
/// platform reachability API wired up.
#[derive(Debug, Default)]
pub struct AssumeOnline;

#[async_trait]
impl ReachabilityProbe for AssumeOnline {
    async fn is_connected(&self) -> bool {
        true
    }
}

/// On-disk envelope for one cache entry. Invariant: `expires_at > timestamp`.
#[derive(Debug, Serialize, Deserialize)]
struct CacheEnvelope {
    data: Value,
    timestamp: i64,
    expires_at: i64,
}

/// Generic namespaced TTL key-value cache.
///
/// Process-wide shared resource: any consumer may read, only the cache
/// itself writes its entries. `clear_all()` is scoped to the namespace
/// prefix and never touches unrelated keys in the underlying store.
pub struct LocalCache {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    reachability: Arc<dyn ReachabilityProbe>,
    prefix: String,
    default_ttl_ms: i64,
}

impl LocalCache {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            reachability: Arc::new(AssumeOnline),
            prefix: prefix.into(),
            default_ttl_ms: DEFAULT_TTL_MS,
        }
    }

    pub fn with_default_ttl(mut self, ttl_ms: i64) -> Self {
        self.default_ttl_ms = ttl_ms;
        self
    }

    pub fn with_reachability(mut self, probe: Arc<dyn ReachabilityProbe>) -> Self {
        self.reachability = probe;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Read a value. Returns `None` on miss, on expiry (deleting the entry
    /// as a side effect), and on any storage or parse failure.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let full = self.full_key(key);

        let raw = match self.store.get(&full).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(key = %full, error = %err, "cache read failed; treating as miss");
                return None;
            }
        };

        let envelope: CacheEnvelope = match serde_json::from_str(&raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(key = %full, error = %err, "corrupt cache entry; evicting");
                self.silent_remove(&full).await;
                return None;
            }
        };

        if self.clock.now_ms() >= envelope.expires_at {
            // Delete-on-read keeps the store from accumulating dead entries.
            self.silent_remove(&full).await;
            return None;
        }

        match serde_json::from_value(envelope.data) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(key = %full, error = %err, "cache entry has wrong shape; evicting");
                self.silent_remove(&full).await;
                None
            }
        }
    }

    /// Write a value unconditionally. `ttl_ms = None` uses the default TTL.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl_ms: Option<i64>) {
        let full = self.full_key(key);
        let now = self.clock.now_ms();
        // Clamp to 1ms so expires_at > timestamp always holds.
        let ttl = ttl_ms.unwrap_or(self.default_ttl_ms).max(1);

        let data = match serde_json::to_value(value) {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(key = %full, error = %err, "cache value not serializable; skipping write");
                return;
            }
        };

        let envelope = CacheEnvelope { data, timestamp: now, expires_at: now + ttl };
        let raw = match serde_json::to_string(&envelope) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(key = %full, error = %err, "cache envelope serialization failed");
                return;
            }
        };

        if let Err(err) = self.store.set(&full, raw).await {
            tracing::warn!(key = %full, error = %err, "cache write failed");
        }
    }

    pub async fn remove(&self, key: &str) {
        let full = self.full_key(key);
        self.silent_remove(&full).await;
    }

    /// Scan the namespace and delete every expired (or unparseable) entry.
    /// Returns the number of entries removed.
    pub async fn clear_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut doomed = Vec::new();

        for key in self.namespace_keys().await {
            match self.store.get(&key).await {
                Ok(Some(raw)) => match serde_json::from_str::<CacheEnvelope>(&raw) {
                    Ok(envelope) if envelope.expires_at < now => doomed.push(key),
                    Ok(_) => {}
                    // Unparseable entries are dead weight too.
                    Err(_) => doomed.push(key),
                },
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "cache scan read failed");
                }
            }
        }

        self.remove_batch(doomed).await
    }

    /// Delete every key under this cache's namespace prefix. Keys outside
    /// the prefix are never touched.
    pub async fn clear_all(&self) -> usize {
        let doomed = self.namespace_keys().await;
        self.remove_batch(doomed).await
    }

    /// Whether the device currently has network reachability.
    pub async fn is_connected(&self) -> bool {
        self.reachability.is_connected().await
    }

    async fn namespace_keys(&self) -> Vec<String> {
        match self.store.get_all_keys().await {
            Ok(keys) => keys.into_iter().filter(|k| k.starts_with(&self.prefix)).collect(),
            Err(err) => {
                tracing::warn!(error = %err, "cache key enumeration failed");
                Vec::new()
            }
        }
    }

    async fn remove_batch(&self, doomed: Vec<String>) -> usize {
        if doomed.is_empty() {
            return 0;
        }
        let count = doomed.len();
        if let Err(err) = self.store.multi_remove(&doomed).await {
            tracing::warn!(error = %err, "cache batch removal failed");
            return 0;
        }
        tracing::debug!(count, prefix = %self.prefix, "cache entries removed");
        count
    }

    async fn silent_remove(&self, full_key: &str) {
        if let Err(err) = self.store.remove(full_key).await {
            tracing::warn!(key = %full_key, error = %err, "cache removal failed");
        }
    }
}
