//! Persistent key-value store boundary.
//!
//! The sync layer never owns a storage engine; the embedder supplies
//! whatever device-local store it has (SQLite, platform preferences, plain
//! files) behind this trait. All values are opaque strings — the cache layer
//! above decides the envelope format.

use async_trait::async_trait;
use dashmap::DashMap;
use lexsync_types::CacheError;

/// Async key-value store with bulk key enumeration and removal.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: String) -> Result<(), CacheError>;
    async fn remove(&self, key: &str) -> Result<(), CacheError>;
    /// Every key currently in the store, cache-owned or not.
    async fn get_all_keys(&self) -> Result<Vec<String>, CacheError>;
    async fn multi_remove(&self, keys: &[String]) -> Result<(), CacheError>;
}

/// In-memory store used by tests and as a default when the embedder has no
/// persistent storage wired up yet.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: String) -> Result<(), CacheError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn get_all_keys(&self) -> Result<Vec<String>, CacheError> {
        Ok(self.entries.iter().map(|e| e.key().clone()).collect())
    }

    async fn multi_remove(&self, keys: &[String]) -> Result<(), CacheError> {
        for key in keys {
            self.entries.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();

        store.set("k", "v".to_string()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        store.remove("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_multi_remove() {
        let store = MemoryStore::new();
        store.set("a", "1".to_string()).await.unwrap();
        store.set("b", "2".to_string()).await.unwrap();
        store.set("c", "3".to_string()).await.unwrap();

        store.multi_remove(&["a".to_string(), "c".to_string()]).await.unwrap();

        let mut keys = store.get_all_keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["b".to_string()]);
    }
}
