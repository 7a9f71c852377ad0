use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::{CacheError, CacheResult};

/// Entry with expiration and a last-touched marker for eviction ordering.
#[derive(Clone, Debug)]
struct MemoryEntry {
    data: String,
    expires_at: DateTime<Utc>,
    last_used: Instant,
}

impl MemoryEntry {
    fn new(data: String, ttl: Duration) -> CacheResult<Self> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| CacheError::Cache(format!("Invalid TTL: {e}")))?;
        Ok(Self {
            data,
            expires_at: Utc::now() + ttl,
            last_used: Instant::now(),
        })
    }

    fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// Capacity-bounded in-memory namespace.
///
/// Expired entries are dropped lazily on read and in bulk by the background
/// sweep. When the namespace is full a write first purges expired entries,
/// then evicts the least-recently-used survivor.
#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, MemoryEntry>>>,
    capacity: usize,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(key);
                None
            }
            Some(entry) => {
                entry.last_used = Instant::now();
                Some(entry.data.clone())
            }
            None => None,
        }
    }

    pub async fn set(&self, key: &str, data: String, ttl: Duration) -> CacheResult<()> {
        let entry = MemoryEntry::new(data, ttl)?;
        let mut entries = self.entries.write().await;
        if !entries.contains_key(key) && entries.len() >= self.capacity {
            entries.retain(|_, e| !e.is_expired());
            if entries.len() >= self.capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_used)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(key.to_string(), entry);
        Ok(())
    }

    /// Remove and return, atomically under the write lock. An expired entry
    /// is removed but reported as absent.
    pub async fn take(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.write().await;
        let entry = entries.remove(key)?;
        if entry.is_expired() {
            None
        } else {
            Some(entry.data)
        }
    }

    pub async fn remove(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    /// Remove every live entry whose serialized value matches the predicate.
    pub async fn remove_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.is_expired() || !predicate(&e.data));
        before - entries.len()
    }

    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired());
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_remove() {
        let store = MemoryStore::new(16);
        store
            .set("k1", "v1".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("k1").await, Some("v1".to_string()));

        store.remove("k1").await;
        assert_eq!(store.get("k1").await, None);
    }

    #[tokio::test]
    async fn test_expired_entry_is_absent() {
        let store = MemoryStore::new(16);
        store
            .set("k1", "v1".to_string(), Duration::from_millis(30))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(store.get("k1").await, None);
        // Lazy cleanup removed the entry entirely
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_take_is_single_shot() {
        let store = MemoryStore::new(16);
        store
            .set("k1", "v1".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(store.take("k1").await, Some("v1".to_string()));
        assert_eq!(store.take("k1").await, None);
        assert_eq!(store.get("k1").await, None);
    }

    #[tokio::test]
    async fn test_take_expired_returns_none() {
        let store = MemoryStore::new(16);
        store
            .set("k1", "v1".to_string(), Duration::from_millis(30))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(store.take("k1").await, None);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_used() {
        let store = MemoryStore::new(2);
        store
            .set("a", "1".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store
            .set("b", "2".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Touch "a" so "b" becomes the eviction candidate
        assert!(store.get("a").await.is_some());
        tokio::time::sleep(Duration::from_millis(5)).await;

        store
            .set("c", "3".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(store.len().await, 2);
        assert!(store.get("a").await.is_some());
        assert!(store.get("b").await.is_none());
        assert!(store.get("c").await.is_some());
    }

    #[tokio::test]
    async fn test_eviction_prefers_expired_entries() {
        let store = MemoryStore::new(2);
        store
            .set("old", "1".to_string(), Duration::from_millis(20))
            .await
            .unwrap();
        store
            .set("live", "2".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        store
            .set("new", "3".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        // The expired entry was purged; the live one survived
        assert!(store.get("live").await.is_some());
        assert!(store.get("new").await.is_some());
    }

    #[tokio::test]
    async fn test_remove_where() {
        let store = MemoryStore::new(16);
        store
            .set("a", "keep".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .set("b", "drop".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        let removed = store.remove_where(|data| data == "drop").await;
        assert_eq!(removed, 1);
        assert!(store.get("a").await.is_some());
        assert!(store.get("b").await.is_none());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryStore::new(16);
        store
            .set("a", "1".to_string(), Duration::from_millis(20))
            .await
            .unwrap();
        store
            .set("b", "2".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.len().await, 1);
    }
}
