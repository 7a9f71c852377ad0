use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::time::Duration;

use super::memory::MemoryStore;
use super::redis::RedisStore;
use super::{CacheError, CacheResult};

/// A value kind that lives in the ephemeral store.
///
/// Each implementor names its own key namespace and default lifetime; the
/// store never mixes artifact kinds, so eviction pressure on one flow cannot
/// flush another flow's state.
pub trait EphemeralObject:
    Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
    /// Key namespace, e.g. "oauth_flow".
    fn store_prefix() -> &'static str;

    /// Lifetime applied by `put`; `put_with_ttl` overrides per entry.
    fn default_ttl() -> Duration;
}

#[derive(Clone)]
pub enum StoreBackend {
    Memory(MemoryStore),
    Redis(RedisStore),
}

/// Typed handle over one namespace of the ephemeral store.
#[derive(Clone)]
pub struct EphemeralStore<T: EphemeralObject> {
    backend: StoreBackend,
    _phantom: PhantomData<T>,
}

impl<T: EphemeralObject> EphemeralStore<T> {
    pub fn new(backend: StoreBackend) -> Self {
        Self {
            backend,
            _phantom: PhantomData,
        }
    }

    fn cache_key(key: &str) -> String {
        format!("{}:{}", T::store_prefix(), key)
    }

    pub async fn put(&self, key: &str, value: &T) -> CacheResult<()> {
        self.put_with_ttl(key, value, T::default_ttl()).await
    }

    pub async fn put_with_ttl(&self, key: &str, value: &T, ttl: Duration) -> CacheResult<()> {
        match &self.backend {
            StoreBackend::Memory(store) => {
                let data = serde_json::to_string(value)
                    .map_err(|e| CacheError::Serialization(e.to_string()))?;
                store.set(&Self::cache_key(key), data, ttl).await
            }
            StoreBackend::Redis(store) => {
                let data = postcard::to_allocvec(value)
                    .map_err(|e| CacheError::Serialization(e.to_string()))?;
                store.set(&Self::cache_key(key), data, ttl).await
            }
        }
    }

    pub async fn get(&self, key: &str) -> CacheResult<Option<T>> {
        match &self.backend {
            StoreBackend::Memory(store) => store
                .get(&Self::cache_key(key))
                .await
                .map(|data| {
                    serde_json::from_str(&data)
                        .map_err(|e| CacheError::Serialization(e.to_string()))
                })
                .transpose(),
            StoreBackend::Redis(store) => store
                .get(&Self::cache_key(key))
                .await?
                .map(|data| {
                    postcard::from_bytes(&data)
                        .map_err(|e| CacheError::Serialization(e.to_string()))
                })
                .transpose(),
        }
    }

    /// Atomic get-and-remove. At most one concurrent caller observes the
    /// value; everyone else gets `None`.
    pub async fn take(&self, key: &str) -> CacheResult<Option<T>> {
        match &self.backend {
            StoreBackend::Memory(store) => store
                .take(&Self::cache_key(key))
                .await
                .map(|data| {
                    serde_json::from_str(&data)
                        .map_err(|e| CacheError::Serialization(e.to_string()))
                })
                .transpose(),
            StoreBackend::Redis(store) => store
                .take(&Self::cache_key(key))
                .await?
                .map(|data| {
                    postcard::from_bytes(&data)
                        .map_err(|e| CacheError::Serialization(e.to_string()))
                })
                .transpose(),
        }
    }

    pub async fn delete(&self, key: &str) -> CacheResult<()> {
        match &self.backend {
            StoreBackend::Memory(store) => {
                store.remove(&Self::cache_key(key)).await;
                Ok(())
            }
            StoreBackend::Redis(store) => store.remove(&Self::cache_key(key)).await,
        }
    }

    /// Delete every entry in this namespace matching the predicate. Returns
    /// the number removed.
    pub async fn delete_where<F>(&self, predicate: F) -> CacheResult<usize>
    where
        F: Fn(&T) -> bool,
    {
        match &self.backend {
            StoreBackend::Memory(store) => {
                let removed = store
                    .remove_where(|data| {
                        serde_json::from_str::<T>(data)
                            .map(|value| predicate(&value))
                            .unwrap_or(false)
                    })
                    .await;
                Ok(removed)
            }
            StoreBackend::Redis(store) => {
                let mut removed = 0;
                for key in store.keys_with_prefix(T::store_prefix()).await? {
                    let Some(data) = store.get(&key).await? else {
                        continue;
                    };
                    let value: T = match postcard::from_bytes(&data) {
                        Ok(value) => value,
                        Err(_) => continue,
                    };
                    if predicate(&value) {
                        store.remove(&key).await?;
                        removed += 1;
                    }
                }
                Ok(removed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ticket {
        owner: String,
        value: u32,
    }

    impl EphemeralObject for Ticket {
        fn store_prefix() -> &'static str {
            "ticket"
        }

        fn default_ttl() -> Duration {
            Duration::from_secs(60)
        }
    }

    fn memory_store() -> EphemeralStore<Ticket> {
        EphemeralStore::new(StoreBackend::Memory(MemoryStore::new(64)))
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = memory_store();
        let ticket = Ticket {
            owner: "acct-1".to_string(),
            value: 7,
        };
        store.put("t1", &ticket).await.unwrap();
        assert_eq!(store.get("t1").await.unwrap(), Some(ticket));
    }

    #[tokio::test]
    async fn test_take_consumes() {
        let store = memory_store();
        let ticket = Ticket {
            owner: "acct-1".to_string(),
            value: 7,
        };
        store.put("t1", &ticket).await.unwrap();

        assert_eq!(store.take("t1").await.unwrap(), Some(ticket));
        assert_eq!(store.take("t1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_with_ttl_expires() {
        let store = memory_store();
        let ticket = Ticket {
            owner: "acct-1".to_string(),
            value: 7,
        };
        store
            .put_with_ttl("t1", &ticket, Duration::from_millis(30))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(store.get("t1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_where_by_owner() {
        let store = memory_store();
        for (key, owner) in [("t1", "acct-1"), ("t2", "acct-2"), ("t3", "acct-1")] {
            store
                .put(
                    key,
                    &Ticket {
                        owner: owner.to_string(),
                        value: 0,
                    },
                )
                .await
                .unwrap();
        }

        let removed = store.delete_where(|t| t.owner == "acct-1").await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.get("t1").await.unwrap().is_none());
        assert!(store.get("t2").await.unwrap().is_some());
    }
}
