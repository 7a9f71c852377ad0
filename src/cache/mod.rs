//! Ephemeral state store for in-flight authentication artifacts
//!
//! Everything kept here is disposable: a lost entry aborts a flow, it never
//! corrupts an account. Entries are keyed by opaque tokens, expire on a
//! per-kind TTL, and are consumed single-shot via `take`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;

pub mod config;
pub mod memory;
pub mod redis;
pub mod typed;

pub use config::CacheConfig;
pub use typed::{EphemeralObject, EphemeralStore, StoreBackend};

use crate::health::{HealthCheckResult, HealthChecker};
use memory::MemoryStore;
use redis::RedisStore;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache error: {0}")]
    Cache(String),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// One in-memory namespace per artifact kind, each with its own capacity.
type MemoryNamespaces = Arc<RwLock<HashMap<&'static str, MemoryStore>>>;

/// Hands out typed `EphemeralStore` handles over the configured backend.
///
/// Constructed explicitly and passed to collaborators; there is no global.
#[derive(Clone)]
pub struct CacheManager {
    config: CacheConfig,
    redis_client: Option<::redis::Client>,
    namespaces: MemoryNamespaces,
}

impl CacheManager {
    /// Memory-backed manager for tests and single-instance deployments.
    pub fn new_memory() -> Self {
        Self {
            config: CacheConfig::default(),
            redis_client: None,
            namespaces: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Build from configuration, failing early if Redis is unreachable.
    pub async fn new_from_config(config: &CacheConfig) -> CacheResult<Self> {
        let redis_client = if config.backend == "redis" {
            let client = ::redis::Client::open(config.redis_url.as_str())
                .map_err(|e| CacheError::Connection(format!("Redis client creation failed: {e}")))?;

            let mut conn = client
                .get_multiplexed_tokio_connection()
                .await
                .map_err(|e| CacheError::Connection(format!("Redis connection failed: {e}")))?;
            ::redis::cmd("PING")
                .query_async::<String>(&mut conn)
                .await
                .map_err(|e| CacheError::Connection(format!("Redis ping failed: {e}")))?;

            Some(client)
        } else {
            None
        };

        Ok(Self {
            config: config.clone(),
            redis_client,
            namespaces: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    fn memory_namespace(&self, prefix: &'static str) -> MemoryStore {
        // Short critical section, no await while holding the lock
        let mut namespaces = match self.namespaces.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        namespaces
            .entry(prefix)
            .or_insert_with(|| MemoryStore::new(self.config.max_entries_per_store))
            .clone()
    }

    /// Typed handle for artifact kind `T`.
    pub fn store<T: EphemeralObject>(&self) -> EphemeralStore<T> {
        let backend = if let Some(client) = &self.redis_client {
            StoreBackend::Redis(RedisStore::from_client(
                client.clone(),
                self.config.redis_key_prefix.clone(),
            ))
        } else {
            StoreBackend::Memory(self.memory_namespace(T::store_prefix()))
        };
        EphemeralStore::new(backend)
    }

    /// Background sweep over the memory namespaces. Redis expires its own
    /// keys. The caller owns the handle and aborts it at shutdown.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let namespaces = self.namespaces.clone();
        let interval = Duration::from_secs(self.config.sweep_interval.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let stores: Vec<(&'static str, MemoryStore)> = {
                    let namespaces = match namespaces.read() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    namespaces.iter().map(|(k, v)| (*k, v.clone())).collect()
                };
                for (prefix, store) in stores {
                    let purged = store.purge_expired().await;
                    if purged > 0 {
                        tracing::debug!(namespace = prefix, purged, "swept expired entries");
                    }
                }
            }
        })
    }

    pub async fn health_check(&self) -> HealthCheckResult {
        match &self.redis_client {
            Some(client) => {
                let store =
                    RedisStore::from_client(client.clone(), self.config.redis_key_prefix.clone());
                match store.health_check().await {
                    Ok(()) => HealthCheckResult::healthy_with_details(serde_json::json!({
                        "backend": "redis",
                        "connection": "ok"
                    })),
                    Err(err) => HealthCheckResult::unhealthy_with_details(
                        "Redis health check failed".to_string(),
                        serde_json::json!({
                            "backend": "redis",
                            "error": err.to_string()
                        }),
                    ),
                }
            }
            None => HealthCheckResult::healthy_with_details(serde_json::json!({
                "backend": "memory"
            })),
        }
    }

}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new_memory()
    }
}

#[async_trait::async_trait]
impl HealthChecker for CacheManager {
    fn name(&self) -> &str {
        "cache"
    }

    async fn check(&self) -> HealthCheckResult {
        self.health_check().await
    }
}
