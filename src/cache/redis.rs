use redis::aio::MultiplexedConnection;
use std::time::Duration;

use super::{CacheError, CacheResult};

/// Redis namespace backend.
///
/// Values are postcard-encoded by the typed layer; keys carry the configured
/// deployment prefix so several services can share one Redis. Expiry is
/// delegated to Redis (`SET .. EX`), single-shot consumption to `GETDEL`.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    key_prefix: String,
}

impl RedisStore {
    pub fn from_client(client: redis::Client, key_prefix: String) -> Self {
        Self { client, key_prefix }
    }

    pub fn new(redis_url: &str, key_prefix: String) -> CacheResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| CacheError::Connection(format!("Redis client creation failed: {e}")))?;
        Ok(Self::from_client(client, key_prefix))
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn connection(&self) -> CacheResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| CacheError::Connection(format!("Redis connection failed: {e}")))
    }

    pub async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;
        redis::cmd("GET")
            .arg(self.full_key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Cache(format!("Redis GET failed: {e}")))
    }

    pub async fn set(&self, key: &str, data: Vec<u8>, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.connection().await?;
        redis::cmd("SET")
            .arg(self.full_key(key))
            .arg(data)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| CacheError::Cache(format!("Redis SET failed: {e}")))
    }

    pub async fn take(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;
        redis::cmd("GETDEL")
            .arg(self.full_key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Cache(format!("Redis GETDEL failed: {e}")))
    }

    pub async fn remove(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.connection().await?;
        redis::cmd("DEL")
            .arg(self.full_key(key))
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| CacheError::Cache(format!("Redis DEL failed: {e}")))
    }

    /// All keys under the given namespace prefix, with the deployment prefix
    /// stripped back off. Uses SCAN so large keyspaces don't block Redis.
    pub async fn keys_with_prefix(&self, namespace: &str) -> CacheResult<Vec<String>> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}{}:*", self.key_prefix, namespace);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| CacheError::Cache(format!("Redis SCAN failed: {e}")))?;
            keys.extend(
                batch
                    .into_iter()
                    .filter_map(|k| k.strip_prefix(&self.key_prefix).map(|s| s.to_string())),
            );
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    pub async fn health_check(&self) -> CacheResult<()> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| CacheError::Connection(format!("Redis ping failed: {e}")))?;
        Ok(())
    }
}
