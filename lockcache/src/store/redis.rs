//! Redis store implementation.
//!
//! Cached values are stored as JSON strings. Lock records are stored as the
//! plain holder token; acquisition uses `SET NX PX`, while refresh and
//! release run as Lua scripts so that the ownership check and the mutation
//! happen atomically on the server.
//!
//! # Examples
//!
//! ```no_run
//! use lockcache::config::StoreUrl;
//! use lockcache::store::redis::Redis;
//!
//! let url: StoreUrl = "redis://127.0.0.1/".parse().unwrap();
//! let store = Redis::new(&url, 16).unwrap();
//! ```

use std::time::Duration;

use chrono::Utc;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::{AsyncCommands, ExistenceCheck, Script, SetExpiry, SetOptions};
use serde_json::Value;
use thiserror::Error;

use crate::config::{StoreUrl, Timeout};
use crate::store::{CacheStore, LockStore, StoreError, StoreResult};

const REFRESH_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Errors specific to the Redis store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RedisStoreError {
    /// An error occurred during Redis connection pool creation.
    #[error("redis pool creation error: {0}")]
    PoolCreation(Box<dyn std::error::Error + Send + Sync>),

    /// An error occurred during a pool connection checkout.
    #[error("redis pool connection error: {0}")]
    PoolConnection(#[from] deadpool_redis::PoolError),

    /// An error occurred during a Redis command execution.
    #[error("redis command error: {0}")]
    Command(#[from] redis::RedisError),

    /// The URL does not point at a Redis server.
    #[error("invalid redis connection string: {0}")]
    InvalidConnectionString(String),

    /// An error occurred during JSON serialization.
    #[error("serialization error: {0}")]
    Serialize(serde_json::Error),

    /// An error occurred during JSON deserialization.
    #[error("deserialization error: {0}")]
    Deserialize(serde_json::Error),
}

impl From<RedisStoreError> for StoreError {
    fn from(err: RedisStoreError) -> Self {
        match err {
            RedisStoreError::Serialize(e) => StoreError::Serialize(e.to_string()),
            RedisStoreError::Deserialize(e) => StoreError::Deserialize(e.to_string()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// A Redis-backed store implementing both [`CacheStore`] and [`LockStore`].
#[derive(Clone)]
pub struct Redis {
    pool: Pool,
    refresh: Script,
    release: Script,
}

impl Redis {
    /// Creates a new store with a connection pool of `pool_size` connections.
    ///
    /// No connection is opened until the first command.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is not a Redis URL or the pool could not
    /// be created.
    pub fn new(url: &StoreUrl, pool_size: usize) -> StoreResult<Self> {
        if !url.is_redis() {
            return Err(RedisStoreError::InvalidConnectionString(url.to_string()).into());
        }
        let pool = Config::from_url(url.as_str())
            .builder()
            .map_err(|e| RedisStoreError::PoolCreation(Box::new(e)))?
            .max_size(pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| RedisStoreError::PoolCreation(Box::new(e)))?;

        Ok(Self {
            pool,
            refresh: Script::new(REFRESH_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        })
    }

    async fn get_connection(&self) -> Result<Connection, RedisStoreError> {
        Ok(self.pool.get().await?)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.get_connection().await?;
        let exists: bool = conn.exists(key).await.map_err(RedisStoreError::from)?;
        Ok(exists)
    }

    async fn flush(&self) -> StoreResult<()> {
        let mut conn = self.get_connection().await?;
        redis::cmd("FLUSHDB")
            .query_async::<()>(&mut conn)
            .await
            .map_err(RedisStoreError::from)?;
        Ok(())
    }
}

impl std::fmt::Debug for Redis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redis")
            .field("pool", &self.pool.status())
            .finish_non_exhaustive()
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait::async_trait]
impl CacheStore for Redis {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let mut conn = self.get_connection().await?;
        let data: Option<String> = conn.get(key).await.map_err(RedisStoreError::from)?;

        data.map(|d| {
            serde_json::from_str::<Value>(&d)
                .map_err(|e| RedisStoreError::Deserialize(e).into())
        })
        .transpose()
    }

    async fn insert(&self, key: String, value: Value, expiry: Timeout) -> StoreResult<()> {
        let mut conn = self.get_connection().await?;
        let data = serde_json::to_string(&value).map_err(RedisStoreError::Serialize)?;

        let options = match expiry {
            Timeout::Never => SetOptions::default(),
            Timeout::After(duration) => {
                SetOptions::default().with_expiration(SetExpiry::PX(millis(duration)))
            }
            Timeout::AtDateTime(dt) => match u64::try_from(dt.timestamp_millis()) {
                Ok(unix_millis) if dt.with_timezone(&Utc) > Utc::now() => {
                    SetOptions::default().with_expiration(SetExpiry::PXAT(unix_millis))
                }
                // Already expired; whatever was stored under the key is stale too.
                _ => {
                    conn.del::<_, usize>(key)
                        .await
                        .map_err(RedisStoreError::from)?;
                    return Ok(());
                }
            },
        };

        conn.set_options::<_, _, ()>(key, data, options)
            .await
            .map_err(RedisStoreError::from)?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.get_connection().await?;
        conn.del::<_, usize>(key)
            .await
            .map_err(RedisStoreError::from)?;
        Ok(())
    }

    async fn contains_key(&self, key: &str) -> StoreResult<bool> {
        self.exists(key).await
    }

    async fn clear(&self) -> StoreResult<()> {
        self.flush().await
    }
}

#[async_trait::async_trait]
impl LockStore for Redis {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.get_connection().await?;
        let options = SetOptions::default()
            .conditional_set(ExistenceCheck::NX)
            .with_expiration(SetExpiry::PX(millis(ttl)));

        let set_ok: bool = conn
            .set_options(key, token, options)
            .await
            .map_err(RedisStoreError::from)?;
        Ok(set_ok)
    }

    async fn refresh(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.get_connection().await?;
        let refreshed: i64 = self
            .refresh
            .key(key)
            .arg(token)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(RedisStoreError::from)?;
        Ok(refreshed == 1)
    }

    async fn release(&self, key: &str, token: &str) -> StoreResult<bool> {
        let mut conn = self.get_connection().await?;
        let deleted: i64 = self
            .release
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(RedisStoreError::from)?;
        Ok(deleted == 1)
    }

    async fn contains_key(&self, key: &str) -> StoreResult<bool> {
        self.exists(key).await
    }

    async fn clear(&self) -> StoreResult<()> {
        self.flush().await
    }
}
