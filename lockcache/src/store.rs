//! Lock store and cache store abstractions.
//!
//! Two external key-value systems back every [`LockAndCache`](crate::LockAndCache):
//! a [`LockStore`] holding the mutual-exclusion records and a [`CacheStore`]
//! holding computed values. They can be the same physical system (keys never
//! collide) or two different ones. Each only needs atomic single-key
//! operations.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::config::{StoreConfig, Timeout};

const STORE_ERROR_PREFIX: &str = "lockcache store error:";

/// Errors that can occur when talking to a store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The underlying backend returned an error.
    #[error("{STORE_ERROR_PREFIX} backend error: {0}")]
    Backend(String),
    /// Failed to serialize a value for storage.
    #[error("{STORE_ERROR_PREFIX} serialization error: {0}")]
    Serialize(String),
    /// Failed to deserialize a stored value.
    #[error("{STORE_ERROR_PREFIX} deserialization error: {0}")]
    Deserialize(String),
    /// The configuration names a backend that was not compiled in.
    #[error("{STORE_ERROR_PREFIX} store backend `{0}` is not enabled")]
    BackendNotEnabled(&'static str),
}

/// Convenience alias for results returned by store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Storage for computed values.
///
/// Writes must be atomic: a reader sees either no entry or a complete one.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Get a value by key. Returns `Ok(None)` if the key does not exist or
    /// has expired.
    async fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Insert a value under the given key, replacing any previous value.
    async fn insert(&self, key: String, value: Value, expiry: Timeout) -> StoreResult<()>;

    /// Remove a value by key. Succeeds even if the key was absent.
    async fn remove(&self, key: &str) -> StoreResult<()>;

    /// Returns `true` if the store holds a live value for the key.
    async fn contains_key(&self, key: &str) -> StoreResult<bool>;

    /// Remove every entry in the store.
    async fn clear(&self) -> StoreResult<()>;
}

/// Storage for lock records.
///
/// A lock record maps a lock key to the token of its holder and carries a
/// time-to-live. Only the holder whose token is stored may refresh or
/// release it.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait LockStore: Send + Sync + 'static {
    /// Atomically store `token` under `key` with the given time-to-live,
    /// unless the key already exists. Returns `true` if the record was
    /// created.
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool>;

    /// Reset the time-to-live of `key` if it is still held by `token`.
    /// Returns `false` if the record is missing or owned by someone else.
    async fn refresh(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool>;

    /// Delete `key` if it is still held by `token`. Returns `false` if the
    /// record is missing or owned by someone else.
    async fn release(&self, key: &str, token: &str) -> StoreResult<bool>;

    /// Returns `true` if a live lock record exists for the key.
    async fn contains_key(&self, key: &str) -> StoreResult<bool>;

    /// Remove every lock record in the store.
    async fn clear(&self) -> StoreResult<()>;
}

impl StoreConfig {
    /// Creates the cache store this configuration describes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend could not be set up or was not
    /// compiled in.
    pub fn to_cache_store(&self) -> StoreResult<Arc<dyn CacheStore>> {
        match self {
            StoreConfig::Memory => Ok(Arc::new(memory::Memory::new())),
            #[cfg(feature = "redis")]
            StoreConfig::Redis { url, pool_size } => {
                Ok(Arc::new(redis::Redis::new(url, *pool_size)?))
            }
            #[cfg(not(feature = "redis"))]
            StoreConfig::Redis { .. } => Err(StoreError::BackendNotEnabled("redis")),
        }
    }

    /// Creates the lock store this configuration describes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend could not be set up or was not
    /// compiled in.
    pub fn to_lock_store(&self) -> StoreResult<Arc<dyn LockStore>> {
        match self {
            StoreConfig::Memory => Ok(Arc::new(memory::Memory::new())),
            #[cfg(feature = "redis")]
            StoreConfig::Redis { url, pool_size } => {
                Ok(Arc::new(redis::Redis::new(url, *pool_size)?))
            }
            #[cfg(not(feature = "redis"))]
            StoreConfig::Redis { .. } => Err(StoreError::BackendNotEnabled("redis")),
        }
    }
}
