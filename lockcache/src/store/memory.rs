//! In-memory store implementation.
//!
//! This module provides a simple thread-safe, process-local store that
//! implements both [`CacheStore`] and [`LockStore`]. It is primarily intended
//! for development, testing, and single-process deployments where a shared
//! in-memory map is sufficient. Locks kept here only exclude callers living
//! in the same process.
//!
//! Expired entries are evicted lazily when they are accessed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::Timeout;
use crate::store::{CacheStore, LockStore, StoreResult};

/// Time-to-lives too long for the clock never expire.
fn expiry_after(ttl: Duration) -> Option<Instant> {
    Instant::now().checked_add(ttl)
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.and_then(expiry_after),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }

    fn is_held_by(&self, token: &str, now: Instant) -> bool {
        self.is_live(now) && self.value.as_str() == Some(token)
    }
}

/// A simple in-memory store backed by a `Mutex<HashMap<..>>`.
///
/// Cloning a `Memory` store yields a handle to the same map.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use lockcache::store::LockStore;
/// use lockcache::store::memory::Memory;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> lockcache::Result<()> {
/// let store = Memory::new();
///
/// assert!(store.try_acquire("lock", "me", Duration::from_secs(5)).await?);
/// assert!(!store.try_acquire("lock", "you", Duration::from_secs(5)).await?);
/// assert!(store.release("lock", "me").await?);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct Memory {
    map: Arc<Mutex<HashMap<String, Entry>>>,
}

impl Memory {
    /// Create a new, empty `Memory` store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the number of live entries in the store.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let map = self.map.lock().await;
        map.values().filter(|entry| entry.is_live(now)).count()
    }

    /// Check whether the store has no live entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn live_value(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let mut map = self.map.lock().await;
        match map.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }
}

#[async_trait::async_trait]
impl CacheStore for Memory {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.live_value(key).await)
    }

    async fn insert(&self, key: String, value: Value, expiry: Timeout) -> StoreResult<()> {
        let mut map = self.map.lock().await;
        map.insert(key, Entry::new(value, expiry.ttl()));
        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        let mut map = self.map.lock().await;
        map.remove(key);
        Ok(())
    }

    async fn contains_key(&self, key: &str) -> StoreResult<bool> {
        Ok(self.live_value(key).await.is_some())
    }

    async fn clear(&self) -> StoreResult<()> {
        let mut map = self.map.lock().await;
        map.clear();
        Ok(())
    }
}

#[async_trait::async_trait]
impl LockStore for Memory {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let mut map = self.map.lock().await;
        if map.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }
        map.insert(
            key.to_owned(),
            Entry::new(Value::String(token.to_owned()), Some(ttl)),
        );
        Ok(true)
    }

    async fn refresh(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let mut map = self.map.lock().await;
        match map.get_mut(key) {
            Some(entry) if entry.is_held_by(token, now) => {
                entry.expires_at = now.checked_add(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, token: &str) -> StoreResult<bool> {
        let now = Instant::now();
        let mut map = self.map.lock().await;
        if map.get(key).is_some_and(|entry| entry.is_held_by(token, now)) {
            map.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn contains_key(&self, key: &str) -> StoreResult<bool> {
        Ok(self.live_value(key).await.is_some())
    }

    async fn clear(&self) -> StoreResult<()> {
        let mut map = self.map.lock().await;
        map.clear();
        Ok(())
    }
}
