//! The lock-and-cache algorithm.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::LockAndCache;
use crate::config::{MIN_HEARTBEAT_EXPIRES, Timeout};
use crate::error::{Error, Result};
use crate::key::Key;
use crate::lock::{HeartbeatingLock, HeldLock};
use crate::store::{CacheStore, LockStore};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const CONTENTION_WARNING_AFTER: Duration = Duration::from_millis(500);

/// Per-call overrides of the defaults configured on a
/// [`LockAndCache`](crate::LockAndCache) handle.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use lockcache::Options;
///
/// let options = Options::new()
///     .expires(Duration::from_secs(60))
///     .max_lock_wait(Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[must_use]
pub struct Options {
    expires: Option<Timeout>,
    max_lock_wait: Option<Duration>,
    heartbeat_expires: Option<Duration>,
}

impl Options {
    /// Creates options that keep every default: cached values never expire.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets when the cached value expires.
    pub fn expires(mut self, expires: impl Into<Timeout>) -> Self {
        self.expires = Some(expires.into());
        self
    }

    /// Sets how long to wait for a lock held by someone else before failing
    /// with [`Error::TimeoutWaitingForLock`].
    pub fn max_lock_wait(mut self, max_lock_wait: Duration) -> Self {
        self.max_lock_wait = Some(max_lock_wait);
        self
    }

    /// Sets the lock time-to-live. Must be at least
    /// [`MIN_HEARTBEAT_EXPIRES`](crate::config::MIN_HEARTBEAT_EXPIRES).
    pub fn heartbeat_expires(mut self, heartbeat_expires: Duration) -> Self {
        self.heartbeat_expires = Some(heartbeat_expires);
        self
    }
}

pub(crate) fn check_heartbeat_expires(heartbeat_expires: Duration) -> Result<()> {
    if heartbeat_expires < MIN_HEARTBEAT_EXPIRES {
        return Err(Error::InvalidHeartbeatExpires {
            given: heartbeat_expires,
            minimum: MIN_HEARTBEAT_EXPIRES,
        });
    }
    Ok(())
}

enum Acquired<V> {
    Held(HeldLock),
    Cached(V),
}

/// One `perform` call on one key with all options resolved.
pub(crate) struct LockAndCacheAction<'a> {
    lock_store: &'a Arc<dyn LockStore>,
    cache_store: &'a Arc<dyn CacheStore>,
    key: &'a Key,
    expires: Timeout,
    max_lock_wait: Duration,
    heartbeat_expires: Duration,
}

impl<'a> LockAndCacheAction<'a> {
    pub(crate) fn new(
        lock_and_cache: &'a LockAndCache,
        key: &'a Key,
        options: Options,
    ) -> Result<Self> {
        let heartbeat_expires = options
            .heartbeat_expires
            .unwrap_or(lock_and_cache.heartbeat_expires);
        check_heartbeat_expires(heartbeat_expires)?;

        Ok(Self {
            lock_store: &lock_and_cache.lock_store,
            cache_store: &lock_and_cache.cache_store,
            key,
            expires: options.expires.unwrap_or_default(),
            max_lock_wait: options
                .max_lock_wait
                .unwrap_or(lock_and_cache.max_lock_wait),
            heartbeat_expires,
        })
    }

    pub(crate) async fn perform<V, E, F, Fut>(
        self,
        computation: F,
    ) -> std::result::Result<V, E>
    where
        V: Serialize + DeserializeOwned,
        E: From<Error>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
    {
        if let Some(value) = self.cached().await? {
            trace!(storage_key = %self.key.storage_key(), "cache hit");
            return Ok(value);
        }

        let lock = HeartbeatingLock::new(
            Arc::clone(self.lock_store),
            self.key.lock_key(),
            self.heartbeat_expires,
        );
        let mut held = match self.acquire(&lock).await? {
            Acquired::Held(held) => held,
            Acquired::Cached(value) => return Ok(value),
        };

        match self.cached().await {
            Ok(None) => {}
            Ok(Some(value)) => {
                debug!(storage_key = %self.key.storage_key(), "value was cached while acquiring the lock");
                self.release(held).await;
                return Ok(value);
            }
            Err(error) => {
                self.release(held).await;
                return Err(error.into());
            }
        }

        debug!(storage_key = %self.key.storage_key(), "computing value");
        let outcome = tokio::select! {
            biased;
            () = held.lost() => None,
            result = computation() => Some(result),
        };
        let value = match outcome {
            None => {
                held.abandon();
                return Err(self.lock_lost().into());
            }
            Some(Err(error)) => {
                self.release(held).await;
                return Err(error);
            }
            Some(Ok(value)) => value,
        };
        if held.is_lost() {
            held.abandon();
            return Err(self.lock_lost().into());
        }
        match held.confirm().await {
            Ok(true) => {}
            Ok(false) => {
                held.abandon();
                return Err(self.lock_lost().into());
            }
            Err(error) => {
                self.release(held).await;
                return Err(error.into());
            }
        }

        let written = self.write(&value).await;
        self.release(held).await;
        written?;
        Ok(value)
    }

    async fn cached<V: DeserializeOwned>(&self) -> Result<Option<V>> {
        match self.cache_store.get(self.key.storage_key()).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn write<V: Serialize>(&self, value: &V) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.cache_store
            .insert(self.key.storage_key().to_owned(), value, self.expires)
            .await?;
        trace!(storage_key = %self.key.storage_key(), expires = ?self.expires, "value cached");
        Ok(())
    }

    async fn acquire<V: DeserializeOwned>(&self, lock: &HeartbeatingLock) -> Result<Acquired<V>> {
        let started = Instant::now();
        // No deadline when waiting would outlast the clock.
        let deadline = started.checked_add(self.max_lock_wait);
        let mut warned = false;

        loop {
            if let Some(held) = lock.try_acquire().await? {
                return Ok(Acquired::Held(held));
            }

            let now = Instant::now();
            let waited = now - started;
            if deadline.is_some_and(|deadline| now >= deadline) {
                warn!(lock_key = %lock.lock_key(), ?waited, "gave up waiting for lock");
                return Err(Error::TimeoutWaitingForLock {
                    lock_key: lock.lock_key().to_owned(),
                    waited,
                });
            }
            if !warned && waited >= CONTENTION_WARNING_AFTER {
                warn!(lock_key = %lock.lock_key(), ?waited, "still waiting for lock held by someone else");
                warned = true;
            }

            let pause = deadline.map_or(POLL_INTERVAL, |deadline| {
                POLL_INTERVAL.min(deadline.saturating_duration_since(now))
            });
            tokio::time::sleep(pause).await;

            if let Some(value) = self.cached().await? {
                debug!(storage_key = %self.key.storage_key(), ?waited, "value was cached by the lock holder");
                return Ok(Acquired::Cached(value));
            }
        }
    }

    async fn release(&self, held: HeldLock) {
        match held.release().await {
            Ok(true) => {}
            Ok(false) => {
                warn!(lock_key = %self.key.lock_key(), "lock was already gone when releasing it");
            }
            Err(error) => {
                warn!(lock_key = %self.key.lock_key(), %error, "failed to release lock; it will expire");
            }
        }
    }

    fn lock_lost(&self) -> Error {
        warn!(lock_key = %self.key.lock_key(), "lock lost while computing; discarding the result");
        Error::LockLost {
            lock_key: self.key.lock_key().to_owned(),
        }
    }
}
