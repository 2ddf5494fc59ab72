//! Lock while you cache.
//!
//! Most caching layers do not lock, so several processes can compute the same
//! expensive value at the same time after a cache miss. `lockcache` puts a
//! distributed lock around the computation: the first caller computes and
//! stores the value while everyone else waits for it to show up in the cache.
//!
//! The lock is kept alive by a heartbeat for as long as the computation runs,
//! so a crashed holder blocks others only for a short time-to-live
//! ([`LockAndCacheConfig::heartbeat_expires`]), no matter how long
//! computations normally take.
//!
//! # Standalone mode
//!
//! The key is built purely from the parts you pass:
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use lockcache::store::memory::Memory;
//! use lockcache::{LockAndCache, Options};
//!
//! # #[tokio::main]
//! # async fn main() -> lockcache::Result<()> {
//! let lock_and_cache = LockAndCache::new(Arc::new(Memory::new()), Arc::new(Memory::new()));
//!
//! let stock_price: f64 = lock_and_cache
//!     .lock_and_cache(
//!         ("stock_price", "AAPL"),
//!         Options::new().expires(Duration::from_secs(60)),
//!         || async { Ok::<_, lockcache::Error>(189.5) },
//!     )
//!     .await?;
//! assert_eq!(stock_price, 189.5);
//! assert!(lock_and_cache.is_cached(("stock_price", "AAPL")).await?);
//! # Ok(())
//! # }
//! ```
//!
//! # Subject mode
//!
//! The key is additionally namespaced by a [`Context`] (owning type and
//! method) and the identifier of the object the value belongs to:
//!
//! ```
//! use std::sync::Arc;
//!
//! use lockcache::key::Context;
//! use lockcache::store::memory::Memory;
//! use lockcache::{LockAndCache, Options};
//!
//! struct Blog {
//!     id: u64,
//! }
//!
//! impl Blog {
//!     async fn word_count(&self, lock_and_cache: &LockAndCache) -> lockcache::Result<usize> {
//!         lock_and_cache
//!             .subject(Context::of::<Blog>("word_count"), self.id)?
//!             .lock_and_cache((), Options::new(), || async { Ok(1_234) })
//!             .await
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> lockcache::Result<()> {
//! # let store = Arc::new(Memory::new());
//! # let lock_and_cache = LockAndCache::new(store.clone(), store);
//! let blog = Blog { id: 7 };
//! assert_eq!(blog.word_count(&lock_and_cache).await?, 1_234);
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

mod action;
pub mod config;
pub mod error;
pub mod key;
mod lock;
pub mod store;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

pub use crate::action::Options;
use crate::action::{LockAndCacheAction, check_heartbeat_expires};
use crate::config::{DEFAULT_HEARTBEAT_EXPIRES, DEFAULT_MAX_LOCK_WAIT, LockAndCacheConfig};
pub use crate::error::{Error, Result};
pub use crate::key::{Context, Key};
use crate::store::{CacheStore, LockStore};

/// A handle to a lock store and a cache store, plus the defaults used by
/// every call made through it.
///
/// Cloning is cheap; clones share the underlying stores.
#[derive(Clone)]
pub struct LockAndCache {
    pub(crate) lock_store: Arc<dyn LockStore>,
    pub(crate) cache_store: Arc<dyn CacheStore>,
    pub(crate) max_lock_wait: Duration,
    pub(crate) heartbeat_expires: Duration,
}

impl std::fmt::Debug for LockAndCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockAndCache")
            .field("max_lock_wait", &self.max_lock_wait)
            .field("heartbeat_expires", &self.heartbeat_expires)
            .finish_non_exhaustive()
    }
}

impl LockAndCache {
    /// Creates a handle with the default `max_lock_wait` and
    /// `heartbeat_expires`.
    ///
    /// The two stores may be the same store; lock keys and storage keys never
    /// collide.
    #[must_use]
    pub fn new(lock_store: Arc<dyn LockStore>, cache_store: Arc<dyn CacheStore>) -> Self {
        Self {
            lock_store,
            cache_store,
            max_lock_wait: DEFAULT_MAX_LOCK_WAIT,
            heartbeat_expires: DEFAULT_HEARTBEAT_EXPIRES,
        }
    }

    /// Creates the stores described by the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a store could not be created, or if
    /// `heartbeat_expires` is below
    /// [`MIN_HEARTBEAT_EXPIRES`](config::MIN_HEARTBEAT_EXPIRES).
    ///
    /// # Examples
    ///
    /// ```
    /// use lockcache::LockAndCache;
    /// use lockcache::config::LockAndCacheConfig;
    ///
    /// let config = LockAndCacheConfig::from_toml(
    ///     r#"
    ///     max_lock_wait = "10min"
    ///     heartbeat_expires = "10s"
    ///     "#,
    /// )?;
    /// let lock_and_cache = LockAndCache::from_config(&config)?;
    /// # Ok::<(), lockcache::Error>(())
    /// ```
    pub fn from_config(config: &LockAndCacheConfig) -> Result<Self> {
        check_heartbeat_expires(config.heartbeat_expires)?;
        debug!(
            lock_store = ?config.lock_store,
            cache_store = ?config.cache_store,
            "creating lock and cache stores"
        );

        Ok(Self {
            lock_store: config.lock_store.to_lock_store()?,
            cache_store: config.cache_store.to_cache_store()?,
            max_lock_wait: config.max_lock_wait,
            heartbeat_expires: config.heartbeat_expires,
        })
    }

    /// Sets the default time to wait for a lock held by someone else.
    #[must_use]
    pub fn with_max_lock_wait(mut self, max_lock_wait: Duration) -> Self {
        self.max_lock_wait = max_lock_wait;
        self
    }

    /// Sets the default lock time-to-live.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHeartbeatExpires`] if the value is below
    /// [`MIN_HEARTBEAT_EXPIRES`](config::MIN_HEARTBEAT_EXPIRES).
    pub fn with_heartbeat_expires(mut self, heartbeat_expires: Duration) -> Result<Self> {
        check_heartbeat_expires(heartbeat_expires)?;
        self.heartbeat_expires = heartbeat_expires;
        Ok(self)
    }

    /// The default time to wait for a contended lock.
    #[must_use]
    pub fn max_lock_wait(&self) -> Duration {
        self.max_lock_wait
    }

    /// The default lock time-to-live.
    #[must_use]
    pub fn heartbeat_expires(&self) -> Duration {
        self.heartbeat_expires
    }

    /// Returns the value cached under `key`, computing and caching it first
    /// if necessary.
    ///
    /// On a cache hit the lock store is never touched. On a miss the lock for
    /// `key` is acquired (waiting up to `max_lock_wait` while someone else
    /// holds it), the cache is checked again, and only then `computation`
    /// runs. While it runs, the lock is refreshed every
    /// `heartbeat_expires / 2`.
    ///
    /// The computation runs on the calling task. A computation that blocks
    /// the thread should run on a multi-threaded runtime or move its work to
    /// [`tokio::task::spawn_blocking`], or the heartbeat may not get to run.
    ///
    /// # Errors
    ///
    /// An error returned by `computation` is returned unchanged, after the
    /// lock has been released; nothing is cached in that case. Other errors
    /// are [`Error`]s converted into `E`:
    ///
    /// * [`Error::TimeoutWaitingForLock`] if the lock stayed held and no value
    ///   appeared in the cache within `max_lock_wait`,
    /// * [`Error::LockLost`] if the lock expired or was taken over while
    ///   computing; the computed value is discarded,
    /// * [`Error::InvalidHeartbeatExpires`] if the options carry a too short
    ///   `heartbeat_expires`,
    /// * [`Error::Store`] or [`Error::SerdeJson`] if a store operation failed
    ///   or the value could not be converted to or from JSON.
    pub async fn perform_or_compute<V, E, F, Fut>(
        &self,
        key: &Key,
        options: Options,
        computation: F,
    ) -> std::result::Result<V, E>
    where
        V: Serialize + DeserializeOwned,
        E: From<Error>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
    {
        LockAndCacheAction::new(self, key, options)?
            .perform(computation)
            .await
    }

    /// Like [`LockAndCache::perform_or_compute`], with the key built from
    /// `parts` (see [`Key::new`]).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] if `parts` is empty, otherwise the same
    /// errors as [`LockAndCache::perform_or_compute`].
    pub async fn lock_and_cache<P, V, E, F, Fut>(
        &self,
        parts: P,
        options: Options,
        computation: F,
    ) -> std::result::Result<V, E>
    where
        P: Serialize,
        V: Serialize + DeserializeOwned,
        E: From<Error>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
    {
        let key = Key::new(parts)?;
        self.perform_or_compute(&key, options, computation).await
    }

    /// Removes the value cached under `key`. Any lock on the key stays in
    /// place.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache store operation failed.
    pub async fn clear_key(&self, key: &Key) -> Result<()> {
        self.cache_store.remove(key.storage_key()).await?;
        debug!(storage_key = %key.storage_key(), "cleared cached value");
        Ok(())
    }

    /// Returns `true` if someone holds the lock for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock store operation failed.
    pub async fn is_key_locked(&self, key: &Key) -> Result<bool> {
        Ok(self.lock_store.contains_key(key.lock_key()).await?)
    }

    /// Returns `true` if a value is cached under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache store operation failed.
    pub async fn is_key_cached(&self, key: &Key) -> Result<bool> {
        Ok(self.cache_store.contains_key(key.storage_key()).await?)
    }

    /// [`LockAndCache::clear_key`] with the key built from `parts`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] if `parts` is empty, or an error if the
    /// cache store operation failed.
    pub async fn clear<P: Serialize>(&self, parts: P) -> Result<()> {
        self.clear_key(&Key::new(parts)?).await
    }

    /// [`LockAndCache::is_key_locked`] with the key built from `parts`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] if `parts` is empty, or an error if the
    /// lock store operation failed.
    pub async fn is_locked<P: Serialize>(&self, parts: P) -> Result<bool> {
        self.is_key_locked(&Key::new(parts)?).await
    }

    /// [`LockAndCache::is_key_cached`] with the key built from `parts`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] if `parts` is empty, or an error if the
    /// cache store operation failed.
    pub async fn is_cached<P: Serialize>(&self, parts: P) -> Result<bool> {
        self.is_key_cached(&Key::new(parts)?).await
    }

    /// Removes every entry from the cache store.
    ///
    /// If the cache store is shared with other data (for example a Redis
    /// database), that data is removed too.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache store operation failed.
    pub async fn flush_cache(&self) -> Result<()> {
        self.cache_store.clear().await?;
        debug!("flushed cache store");
        Ok(())
    }

    /// Removes every lock record from the lock store.
    ///
    /// Computations currently holding a lock will find it lost at their next
    /// heartbeat. If the lock store is shared with other data, that data is
    /// removed too.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock store operation failed.
    pub async fn flush_locks(&self) -> Result<()> {
        self.lock_store.clear().await?;
        debug!("flushed lock store");
        Ok(())
    }

    /// Returns a handle that namespaces keys by `context` and the identifier
    /// of the object the values belong to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SerdeJson`] if `id` cannot be serialized.
    pub fn subject<I: Serialize>(&self, context: Context, id: I) -> Result<Subject<'_>> {
        Ok(Subject {
            lock_and_cache: self,
            context,
            id: serde_json::to_value(id)?,
        })
    }
}

/// Lock and cache calls made on behalf of one object.
///
/// Keys are built from the [`Context`], then the object's identifier, then
/// the parts of each call; calls without any parts are valid.
#[derive(Debug, Clone)]
pub struct Subject<'a> {
    lock_and_cache: &'a LockAndCache,
    context: Context,
    id: Value,
}

impl Subject<'_> {
    /// Builds the key for a call with the given parts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SerdeJson`] if `parts` cannot be serialized.
    pub fn key<P: Serialize>(&self, parts: P) -> Result<Key> {
        Key::builder()
            .context(self.context.clone())
            .part(&self.id)
            .parts(parts)
            .build()
    }

    /// The context keys are namespaced by.
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// See [`LockAndCache::perform_or_compute`].
    ///
    /// # Errors
    ///
    /// The same errors as [`LockAndCache::perform_or_compute`].
    pub async fn lock_and_cache<P, V, E, F, Fut>(
        &self,
        parts: P,
        options: Options,
        computation: F,
    ) -> std::result::Result<V, E>
    where
        P: Serialize,
        V: Serialize + DeserializeOwned,
        E: From<Error>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
    {
        let key = self.key(parts)?;
        self.lock_and_cache
            .perform_or_compute(&key, options, computation)
            .await
    }

    /// See [`LockAndCache::clear_key`].
    ///
    /// # Errors
    ///
    /// Returns an error if the cache store operation failed.
    pub async fn clear<P: Serialize>(&self, parts: P) -> Result<()> {
        self.lock_and_cache.clear_key(&self.key(parts)?).await
    }

    /// See [`LockAndCache::is_key_locked`].
    ///
    /// # Errors
    ///
    /// Returns an error if the lock store operation failed.
    pub async fn is_locked<P: Serialize>(&self, parts: P) -> Result<bool> {
        self.lock_and_cache.is_key_locked(&self.key(parts)?).await
    }

    /// See [`LockAndCache::is_key_cached`].
    ///
    /// # Errors
    ///
    /// Returns an error if the cache store operation failed.
    pub async fn is_cached<P: Serialize>(&self, parts: P) -> Result<bool> {
        self.lock_and_cache.is_key_cached(&self.key(parts)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MIN_HEARTBEAT_EXPIRES, StoreConfig};
    use crate::store::memory::Memory;

    fn memory() -> LockAndCache {
        let store = Arc::new(Memory::new());
        LockAndCache::new(store.clone(), store)
    }

    #[test]
    fn from_config_uses_configured_defaults() {
        let config = LockAndCacheConfig::builder()
            .lock_store(StoreConfig::Memory)
            .max_lock_wait(Duration::from_secs(30))
            .heartbeat_expires(Duration::from_secs(4))
            .build();

        let lock_and_cache = LockAndCache::from_config(&config).unwrap();

        assert_eq!(lock_and_cache.max_lock_wait(), Duration::from_secs(30));
        assert_eq!(lock_and_cache.heartbeat_expires(), Duration::from_secs(4));
    }

    #[test]
    fn short_heartbeat_is_rejected() {
        let config = LockAndCacheConfig::builder()
            .heartbeat_expires(Duration::from_secs(1))
            .build();

        assert!(matches!(
            LockAndCache::from_config(&config),
            Err(Error::InvalidHeartbeatExpires { .. })
        ));
        assert!(matches!(
            memory().with_heartbeat_expires(Duration::from_millis(1999)),
            Err(Error::InvalidHeartbeatExpires { minimum, .. }) if minimum == MIN_HEARTBEAT_EXPIRES
        ));
        assert!(memory().with_heartbeat_expires(MIN_HEARTBEAT_EXPIRES).is_ok());
    }

    #[cfg(not(feature = "redis"))]
    #[test]
    fn redis_config_without_feature() {
        let config = LockAndCacheConfig::builder()
            .cache_store(StoreConfig::redis("redis://localhost".parse().unwrap()))
            .build();

        assert!(matches!(
            LockAndCache::from_config(&config),
            Err(Error::Store(store::StoreError::BackendNotEnabled("redis")))
        ));
    }

    #[tokio::test]
    async fn empty_parts_are_rejected() {
        let lock_and_cache = memory();

        let result: Result<u32> = lock_and_cache
            .lock_and_cache((), Options::new(), || async { Ok(1) })
            .await;
        assert!(matches!(result, Err(Error::InvalidKey)));
        assert!(matches!(lock_and_cache.clear(()).await, Err(Error::InvalidKey)));
        assert!(matches!(lock_and_cache.is_locked(()).await, Err(Error::InvalidKey)));
        assert!(matches!(lock_and_cache.is_cached(()).await, Err(Error::InvalidKey)));
    }

    #[tokio::test]
    async fn clear_removes_value_but_not_lock() {
        let store = Memory::new();
        let lock_and_cache = LockAndCache::new(Arc::new(store.clone()), Arc::new(store.clone()));
        let key = Key::new(("report", 2024)).unwrap();

        let _: u32 = lock_and_cache
            .perform_or_compute(&key, Options::new(), || async { Ok::<_, Error>(1) })
            .await
            .unwrap();
        store
            .try_acquire(key.lock_key(), "in-flight", Duration::from_secs(60))
            .await
            .unwrap();

        lock_and_cache.clear_key(&key).await.unwrap();

        assert!(!lock_and_cache.is_key_cached(&key).await.unwrap());
        assert!(lock_and_cache.is_key_locked(&key).await.unwrap());
    }

    #[tokio::test]
    async fn subject_calls_without_parts_are_valid() {
        let lock_and_cache = memory();
        let subject = lock_and_cache
            .subject(Context::new("Blog", "word_count"), 7)
            .unwrap();

        let value: u32 = subject
            .lock_and_cache((), Options::new(), || async { Ok::<_, Error>(3) })
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert!(subject.is_cached(()).await.unwrap());
        assert!(!subject.is_locked(()).await.unwrap());
        subject.clear(()).await.unwrap();
        assert!(!subject.is_cached(()).await.unwrap());
    }

    #[tokio::test]
    async fn subjects_are_namespaced_by_id_and_context() {
        let lock_and_cache = memory();
        let blog_7 = lock_and_cache
            .subject(Context::new("Blog", "word_count"), 7)
            .unwrap();
        let blog_8 = lock_and_cache
            .subject(Context::new("Blog", "word_count"), 8)
            .unwrap();
        let title_7 = lock_and_cache
            .subject(Context::new("Blog", "title"), 7)
            .unwrap();

        let _: u32 = blog_7
            .lock_and_cache(("en",), Options::new(), || async { Ok::<_, Error>(1) })
            .await
            .unwrap();

        assert!(blog_7.is_cached(("en",)).await.unwrap());
        assert!(!blog_8.is_cached(("en",)).await.unwrap());
        assert!(!title_7.is_cached(("en",)).await.unwrap());
        assert!(!lock_and_cache.is_cached(("en",)).await.unwrap());
        assert!(!lock_and_cache.is_cached((7, "en")).await.unwrap());
    }

    #[tokio::test]
    async fn flush_removes_everything() {
        let store = Memory::new();
        let lock_and_cache = LockAndCache::new(Arc::new(store.clone()), Arc::new(store.clone()));
        let _: u32 = lock_and_cache
            .lock_and_cache("a", Options::new(), || async { Ok::<_, Error>(1) })
            .await
            .unwrap();
        store
            .try_acquire("lockcache:lock:x", "holder", Duration::from_secs(60))
            .await
            .unwrap();

        lock_and_cache.flush_cache().await.unwrap();
        lock_and_cache.flush_locks().await.unwrap();

        assert!(store.is_empty().await);
    }
}
