//! Configuration for lock and cache.
//!
//! A [`LockAndCacheConfig`] describes where locks and cached values live and
//! the process-wide defaults used by every call. It is built once at startup,
//! either in code through [`LockAndCacheConfig::builder`] or by parsing a TOML
//! document with [`LockAndCacheConfig::from_toml`], and is never mutated
//! afterwards.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//!
//! use lockcache::config::{LockAndCacheConfig, StoreConfig};
//!
//! let config = LockAndCacheConfig::from_toml(
//!     r#"
//!     max_lock_wait = "10min"
//!     heartbeat_expires = "16s"
//!
//!     [lock_store]
//!     type = "redis"
//!     url = "redis://127.0.0.1:6379/0"
//!
//!     [cache_store]
//!     type = "memory"
//!     "#,
//! )
//! .unwrap();
//!
//! assert_eq!(config.max_lock_wait, Duration::from_secs(600));
//! assert_eq!(config.cache_store, StoreConfig::Memory);
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How long a caller waits for a contended lock before giving up (one day).
pub const DEFAULT_MAX_LOCK_WAIT: Duration = Duration::from_secs(60 * 60 * 24);

/// Lock time-to-live, refreshed by the holder's heartbeat.
pub const DEFAULT_HEARTBEAT_EXPIRES: Duration = Duration::from_secs(32);

/// Lowest accepted `heartbeat_expires`. Anything shorter makes the heartbeat
/// thrash the lock store.
pub const MIN_HEARTBEAT_EXPIRES: Duration = Duration::from_secs(2);

/// Default connection pool size for Redis-backed stores.
pub const DEFAULT_REDIS_POOL_SIZE: usize = 16;

const ERROR_PREFIX: &str = "lockcache config error:";

/// Errors that can occur while loading a configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The TOML document could not be parsed.
    #[error("{ERROR_PREFIX} could not parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A store URL is not a valid URL.
    #[error("{ERROR_PREFIX} invalid store URL `{url}`: {source}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// The underlying parse error.
        source: url::ParseError,
    },
    /// A store URL uses a scheme no store backend understands.
    #[error("{ERROR_PREFIX} unsupported store URL scheme `{0}`")]
    UnsupportedScheme(String),
}

/// Expiration policy for a cached value.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use lockcache::config::Timeout;
///
/// assert_eq!(Timeout::Never.ttl(), None);
/// assert_eq!(
///     Timeout::After(Duration::from_secs(60)).ttl(),
///     Some(Duration::from_secs(60))
/// );
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timeout {
    /// The value is stored until it is cleared or flushed.
    #[default]
    Never,
    /// The value expires after the given duration.
    After(#[serde(with = "humantime_serde")] Duration),
    /// The value expires at the given point in time.
    AtDateTime(DateTime<FixedOffset>),
}

impl Timeout {
    /// Returns the time-to-live measured from now, or `None` if the value
    /// never expires.
    ///
    /// A point in time that has already passed yields [`Duration::ZERO`].
    #[must_use]
    pub fn ttl(&self) -> Option<Duration> {
        match self {
            Timeout::Never => None,
            Timeout::After(duration) => Some(*duration),
            Timeout::AtDateTime(at) => Some(
                at.with_timezone(&Utc)
                    .signed_duration_since(Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO),
            ),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Timeout::After(duration)
    }
}

/// A validated URL of an external store.
///
/// # Examples
///
/// ```
/// use lockcache::config::StoreUrl;
///
/// let url: StoreUrl = "redis://localhost:6379/1".parse().unwrap();
/// assert!(url.is_redis());
/// assert!("ftp://localhost".parse::<StoreUrl>().is_err());
/// ```
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StoreUrl(url::Url);

impl StoreUrl {
    const SCHEMES: &[&str] = &["redis", "rediss"];

    /// Returns the URL as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Returns `true` if the URL points at a Redis server.
    #[must_use]
    pub fn is_redis(&self) -> bool {
        matches!(self.0.scheme(), "redis" | "rediss")
    }
}

impl FromStr for StoreUrl {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = url::Url::parse(s).map_err(|source| ConfigError::InvalidUrl {
            url: s.to_owned(),
            source,
        })?;
        if !Self::SCHEMES.contains(&url.scheme()) {
            return Err(ConfigError::UnsupportedScheme(url.scheme().to_owned()));
        }
        Ok(Self(url))
    }
}

impl TryFrom<String> for StoreUrl {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StoreUrl> for String {
    fn from(url: StoreUrl) -> Self {
        url.0.into()
    }
}

impl fmt::Display for StoreUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Credentials may be embedded in the URL.
impl fmt::Debug for StoreUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut redacted = self.0.clone();
        if redacted.password().is_some() {
            let _ = redacted.set_password(Some("********"));
        }
        f.debug_tuple("StoreUrl").field(&redacted.as_str()).finish()
    }
}

/// Which backend holds locks or cached values.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum StoreConfig {
    /// A process-local in-memory store.
    ///
    /// Locks held in memory only exclude callers within the same process.
    #[default]
    Memory,
    /// A Redis server. Requires the `redis` feature.
    Redis {
        /// The URL of the Redis server.
        url: StoreUrl,
        /// Maximum number of pooled connections.
        #[serde(default = "default_pool_size")]
        pool_size: usize,
    },
}

impl StoreConfig {
    /// Creates a Redis store configuration with the default pool size.
    #[must_use]
    pub fn redis(url: StoreUrl) -> Self {
        StoreConfig::Redis {
            url,
            pool_size: DEFAULT_REDIS_POOL_SIZE,
        }
    }
}

fn default_pool_size() -> usize {
    DEFAULT_REDIS_POOL_SIZE
}

/// Process-wide lock and cache configuration.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use lockcache::config::{LockAndCacheConfig, StoreConfig};
///
/// let config = LockAndCacheConfig::builder()
///     .lock_store(StoreConfig::Memory)
///     .heartbeat_expires(Duration::from_secs(10))
///     .build();
///
/// assert_eq!(config.heartbeat_expires, Duration::from_secs(10));
/// assert_eq!(config.max_lock_wait, lockcache::config::DEFAULT_MAX_LOCK_WAIT);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[builder(build_fn(skip))]
#[serde(default)]
#[non_exhaustive]
pub struct LockAndCacheConfig {
    /// Where locks are kept.
    pub lock_store: StoreConfig,
    /// Where computed values are kept.
    pub cache_store: StoreConfig,
    /// How long to wait for a lock held by someone else.
    #[serde(with = "humantime_serde")]
    pub max_lock_wait: Duration,
    /// Lock time-to-live. The holder refreshes the lock at half this
    /// interval; it must be at least [`MIN_HEARTBEAT_EXPIRES`].
    #[serde(with = "humantime_serde")]
    pub heartbeat_expires: Duration,
}

impl LockAndCacheConfig {
    /// Creates a new builder with every field unset.
    #[must_use]
    pub fn builder() -> LockAndCacheConfigBuilder {
        LockAndCacheConfigBuilder::default()
    }

    /// Parses a configuration from a TOML document. Missing fields take their
    /// default values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the document is not valid TOML or
    /// does not describe a configuration.
    pub fn from_toml(toml_content: &str) -> Result<Self, ConfigError> {
        let config = toml::from_str(toml_content)?;
        Ok(config)
    }
}

impl Default for LockAndCacheConfig {
    fn default() -> Self {
        Self {
            lock_store: StoreConfig::default(),
            cache_store: StoreConfig::default(),
            max_lock_wait: DEFAULT_MAX_LOCK_WAIT,
            heartbeat_expires: DEFAULT_HEARTBEAT_EXPIRES,
        }
    }
}

impl LockAndCacheConfigBuilder {
    /// Builds the configuration, filling in defaults for unset fields.
    #[must_use]
    pub fn build(&self) -> LockAndCacheConfig {
        let defaults = LockAndCacheConfig::default();
        LockAndCacheConfig {
            lock_store: self.lock_store.clone().unwrap_or(defaults.lock_store),
            cache_store: self.cache_store.clone().unwrap_or(defaults.cache_store),
            max_lock_wait: self.max_lock_wait.unwrap_or(defaults.max_lock_wait),
            heartbeat_expires: self
                .heartbeat_expires
                .unwrap_or(defaults.heartbeat_expires),
        }
    }
}
