//! Error types returned by lock and cache operations.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::store::StoreError;

const ERROR_PREFIX: &str = "lockcache error:";

/// An error that can occur while locking and caching.
///
/// Errors returned by the computation itself are never converted into this
/// type; see [`LockAndCache::perform_or_compute`](crate::LockAndCache::perform_or_compute).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A key was built without any parts.
    #[error("{ERROR_PREFIX} need at least one key part")]
    InvalidKey,
    /// The lock stayed held by someone else for longer than `max_lock_wait`
    /// and no cached value appeared in the meantime.
    #[error("{ERROR_PREFIX} timed out after {waited:?} waiting for lock `{lock_key}`")]
    TimeoutWaitingForLock {
        /// The lock that could not be acquired.
        lock_key: String,
        /// How long the caller waited.
        waited: Duration,
    },
    /// The heartbeat could not refresh the lock, so another holder may be
    /// computing the same value. The computed result was discarded.
    #[error("{ERROR_PREFIX} lock `{lock_key}` was lost while computing")]
    LockLost {
        /// The lock that was lost.
        lock_key: String,
    },
    /// The requested lock time-to-live is below the accepted minimum.
    #[error("{ERROR_PREFIX} heartbeat_expires must be at least {minimum:?}, got {given:?}")]
    InvalidHeartbeatExpires {
        /// The rejected value.
        given: Duration,
        /// The lowest accepted value.
        minimum: Duration,
    },
    /// A key part or a computed value could not be converted to or from JSON.
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    /// A lock store or cache store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Returns `true` if this is [`Error::TimeoutWaitingForLock`].
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::TimeoutWaitingForLock { .. })
    }

    /// Returns `true` if this is [`Error::LockLost`].
    #[must_use]
    pub fn is_lock_lost(&self) -> bool {
        matches!(self, Error::LockLost { .. })
    }
}

/// A type alias for results that can contain an [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
