//! A lock that stays alive for as long as its holder does.
//!
//! The lock record is written with a short time-to-live and refreshed by a
//! background task at half that interval. If the holder dies, the record
//! expires quickly; if the holder lives, the record survives computations of
//! any length. When a refresh finds the record gone or owned by someone else,
//! the holder is told through [`HeldLock::lost`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::store::LockStore;

/// Holder identity for one lock on one key.
///
/// The same `HeartbeatingLock` may be asked to acquire repeatedly while the
/// lock is contended; every attempt uses the same holder token.
pub(crate) struct HeartbeatingLock {
    store: Arc<dyn LockStore>,
    lock_key: String,
    token: String,
    ttl: Duration,
}

impl HeartbeatingLock {
    pub(crate) fn new(store: Arc<dyn LockStore>, lock_key: &str, ttl: Duration) -> Self {
        Self {
            store,
            lock_key: lock_key.to_owned(),
            token: holder_token(),
            ttl,
        }
    }

    pub(crate) fn lock_key(&self) -> &str {
        &self.lock_key
    }

    /// Attempts to take the lock once. Returns `None` if it is held by
    /// someone else.
    pub(crate) async fn try_acquire(&self) -> Result<Option<HeldLock>> {
        if !self
            .store
            .try_acquire(&self.lock_key, &self.token, self.ttl)
            .await?
        {
            return Ok(None);
        }
        trace!(lock_key = %self.lock_key, token = %self.token, ttl = ?self.ttl, "lock acquired");

        let (lost_tx, lost_rx) = watch::channel(false);
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(heartbeat(
            Arc::clone(&self.store),
            self.lock_key.clone(),
            self.token.clone(),
            self.ttl,
            lost_tx,
            stop_rx,
        ));

        Ok(Some(HeldLock {
            store: Arc::clone(&self.store),
            lock_key: self.lock_key.clone(),
            token: self.token.clone(),
            ttl: self.ttl,
            lost: lost_rx,
            stop: Some(stop_tx),
            finished: false,
        }))
    }
}

fn holder_token() -> String {
    format!("{}:{}", std::process::id(), Uuid::new_v4())
}

/// A lock currently held by this process.
///
/// Dropping a `HeldLock` without calling [`HeldLock::release`] or
/// [`HeldLock::abandon`] stops the heartbeat and releases the record on a
/// background task, so that a cancelled caller does not keep others waiting
/// for longer than one time-to-live.
pub(crate) struct HeldLock {
    store: Arc<dyn LockStore>,
    lock_key: String,
    token: String,
    ttl: Duration,
    lost: watch::Receiver<bool>,
    stop: Option<oneshot::Sender<()>>,
    finished: bool,
}

impl HeldLock {
    /// Completes once the heartbeat has found the lock lost. Never completes
    /// otherwise.
    pub(crate) async fn lost(&mut self) {
        let closed = self.lost.wait_for(|lost| *lost).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }

    pub(crate) fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }

    /// Asks the store whether the record still carries this holder's token,
    /// extending it by one time-to-live if so.
    ///
    /// The heartbeat cannot notice an expired record while the runtime is
    /// blocked, so [`HeldLock::is_lost`] alone is not enough before acting on
    /// the lock.
    pub(crate) async fn confirm(&self) -> Result<bool> {
        let held = self
            .store
            .refresh(&self.lock_key, &self.token, self.ttl)
            .await?;
        if !held {
            warn!(lock_key = %self.lock_key, "lock record expired or was taken over");
        }
        Ok(held)
    }

    /// Stops the heartbeat and deletes the lock record if it still carries
    /// this holder's token. Returns `false` if the record was already gone or
    /// owned by someone else.
    pub(crate) async fn release(mut self) -> Result<bool> {
        self.stop_heartbeat();
        let released = self.store.release(&self.lock_key, &self.token).await;
        // Cancelled before this point, `Drop` still releases the record.
        self.finished = true;
        let released = released?;
        if released {
            trace!(lock_key = %self.lock_key, "lock released");
        }
        Ok(released)
    }

    /// Stops the heartbeat without touching the lock record.
    pub(crate) fn abandon(mut self) {
        self.stop_heartbeat();
        self.finished = true;
    }

    fn stop_heartbeat(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.stop_heartbeat();

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(lock_key = %self.lock_key, "no runtime to release lock; leaving it to expire");
            return;
        };
        let store = Arc::clone(&self.store);
        let lock_key = std::mem::take(&mut self.lock_key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            match store.release(&lock_key, &token).await {
                Ok(_) => debug!(%lock_key, "released lock of a cancelled computation"),
                Err(error) => warn!(%lock_key, %error, "failed to release lock of a cancelled computation"),
            }
        });
    }
}

async fn heartbeat(
    store: Arc<dyn LockStore>,
    lock_key: String,
    token: String,
    ttl: Duration,
    lost: watch::Sender<bool>,
    mut stop: oneshot::Receiver<()>,
) {
    let period = ttl / 2;
    let mut last_refresh = Instant::now();

    loop {
        tokio::select! {
            biased;
            _ = &mut stop => return,
            () = tokio::time::sleep(period) => {}
        }

        match store.refresh(&lock_key, &token, ttl).await {
            Ok(true) => {
                trace!(%lock_key, "lock refreshed");
                last_refresh = Instant::now();
            }
            Ok(false) => {
                if !matches!(stop.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
                    return;
                }
                warn!(%lock_key, "lock record is gone or owned by someone else");
                lost.send_replace(true);
                return;
            }
            Err(error) => {
                if last_refresh.elapsed() >= ttl {
                    warn!(%lock_key, %error, "could not refresh lock before it expired");
                    lost.send_replace(true);
                    return;
                }
                warn!(%lock_key, %error, "failed to refresh lock; retrying");
            }
        }
    }
}
