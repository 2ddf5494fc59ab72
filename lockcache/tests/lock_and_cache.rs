use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use lockcache::key::Context;
use lockcache::store::LockStore;
use lockcache::store::memory::Memory;
use lockcache::test::TestStores;
use lockcache::{Error, Key, LockAndCache, Options};
use tokio::time::Instant;

#[derive(Debug, PartialEq, Eq)]
enum ReportError {
    Upstream(&'static str),
    LockAndCache(String),
}

impl From<Error> for ReportError {
    fn from(err: Error) -> Self {
        ReportError::LockAndCache(err.to_string())
    }
}

fn shared_memory() -> (Memory, LockAndCache) {
    let store = Memory::new();
    let lock_and_cache = LockAndCache::new(Arc::new(store.clone()), Arc::new(store.clone()));
    (store, lock_and_cache)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_compute_once() {
    let stores = TestStores::new_memory();
    let counter = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..10)
        .map(|_| {
            let lock_and_cache = stores.lock_and_cache();
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                lock_and_cache
                    .lock_and_cache(
                        ("user", 42),
                        Options::new().expires(Duration::from_secs(60)),
                        || async move {
                            let run = counter.fetch_add(1, Ordering::SeqCst) + 1;
                            tokio::time::sleep(Duration::from_millis(500)).await;
                            Ok::<_, Error>(format!("computed by run {run}"))
                        },
                    )
                    .await
            })
        })
        .collect();

    let mut values = Vec::new();
    for worker in workers {
        values.push(worker.await.unwrap().unwrap());
    }

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(values.iter().all(|value| value == "computed by run 1"));
    stores.cleanup().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn heartbeat_outlives_lock_ttl() {
    let stores = TestStores::new_memory();
    let lock_and_cache = stores.lock_and_cache();

    let worker = tokio::spawn({
        let lock_and_cache = lock_and_cache.clone();
        async move {
            lock_and_cache
                .lock_and_cache(
                    "slow",
                    Options::new().heartbeat_expires(Duration::from_secs(2)),
                    || async {
                        tokio::time::sleep(Duration::from_secs(3)).await;
                        Ok::<_, Error>(99_u32)
                    },
                )
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(lock_and_cache.is_locked("slow").await.unwrap());
    assert!(!lock_and_cache.is_cached("slow").await.unwrap());

    assert_eq!(worker.await.unwrap().unwrap(), 99);
    assert!(lock_and_cache.is_cached("slow").await.unwrap());
    assert!(!lock_and_cache.is_locked("slow").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn contended_lock_times_out() {
    let (store, lock_and_cache) = shared_memory();
    let key = Key::new(("held", "forever")).unwrap();
    assert!(
        store
            .try_acquire(key.lock_key(), "someone-else", Duration::from_secs(3600))
            .await
            .unwrap()
    );

    let started = Instant::now();
    let result: lockcache::Result<u32> = lock_and_cache
        .with_max_lock_wait(Duration::from_secs(1))
        .perform_or_compute(&key, Options::new(), || async { Ok(1) })
        .await;
    let elapsed = started.elapsed();

    assert!(result.unwrap_err().is_timeout());
    assert!(elapsed >= Duration::from_secs(1), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
}

#[tokio::test]
async fn clear_forces_recompute() {
    let stores = TestStores::new_memory();
    let lock_and_cache = stores.lock_and_cache();
    let runs = AtomicUsize::new(0);
    let runs = &runs;
    let compute = move || async move { Ok::<_, Error>(runs.fetch_add(1, Ordering::SeqCst)) };

    let first: usize = lock_and_cache
        .lock_and_cache(("report", 1), Options::new(), compute)
        .await
        .unwrap();
    let cached: usize = lock_and_cache
        .lock_and_cache(("report", 1), Options::new(), compute)
        .await
        .unwrap();
    assert_eq!(first, cached);

    lock_and_cache.clear(("report", 1)).await.unwrap();
    assert!(!lock_and_cache.is_cached(("report", 1)).await.unwrap());

    let recomputed: usize = lock_and_cache
        .lock_and_cache(("report", 1), Options::new(), compute)
        .await
        .unwrap();
    assert_eq!(recomputed, 1);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn clear_keeps_in_flight_lock() {
    let (store, lock_and_cache) = shared_memory();
    let key = Key::new("in-flight").unwrap();
    store
        .try_acquire(key.lock_key(), "computing", Duration::from_secs(60))
        .await
        .unwrap();

    lock_and_cache.clear_key(&key).await.unwrap();

    assert!(lock_and_cache.is_key_locked(&key).await.unwrap());
    assert!(store.release(key.lock_key(), "computing").await.unwrap());
}

#[tokio::test]
async fn failed_computation_is_not_cached() {
    let stores = TestStores::new_memory();
    let lock_and_cache = stores.lock_and_cache();

    let failed: Result<u32, ReportError> = lock_and_cache
        .lock_and_cache("flaky", Options::new(), || async {
            Err(ReportError::Upstream("503 from upstream"))
        })
        .await;
    assert_eq!(failed, Err(ReportError::Upstream("503 from upstream")));
    assert!(!lock_and_cache.is_cached("flaky").await.unwrap());
    assert!(!lock_and_cache.is_locked("flaky").await.unwrap());

    let retried: Result<u32, ReportError> = tokio::time::timeout(
        Duration::from_secs(1),
        lock_and_cache.lock_and_cache("flaky", Options::new(), || async { Ok(7) }),
    )
    .await
    .unwrap();
    assert_eq!(retried, Ok(7));
}

#[tokio::test(start_paused = true)]
async fn lost_lock_discards_result() {
    let stores = TestStores::new_memory();
    let lock_and_cache = stores.lock_and_cache();

    let worker = tokio::spawn({
        let lock_and_cache = lock_and_cache.clone();
        async move {
            lock_and_cache
                .lock_and_cache(
                    ("export", 3),
                    Options::new().heartbeat_expires(Duration::from_secs(2)),
                    || async {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok::<_, Error>("stale".to_owned())
                    },
                )
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(lock_and_cache.is_locked(("export", 3)).await.unwrap());
    lock_and_cache.flush_locks().await.unwrap();

    let result = worker.await.unwrap();
    assert!(matches!(result, Err(Error::LockLost { .. })));
    assert!(!lock_and_cache.is_cached(("export", 3)).await.unwrap());
}

#[tokio::test]
async fn subjects_do_not_share_values() {
    struct Blog;

    let stores = TestStores::new_memory();
    let lock_and_cache = stores.lock_and_cache();

    let word_count = |id: u64| {
        lock_and_cache
            .subject(Context::of::<Blog>("word_count"), id)
            .unwrap()
    };

    let first: u64 = word_count(1)
        .lock_and_cache((), Options::new(), || async { Ok::<_, Error>(100) })
        .await
        .unwrap();
    let second: u64 = word_count(2)
        .lock_and_cache((), Options::new(), || async { Ok::<_, Error>(200) })
        .await
        .unwrap();
    let first_again: u64 = word_count(1)
        .lock_and_cache((), Options::new(), || async { Ok::<_, Error>(300) })
        .await
        .unwrap();

    assert_eq!((first, second, first_again), (100, 200, 100));

    let title = lock_and_cache
        .subject(Context::of::<Blog>("title"), 1_u64)
        .unwrap();
    assert!(!title.is_cached(()).await.unwrap());
}

#[tokio::test]
async fn too_short_heartbeat_is_rejected() {
    let (store, lock_and_cache) = shared_memory();

    let result: lockcache::Result<u32> = lock_and_cache
        .lock_and_cache(
            "fast",
            Options::new().heartbeat_expires(Duration::from_millis(500)),
            || async { Ok(1) },
        )
        .await;

    assert!(matches!(result, Err(Error::InvalidHeartbeatExpires { .. })));
    assert!(store.is_empty().await);
}

#[cfg(feature = "redis")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires Docker"]
async fn redis_concurrent_callers_compute_once() {
    let stores = TestStores::new_redis().await.unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..10)
        .map(|_| {
            let lock_and_cache = stores.lock_and_cache();
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                lock_and_cache
                    .lock_and_cache(
                        ("user", 42),
                        Options::new().expires(Duration::from_secs(60)),
                        || async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(500)).await;
                            Ok::<_, Error>(vec![1, 2, 3])
                        },
                    )
                    .await
            })
        })
        .collect();

    for worker in workers {
        assert_eq!(worker.await.unwrap().unwrap(), vec![1, 2, 3]);
    }
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    stores.cleanup().await.unwrap();
}
