//! Provides the cache coordinator - the read-path state machine on top of a storage engine.
//!
//! # The read path
//! [Cache::get](Cache::get) receives a key, a freshness deadline for the *next* value and a
//! regeneration function, and immediately launches a background task which walks the following
//! decision tree:
//!
//! 1. The key is present in the engine:
//!    * ...and still fresh: the stored payload is returned. Done.
//!    * ...stale, but locked by another actor: the stale payload is returned as-is - whoever
//!      holds the lock is already regenerating.
//!    * ...stale and unlocked: the stale payload is returned **and** a refresh job is queued on
//!      the worker pool. Queueing may wait for a free slot (backpressure), but it waits on the
//!      background task, never in the caller's code.
//! 2. The key is absent:
//!    * ...and locked: there is no stale value to bridge the gap, so the caller receives
//!      [EngineLocked](crate::error::CacheError::EngineLocked).
//!    * ...and unlocked: the regeneration function runs right on the background task, the result
//!      is stored and returned. This is the only case in which a caller waits for a
//!      regeneration.
//!
//! A failed refresh never replaces a live value - the coordinator always prefers stale over
//! wrong. Background failures are recorded in [CacheMetrics](crate::metrics::CacheMetrics) and
//! logged, nothing else; the caller who triggered the refresh already left with the stale value.
//!
//! # Single-flight
//! The engine's advisory lock serializes regenerations per key: a refresh job which finds the
//! key already locked backs off, and after acquiring the lock it re-checks the freshness so a
//! burst of stale reads boils down to (at most) one invocation of the regeneration function.
//! Note that this is exactly as strong as the engine's lock - best effort on remote backends.
use crate::engine::Engine;
use crate::error::CacheError;
use crate::metrics::CacheMetrics;
use crate::pool::{Job, JobQueue, WorkerPool};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::SystemTime;
use tokio::sync::oneshot;

/// A pending cache read.
///
/// The underlying task starts when [Cache::get](Cache::get) is invoked, not when the lookup is
/// first polled - awaiting the lookup only collects the result. Dropping it abandons the result
/// but never cancels the read path: a refresh which is already underway is wanted regardless of
/// whether the requesting caller is still interested.
pub struct Lookup {
    receiver: oneshot::Receiver<Result<Vec<u8>, CacheError>>,
}

impl Future for Lookup {
    type Output = Result<Vec<u8>, CacheError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| match received {
                Ok(result) => result,
                Err(_) => Err(CacheError::Backend(anyhow::anyhow!(
                    "the read path task terminated before delivering a result"
                ))),
            })
    }
}

/// Serves cached values and coordinates their regeneration.
///
/// The cache owns a bounded [worker pool](crate::pool::WorkerPool) for refresh jobs and shares
/// its storage engine with every job it schedules. All tuning happens at construction time;
/// afterwards the coordinator is driven entirely by [get](Cache::get) and
/// [expire](Cache::expire) calls.
///
/// # Example
/// ```
/// # use std::sync::Arc;
/// # use std::time::{Duration, SystemTime};
/// # use mercury::cache::Cache;
/// # use mercury::engine::MemoryEngine;
/// #[tokio::main]
/// async fn main() {
///     let engine = Arc::new(MemoryEngine::new(Duration::from_secs(30)));
///     let cache = Cache::new(engine, 16, 2);
///
///     let value = cache
///         .get("answer", SystemTime::now() + Duration::from_secs(60), || async {
///             Ok(b"42".to_vec())
///         })
///         .await
///         .unwrap();
///     assert_eq!(value, b"42".to_vec());
/// }
/// ```
pub struct Cache {
    engine: Arc<dyn Engine>,
    pool: WorkerPool,
    metrics: Arc<CacheMetrics>,
}

impl Cache {
    /// Creates a coordinator on top of the given engine.
    ///
    /// Up to `max_queue_size` refresh jobs may be outstanding before stale reads start waiting
    /// for the `max_workers` workers to catch up (both clamped to at least one). The pool is
    /// launched immediately, so this must be called from within a tokio runtime.
    pub fn new(engine: Arc<dyn Engine>, max_queue_size: usize, max_workers: usize) -> Self {
        let workers = max_workers.max(1);
        let metrics = Arc::new(CacheMetrics::new(workers));
        let pool = WorkerPool::new(max_queue_size, workers, metrics.clone());

        Cache {
            engine,
            pool,
            metrics,
        }
    }

    /// Reads the value of the given key, regenerating it as required.
    ///
    /// `expires` is the freshness deadline to attach to the *next* stored value - whatever is
    /// served may of course be older. The returned [Lookup](Lookup) is hot: the read path runs
    /// whether or not the lookup is ever awaited.
    ///
    /// See the [module documentation](self) for the full decision tree. The only errors a
    /// lookup can yield are [EngineLocked](crate::error::CacheError::EngineLocked) (cold miss
    /// while another actor holds the lock), a failure of the initial payload read, and on a
    /// cold miss the error of the regeneration function itself.
    pub fn get<F, Fut>(&self, key: &str, expires: SystemTime, regenerate: F) -> Lookup
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Vec<u8>>> + Send + 'static,
    {
        let (resolver, receiver) = oneshot::channel();
        let engine = Arc::clone(&self.engine);
        let metrics = Arc::clone(&self.metrics);
        let queue = self.pool.queue();
        let key = key.to_owned();

        crate::spawn!(async move {
            let result = read_path(engine, metrics, queue, key, expires, regenerate).await;

            // The caller may have dropped the lookup in the meantime - that's fine, the cache
            // itself is up to date either way.
            let _ = resolver.send(result);
        });

        Lookup { receiver }
    }

    /// Removes the given key (payload, freshness record and lock) from the engine.
    pub async fn expire(&self, key: &str) -> Result<(), CacheError> {
        self.engine.expire(key).await
    }

    /// Returns the counters describing this cache's behaviour.
    pub fn metrics(&self) -> Arc<CacheMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Shuts the refresh workers down.
    ///
    /// Stale reads issued afterwards still serve their stale values, but queued refresh jobs
    /// are no longer executed.
    pub fn stop(&self) {
        self.pool.stop();
    }
}

/// Walks the decision tree for a single read.
async fn read_path<F, Fut>(
    engine: Arc<dyn Engine>,
    metrics: Arc<CacheMetrics>,
    queue: JobQueue,
    key: String,
    expires: SystemTime,
    regenerate: F,
) -> Result<Vec<u8>, CacheError>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<Vec<u8>>> + Send + 'static,
{
    if engine.exists(&key).await {
        metrics.record_hit();

        // Fetch the payload before probing anything else so that a stale value is in hand
        // before regeneration gets a chance to touch the entry.
        let data = match engine.get(&key).await {
            Ok(data) => data,
            Err(error) => {
                metrics.record_engine_get_failure();
                return Err(error);
            }
        };

        if !engine.is_expired(&key).await {
            return Ok(data);
        }

        if engine.is_locked(&key).await {
            metrics.record_locked_while_serving();
            return Ok(data);
        }

        metrics.record_queued();
        queue
            .submit(refresh_job(
                Arc::clone(&engine),
                Arc::clone(&metrics),
                key,
                expires,
                regenerate,
            ))
            .await;

        return Ok(data);
    }

    metrics.record_miss();

    if engine.is_locked(&key).await {
        metrics.record_locked_on_miss();
        return Err(CacheError::EngineLocked);
    }

    // There is nothing to serve, so the caller waits for the regeneration either way. The lock
    // is best effort - failing to set it must not fail the read.
    if let Err(error) = engine.lock(&key).await {
        log::debug!("Failed to lock {} for its initial generation: {}", key, error);
    }

    let result = match regenerate().await {
        Ok(data) => {
            if let Err(error) = engine.put(&key, &data, expires).await {
                metrics.record_engine_put_failure();
                log::warn!("Failed to store the generated value of {}: {}", key, error);
            }

            Ok(data)
        }
        Err(error) => {
            metrics.record_regeneration_failure();
            Err(CacheError::Regeneration(error))
        }
    };

    release_lock(&*engine, &key).await;

    result
}

/// Creates the job which refreshes a stale key in the background.
fn refresh_job<F, Fut>(
    engine: Arc<dyn Engine>,
    metrics: Arc<CacheMetrics>,
    key: String,
    expires: SystemTime,
    regenerate: F,
) -> Job
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<Vec<u8>>> + Send + 'static,
{
    Box::pin(async move {
        match engine.lock(&key).await {
            Ok(()) => {}
            Err(CacheError::AlreadyLocked) => {
                log::debug!("Skipping the refresh of {} - another actor is on it.", key);
                return;
            }
            Err(error) => {
                log::debug!("Refreshing {} without a lock: {}", key, error);
            }
        }

        // The key may have been refreshed while this job sat in the queue.
        if !engine.is_expired(&key).await {
            release_lock(&*engine, &key).await;
            return;
        }

        match regenerate().await {
            Ok(data) => {
                if let Err(error) = engine.put(&key, &data, expires).await {
                    metrics.record_engine_put_failure();
                    log::warn!("Failed to store the refreshed value of {}: {}", key, error);
                }
            }
            Err(error) => {
                // The previous payload stays in place - stale beats wrong.
                metrics.record_regeneration_failure();
                log::warn!("Refreshing {} failed: {:#}", key, error);
            }
        }

        release_lock(&*engine, &key).await;
    })
}

async fn release_lock(engine: &dyn Engine, key: &str) {
    if let Err(error) = engine.unlock(key).await {
        log::debug!("Failed to release the lock of {}: {}", key, error);
    }
}

#[cfg(test)]
mod tests {
    use super::Cache;
    use crate::engine::{Engine, MemoryEngine};
    use crate::error::CacheError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant, SystemTime};

    /// All scenarios use a reaper poll far beyond the test runtime - reaping has its own tests,
    /// here it would only add timing noise.
    fn test_engine() -> Arc<MemoryEngine> {
        Arc::new(MemoryEngine::new(Duration::from_secs(60)))
    }

    fn in_secs(secs: u64) -> SystemTime {
        SystemTime::now() + Duration::from_secs(secs)
    }

    fn moments_ago() -> SystemTime {
        SystemTime::now() - Duration::from_secs(1)
    }

    /// Waits until the engine serves the expected payload for the given key.
    async fn await_value(engine: &Arc<MemoryEngine>, key: &str, expected: &[u8]) {
        for _ in 0..300 {
            if engine.get(key).await.ok().as_deref() == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        panic!("the value of {} never became {:?}", key, expected);
    }

    /// Waits until every queued refresh job has been executed.
    async fn await_refreshes_settled(cache: &Cache) {
        let metrics = cache.metrics();
        for _ in 0..300 {
            if metrics.processed_total() == metrics.queued() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        panic!(
            "only {} of {} queued refreshes were processed",
            metrics.processed_total(),
            metrics.queued()
        );
    }

    #[tokio::test]
    async fn cold_miss_generates_and_caches() {
        let engine = test_engine();
        let cache = Cache::new(engine.clone(), 5, 5);
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let data = cache
            .get("existing", in_secs(60), move || async move {
                let _ = counter.fetch_add(1, Ordering::SeqCst);
                Ok(b"hello".to_vec())
            })
            .await
            .unwrap();
        assert_eq!(data, b"hello".to_vec());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A second read within the freshness window is served from the engine...
        let counter = calls.clone();
        let data = cache
            .get("existing", in_secs(60), move || async move {
                let _ = counter.fetch_add(1, Ordering::SeqCst);
                Ok(b"other".to_vec())
            })
            .await
            .unwrap();
        assert_eq!(data, b"hello".to_vec());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(cache.metrics().misses(), 1);
        assert_eq!(cache.metrics().hits(), 1);
        assert_eq!(cache.metrics().queued(), 0);
    }

    #[tokio::test]
    async fn stale_read_serves_old_value_and_refreshes_in_background() {
        let engine = test_engine();
        let cache = Cache::new(engine.clone(), 5, 5);

        engine.put("a", b"v1", moments_ago()).await.unwrap();

        let data = cache
            .get("a", in_secs(60), || async { Ok(b"v2".to_vec()) })
            .await
            .unwrap();
        assert_eq!(data, b"v1".to_vec(), "the stale value is served immediately");

        // ...while the refreshed value lands in the engine shortly after.
        await_value(&engine, "a", b"v2").await;
        assert_eq!(cache.metrics().queued(), 1);

        let data = cache
            .get("a", in_secs(60), || async {
                unreachable!("a fresh entry is never regenerated")
            })
            .await
            .unwrap();
        assert_eq!(data, b"v2".to_vec());
    }

    #[tokio::test]
    async fn failed_refresh_preserves_the_previous_value() {
        let engine = test_engine();
        let cache = Cache::new(engine.clone(), 5, 5);

        engine.put("a", b"v1", moments_ago()).await.unwrap();

        let data = cache
            .get("a", in_secs(60), || async {
                Err(anyhow::anyhow!("origin unavailable"))
            })
            .await
            .unwrap();
        assert_eq!(data, b"v1".to_vec());

        await_refreshes_settled(&cache).await;
        assert_eq!(cache.metrics().regeneration_failures(), 1);

        // The failure clobbered nothing...
        assert_eq!(engine.get("a").await.unwrap(), b"v1".to_vec());

        // ...so the next read still serves the previous value (and tries again).
        let data = cache
            .get("a", in_secs(60), || async { Ok(b"v2".to_vec()) })
            .await
            .unwrap();
        assert_eq!(data, b"v1".to_vec());
        await_value(&engine, "a", b"v2").await;
    }

    #[tokio::test]
    async fn locked_cold_miss_is_reported_without_regenerating() {
        let engine = test_engine();
        let cache = Cache::new(engine.clone(), 5, 5);

        engine.lock("a").await.unwrap();

        let result = cache
            .get("a", in_secs(60), || async {
                unreachable!("the regenerator must not run while the key is foreign-locked")
            })
            .await;
        assert!(matches!(result, Err(CacheError::EngineLocked)));
        assert_eq!(cache.metrics().locked_on_miss(), 1);
    }

    #[tokio::test]
    async fn locked_stale_entry_is_served_without_refreshing() {
        let engine = test_engine();
        let cache = Cache::new(engine.clone(), 5, 5);

        engine.put("a", b"v1", moments_ago()).await.unwrap();
        engine.lock("a").await.unwrap();

        let data = cache
            .get("a", in_secs(60), || async {
                unreachable!("whoever holds the lock is refreshing already")
            })
            .await
            .unwrap();
        assert_eq!(data, b"v1".to_vec());
        assert_eq!(cache.metrics().locked_while_serving(), 1);
        assert_eq!(cache.metrics().queued(), 0);
    }

    #[tokio::test]
    async fn saturated_pool_throttles_refreshes_but_not_reads() {
        let engine = test_engine();
        let cache = Cache::new(engine.clone(), 2, 1);

        for i in 0..5 {
            engine
                .put(&format!("k{}", i), b"old", moments_ago())
                .await
                .unwrap();
        }

        let start = Instant::now();
        let mut lookups = Vec::new();
        for i in 0..5 {
            lookups.push(cache.get(&format!("k{}", i), in_secs(60), || async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(b"new".to_vec())
            }));
        }

        // Every read is answered from the stale entries...
        for lookup in lookups {
            assert_eq!(lookup.await.unwrap(), b"old".to_vec());
        }

        // ...while the single worker grinds through the refreshes one by one.
        for i in 0..5 {
            await_value(&engine, &format!("k{}", i), b"new").await;
        }
        assert_eq!(cache.metrics().queued(), 5);
        assert!(
            start.elapsed() >= Duration::from_millis(1000),
            "five 500ms refreshes on one worker cannot complete this quickly"
        );
    }

    #[tokio::test]
    async fn manual_expiry_forces_regeneration() {
        let engine = test_engine();
        let cache = Cache::new(engine.clone(), 5, 5);
        let calls = Arc::new(AtomicUsize::new(0));

        engine.put("a", b"v1", in_secs(60)).await.unwrap();
        cache.expire("a").await.unwrap();

        let counter = calls.clone();
        let data = cache
            .get("a", in_secs(60), move || async move {
                let _ = counter.fetch_add(1, Ordering::SeqCst);
                Ok(b"v2".to_vec())
            })
            .await
            .unwrap();
        assert_eq!(data, b"v2".to_vec());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_stale_burst_regenerates_at_most_once() {
        let engine = test_engine();
        let cache = Cache::new(engine.clone(), 16, 4);
        let calls = Arc::new(AtomicUsize::new(0));

        engine.put("a", b"v1", moments_ago()).await.unwrap();

        let lookups: Vec<_> = (0..8)
            .map(|_| {
                let counter = calls.clone();
                cache.get("a", in_secs(60), move || async move {
                    let _ = counter.fetch_add(1, Ordering::SeqCst);
                    Ok(b"v2".to_vec())
                })
            })
            .collect();

        for lookup in lookups {
            let data = lookup.await.unwrap();
            assert!(data == b"v1".to_vec() || data == b"v2".to_vec());
        }

        await_refreshes_settled(&cache).await;
        await_value(&engine, "a", b"v2").await;

        // The lock plus the post-lock freshness check boil the whole burst down to one call.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropping_the_lookup_does_not_cancel_the_refresh() {
        let engine = test_engine();
        let cache = Cache::new(engine.clone(), 5, 5);

        engine.put("a", b"v1", moments_ago()).await.unwrap();

        let lookup = cache.get("a", in_secs(60), || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(b"v2".to_vec())
        });
        drop(lookup);

        await_value(&engine, "a", b"v2").await;
    }

    #[tokio::test]
    async fn stopped_cache_still_serves_stale_values() {
        let engine = test_engine();
        let cache = Cache::new(engine.clone(), 5, 2);

        engine.put("a", b"v1", moments_ago()).await.unwrap();

        cache.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let data = cache
            .get("a", in_secs(60), || async { Ok(b"v2".to_vec()) })
            .await
            .unwrap();
        assert_eq!(data, b"v1".to_vec());

        // The refresh was queued but no worker is left to run it.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.get("a").await.unwrap(), b"v1".to_vec());
        assert_eq!(cache.metrics().processed_total(), 0);
    }
}
