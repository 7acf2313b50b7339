//! Provides fire-and-forget counters describing the behaviour of a cache.
//!
//! The coordinator has no output channel besides the values it serves; these counters are the
//! only way to observe what happens behind the scenes (how many reads were stale, how many
//! refreshes failed, ...). All counters are internally mutable without needing a mutable
//! reference as we rely on atomic intrinsics as provided by modern processors / compilers -
//! recording is wait free and can happen from any task.
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing event counter.
struct Counter(AtomicU64);

impl Counter {
    fn new() -> Self {
        Counter(AtomicU64::new(0))
    }

    fn inc(&self) {
        let _ = self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Records the observable events of a [Cache](crate::cache::Cache).
///
/// An instance is created by the cache itself and shared via
/// [Cache::metrics](crate::cache::Cache::metrics). The difference between
/// [queued](CacheMetrics::queued) and [processed_total](CacheMetrics::processed_total) is the
/// current refresh backlog.
///
/// # Example
/// ```
/// # use std::sync::Arc;
/// # use std::time::{Duration, SystemTime};
/// # use mercury::cache::Cache;
/// # use mercury::engine::MemoryEngine;
/// #[tokio::main]
/// async fn main() {
///     let cache = Cache::new(Arc::new(MemoryEngine::new(Duration::from_secs(30))), 4, 1);
///     let _ = cache
///         .get("key", SystemTime::now() + Duration::from_secs(60), || async {
///             Ok(vec![42])
///         })
///         .await;
///
///     // The read above was a cold miss...
///     assert_eq!(cache.metrics().misses(), 1);
///     assert_eq!(cache.metrics().hits(), 0);
/// }
/// ```
pub struct CacheMetrics {
    hits: Counter,
    misses: Counter,
    queued: Counter,
    locked_on_miss: Counter,
    locked_while_serving: Counter,
    engine_get_failures: Counter,
    regeneration_failures: Counter,
    engine_put_failures: Counter,
    processed: Vec<Counter>,
}

impl CacheMetrics {
    /// Creates a fresh set of counters with one processed-jobs slot per worker.
    pub(crate) fn new(workers: usize) -> Self {
        CacheMetrics {
            hits: Counter::new(),
            misses: Counter::new(),
            queued: Counter::new(),
            locked_on_miss: Counter::new(),
            locked_while_serving: Counter::new(),
            engine_get_failures: Counter::new(),
            regeneration_failures: Counter::new(),
            engine_put_failures: Counter::new(),
            processed: (0..workers).map(|_| Counter::new()).collect(),
        }
    }

    pub(crate) fn record_hit(&self) {
        self.hits.inc();
    }

    pub(crate) fn record_miss(&self) {
        self.misses.inc();
    }

    pub(crate) fn record_queued(&self) {
        self.queued.inc();
    }

    pub(crate) fn record_locked_on_miss(&self) {
        self.locked_on_miss.inc();
    }

    pub(crate) fn record_locked_while_serving(&self) {
        self.locked_while_serving.inc();
    }

    pub(crate) fn record_engine_get_failure(&self) {
        self.engine_get_failures.inc();
    }

    pub(crate) fn record_regeneration_failure(&self) {
        self.regeneration_failures.inc();
    }

    pub(crate) fn record_engine_put_failure(&self) {
        self.engine_put_failures.inc();
    }

    pub(crate) fn record_processed(&self, worker_id: usize) {
        if let Some(counter) = self.processed.get(worker_id) {
            counter.inc();
        }
    }

    /// Returns the number of reads which found the key present in the engine.
    pub fn hits(&self) -> u64 {
        self.hits.get()
    }

    /// Returns the number of reads which found no entry at all (cold misses).
    pub fn misses(&self) -> u64 {
        self.misses.get()
    }

    /// Returns the number of refresh jobs handed to the worker pool.
    pub fn queued(&self) -> u64 {
        self.queued.get()
    }

    /// Returns the number of cold misses which were aborted because another actor held the
    /// key's lock.
    pub fn locked_on_miss(&self) -> u64 {
        self.locked_on_miss.get()
    }

    /// Returns the number of stale reads which skipped the refresh because another actor was
    /// already regenerating the key.
    pub fn locked_while_serving(&self) -> u64 {
        self.locked_while_serving.get()
    }

    /// Returns the number of payload reads the engine failed to answer.
    pub fn engine_get_failures(&self) -> u64 {
        self.engine_get_failures.get()
    }

    /// Returns the number of regeneration functions which reported an error.
    pub fn regeneration_failures(&self) -> u64 {
        self.regeneration_failures.get()
    }

    /// Returns the number of engine writes which failed after a successful regeneration.
    pub fn engine_put_failures(&self) -> u64 {
        self.engine_put_failures.get()
    }

    /// Returns the number of refresh jobs executed by the given worker.
    pub fn processed(&self, worker_id: usize) -> u64 {
        self.processed.get(worker_id).map_or(0, Counter::get)
    }

    /// Returns the number of refresh jobs executed by the pool as a whole.
    pub fn processed_total(&self) -> u64 {
        self.processed.iter().map(Counter::get).sum()
    }
}
