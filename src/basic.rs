//! Provides a manual caching strategy without background regeneration.
//!
//! Where [Cache](crate::cache::Cache) owns the whole serve-and-refresh cycle, this strategy
//! leaves both sides to the caller: reads yield a value only while it is fresh, and writes are
//! the caller's job entirely. It is the right tool when the regeneration cannot be expressed as
//! a closure handed to the cache - e.g. when fresh values arrive from an external feed.
use crate::engine::Engine;
use crate::error::CacheError;
use std::sync::Arc;
use std::time::SystemTime;

/// A read/write cache facade over a storage engine.
///
/// # Example
/// ```
/// # use std::sync::Arc;
/// # use std::time::{Duration, SystemTime};
/// # use mercury::basic::BasicCache;
/// # use mercury::engine::MemoryEngine;
/// #[tokio::main]
/// async fn main() {
///     let cache = BasicCache::new(Arc::new(MemoryEngine::new(Duration::from_secs(30))));
///
///     cache
///         .put("foo", SystemTime::now() + Duration::from_secs(60), b"bar")
///         .await
///         .unwrap();
///     assert_eq!(cache.get("foo").await.unwrap(), b"bar".to_vec());
/// }
/// ```
pub struct BasicCache {
    engine: Arc<dyn Engine>,
}

impl BasicCache {
    /// Creates a new cache on top of the given engine.
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        BasicCache { engine }
    }

    /// Returns the value of the given key as long as it is present *and* fresh.
    ///
    /// A stale entry is reported as [MissingKey](crate::error::CacheError::MissingKey) just
    /// like an absent one - this strategy never serves stale data, that is what
    /// [Cache](crate::cache::Cache) is for.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        if !self.engine.exists(key).await {
            return Err(CacheError::MissingKey);
        }

        let data = self.engine.get(key).await?;

        if self.engine.is_expired(key).await {
            return Err(CacheError::MissingKey);
        }

        Ok(data)
    }

    /// Stores the given value with the given freshness deadline.
    ///
    /// Fails with [EngineLocked](crate::error::CacheError::EngineLocked) while another actor
    /// holds the key's lock (e.g. a coordinator regenerating the same key); the write is
    /// bracketed by the advisory lock itself so concurrent writers take turns.
    pub async fn put(
        &self,
        key: &str,
        expires: SystemTime,
        data: &[u8],
    ) -> Result<(), CacheError> {
        if self.engine.is_locked(key).await {
            return Err(CacheError::EngineLocked);
        }

        if let Err(error) = self.engine.lock(key).await {
            log::debug!("Failed to lock {} for writing: {}", key, error);
        }

        let result = self.engine.put(key, data, expires).await;

        if let Err(error) = self.engine.unlock(key).await {
            log::debug!("Failed to release the lock of {}: {}", key, error);
        }

        result
    }

    /// Removes the given key from the engine.
    pub async fn expire(&self, key: &str) -> Result<(), CacheError> {
        self.engine.expire(key).await
    }
}
