//! Provides the error type shared by the coordinator and all storage engines.
//!
//! Most conditions listed here never reach a caller of [Cache::get](crate::cache::Cache::get):
//! the read path prefers serving a stale value over reporting a background problem and records
//! swallowed failures in [CacheMetrics](crate::metrics::CacheMetrics) instead. See the individual
//! variants for which side of the API they can show up on.
use thiserror::Error;

/// Enumerates the error conditions of the cache and its storage engines.
#[derive(Debug, Error)]
pub enum CacheError {
    /// An engine operation needed a key which is not present.
    ///
    /// Reported by [Engine::get](crate::engine::Engine::get),
    /// [Engine::expire](crate::engine::Engine::expire) and
    /// [Engine::unlock](crate::engine::Engine::unlock); the coordinator's read path treats this
    /// as an ordinary miss and never forwards it.
    #[error("non-existent key")]
    MissingKey,

    /// A lock was requested for a key which is already locked.
    ///
    /// Only ever returned by [Engine::lock](crate::engine::Engine::lock). A refresh job which
    /// runs into this simply backs off - some other actor is already regenerating the key.
    #[error("key already locked")]
    AlreadyLocked,

    /// A value had to be generated from scratch while another actor holds the key's lock.
    ///
    /// This is the one lock related condition a caller of
    /// [Cache::get](crate::cache::Cache::get) can observe: on a cold miss there is no stale
    /// value to bridge the gap, so the caller has to retry once the foreign regeneration
    /// completed.
    #[error("cannot generate a value while the key is locked by another actor")]
    EngineLocked,

    /// The underlying storage backend failed (I/O, network, connection pool).
    ///
    /// Engines collapse backend failures of their *predicates* to conservative booleans; this
    /// variant therefore only shows up on payload reads and writes.
    #[error("storage backend failure: {0}")]
    Backend(anyhow::Error),

    /// The caller supplied regeneration function reported an error.
    ///
    /// Surfaced only on a cold miss, where the caller waits for the regeneration anyway. A
    /// failed *background* refresh is counted and logged, never reported - the requesting
    /// caller already received the stale value.
    #[error("regeneration failed: {0}")]
    Regeneration(anyhow::Error),
}

impl CacheError {
    /// Wraps an arbitrary backend error.
    pub fn backend(error: impl Into<anyhow::Error>) -> Self {
        CacheError::Backend(error.into())
    }
}
