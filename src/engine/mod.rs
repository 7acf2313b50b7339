//! Provides the storage engine contract and the two reference engines.
//!
//! An engine stores byte payloads under string keys together with two bits of per-key state the
//! coordinator builds its decisions on: a **freshness deadline** (after which the payload is
//! stale but still returnable) and an **advisory lock** (a storage-backed marker coordinating
//! regenerations - not a memory mutex, it may outlive the process on remote backends).
//!
//! Engines are deliberately forgiving: a predicate which cannot reach its backend answers with
//! the conservative boolean (`exists` and `is_locked` report `false`, `is_expired` reports
//! `false` when the freshness record cannot be read) instead of failing. A false negative at
//! worst triggers a spurious regeneration; a false positive would serve bad data or block
//! regeneration entirely.
//!
//! The [memory](MemoryEngine) engine keeps everything in process-local maps and cleans up via a
//! polling reaper task. The [redis](RedisEngine) engine spreads each logical key over three
//! physical keys and relies on the backend's own TTL for cleanup.
use crate::error::CacheError;
use async_trait::async_trait;
use std::time::SystemTime;

mod memory;
mod redis;

pub use memory::MemoryEngine;
pub use redis::RedisEngine;

/// The contract all storage engines must fulfil.
///
/// Engines are shared between the coordinator and every refresh job it schedules, therefore
/// implementations have to be fully thread safe and are commonly handed around as
/// `Arc<dyn Engine>`.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Determines if the given key is present, no matter how stale.
    ///
    /// Best effort: a backend failure reports `false`.
    async fn exists(&self, key: &str) -> bool;

    /// Returns the payload stored for the given key.
    ///
    /// Fails with [CacheError::MissingKey](crate::error::CacheError::MissingKey) if the key is
    /// absent.
    async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError>;

    /// Establishes or overwrites the entry for the given key.
    ///
    /// The payload is considered fresh until `expires` (a wall-clock instant) has passed. Any
    /// lock state of the key remains untouched.
    async fn put(&self, key: &str, data: &[u8], expires: SystemTime) -> Result<(), CacheError>;

    /// Determines if the freshness deadline of the given key has passed.
    ///
    /// An absent key is always expired. A backend failure while reading the freshness record
    /// reports `false` so that an unreachable backend does not drown the system in
    /// regenerations.
    async fn is_expired(&self, key: &str) -> bool;

    /// Forces the immediate removal of the payload, the freshness record and the lock state of
    /// the given key.
    ///
    /// Fails with [CacheError::MissingKey](crate::error::CacheError::MissingKey) if the key is
    /// absent.
    async fn expire(&self, key: &str) -> Result<(), CacheError>;

    /// Places the advisory lock marker on the given key.
    ///
    /// Fails with [CacheError::AlreadyLocked](crate::error::CacheError::AlreadyLocked) if the
    /// marker is already set. Locking is independent of payload presence - a key can be locked
    /// before its first [put](Engine::put).
    async fn lock(&self, key: &str) -> Result<(), CacheError>;

    /// Removes the advisory lock marker from the given key.
    ///
    /// Fails with [CacheError::MissingKey](crate::error::CacheError::MissingKey) if the marker
    /// is not set.
    async fn unlock(&self, key: &str) -> Result<(), CacheError>;

    /// Determines if the advisory lock marker is set for the given key.
    ///
    /// Best effort: a backend failure reports `false`.
    async fn is_locked(&self, key: &str) -> bool;
}
