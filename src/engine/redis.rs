//! Provides the Redis backed reference engine.
use crate::engine::Engine;
use crate::error::CacheError;
use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use std::time::{Duration, SystemTime};

/// A storage engine mapping each logical key onto three physical Redis keys.
///
/// For a logical key `k` and a key prefix `p` the engine maintains:
/// * `p:k` - the raw payload bytes,
/// * `p:expire:k` - the freshness deadline as decimal unix seconds,
/// * `p:lock:k` - the advisory lock marker (`"1"`).
///
/// Every write carries the engine wide **retention** TTL, which is deliberately separate from
/// the freshness deadline: retention bounds how long Redis keeps any of the physical keys around
/// (and thereby the backend's memory use), while the deadline merely decides when the
/// coordinator starts regenerating. Retention should therefore be at least as long as the
/// longest freshness window in use. Since the lock marker expires with the same TTL, a crashed
/// lock holder cannot block a key forever.
///
/// Locks here are advisory markers in shared storage, visible to every process talking to the
/// same Redis - which is exactly what makes the single-flight discipline hold across process
/// boundaries (best effort, not a transactional guarantee).
///
/// # Example
/// ```no_run
/// # use std::time::Duration;
/// # use mercury::engine::RedisEngine;
/// let pool = deadpool_redis::Config::from_url("redis://127.0.0.1:6379")
///     .create_pool(Some(deadpool_redis::Runtime::Tokio1))
///     .unwrap();
/// let engine = RedisEngine::new("mycache", pool, Duration::from_secs(60 * 60));
/// ```
pub struct RedisEngine {
    prefix: String,
    pool: Pool,
    retention: Duration,
}

impl RedisEngine {
    /// Creates a new engine on top of the given connection pool.
    ///
    /// All physical keys are prefixed with `prefix` and written with `retention` as their TTL.
    pub fn new(prefix: impl Into<String>, pool: Pool, retention: Duration) -> Self {
        RedisEngine {
            prefix: prefix.into(),
            pool,
            retention,
        }
    }

    fn payload_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    fn marker_key(&self, key: &str) -> String {
        format!("{}:expire:{}", self.prefix, key)
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}:lock:{}", self.prefix, key)
    }

    /// Returns the retention TTL in seconds (the server rejects a TTL of zero).
    fn retention_secs(&self) -> u64 {
        self.retention.as_secs().max(1)
    }

    /// Determines the presence of an arbitrary physical key, collapsing failures to `false`.
    async fn physical_key_present(&self, physical_key: String) -> bool {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(error) => {
                log::debug!("Failed to obtain a Redis connection: {}", error);
                return false;
            }
        };

        match conn.exists::<_, bool>(&physical_key).await {
            Ok(present) => present,
            Err(error) => {
                log::debug!("EXISTS {} failed: {}", physical_key, error);
                false
            }
        }
    }
}

fn unix_seconds(instant: SystemTime) -> u64 {
    instant
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

#[async_trait]
impl Engine for RedisEngine {
    async fn exists(&self, key: &str) -> bool {
        self.physical_key_present(self.payload_key(key)).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        let mut conn = self.pool.get().await.map_err(CacheError::backend)?;

        let data: Option<Vec<u8>> = conn
            .get(self.payload_key(key))
            .await
            .map_err(CacheError::backend)?;

        data.ok_or(CacheError::MissingKey)
    }

    async fn put(&self, key: &str, data: &[u8], expires: SystemTime) -> Result<(), CacheError> {
        let mut conn = self.pool.get().await.map_err(CacheError::backend)?;

        let _: () = redis::pipe()
            .cmd("SETEX")
            .arg(self.payload_key(key))
            .arg(self.retention_secs())
            .arg(data)
            .ignore()
            .cmd("SETEX")
            .arg(self.marker_key(key))
            .arg(self.retention_secs())
            .arg(unix_seconds(expires))
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(CacheError::backend)?;

        Ok(())
    }

    async fn is_expired(&self, key: &str) -> bool {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(error) => {
                log::debug!("Failed to obtain a Redis connection: {}", error);
                return false;
            }
        };

        let marker: Option<String> = match conn.get(self.marker_key(key)).await {
            Ok(marker) => marker,
            Err(error) => {
                log::debug!("Failed to read the freshness record of {}: {}", key, error);
                return false;
            }
        };

        // A missing or unreadable record reports "not expired" - retention will clean the
        // payload up eventually, and until then serving it beats regenerating it blindly.
        match marker.and_then(|raw| raw.parse::<u64>().ok()) {
            Some(deadline) => unix_seconds(SystemTime::now()) > deadline,
            None => false,
        }
    }

    async fn expire(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.pool.get().await.map_err(CacheError::backend)?;

        let removed: i64 = conn
            .del((
                self.payload_key(key),
                self.marker_key(key),
                self.lock_key(key),
            ))
            .await
            .map_err(CacheError::backend)?;

        if removed == 0 {
            Err(CacheError::MissingKey)
        } else {
            Ok(())
        }
    }

    async fn lock(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.pool.get().await.map_err(CacheError::backend)?;

        // NX makes the marker exclusive, EX lets a crashed holder's lock clear itself.
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(key))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(self.retention_secs())
            .query_async(&mut conn)
            .await
            .map_err(CacheError::backend)?;

        match reply {
            Some(_) => Ok(()),
            None => Err(CacheError::AlreadyLocked),
        }
    }

    async fn unlock(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.pool.get().await.map_err(CacheError::backend)?;

        let removed: i64 = conn
            .del(self.lock_key(key))
            .await
            .map_err(CacheError::backend)?;

        if removed == 0 {
            Err(CacheError::MissingKey)
        } else {
            Ok(())
        }
    }

    async fn is_locked(&self, key: &str) -> bool {
        self.physical_key_present(self.lock_key(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::RedisEngine;
    use crate::engine::Engine;
    use crate::error::CacheError;
    use std::time::{Duration, SystemTime};

    /// Creating a pool performs no I/O, so an engine can be built without a reachable server.
    fn test_engine(prefix: &str) -> RedisEngine {
        let pool = deadpool_redis::Config::from_url("redis://127.0.0.1:6379")
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .unwrap();

        RedisEngine::new(prefix, pool, Duration::from_secs(60))
    }

    #[test]
    fn logical_keys_map_onto_three_key_families() {
        let engine = test_engine("testing");

        assert_eq!(engine.payload_key("foo"), "testing:foo");
        assert_eq!(engine.marker_key("foo"), "testing:expire:foo");
        assert_eq!(engine.lock_key("foo"), "testing:lock:foo");
    }

    #[test]
    fn retention_never_degrades_to_an_illegal_ttl() {
        let pool = deadpool_redis::Config::from_url("redis://127.0.0.1:6379")
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .unwrap();
        let engine = RedisEngine::new("testing", pool, Duration::from_millis(1));

        assert_eq!(engine.retention_secs(), 1);
    }

    /// Requires a local Redis on 127.0.0.1:6379, hence ignored by default:
    /// `cargo test -- --ignored` runs it.
    #[tokio::test]
    #[ignore]
    async fn round_trip_against_a_live_server() {
        let engine = test_engine("mercury-test");
        let _ = engine.expire("foo").await;

        assert_eq!(engine.exists("foo").await, false);
        assert_eq!(engine.is_expired("foo").await, false);

        engine
            .put("foo", b"bar", SystemTime::now() + Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(engine.exists("foo").await, true);
        assert_eq!(engine.get("foo").await.unwrap(), b"bar".to_vec());
        assert_eq!(engine.is_expired("foo").await, false);

        engine
            .put("foo", b"bar", SystemTime::now() - Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(engine.is_expired("foo").await, true);

        engine.lock("foo").await.unwrap();
        assert!(matches!(
            engine.lock("foo").await,
            Err(CacheError::AlreadyLocked)
        ));

        engine.expire("foo").await.unwrap();
        assert_eq!(engine.exists("foo").await, false);
        assert_eq!(engine.is_locked("foo").await, false);
        assert!(matches!(
            engine.expire("foo").await,
            Err(CacheError::MissingKey)
        ));
    }
}
