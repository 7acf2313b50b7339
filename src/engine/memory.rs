//! Provides the process-local reference engine.
use crate::engine::Engine;
use crate::error::CacheError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, SystemTime};

/// Payload and freshness state of the engine.
///
/// Both maps are guarded by a single capability as they are always touched together - an entry
/// without a freshness record (or vice versa) must never be observable.
struct State {
    store: HashMap<String, Vec<u8>>,
    expire: HashMap<String, SystemTime>,
}

struct Inner {
    state: RwLock<State>,
    locks: RwLock<HashSet<String>>,
}

/// A storage engine keeping all entries in process-local maps.
///
/// The lock markers live behind their own reader/writer capability, so locking a key never
/// blocks concurrent payload readers. None of the capabilities is ever held across an await
/// point or across a nested removal.
///
/// Entries whose freshness deadline has passed remain readable (and will be served as stale
/// values by the coordinator) until a **reaper** collects them: a background task which wakes up
/// every poll interval and removes all expired, unlocked keys. The reaper only keeps a weak
/// reference, so it winds down on its own once the last handle to the engine is dropped.
///
/// Note that this engine must be created from within a tokio runtime as the reaper task is
/// spawned right away. Contents do not survive a restart.
///
/// # Example
/// ```
/// # use std::time::{Duration, SystemTime};
/// # use mercury::engine::{Engine, MemoryEngine};
/// #[tokio::main]
/// async fn main() {
///     let engine = MemoryEngine::new(Duration::from_secs(30));
///
///     engine
///         .put("foo", b"bar", SystemTime::now() + Duration::from_secs(60))
///         .await
///         .unwrap();
///     assert_eq!(engine.get("foo").await.unwrap(), b"bar".to_vec());
///     assert_eq!(engine.is_expired("foo").await, false);
/// }
/// ```
pub struct MemoryEngine {
    inner: Arc<Inner>,
}

impl MemoryEngine {
    /// Creates a new engine whose reaper scans for expired entries every `reaper_poll`.
    pub fn new(reaper_poll: Duration) -> Self {
        let inner = Arc::new(Inner {
            state: RwLock::new(State {
                store: HashMap::new(),
                expire: HashMap::new(),
            }),
            locks: RwLock::new(HashSet::new()),
        });

        start_reaper(&inner, reaper_poll);

        MemoryEngine { inner }
    }
}

impl Inner {
    fn locked(&self, key: &str) -> bool {
        self.locks.read().unwrap().contains(key)
    }

    /// Removes the payload and the freshness record, then the lock marker.
    ///
    /// Each capability is released before the next one is taken.
    fn remove(&self, key: &str) {
        {
            let mut state = self.state.write().unwrap();
            let _ = state.store.remove(key);
            let _ = state.expire.remove(key);
        }

        let _ = self.locks.write().unwrap().remove(key);
    }

    /// Collects all expired, unlocked keys.
    ///
    /// The deadline set is snapshotted up front so that no capability is held while entries are
    /// being removed.
    fn sweep(&self) {
        let now = SystemTime::now();

        let expired: Vec<String> = {
            let state = self.state.read().unwrap();
            state
                .expire
                .iter()
                .filter(|(_, deadline)| **deadline < now)
                .map(|(key, _)| key.clone())
                .collect()
        };

        for key in expired {
            if !self.locked(&key) {
                log::debug!("Reaping expired cache entry {}...", key);
                self.remove(&key);
            }
        }
    }
}

/// Spawns the reaper task for the given engine state.
///
/// The task holds a weak reference only: once the engine is gone, the next poll ends the task.
fn start_reaper(inner: &Arc<Inner>, poll: Duration) {
    let weak: Weak<Inner> = Arc::downgrade(inner);

    crate::spawn!(async move {
        loop {
            tokio::time::sleep(poll).await;

            match weak.upgrade() {
                Some(inner) => inner.sweep(),
                None => return,
            }
        }
    });
}

#[async_trait]
impl Engine for MemoryEngine {
    async fn exists(&self, key: &str) -> bool {
        self.inner.state.read().unwrap().store.contains_key(key)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        self.inner
            .state
            .read()
            .unwrap()
            .store
            .get(key)
            .cloned()
            .ok_or(CacheError::MissingKey)
    }

    async fn put(&self, key: &str, data: &[u8], expires: SystemTime) -> Result<(), CacheError> {
        let mut state = self.inner.state.write().unwrap();
        let _ = state.store.insert(key.to_owned(), data.to_vec());
        let _ = state.expire.insert(key.to_owned(), expires);

        Ok(())
    }

    async fn is_expired(&self, key: &str) -> bool {
        self.inner
            .state
            .read()
            .unwrap()
            .expire
            .get(key)
            .map_or(true, |deadline| *deadline < SystemTime::now())
    }

    async fn expire(&self, key: &str) -> Result<(), CacheError> {
        if !self.inner.state.read().unwrap().store.contains_key(key) {
            return Err(CacheError::MissingKey);
        }

        self.inner.remove(key);

        Ok(())
    }

    async fn lock(&self, key: &str) -> Result<(), CacheError> {
        if self.inner.locks.write().unwrap().insert(key.to_owned()) {
            Ok(())
        } else {
            Err(CacheError::AlreadyLocked)
        }
    }

    async fn unlock(&self, key: &str) -> Result<(), CacheError> {
        if self.inner.locks.write().unwrap().remove(key) {
            Ok(())
        } else {
            Err(CacheError::MissingKey)
        }
    }

    async fn is_locked(&self, key: &str) -> bool {
        self.inner.locked(key)
    }
}
