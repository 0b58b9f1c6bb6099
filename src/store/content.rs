/// Content store: cache state per digest, with expiry
use crate::store::{Digest, StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Upload progress of a blob
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    /// Upload started, blob may not exist yet
    Pending,
    Cached,
}

impl CacheState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheState::Pending => "pending",
            CacheState::Cached => "cached",
        }
    }

    pub fn parse(text: &str) -> StoreResult<Self> {
        match text {
            "pending" => Ok(CacheState::Pending),
            "cached" => Ok(CacheState::Cached),
            other => Err(StoreError::Backend(format!(
                "Unknown cache state: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait ContentStore: Send + Sync {
    fn backend_name(&self) -> &str;
    /// `Ok(None)` for an unknown or expired digest
    fn get(&self, digest: &Digest) -> StoreResult<Option<CacheState>>;
    fn set(&self, digest: &Digest, state: CacheState, ttl: Duration) -> StoreResult<()>;
}

/// Process-local content store
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    entries: Mutex<HashMap<Digest, (CacheState, Instant)>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, HashMap<Digest, (CacheState, Instant)>>> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Backend("content store lock poisoned".to_string()))
    }
}

impl ContentStore for MemoryContentStore {
    fn backend_name(&self) -> &str {
        "memory"
    }

    fn get(&self, digest: &Digest) -> StoreResult<Option<CacheState>> {
        let mut entries = self.lock()?;
        match entries.get(digest) {
            Some((state, expires)) if *expires > Instant::now() => Ok(Some(*state)),
            Some(_) => {
                entries.remove(digest);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, digest: &Digest, state: CacheState, ttl: Duration) -> StoreResult<()> {
        self.lock()?
            .insert(digest.clone(), (state, Instant::now() + ttl));
        Ok(())
    }
}

/// Redis-backed content store; keys are the bare hex digests
#[cfg(feature = "redis-backend")]
pub struct RedisContentStore {
    client: redis::Client,
}

#[cfg(feature = "redis-backend")]
impl RedisContentStore {
    pub fn open(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Backend(format!("Invalid Redis URL {}: {}", url, e)))?;
        Ok(Self { client })
    }

    fn connection(&self) -> StoreResult<redis::Connection> {
        self.client
            .get_connection()
            .map_err(|e| StoreError::Backend(format!("Redis connection failed: {}", e)))
    }

    pub fn ping(&self) -> StoreResult<()> {
        let mut conn = self.connection()?;
        let reply: String = redis::cmd("PING")
            .query(&mut conn)
            .map_err(|e| StoreError::Backend(format!("Redis PING failed: {}", e)))?;
        log::debug!("Redis PING -> {}", reply);
        Ok(())
    }
}

#[cfg(feature = "redis-backend")]
impl ContentStore for RedisContentStore {
    fn backend_name(&self) -> &str {
        "redis"
    }

    fn get(&self, digest: &Digest) -> StoreResult<Option<CacheState>> {
        let mut conn = self.connection()?;
        let value: Option<String> = redis::cmd("GET")
            .arg(digest.as_str())
            .query(&mut conn)
            .map_err(|e| StoreError::Backend(format!("Redis GET {} failed: {}", digest, e)))?;
        value.as_deref().map(CacheState::parse).transpose()
    }

    fn set(&self, digest: &Digest, state: CacheState, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.connection()?;
        // EX takes whole seconds and rejects 0
        let seconds = ttl.as_secs().max(1);
        redis::cmd("SET")
            .arg(digest.as_str())
            .arg(state.as_str())
            .arg("EX")
            .arg(seconds)
            .query::<()>(&mut conn)
            .map_err(|e| StoreError::Backend(format!("Redis SET {} failed: {}", digest, e)))
    }
}
