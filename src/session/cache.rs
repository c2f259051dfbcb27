//! Cluster cache seam and the replicated binding record.
//!
//! The binding record is the authoritative cross-server view of a user's
//! ownership: which frontend holds the socket, which backends the user is
//! bound to, and the user's opaque data. It lives in an out-of-process
//! cache under a deterministic key and expires unless refreshed by flush.

use crate::core::time::Clock;
use crate::protocol::{self, WireError};
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cluster cache unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Key under which a user's binding record is stored.
pub fn binding_key(uid: &str) -> String {
    format!("pitaya:session:{uid}")
}

/// Replicated summary of a user's ownership.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindingRecord {
    pub frontend_id: String,
    pub frontend_session_id: i64,
    /// Backend bindings by server type.
    pub backends: HashMap<String, String>,
    /// Opaque user kv data.
    pub data: HashMap<String, String>,
}

impl BindingRecord {
    pub fn encode(&self) -> Result<Bytes, CacheError> {
        Ok(protocol::encode(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CacheError> {
        Ok(protocol::decode(bytes)?)
    }
}

/// Key/value store with TTL holding serialized session state.
#[async_trait::async_trait]
pub trait ClusterCache: Send + Sync + 'static {
    async fn put(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError>;
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

struct Entry {
    value: Bytes,
    expires_at: Instant,
}

/// In-process cache with lazy expiry.
pub struct MemoryCache<C: Clock> {
    entries: RwLock<HashMap<String, Entry>>,
    clock: C,
    fail_writes: AtomicBool,
}

impl<C: Clock> MemoryCache<C> {
    pub fn new(clock: C) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Test hook: make subsequent writes fail as if the cache were down.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .read()
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl<C: Clock> ClusterCache for MemoryCache<C> {
    async fn put(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(CacheError::Unavailable("write rejected".into()));
        }
        let expires_at = self.clock.now() + ttl;
        self.entries
            .write()
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let now = self.clock.now();
        let expired = {
            let entries = self.entries.read();
            match entries.get(key) {
                None => return Ok(None),
                Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
                Some(_) => true,
            }
        };
        if expired {
            self.entries.write().remove(key);
        }
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(CacheError::Unavailable("write rejected".into()));
        }
        self.entries.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::ManualClock;

    #[tokio::test]
    async fn record_roundtrip_under_binding_key() {
        let cache = MemoryCache::new(ManualClock::new());
        let mut record = BindingRecord {
            frontend_id: "f1".into(),
            frontend_session_id: 7,
            ..Default::default()
        };
        record.backends.insert("room".into(), "r1".into());

        let key = binding_key("u1");
        assert_eq!(key, "pitaya:session:u1");
        cache
            .put(&key, record.encode().unwrap(), Duration::from_secs(60))
            .await
            .unwrap();

        let loaded = BindingRecord::decode(&cache.get(&key).await.unwrap().unwrap()).unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let clock = ManualClock::new();
        let cache = MemoryCache::new(clock.clone());
        cache
            .put("k", Bytes::from_static(b"v"), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(cache.get("k").await.unwrap().is_some());

        clock.advance(Duration::from_secs(11));
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn flush_refreshes_ttl() {
        let clock = ManualClock::new();
        let cache = MemoryCache::new(clock.clone());
        cache
            .put("k", Bytes::from_static(b"v1"), Duration::from_secs(10))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(8));
        cache
            .put("k", Bytes::from_static(b"v2"), Duration::from_secs(10))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(8));
        assert_eq!(cache.get("k").await.unwrap().unwrap(), &b"v2"[..]);
    }

    #[tokio::test]
    async fn failed_writes_surface() {
        let cache = MemoryCache::new(ManualClock::new());
        cache.set_fail_writes(true);
        let err = cache
            .put("k", Bytes::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Unavailable(_)));
    }
}
