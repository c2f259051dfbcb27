//! Process-local session index and lifecycle registry.

use super::cache::ClusterCache;
use super::entity::Session;
use super::CloseReason;
use crate::cluster::Error;
use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle hooks driven by session operations. The fabric's system layer
/// registers the binding state machine here; the RPC engine registers the
/// user-subject subscription step. Hooks run in registration order and a
/// bind succeeds only if every hook does.
#[async_trait::async_trait]
pub trait SessionLifecycle: Send + Sync + 'static {
    async fn on_session_bind(
        &self,
        _session: &Session,
        _metadata: &HashMap<String, String>,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn on_session_close(
        &self,
        _session: &Session,
        _metadata: &HashMap<String, String>,
        _reason: CloseReason,
    ) {
    }

    async fn on_bind_backend(
        &self,
        _session: &Session,
        _server_type: &str,
        _server_id: &str,
        _metadata: &HashMap<String, String>,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn on_kick_backend(
        &self,
        _session: &Session,
        _server_type: &str,
        _server_id: &str,
        _metadata: &HashMap<String, String>,
        _reason: CloseReason,
    ) -> Result<(), Error> {
        Ok(())
    }
}

pub(crate) struct PoolShared {
    next_id: AtomicI64,
    by_id: RwLock<HashMap<i64, Session>>,
    by_uid: RwLock<HashMap<String, Session>>,
    lifecycles: RwLock<Vec<Arc<dyn SessionLifecycle>>>,
    cache: Arc<dyn ClusterCache>,
    cache_ttl: Duration,
}

impl PoolShared {
    pub(crate) fn lifecycles(&self) -> Vec<Arc<dyn SessionLifecycle>> {
        self.lifecycles.read().clone()
    }

    pub(crate) fn register_uid(&self, uid: &str, session: &Session) -> Result<(), Error> {
        match self.by_uid.write().entry(uid.to_string()) {
            Entry::Occupied(_) => Err(Error::SessionAlreadyBound),
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
                Ok(())
            }
        }
    }

    /// Remove a uid mapping, but only if it still points at `session_id`;
    /// a rebind may already have installed a newer session.
    pub(crate) fn unregister_uid(&self, uid: &str, session_id: i64) {
        let mut by_uid = self.by_uid.write();
        if by_uid.get(uid).is_some_and(|s| s.id() == session_id) {
            by_uid.remove(uid);
        }
    }

    pub(crate) fn remove(&self, session_id: i64, uid: &str) {
        self.by_id.write().remove(&session_id);
        if !uid.is_empty() {
            self.unregister_uid(uid, session_id);
        }
    }
}

/// Index of live sessions by internal id and by user id.
#[derive(Clone)]
pub struct SessionPool {
    shared: Arc<PoolShared>,
}

impl SessionPool {
    pub fn new(cache: Arc<dyn ClusterCache>, cache_ttl: Duration) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                next_id: AtomicI64::new(0),
                by_id: RwLock::new(HashMap::new()),
                by_uid: RwLock::new(HashMap::new()),
                lifecycles: RwLock::new(Vec::new()),
                cache,
                cache_ttl,
            }),
        }
    }

    /// New session with a process-unique monotonic id, indexed by id.
    pub fn create_session(&self) -> Session {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let session = Session::new(
            id,
            Arc::downgrade(&self.shared),
            self.shared.cache.clone(),
            self.shared.cache_ttl,
        );
        self.shared.by_id.write().insert(id, session.clone());
        session
    }

    pub fn session_by_id(&self, id: i64) -> Option<Session> {
        self.shared.by_id.read().get(&id).cloned()
    }

    pub fn session_by_uid(&self, uid: &str) -> Option<Session> {
        self.shared.by_uid.read().get(uid).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.shared.by_id.read().len()
    }

    pub fn add_lifecycle(&self, lifecycle: Arc<dyn SessionLifecycle>) {
        self.shared.lifecycles.write().push(lifecycle);
    }

    /// Index a backend-side session under its uid. Fails if the uid is
    /// already stored, which is the backend double-bind guard.
    pub fn store_session_local(&self, session: &Session) -> Result<(), Error> {
        let uid = session.uid();
        if uid.is_empty() {
            return Err(Error::IllegalUid);
        }
        self.shared.register_uid(&uid, session)?;
        self.shared.by_id.write().insert(session.id(), session.clone());
        Ok(())
    }

    /// Drop a session from both indexes.
    pub fn remove_session_local(&self, session: &Session) {
        self.shared.remove(session.id(), &session.uid());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::ManualClock;
    use crate::session::cache::MemoryCache;

    fn pool() -> SessionPool {
        SessionPool::new(
            Arc::new(MemoryCache::new(ManualClock::new())),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn ids_are_monotonic_and_unique() {
        let p = pool();
        let a = p.create_session();
        let b = p.create_session();
        assert!(b.id() > a.id());
        assert_eq!(p.session_count(), 2);
        assert_eq!(p.session_by_id(a.id()).unwrap().id(), a.id());
    }

    #[test]
    fn store_session_local_guards_double_bind() {
        let p = pool();
        let first = p.create_session();
        first.set_uid("u1").unwrap();
        p.store_session_local(&first).unwrap();

        let second = p.create_session();
        second.set_uid("u1").unwrap();
        assert!(matches!(
            p.store_session_local(&second).unwrap_err(),
            Error::SessionAlreadyBound
        ));

        p.remove_session_local(&first);
        assert!(p.session_by_uid("u1").is_none());
        assert!(p.store_session_local(&second).is_ok());
    }

    #[test]
    fn unregister_ignores_stale_mapping() {
        let p = pool();
        let old = p.create_session();
        old.set_uid("u1").unwrap();
        p.store_session_local(&old).unwrap();

        // A rebind replaces the mapping before the old session is removed.
        p.shared.unregister_uid("u1", old.id());
        let newer = p.create_session();
        newer.set_uid("u1").unwrap();
        p.store_session_local(&newer).unwrap();
        p.shared.unregister_uid("u1", old.id());
        assert_eq!(p.session_by_uid("u1").unwrap().id(), newer.id());
    }
}
