//! Per-connection session state.
//!
//! A `Session` is created when a socket is accepted and is owned by the
//! [`SessionPool`](super::SessionPool); everything else holds either a
//! cheap clone for the duration of one handler or a [`WeakSession`] when
//! the reference may outlive the connection.

use super::cache::{binding_key, BindingRecord, ClusterCache};
use super::pool::PoolShared;
use super::{CloseReason, SessionState};
use crate::broker::Subscription;
use crate::cluster::Error;
use crate::protocol::{self, Push, SessionData};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

struct Core {
    uid: String,
    state: SessionState,
    frontend_id: String,
    frontend_session_id: i64,
    data: HashMap<String, String>,
    backends: HashMap<String, String>,
    subs: Vec<Subscription>,
    outbound_tx: Option<mpsc::Sender<Push>>,
}

pub(crate) struct Inner {
    id: i64,
    pool: Weak<PoolShared>,
    cache: Arc<dyn ClusterCache>,
    cache_ttl: Duration,
    core: RwLock<Core>,
}

/// Cheaply cloneable handle; all clones observe the same state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

/// Non-owning session reference for work that may outlive the connection.
#[derive(Clone)]
pub struct WeakSession {
    inner: Weak<Inner>,
}

impl WeakSession {
    pub fn upgrade(&self) -> Option<Session> {
        self.inner.upgrade().map(|inner| Session { inner })
    }
}

impl Session {
    pub(crate) fn new(
        id: i64,
        pool: Weak<PoolShared>,
        cache: Arc<dyn ClusterCache>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                pool,
                cache,
                cache_ttl,
                core: RwLock::new(Core {
                    uid: String::new(),
                    state: SessionState::Unbound,
                    frontend_id: String::new(),
                    frontend_session_id: 0,
                    data: HashMap::new(),
                    backends: HashMap::new(),
                    subs: Vec::new(),
                    outbound_tx: None,
                }),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn id(&self) -> i64 {
        self.inner.id
    }

    pub fn uid(&self) -> String {
        self.inner.core.read().uid.clone()
    }

    pub fn state(&self) -> SessionState {
        self.inner.core.read().state
    }

    pub fn is_bound(&self) -> bool {
        self.state() == SessionState::Bound
    }

    pub fn frontend_id(&self) -> String {
        self.inner.core.read().frontend_id.clone()
    }

    pub fn frontend_session_id(&self) -> i64 {
        self.inner.core.read().frontend_session_id
    }

    pub fn set_frontend_data(&self, frontend_id: &str, frontend_session_id: i64) {
        let mut core = self.inner.core.write();
        core.frontend_id = frontend_id.to_string();
        core.frontend_session_id = frontend_session_id;
    }

    /// Assign a uid without driving the bind protocol. Backend-side
    /// sessions receive their uid from the forwarded bind request.
    pub fn set_uid(&self, uid: &str) -> Result<(), Error> {
        if uid.is_empty() {
            return Err(Error::IllegalUid);
        }
        let mut core = self.inner.core.write();
        if core.state.is_terminal() {
            return Err(Error::SessionNotFound);
        }
        if !core.uid.is_empty() && core.uid != uid {
            return Err(Error::SessionBoundMismatch);
        }
        core.uid = uid.to_string();
        Ok(())
    }

    pub fn data(&self) -> HashMap<String, String> {
        self.inner.core.read().data.clone()
    }

    pub fn set_data(&self, data: HashMap<String, String>) {
        self.inner.core.write().data = data;
    }

    pub fn get_data(&self, key: &str) -> Option<String> {
        self.inner.core.read().data.get(key).cloned()
    }

    /// Encoded opaque user kv, as stored in the binding record.
    pub fn data_encoded(&self) -> Result<Bytes, Error> {
        Ok(protocol::encode(&self.inner.core.read().data)?)
    }

    pub fn set_data_encoded(&self, bytes: &[u8]) -> Result<(), Error> {
        if bytes.is_empty() {
            return Ok(());
        }
        let data: HashMap<String, String> = protocol::decode(bytes)?;
        self.inner.core.write().data = data;
        Ok(())
    }

    pub fn backends(&self) -> HashMap<String, String> {
        self.inner.core.read().backends.clone()
    }

    pub fn set_backend_binding(&self, server_type: &str, server_id: &str) {
        self.inner
            .core
            .write()
            .backends
            .insert(server_type.to_string(), server_id.to_string());
    }

    pub fn remove_backend_binding(&self, server_type: &str) {
        self.inner.core.write().backends.remove(server_type);
    }

    /// Identity snapshot carried with outbound requests.
    pub fn session_data(&self) -> SessionData {
        let core = self.inner.core.read();
        SessionData {
            id: self.inner.id,
            uid: core.uid.clone(),
            data: protocol::encode(&core.data).map(|b| b.to_vec()).unwrap_or_default(),
        }
    }

    /// Store the user-scoped broker subscriptions held while Bound.
    pub fn set_subscriptions(&self, subs: Vec<Subscription>) {
        self.inner.core.write().subs = subs;
    }

    /// Release every user-scoped subscription.
    pub fn release_subscriptions(&self) {
        let subs = std::mem::take(&mut self.inner.core.write().subs);
        for sub in subs {
            sub.unsubscribe();
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.core.read().subs.len()
    }

    /// Route a per-user push toward the connection's outbound channel.
    /// Returns false when no channel is attached or the channel is full.
    pub fn deliver_push(&self, push: Push) -> bool {
        let core = self.inner.core.read();
        match &core.outbound_tx {
            Some(tx) => tx.try_send(push).is_ok(),
            None => false,
        }
    }

    pub fn set_outbound(&self, tx: mpsc::Sender<Push>) {
        self.inner.core.write().outbound_tx = Some(tx);
    }

    pub(crate) fn mark_binding_remote(&self) {
        self.inner.core.write().state = SessionState::BindingRemote;
    }

    fn pool(&self) -> Result<Arc<PoolShared>, Error> {
        self.inner.pool.upgrade().ok_or(Error::SessionNotFound)
    }

    fn reset_to_unbound(&self) {
        let mut core = self.inner.core.write();
        core.uid = String::new();
        core.state = SessionState::Unbound;
        core.frontend_id = String::new();
        core.frontend_session_id = 0;
    }

    /// Drive the user-level bind. Succeeds only if every registered
    /// lifecycle step (including the cross-cluster ones) succeeds; on
    /// failure the session is returned to `Unbound` with its user-scoped
    /// subscriptions released.
    pub async fn bind(&self, uid: &str, metadata: &HashMap<String, String>) -> Result<(), Error> {
        if uid.is_empty() {
            return Err(Error::IllegalUid);
        }
        let pool = self.pool()?;
        {
            let mut core = self.inner.core.write();
            match core.state {
                SessionState::Unbound => {}
                SessionState::Closing | SessionState::Closed => {
                    return Err(Error::SessionNotFound)
                }
                _ => return Err(Error::SessionAlreadyBound),
            }
            if !core.uid.is_empty() && core.uid != uid {
                return Err(Error::SessionBoundMismatch);
            }
            core.uid = uid.to_string();
            core.state = SessionState::BindingLocal;
        }
        if let Err(err) = pool.register_uid(uid, self) {
            self.reset_to_unbound();
            return Err(err);
        }
        for lifecycle in pool.lifecycles() {
            if let Err(err) = lifecycle.on_session_bind(self, metadata).await {
                self.release_subscriptions();
                pool.unregister_uid(uid, self.inner.id);
                self.reset_to_unbound();
                return Err(err);
            }
        }
        self.inner.core.write().state = SessionState::Bound;
        Ok(())
    }

    /// Close the session. Idempotent; `Closed` is terminal.
    pub async fn close(&self, reason: CloseReason, metadata: &HashMap<String, String>) {
        let uid = {
            let mut core = self.inner.core.write();
            if matches!(core.state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            core.state = SessionState::Closing;
            core.uid.clone()
        };
        if let Ok(pool) = self.pool() {
            for lifecycle in pool.lifecycles() {
                lifecycle.on_session_close(self, metadata, reason).await;
            }
            pool.remove(self.inner.id, &uid);
        }
        self.release_subscriptions();
        self.inner.core.write().state = SessionState::Closed;
    }

    /// Kick the user off this session.
    pub async fn kick(&self, metadata: &HashMap<String, String>) -> Result<(), Error> {
        if self.state().is_terminal() {
            return Err(Error::SessionNotFound);
        }
        self.close(CloseReason::Kicked, metadata).await;
        Ok(())
    }

    /// Bind this user to a backend server. The target may be this process
    /// or a peer; the registered lifecycle decides.
    pub async fn bind_backend(
        &self,
        server_type: &str,
        server_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<(), Error> {
        let pool = self.pool()?;
        for lifecycle in pool.lifecycles() {
            lifecycle
                .on_bind_backend(self, server_type, server_id, metadata)
                .await?;
        }
        Ok(())
    }

    /// Remove this user's binding on a backend server.
    pub async fn kick_backend(
        &self,
        server_type: &str,
        server_id: &str,
        metadata: &HashMap<String, String>,
        reason: CloseReason,
    ) -> Result<(), Error> {
        let pool = self.pool()?;
        for lifecycle in pool.lifecycles() {
            lifecycle
                .on_kick_backend(self, server_type, server_id, metadata, reason)
                .await?;
        }
        Ok(())
    }

    /// Write this session's view into the cluster binding record,
    /// refreshing the TTL. Existing fields owned by other servers (a
    /// frontend's ownership when flushing from a backend, other backends'
    /// bindings) are preserved by merging onto the stored record.
    pub async fn flush_to_cluster(&self) -> Result<(), Error> {
        let (uid, local) = {
            let core = self.inner.core.read();
            (
                core.uid.clone(),
                BindingRecord {
                    frontend_id: core.frontend_id.clone(),
                    frontend_session_id: core.frontend_session_id,
                    backends: core.backends.clone(),
                    data: core.data.clone(),
                },
            )
        };
        if uid.is_empty() {
            return Err(Error::IllegalUid);
        }
        let key = binding_key(&uid);
        let mut record = match self.inner.cache.get(&key).await? {
            Some(bytes) => BindingRecord::decode(&bytes)?,
            None => BindingRecord::default(),
        };
        if !local.frontend_id.is_empty() {
            record.frontend_id = local.frontend_id;
            record.frontend_session_id = local.frontend_session_id;
        }
        record.backends.extend(local.backends);
        if !local.data.is_empty() {
            record.data = local.data;
        }
        self.inner
            .cache
            .put(&key, record.encode()?, self.inner.cache_ttl)
            .await?;
        Ok(())
    }

    /// Remove one backend binding from the cluster record, refreshing the
    /// TTL. Flush merges and therefore cannot express a deletion.
    pub async fn flush_backend_unbind(&self, server_type: &str) -> Result<(), Error> {
        let uid = self.uid();
        if uid.is_empty() {
            return Err(Error::IllegalUid);
        }
        let key = binding_key(&uid);
        let Some(bytes) = self.inner.cache.get(&key).await? else {
            return Ok(());
        };
        let mut record = BindingRecord::decode(&bytes)?;
        record.backends.remove(server_type);
        self.inner
            .cache
            .put(&key, record.encode()?, self.inner.cache_ttl)
            .await?;
        Ok(())
    }

    /// Load the authoritative binding record and merge it into local
    /// state: backend bindings set by other servers are adopted, and
    /// stored user data fills keys not set locally.
    pub async fn obtain_from_cluster(&self) -> Result<(), Error> {
        let uid = self.uid();
        if uid.is_empty() {
            return Err(Error::IllegalUid);
        }
        if let Some(bytes) = self.inner.cache.get(&binding_key(&uid)).await? {
            let record = BindingRecord::decode(&bytes)?;
            let mut core = self.inner.core.write();
            core.backends.extend(record.backends);
            for (key, value) in record.data {
                core.data.entry(key).or_insert(value);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::ManualClock;
    use crate::session::cache::MemoryCache;
    use crate::session::SessionPool;

    fn pool() -> SessionPool {
        pool_with_cache().0
    }

    fn pool_with_cache() -> (SessionPool, Arc<MemoryCache<ManualClock>>) {
        let cache = Arc::new(MemoryCache::new(ManualClock::new()));
        (
            SessionPool::new(cache.clone(), Duration::from_secs(60)),
            cache,
        )
    }

    #[tokio::test]
    async fn data_roundtrips_through_encoding() {
        let session = pool().create_session();
        let mut data = HashMap::new();
        data.insert("team".to_string(), "red".to_string());
        session.set_data(data);

        let encoded = session.data_encoded().unwrap();
        let other = pool().create_session();
        other.set_data_encoded(&encoded).unwrap();
        assert_eq!(other.get_data("team").as_deref(), Some("red"));
    }

    #[tokio::test]
    async fn flush_then_obtain_merges_remote_backends() {
        let p = pool();
        let session = p.create_session();
        session.set_uid("u1").unwrap();
        session.set_frontend_data("f1", session.id());
        session.flush_to_cluster().await.unwrap();

        // A backend elsewhere adds its own binding.
        let backend_side = p.create_session();
        backend_side.set_uid("u1").unwrap();
        backend_side.set_backend_binding("room", "r1");
        backend_side.flush_to_cluster().await.unwrap();

        session.obtain_from_cluster().await.unwrap();
        assert_eq!(session.backends().get("room").map(String::as_str), Some("r1"));
    }

    #[tokio::test]
    async fn backend_flush_preserves_frontend_ownership() {
        let (p, cache) = pool_with_cache();
        let front = p.create_session();
        front.set_uid("u1").unwrap();
        front.set_frontend_data("f1", front.id());
        front.flush_to_cluster().await.unwrap();

        let back = p.create_session();
        back.set_uid("u1").unwrap();
        back.set_backend_binding("room", "r1");
        back.flush_to_cluster().await.unwrap();

        let bytes = cache.get(&binding_key("u1")).await.unwrap().unwrap();
        let record = BindingRecord::decode(&bytes).unwrap();
        assert_eq!(record.frontend_id, "f1");
        assert_eq!(record.frontend_session_id, front.id());
        assert_eq!(record.backends.get("room").map(String::as_str), Some("r1"));
    }

    #[tokio::test]
    async fn backend_unbind_flush_removes_only_that_entry() {
        let (p, cache) = pool_with_cache();
        let session = p.create_session();
        session.set_uid("u1").unwrap();
        session.set_backend_binding("room", "r1");
        session.set_backend_binding("chat", "c1");
        session.flush_to_cluster().await.unwrap();

        session.flush_backend_unbind("room").await.unwrap();
        let bytes = cache.get(&binding_key("u1")).await.unwrap().unwrap();
        let record = BindingRecord::decode(&bytes).unwrap();
        assert!(record.backends.get("room").is_none());
        assert_eq!(record.backends.get("chat").map(String::as_str), Some("c1"));
    }

    #[tokio::test]
    async fn weak_reference_drops_with_session() {
        let p = pool();
        let weak = {
            let session = p.create_session();
            let weak = session.downgrade();
            assert!(weak.upgrade().is_some());
            p.remove_session_local(&session);
            weak
        };
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn set_uid_guards_mismatch() {
        let session = pool().create_session();
        session.set_uid("u1").unwrap();
        assert!(matches!(
            session.set_uid("u2").unwrap_err(),
            Error::SessionBoundMismatch
        ));
        assert!(session.set_uid("u1").is_ok());
    }
}
