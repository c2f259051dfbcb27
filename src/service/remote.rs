//! Outbound dispatch primitives.
//!
//! `RemoteService` turns routed messages into broker publishes: unicast to
//! one server, one-per-type across the cluster, or a fork that every
//! instance of a type receives. It also owns the listener registry that
//! the system handlers notify on inbound events.

use crate::cluster::discovery::{Server, ServiceDiscovery};
use crate::cluster::rpc_client::RpcClient;
use crate::cluster::{subjects, Error};
use crate::protocol::routes::Route;
use crate::protocol::{self, Message, Request};
use crate::session::Session;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Cluster event capability set. Implementations subscribe to any subset
/// by overriding the methods they care about; the rest default to no-ops.
pub trait RemoteListener: Send + Sync + 'static {
    /// A frontend of our own type bound `uid` (fork path, synchronous).
    fn on_user_bind(&self, _uid: &str, _fid: &str) {}

    /// Some frontend in the cluster finished binding `uid`.
    fn on_user_bound(&self, _uid: &str, _fid: &str, _metadata: &HashMap<String, String>) {}

    /// A backend of our own type bound `uid` (fork path, synchronous).
    fn on_user_bind_backend(&self, _uid: &str, _server_type: &str, _server_id: &str) {}

    /// Some backend in the cluster finished binding `uid`.
    fn on_user_bound_backend(
        &self,
        _uid: &str,
        _server_type: &str,
        _server_id: &str,
        _metadata: &HashMap<String, String>,
    ) {
    }

    /// `uid`'s session closed on its frontend.
    fn on_user_disconnected(&self, _uid: &str, _metadata: &HashMap<String, String>) {}

    /// `uid` was unbound from a backend.
    fn on_user_unbound_backend(
        &self,
        _uid: &str,
        _server_type: &str,
        _server_id: &str,
        _metadata: &HashMap<String, String>,
    ) {
    }
}

pub struct RemoteService {
    server: Arc<Server>,
    discovery: Arc<dyn ServiceDiscovery>,
    client: Arc<RpcClient>,
    /// Written at init, read on the hot path; always cloned out before
    /// iteration so dispatch never holds the lock.
    listeners: RwLock<Vec<Arc<dyn RemoteListener>>>,
}

impl RemoteService {
    pub fn new(
        server: Arc<Server>,
        discovery: Arc<dyn ServiceDiscovery>,
        client: Arc<RpcClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            server,
            discovery,
            client,
            listeners: RwLock::new(Vec::new()),
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn RemoteListener>) {
        self.listeners.write().push(listener);
    }

    pub fn listeners(&self) -> Vec<Arc<dyn RemoteListener>> {
        self.listeners.read().clone()
    }

    fn build_request<M: Serialize>(
        &self,
        route: &Route,
        msg: &M,
        session: Option<&Session>,
    ) -> Result<Request, Error> {
        let data = protocol::encode(msg)?.to_vec();
        let mut request = Request::new(Message::notify(route.to_string(), data));
        if let Some(session) = session {
            request.frontend_id = session.frontend_id();
            request.session = Some(session.session_data());
        }
        Ok(request)
    }

    /// Fire-and-forget to one server. With an explicit `server_id` the
    /// target is that instance; with an empty id, one server of the
    /// route's type is chosen via discovery.
    pub async fn notify<M: Serialize>(
        &self,
        server_id: &str,
        route: &Route,
        msg: &M,
        session: Option<&Session>,
    ) -> Result<(), Error> {
        let target = if server_id.is_empty() {
            let server_type = route
                .server_type
                .as_deref()
                .ok_or_else(|| Error::NoServerOfType(String::new()))?;
            self.discovery
                .servers_by_type(server_type)
                .into_iter()
                .next()
                .ok_or_else(|| Error::NoServerOfType(server_type.to_string()))?
        } else {
            self.discovery
                .server_by_id(server_id)
                .ok_or_else(|| Error::ServerNotFound(server_id.to_string()))?
        };
        let request = self.build_request(route, msg, session)?;
        let subject = subjects::server_subject(&target.server_type, &target.id);
        self.client.send(&subject, &request).await
    }

    /// One notify per server type known to discovery, excluding our own
    /// type, each carrying the per-type route.
    pub async fn notify_all<M: Serialize>(
        &self,
        route: &Route,
        msg: &M,
        session: Option<&Session>,
    ) -> Result<(), Error> {
        for representative in self.discovery.server_types() {
            if representative.server_type == self.server.server_type {
                continue;
            }
            let typed = route.for_server_type(&representative.server_type);
            self.notify(&representative.id, &typed, msg, session).await?;
        }
        Ok(())
    }

    /// Publish so that every instance of the route's type receives. Routes
    /// without a type fork to our own type.
    pub async fn fork<M: Serialize>(
        &self,
        route: &Route,
        msg: &M,
        session: Option<&Session>,
    ) -> Result<(), Error> {
        let server_type = route
            .server_type
            .clone()
            .unwrap_or_else(|| self.server.server_type.clone());
        let request = self.build_request(route, msg, session)?;
        self.client
            .send(&subjects::fork_subject(&server_type), &request)
            .await
    }

    /// Announce a frontend bind on our type's bindings subject.
    pub async fn broadcast_session_bind(&self, uid: &str) -> Result<(), Error> {
        self.client.broadcast_session_bind(uid).await
    }
}
