//! System handler surface: the binding state machine and its remote entry
//! points.
//!
//! `Sys` plugs into the session pool as the lifecycle that drives the
//! cross-cluster side of every bind, close, backend-bind, and backend-kick
//! and, symmetrically, implements the remote-callable routes peers use to
//! deliver those events here. Handler results ride back as `"ack"` or an
//! error status; listener fan-in runs on per-uid worker shards so events
//! for one user are observed in arrival order.

use crate::cluster::discovery::{Server, ServiceDiscovery};
use crate::cluster::rpc_server::FabricHandler;
use crate::cluster::Error;
use crate::core::workers::ShardedWorkers;
use crate::protocol::routes::{self, Route};
use crate::protocol::{
    self, BindBackendMsg, BindMsg, KickAnswer, KickMsg, Push, Request, Response, SessionData,
};
use crate::service::remote::RemoteService;
use crate::session::{CloseReason, Session, SessionLifecycle, SessionPool};
use std::collections::HashMap;
use std::sync::Arc;

pub struct Sys {
    pool: SessionPool,
    server: Arc<Server>,
    discovery: Arc<dyn ServiceDiscovery>,
    remote: Arc<RemoteService>,
    workers: Arc<ShardedWorkers>,
}

impl Sys {
    pub fn new(
        pool: SessionPool,
        server: Arc<Server>,
        discovery: Arc<dyn ServiceDiscovery>,
        remote: Arc<RemoteService>,
        workers: Arc<ShardedWorkers>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            server,
            discovery,
            remote,
            workers,
        })
    }

    /// Register this instance as the pool's binding lifecycle. Call after
    /// the engine's lifecycle so user subjects are subscribed before the
    /// cluster learns about the bind.
    pub fn install(self: Arc<Self>) {
        let pool = self.pool.clone();
        pool.add_lifecycle(self);
    }

    async fn bind_session(&self, msg: BindMsg) -> Result<Response, Error> {
        let session = self
            .pool
            .session_by_id(msg.sid)
            .ok_or(Error::SessionNotFound)?;
        session.bind(&msg.uid, &msg.metadata).await?;
        Ok(Response::ack())
    }

    async fn push_session(&self, data: SessionData) -> Result<Response, Error> {
        let session = self
            .pool
            .session_by_id(data.id)
            .ok_or(Error::SessionNotFound)?;
        session.set_data_encoded(&data.data)?;
        Ok(Response::ack())
    }

    /// Always answers with a KickAnswer; a missing session reports
    /// `kicked: false` alongside the error status.
    async fn kick(&self, msg: KickMsg) -> Result<Response, Error> {
        let Some(session) = self.pool.session_by_uid(&msg.user_id) else {
            let mut response = Response::from_error(
                Error::SessionNotFound.code(),
                Error::SessionNotFound.to_string(),
            );
            response.data = protocol::encode(&KickAnswer { kicked: false })?.to_vec();
            return Ok(response);
        };
        session.kick(&msg.metadata).await?;
        Ok(Response::with_data(
            protocol::encode(&KickAnswer { kicked: true })?.to_vec(),
        ))
    }

    async fn bind_backend_session(&self, msg: BindBackendMsg) -> Result<Response, Error> {
        if msg.btype != self.server.server_type || msg.bid != self.server.id {
            tracing::error!(
                btype = %msg.btype,
                bid = %msg.bid,
                "{}",
                Error::IllegalBindBackendId
            );
            return Err(Error::IllegalBindBackendId);
        }
        let session = self.pool.create_session();
        session.set_uid(&msg.uid)?;
        if let Err(err) = session
            .bind_backend(&msg.btype, &msg.bid, &msg.metadata)
            .await
        {
            self.pool.remove_session_local(&session);
            return Err(err);
        }
        Ok(Response::ack())
    }

    async fn kick_backend(&self, msg: BindBackendMsg) -> Result<Response, Error> {
        let session = self
            .pool
            .session_by_uid(&msg.uid)
            .ok_or(Error::SessionNotFound)?;
        session
            .kick_backend(
                &msg.btype,
                &self.server.id,
                &msg.metadata,
                CloseReason::Kicked,
            )
            .await?;
        Ok(Response::ack())
    }

    async fn session_bound_fork(&self, msg: BindMsg) -> Result<Response, Error> {
        for listener in self.remote.listeners() {
            listener.on_user_bind(&msg.uid, &msg.fid);
        }
        Ok(Response::ack())
    }

    async fn session_bound(&self, msg: BindMsg) -> Result<Response, Error> {
        if let Some(session) = self.pool.session_by_uid(&msg.uid) {
            session.set_frontend_data(&msg.fid, msg.sid);
        }
        let uid = msg.uid.clone();
        for listener in self.remote.listeners() {
            let msg = msg.clone();
            self.workers
                .dispatch_by_uid(&uid, async move {
                    listener.on_user_bound(&msg.uid, &msg.fid, &msg.metadata);
                })
                .await;
        }
        Ok(Response::ack())
    }

    async fn session_closed(&self, msg: KickMsg) -> Result<Response, Error> {
        let uid = msg.user_id.clone();
        for listener in self.remote.listeners() {
            let msg = msg.clone();
            self.workers
                .dispatch_by_uid(&uid, async move {
                    listener.on_user_disconnected(&msg.user_id, &msg.metadata);
                })
                .await;
        }
        Ok(Response::ack())
    }

    async fn session_bound_backend_fork(&self, msg: BindBackendMsg) -> Result<Response, Error> {
        for listener in self.remote.listeners() {
            listener.on_user_bind_backend(&msg.uid, &msg.btype, &msg.bid);
        }
        Ok(Response::ack())
    }

    async fn session_bound_backend(&self, msg: BindBackendMsg) -> Result<Response, Error> {
        let uid = msg.uid.clone();
        for listener in self.remote.listeners() {
            let msg = msg.clone();
            self.workers
                .dispatch_by_uid(&uid, async move {
                    listener.on_user_bound_backend(&msg.uid, &msg.btype, &msg.bid, &msg.metadata);
                })
                .await;
        }
        Ok(Response::ack())
    }

    async fn session_kicked_backend(&self, msg: BindBackendMsg) -> Result<Response, Error> {
        let uid = msg.uid.clone();
        for listener in self.remote.listeners() {
            let msg = msg.clone();
            self.workers
                .dispatch_by_uid(&uid, async move {
                    listener.on_user_unbound_backend(&msg.uid, &msg.btype, &msg.bid, &msg.metadata);
                })
                .await;
        }
        Ok(Response::ack())
    }
}

#[async_trait::async_trait]
impl FabricHandler for Sys {
    async fn call(&self, request: Request) -> Result<Response, Error> {
        let route = Route::decode(&request.msg.route)
            .map_err(|err| Error::Handler(err.to_string()))?;
        let data = request.msg.data;
        match route.path.as_str() {
            routes::SESSION_BIND => self.bind_session(protocol::decode(&data)?).await,
            routes::SESSION_PUSH => self.push_session(protocol::decode(&data)?).await,
            routes::KICK => self.kick(protocol::decode(&data)?).await,
            routes::SESSION_BIND_BACKEND => {
                self.bind_backend_session(protocol::decode(&data)?).await
            }
            routes::KICK_BACKEND => self.kick_backend(protocol::decode(&data)?).await,
            routes::SESSION_BOUND_FORK => self.session_bound_fork(protocol::decode(&data)?).await,
            routes::SESSION_BOUND => self.session_bound(protocol::decode(&data)?).await,
            routes::SESSION_CLOSED => self.session_closed(protocol::decode(&data)?).await,
            routes::SESSION_BOUND_BACKEND_FORK => {
                self.session_bound_backend_fork(protocol::decode(&data)?).await
            }
            routes::SESSION_BOUND_BACKEND => {
                self.session_bound_backend(protocol::decode(&data)?).await
            }
            routes::SESSION_KICKED_BACKEND => {
                self.session_kicked_backend(protocol::decode(&data)?).await
            }
            other => Err(Error::Handler(format!("unhandled system route {other}"))),
        }
    }

    /// Bindings broadcast: a peer frontend of our type now owns `uid`. Any
    /// session still held locally for that uid belongs to the previous
    /// connection and is closed as a rebind, which suppresses the close
    /// fan-out.
    async fn session_bind_remote(&self, msg: BindMsg) {
        if msg.fid == self.server.id {
            return;
        }
        if let Some(stale) = self.pool.session_by_uid(&msg.uid) {
            tracing::debug!(uid = %msg.uid, new_frontend = %msg.fid, "rebinding stale session");
            stale.close(CloseReason::Rebind, &HashMap::new()).await;
        }
    }

    async fn push_to_user(&self, push: Push) {
        match self.pool.session_by_uid(&push.uid) {
            Some(session) => {
                if !session.deliver_push(push) {
                    tracing::warn!("push dropped, outbound channel unavailable");
                }
            }
            None => {
                tracing::debug!(uid = %push.uid, "push for user without local session");
            }
        }
    }

    async fn kick_user(&self, kick: KickMsg) -> Result<bool, Error> {
        let Some(session) = self.pool.session_by_uid(&kick.user_id) else {
            return Ok(false);
        };
        // The job holds a weak reference: if the session closes before the
        // shard runs the kick, it simply vanishes.
        let weak = session.downgrade();
        drop(session);
        let uid = kick.user_id.clone();
        self.workers
            .dispatch_by_uid(&uid, async move {
                if let Some(session) = weak.upgrade() {
                    let _ = session.kick(&kick.metadata).await;
                }
            })
            .await;
        Ok(true)
    }
}

#[async_trait::async_trait]
impl SessionLifecycle for Sys {
    /// Frontend bind driver: merge the authoritative record, take
    /// ownership, flush, then announce to the cluster. Any failure
    /// restores the snapshotted session data and surfaces the error;
    /// remote side effects already committed are not compensated, the next
    /// successful bind reconciles them.
    async fn on_session_bind(
        &self,
        session: &Session,
        metadata: &HashMap<String, String>,
    ) -> Result<(), Error> {
        if !self.server.frontend {
            return Ok(());
        }
        let snapshot = session.data_encoded()?;
        let result: Result<(), Error> = async {
            session.obtain_from_cluster().await?;
            session.set_frontend_data(&self.server.id, session.id());
            session.flush_to_cluster().await?;
            session.mark_binding_remote();
            self.remote.broadcast_session_bind(&session.uid()).await?;
            let msg = BindMsg {
                uid: session.uid(),
                fid: self.server.id.clone(),
                sid: session.id(),
                metadata: metadata.clone(),
            };
            let fork_route = Route::typed(&self.server.server_type, routes::SESSION_BOUND_FORK);
            self.remote.fork(&fork_route, &msg, Some(session)).await?;
            let bound_route = Route::new(routes::SESSION_BOUND);
            self.remote.notify_all(&bound_route, &msg, Some(session)).await?;
            Ok(())
        }
        .await;
        if let Err(err) = result {
            if let Err(restore_err) = session.set_data_encoded(&snapshot) {
                tracing::error!(error = %restore_err, "failed restoring session snapshot");
            }
            tracing::error!(
                sid = session.id(),
                uid = %session.uid(),
                error = %err,
                "session binding error"
            );
            return Err(err);
        }
        Ok(())
    }

    /// Close fan-out. Rebind closes stay silent; the frontend's binding
    /// record is intentionally kept so an immediate reattach finds it.
    async fn on_session_close(
        &self,
        session: &Session,
        metadata: &HashMap<String, String>,
        reason: CloseReason,
    ) {
        if !self.server.frontend {
            return;
        }
        if reason == CloseReason::Rebind {
            return;
        }
        // Never-bound sessions fan out too, with an empty user id.
        let uid = session.uid();
        let msg = KickMsg {
            user_id: uid.clone(),
            metadata: metadata.clone(),
        };
        let route = Route::new(routes::SESSION_CLOSED);
        if let Err(err) = self.remote.notify_all(&route, &msg, Some(session)).await {
            tracing::error!(
                sid = session.id(),
                uid = %uid,
                error = %err,
                "session on close error"
            );
        }
    }

    async fn on_bind_backend(
        &self,
        session: &Session,
        server_type: &str,
        server_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<(), Error> {
        let uid = session.uid();
        if uid.is_empty() {
            return Err(Error::IllegalUid);
        }
        let msg = BindBackendMsg {
            uid: uid.clone(),
            btype: server_type.to_string(),
            bid: server_id.to_string(),
            metadata: metadata.clone(),
        };
        if self.server.id == server_id {
            if self.pool.session_by_uid(&uid).is_some() {
                return Err(Error::SessionAlreadyBound);
            }
            self.pool.store_session_local(session)?;
            let result: Result<(), Error> = async {
                session.set_backend_binding(server_type, server_id);
                session.flush_to_cluster().await?;
                let fork_route =
                    Route::typed(&self.server.server_type, routes::SESSION_BOUND_BACKEND_FORK);
                self.remote.fork(&fork_route, &msg, Some(session)).await?;
                for representative in self.discovery.server_types() {
                    let route =
                        Route::typed(&representative.server_type, routes::SESSION_BOUND_BACKEND);
                    self.remote.notify("", &route, &msg, Some(session)).await?;
                }
                Ok(())
            }
            .await;
            if let Err(err) = result {
                self.pool.remove_session_local(session);
                session.remove_backend_binding(server_type);
                tracing::error!(
                    sid = session.id(),
                    uid = %uid,
                    error = %err,
                    "session binding backend error"
                );
                return Err(err);
            }
            Ok(())
        } else {
            let route = Route::new(routes::SESSION_BIND_BACKEND);
            self.remote.notify(server_id, &route, &msg, Some(session)).await
        }
    }

    async fn on_kick_backend(
        &self,
        session: &Session,
        server_type: &str,
        server_id: &str,
        metadata: &HashMap<String, String>,
        reason: CloseReason,
    ) -> Result<(), Error> {
        let uid = session.uid();
        let msg = BindBackendMsg {
            uid: uid.clone(),
            btype: server_type.to_string(),
            bid: server_id.to_string(),
            metadata: metadata.clone(),
        };
        if self.server.id == server_id {
            self.pool.remove_session_local(session);
            if reason == CloseReason::Rebind {
                return Ok(());
            }
            let result: Result<(), Error> = async {
                session.remove_backend_binding(server_type);
                session.flush_backend_unbind(server_type).await?;
                let route = Route::new(routes::SESSION_KICKED_BACKEND);
                self.remote.notify_all(&route, &msg, Some(session)).await?;
                Ok(())
            }
            .await;
            if let Err(err) = result {
                tracing::error!(
                    sid = session.id(),
                    uid = %uid,
                    error = %err,
                    "session kick backend error"
                );
                return Err(err);
            }
            Ok(())
        } else {
            let route = Route::new(routes::KICK_BACKEND);
            self.remote.notify(server_id, &route, &msg, Some(session)).await
        }
    }
}
