//! Broker-facing RPC engine.
//!
//! The engine owns this server's subscriptions and demultiplexes inbound
//! traffic into bounded channels. One worker drains the raw message
//! channel, accounts subscription drops, unmarshals requests, and stamps
//! the transport reply subject; one worker drains the decoded requests in
//! arrival order and hands each to a per-user shard. The single-threaded
//! pre-handoff stage is what turns broker subject ordering into the
//! per-user ordering guarantee, so neither stage may be widened.

use super::discovery::Server;
use super::subjects;
use super::Error;
use crate::broker::{Broker, BrokerMessage, Subscription};
use crate::core::config::RpcServerConfig;
use crate::core::workers::ShardedWorkers;
use crate::ops::metrics::{self, Reporter};
use crate::protocol::{self, BindMsg, KickMsg, MsgKind, Push, Request, Response};
use crate::session::{Session, SessionLifecycle, SessionPool};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Remote-callable surface the engine dispatches into.
#[async_trait::async_trait]
pub trait FabricHandler: Send + Sync + 'static {
    /// Routed request dispatch; the returned response is published to the
    /// request's reply subject for non-notify messages.
    async fn call(&self, request: Request) -> Result<Response, Error>;

    /// A peer frontend announced a bind on the bindings broadcast.
    async fn session_bind_remote(&self, msg: BindMsg);

    /// A per-user push arrived on this frontend's user subject.
    async fn push_to_user(&self, push: Push);

    /// A per-user kick arrived on this frontend's user subject.
    async fn kick_user(&self, kick: KickMsg) -> Result<bool, Error>;
}

#[derive(Default)]
struct PublishSubs {
    /// Registered before the broker connection exists; materialized at init.
    pending: HashMap<String, Option<String>>,
    live: HashMap<String, Subscription>,
}

/// Channel receivers handed to the worker loops exactly once, at init.
struct Receivers {
    sub: mpsc::Receiver<BrokerMessage>,
    bindings: mpsc::Receiver<BrokerMessage>,
    push: mpsc::Receiver<BrokerMessage>,
    kick: mpsc::Receiver<BrokerMessage>,
    unhandled: mpsc::Receiver<Request>,
}

struct Inner {
    config: RpcServerConfig,
    server: Arc<Server>,
    pool: SessionPool,
    reporter: Arc<dyn Reporter>,
    workers: Arc<ShardedWorkers>,
    die_tx: mpsc::Sender<()>,
    stop_tx: watch::Sender<bool>,

    broker: Mutex<Option<Arc<dyn Broker>>>,
    handler: Mutex<Option<Arc<dyn FabricHandler>>>,

    sub_tx: mpsc::Sender<BrokerMessage>,
    bindings_tx: mpsc::Sender<BrokerMessage>,
    push_tx: mpsc::Sender<BrokerMessage>,
    kick_tx: mpsc::Sender<BrokerMessage>,
    unhandled_tx: mpsc::Sender<Request>,

    receivers: Mutex<Option<Receivers>>,

    own_sub: Mutex<Option<Subscription>>,
    bindings_sub: Mutex<Option<Subscription>>,
    broadcast_subs: Mutex<Vec<Subscription>>,
    publish: tokio::sync::Mutex<PublishSubs>,
    dropped: AtomicU64,
}

/// Cheap-to-clone engine handle; clones share all state.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<Inner>,
}

impl RpcServer {
    /// Construct the engine. Fails fast on unusable configuration; no
    /// broker traffic happens until [`init`](Self::init).
    pub fn new(
        config: RpcServerConfig,
        server: Arc<Server>,
        pool: SessionPool,
        workers: Arc<ShardedWorkers>,
        reporter: Arc<dyn Reporter>,
        die_tx: mpsc::Sender<()>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let (stop_tx, _) = watch::channel(false);
        let (sub_tx, sub_rx) = mpsc::channel(config.buffer.messages);
        let (bindings_tx, bindings_rx) = mpsc::channel(config.buffer.messages);
        let (push_tx, push_rx) = mpsc::channel(config.buffer.push);
        let (kick_tx, kick_rx) = mpsc::channel(config.buffer.messages);
        // Rendezvous-sized handoff between the demultiplex and dispatch
        // stages; a bigger buffer here would hide backpressure without
        // adding throughput.
        let (unhandled_tx, unhandled_rx) = mpsc::channel(1);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                server,
                pool,
                reporter,
                workers,
                die_tx,
                stop_tx,
                broker: Mutex::new(None),
                handler: Mutex::new(None),
                sub_tx,
                bindings_tx,
                push_tx,
                kick_tx,
                unhandled_tx,
                receivers: Mutex::new(Some(Receivers {
                    sub: sub_rx,
                    bindings: bindings_rx,
                    push: push_rx,
                    kick: kick_rx,
                    unhandled: unhandled_rx,
                })),
                own_sub: Mutex::new(None),
                bindings_sub: Mutex::new(None),
                broadcast_subs: Mutex::new(Vec::new()),
                publish: tokio::sync::Mutex::new(PublishSubs::default()),
                dropped: AtomicU64::new(0),
            }),
        })
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.inner.server
    }

    /// Install the remote-callable surface. Must happen before traffic is
    /// expected; requests arriving earlier are dropped with an error log.
    pub fn set_handler(&self, handler: Arc<dyn FabricHandler>) {
        *self.inner.handler.lock() = Some(handler);
    }

    /// Connect the engine: establish the standing subscriptions,
    /// materialize pre-registered publish topics, and start the worker
    /// loops. Call once, inside a tokio runtime.
    pub async fn init(&self, broker: Arc<dyn Broker>) -> Result<(), Error> {
        let Some(receivers) = self.inner.receivers.lock().take() else {
            return Err(Error::Handler("rpc server already initialized".into()));
        };
        *self.inner.broker.lock() = Some(broker.clone());

        let own = broker
            .subscribe(
                &subjects::server_subject(&self.inner.server.server_type, &self.inner.server.id),
                None,
                self.inner.sub_tx.clone(),
            )
            .await?;
        *self.inner.own_sub.lock() = Some(own);

        // Every instance of our type receives forks: no queue group.
        let fork = broker
            .subscribe(
                &subjects::fork_subject(&self.inner.server.server_type),
                None,
                self.inner.sub_tx.clone(),
            )
            .await?;
        self.inner.broadcast_subs.lock().push(fork);

        let bindings = broker
            .subscribe(
                &subjects::bindings_subject(&self.inner.server.server_type),
                None,
                self.inner.bindings_tx.clone(),
            )
            .await?;
        *self.inner.bindings_sub.lock() = Some(bindings);

        {
            let mut publish = self.inner.publish.lock().await;
            let pending = std::mem::take(&mut publish.pending);
            for (topic, group) in pending {
                let sub = broker
                    .subscribe(&topic, group.as_deref(), self.inner.sub_tx.clone())
                    .await?;
                publish.live.insert(topic, sub);
            }
        }

        let this = self.clone();
        let stop = self.inner.stop_tx.subscribe();
        tokio::spawn(async move { this.handle_messages(receivers.sub, stop).await });

        let this = self.clone();
        let stop = self.inner.stop_tx.subscribe();
        tokio::spawn(async move { this.process_messages(receivers.unhandled, stop).await });

        let this = self.clone();
        let stop = self.inner.stop_tx.subscribe();
        tokio::spawn(async move { this.process_session_bindings(receivers.bindings, stop).await });

        let this = self.clone();
        let stop = self.inner.stop_tx.subscribe();
        tokio::spawn(async move { this.process_pushes(receivers.push, stop).await });

        let this = self.clone();
        let stop = self.inner.stop_tx.subscribe();
        tokio::spawn(async move { this.process_kicks(receivers.kick, stop).await });

        let this = self.clone();
        let stop = self.inner.stop_tx.subscribe();
        tokio::spawn(async move { this.supervise_connection(broker, stop).await });

        self.inner.pool.add_lifecycle(Arc::new(self.clone()));
        Ok(())
    }

    /// Register a publish-topic subscription. Before init the topic is
    /// queued and materialized on connect; after init it subscribes
    /// immediately. Re-registering an existing topic warns and keeps the
    /// original subscription.
    pub async fn subscribe_topic(&self, topic: &str, group: Option<&str>) -> Result<(), Error> {
        let full_topic = subjects::publish_subject(topic);
        let mut publish = self.inner.publish.lock().await;
        if publish.live.contains_key(&full_topic) || publish.pending.contains_key(&full_topic) {
            tracing::warn!(topic = %full_topic, "{}", Error::AlreadySubscribed);
            return Ok(());
        }
        let broker = self.inner.broker.lock().clone();
        match broker {
            None => {
                publish
                    .pending
                    .insert(full_topic, group.map(str::to_string));
            }
            Some(broker) => {
                let sub = broker
                    .subscribe(&full_topic, group, self.inner.sub_tx.clone())
                    .await?;
                publish.live.insert(full_topic, sub);
            }
        }
        Ok(())
    }

    /// Total dropped messages observed across subscriptions.
    pub fn dropped_total(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Stop the worker loops and release the standing subscriptions. The
    /// demultiplex loop drains the broker connection on its way out.
    pub fn shutdown(&self) {
        let _ = self.inner.stop_tx.send(true);
        if let Some(sub) = self.inner.own_sub.lock().as_ref() {
            sub.unsubscribe();
        }
        if let Some(sub) = self.inner.bindings_sub.lock().as_ref() {
            sub.unsubscribe();
        }
        for sub in self.inner.broadcast_subs.lock().iter() {
            sub.unsubscribe();
        }
    }

    fn broker_handle(&self) -> Option<Arc<dyn Broker>> {
        self.inner.broker.lock().clone()
    }

    fn handler_handle(&self) -> Option<Arc<dyn FabricHandler>> {
        self.inner.handler.lock().clone()
    }

    /// Demultiplex loop: decode, stamp the reply subject, forward in
    /// arrival order. Also the drop-accounting and channel-gauge site.
    async fn handle_messages(
        self,
        mut rx: mpsc::Receiver<BrokerMessage>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut max_pending = 0usize;
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    let Some(msg) = maybe else { break };
                    self.account_drops().await;
                    self.report_channel_gauges();
                    let pending =
                        self.inner.config.buffer.messages - self.inner.sub_tx.capacity();
                    max_pending = max_pending.max(pending);
                    tracing::debug!(pending, max_pending, "messages channel depth");
                    let mut request: Request = match protocol::decode(&msg.payload) {
                        Ok(request) => request,
                        Err(err) => {
                            tracing::error!(error = %err, subject = %msg.subject, "error unmarshalling rpc message");
                            continue;
                        }
                    };
                    request.msg.reply = msg.reply;
                    if self.inner.unhandled_tx.send(request).await.is_err() {
                        break;
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
        if let Some(broker) = self.broker_handle() {
            broker.drain().await;
        }
        tracing::debug!("rpc server message loop stopped");
    }

    /// Dispatch loop: single-threaded up to the per-user fan-out so the
    /// broker's subject ordering survives into the shard queues.
    async fn process_messages(
        self,
        mut rx: mpsc::Receiver<Request>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    let Some(request) = maybe else { break };
                    let session_id = request.session.as_ref().map_or(0, |s| s.id);
                    let uid = request.uid().to_string();
                    let this = self.clone();
                    let job = async move { this.run_handler(request).await };
                    if session_id != 0 {
                        self.inner.workers.dispatch_by_session(session_id, job).await;
                    } else {
                        self.inner.workers.dispatch_by_uid(&uid, job).await;
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn run_handler(self, request: Request) {
        let Some(handler) = self.handler_handle() else {
            tracing::error!("no handler registered, dropping request");
            return;
        };
        let kind = request.msg.kind;
        let route = request.msg.route.clone();
        let reply = request.msg.reply.clone();
        let outcome =
            tokio::time::timeout(self.inner.config.request_timeout(), handler.call(request)).await;
        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                tracing::info!(route = %route, error = %err, "rpc handler error");
                Response::from_error(err.code(), err.to_string())
            }
            Err(_) => {
                tracing::warn!(route = %route, "rpc handler cancelled by request timeout");
                Response::from_error(Error::Timeout.code(), Error::Timeout.to_string())
            }
        };
        if kind == MsgKind::Notify {
            return;
        }
        let Some(reply) = reply else {
            tracing::warn!(route = %route, "request without reply subject");
            return;
        };
        let payload = match protocol::encode(&response) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(route = %route, error = %err, "error marshalling response");
                return;
            }
        };
        if let Some(broker) = self.broker_handle() {
            if let Err(err) = broker.publish(&reply, payload).await {
                tracing::error!(route = %route, error = %err, "error sending message response");
            }
        }
    }

    async fn process_session_bindings(
        self,
        mut rx: mpsc::Receiver<BrokerMessage>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    let Some(msg) = maybe else { break };
                    let bind: BindMsg = match protocol::decode(&msg.payload) {
                        Ok(bind) => bind,
                        Err(err) => {
                            tracing::error!(error = %err, "error processing binding msg");
                            continue;
                        }
                    };
                    if let Some(handler) = self.handler_handle() {
                        handler.session_bind_remote(bind).await;
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn process_pushes(
        self,
        mut rx: mpsc::Receiver<BrokerMessage>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    let Some(msg) = maybe else { break };
                    let push: Push = match protocol::decode(&msg.payload) {
                        Ok(push) => push,
                        Err(err) => {
                            tracing::error!(error = %err, "error unmarshalling push");
                            continue;
                        }
                    };
                    tracing::debug!(
                        uid = %push.uid,
                        remaining = self.inner.push_tx.capacity(),
                        "received user push"
                    );
                    if let Some(handler) = self.handler_handle() {
                        handler.push_to_user(push).await;
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn process_kicks(
        self,
        mut rx: mpsc::Receiver<BrokerMessage>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    let Some(msg) = maybe else { break };
                    let kick: KickMsg = match protocol::decode(&msg.payload) {
                        Ok(kick) => kick,
                        Err(err) => {
                            tracing::error!(error = %err, "error unmarshalling kick");
                            continue;
                        }
                    };
                    if let Some(handler) = self.handler_handle() {
                        if let Err(err) = handler.kick_user(kick).await {
                            tracing::error!(error = %err, "error sending kick to user");
                        }
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Watch connection health; retry lost connections up to the
    /// configured count, then signal the process-wide die channel.
    async fn supervise_connection(
        self,
        broker: Arc<dyn Broker>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut health = broker.health();
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    if *stop.borrow() {
                        return;
                    }
                }
                changed = health.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if *health.borrow() {
                        continue;
                    }
                    tracing::warn!("broker connection lost, reconnecting");
                    let mut recovered = false;
                    for attempt in 1..=self.inner.config.max_reconnection_retries {
                        match tokio::time::timeout(
                            self.inner.config.connection_timeout(),
                            broker.reconnect(),
                        )
                        .await
                        {
                            Ok(Ok(())) => {
                                tracing::info!(attempt, "broker reconnected");
                                recovered = true;
                                break;
                            }
                            Ok(Err(err)) => {
                                tracing::warn!(attempt, error = %err, "broker reconnect failed");
                            }
                            Err(_) => {
                                tracing::warn!(attempt, "broker reconnect timed out");
                            }
                        }
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    }
                    if !recovered {
                        tracing::error!("broker connection terminally lost, signalling die channel");
                        let _ = self.inner.die_tx.send(()).await;
                        return;
                    }
                }
            }
        }
    }

    async fn account_drops(&self) {
        let mut total = 0;
        if let Some(sub) = self.inner.own_sub.lock().as_ref() {
            total += sub.dropped();
        }
        for sub in self.inner.broadcast_subs.lock().iter() {
            total += sub.dropped();
        }
        {
            let publish = self.inner.publish.lock().await;
            for sub in publish.live.values() {
                total += sub.dropped();
            }
        }
        let last = self.inner.dropped.load(Ordering::Relaxed);
        if total > last {
            tracing::warn!(
                dropped = total,
                delta = total - last,
                "rpc server dropped messages"
            );
            self.inner.dropped.store(total, Ordering::Relaxed);
        }
        self.inner.reporter.report_gauge(
            metrics::DROPPED_MESSAGES,
            HashMap::new(),
            self.inner.dropped.load(Ordering::Relaxed) as f64,
        );
    }

    fn report_channel_gauges(&self) {
        let gauges = [
            (metrics::SUB_CHANNEL, self.inner.sub_tx.capacity()),
            (metrics::BINDINGS_CHANNEL, self.inner.bindings_tx.capacity()),
            (metrics::USER_PUSH_CHANNEL, self.inner.push_tx.capacity()),
        ];
        for (channel, remaining) in gauges {
            if remaining == 0 {
                tracing::warn!(channel, "channel is at maximum capacity");
            }
            let mut labels = HashMap::new();
            labels.insert(metrics::CHANNEL_LABEL.to_string(), channel.to_string());
            self.inner
                .reporter
                .report_gauge(metrics::CHANNEL_CAPACITY, labels, remaining as f64);
        }
    }
}

/// The engine's part of the bind protocol: while a user is bound on a
/// frontend, its push and kick subjects are subscribed and the handles
/// live on the session.
#[async_trait::async_trait]
impl SessionLifecycle for RpcServer {
    async fn on_session_bind(
        &self,
        session: &Session,
        _metadata: &HashMap<String, String>,
    ) -> Result<(), Error> {
        if !self.inner.server.frontend {
            return Ok(());
        }
        let Some(broker) = self.broker_handle() else {
            return Err(Error::Broker(crate::broker::BrokerError::ConnectionClosed));
        };
        let uid = session.uid();
        let push_sub = broker
            .subscribe(
                &subjects::user_messages_subject(&uid, &self.inner.server.server_type),
                None,
                self.inner.push_tx.clone(),
            )
            .await?;
        let kick_sub = broker
            .subscribe(
                &subjects::user_kick_subject(&uid, &self.inner.server.server_type),
                None,
                self.inner.kick_tx.clone(),
            )
            .await?;
        session.set_subscriptions(vec![push_sub, kick_sub]);
        Ok(())
    }
}
