//! Common test harness for integration tests.
//!
//! Stands up fabric nodes that share one in-process broker, one cluster
//! cache, and one discovery view, which is exactly the topology a real
//! deployment gets from its external collaborators.

// Not all test files use all helpers; silence dead_code warnings.
#![allow(dead_code)]

use parking_lot::Mutex;
use pitaya_cluster::config::RpcServerConfig;
use pitaya_cluster::session::cache::{ClusterCache, MemoryCache};
use pitaya_cluster::time::ManualClock;
use pitaya_cluster::workers::ShardedWorkers;
use pitaya_cluster::{
    MemoryBroker, RemoteListener, RemoteService, RpcClient, RpcServer, Server, SessionPool,
    StaticDiscovery, Sys,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Cluster event observed by a [`RecordingListener`].
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Bind {
        uid: String,
        fid: String,
    },
    Bound {
        uid: String,
        fid: String,
        metadata: HashMap<String, String>,
    },
    BindBackend {
        uid: String,
        server_type: String,
        server_id: String,
    },
    BoundBackend {
        uid: String,
        server_type: String,
        server_id: String,
    },
    Disconnected {
        uid: String,
        metadata: HashMap<String, String>,
    },
    UnboundBackend {
        uid: String,
        server_type: String,
        server_id: String,
    },
}

/// Listener that records every capability callback.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<Event>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }

    pub fn bind_count(&self, uid: &str) -> usize {
        self.count(|e| matches!(e, Event::Bind { uid: u, .. } if u == uid))
    }

    pub fn bound_count(&self, uid: &str) -> usize {
        self.count(|e| matches!(e, Event::Bound { uid: u, .. } if u == uid))
    }

    pub fn disconnected_count(&self, uid: &str) -> usize {
        self.count(|e| matches!(e, Event::Disconnected { uid: u, .. } if u == uid))
    }
}

impl RemoteListener for RecordingListener {
    fn on_user_bind(&self, uid: &str, fid: &str) {
        self.events.lock().push(Event::Bind {
            uid: uid.to_string(),
            fid: fid.to_string(),
        });
    }

    fn on_user_bound(&self, uid: &str, fid: &str, metadata: &HashMap<String, String>) {
        self.events.lock().push(Event::Bound {
            uid: uid.to_string(),
            fid: fid.to_string(),
            metadata: metadata.clone(),
        });
    }

    fn on_user_bind_backend(&self, uid: &str, server_type: &str, server_id: &str) {
        self.events.lock().push(Event::BindBackend {
            uid: uid.to_string(),
            server_type: server_type.to_string(),
            server_id: server_id.to_string(),
        });
    }

    fn on_user_bound_backend(
        &self,
        uid: &str,
        server_type: &str,
        server_id: &str,
        _metadata: &HashMap<String, String>,
    ) {
        self.events.lock().push(Event::BoundBackend {
            uid: uid.to_string(),
            server_type: server_type.to_string(),
            server_id: server_id.to_string(),
        });
    }

    fn on_user_disconnected(&self, uid: &str, metadata: &HashMap<String, String>) {
        self.events.lock().push(Event::Disconnected {
            uid: uid.to_string(),
            metadata: metadata.clone(),
        });
    }

    fn on_user_unbound_backend(
        &self,
        uid: &str,
        server_type: &str,
        server_id: &str,
        _metadata: &HashMap<String, String>,
    ) {
        self.events.lock().push(Event::UnboundBackend {
            uid: uid.to_string(),
            server_type: server_type.to_string(),
            server_id: server_id.to_string(),
        });
    }
}

/// One fabric node wired the way production wiring does it: engine first
/// (so user subjects subscribe before the bind fans out), then the system
/// layer as handler and lifecycle.
pub struct Node {
    pub server: Arc<Server>,
    pub pool: SessionPool,
    pub engine: RpcServer,
    pub remote: Arc<RemoteService>,
    pub sys: Arc<Sys>,
    pub listener: Arc<RecordingListener>,
    pub die_rx: mpsc::Receiver<()>,
}

/// Shared collaborators: broker, cache, discovery, clock.
pub struct Cluster {
    pub broker: MemoryBroker,
    pub cache: Arc<MemoryCache<ManualClock>>,
    pub clock: ManualClock,
    pub discovery: Arc<StaticDiscovery>,
}

impl Cluster {
    pub fn new() -> Self {
        let clock = ManualClock::new();
        Self {
            broker: MemoryBroker::new(),
            cache: Arc::new(MemoryCache::new(clock.clone())),
            clock,
            discovery: Arc::new(StaticDiscovery::new()),
        }
    }

    pub fn config() -> RpcServerConfig {
        RpcServerConfig {
            connect: "mem://cluster".into(),
            services: 8,
            request_timeout_ms: 1_000,
            ..RpcServerConfig::default()
        }
    }

    pub async fn spawn(&self, server: Arc<Server>) -> Node {
        self.spawn_with_config(server, Self::config()).await
    }

    pub async fn spawn_with_config(&self, server: Arc<Server>, config: RpcServerConfig) -> Node {
        self.discovery.add(server.clone());
        let cache: Arc<dyn ClusterCache> = self.cache.clone();
        let pool = SessionPool::new(cache, Duration::from_secs(300));
        let workers = Arc::new(ShardedWorkers::new(config.services, 64));
        let reporter = Arc::new(pitaya_cluster::metrics::AtomicReporter::new());
        let (die_tx, die_rx) = mpsc::channel(1);
        let request_timeout = config.request_timeout();
        let engine = RpcServer::new(
            config,
            server.clone(),
            pool.clone(),
            workers.clone(),
            reporter,
            die_tx,
        )
        .expect("engine config");
        engine
            .init(Arc::new(self.broker.client()))
            .await
            .expect("engine init");

        let client = Arc::new(RpcClient::new(
            Arc::new(self.broker.client()),
            server.clone(),
            request_timeout,
        ));
        let remote = RemoteService::new(server.clone(), self.discovery.clone(), client);
        let listener = Arc::new(RecordingListener::default());
        remote.add_listener(listener.clone());

        let sys = Sys::new(
            pool.clone(),
            server.clone(),
            self.discovery.clone(),
            remote.clone(),
            workers,
        );
        sys.clone().install();
        engine.set_handler(sys.clone());

        Node {
            server,
            pool,
            engine,
            remote,
            sys,
            listener,
            die_rx,
        }
    }
}

/// Poll until `cond` holds or a few seconds pass.
pub async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Let in-flight broker deliveries settle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
