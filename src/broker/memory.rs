//! In-process broker.
//!
//! One `Hub` carries the full subject table; every [`MemoryBroker`] handle
//! attached to it is a "connection". `mem://<name>` urls resolve to a
//! process-wide named hub so independently constructed servers can share a
//! fabric, which is also how the integration tests stand up a cluster.

use super::{Broker, BrokerError, BrokerMessage, Subscription};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

const MEM_SCHEME: &str = "mem://";

static HUBS: OnceLock<Mutex<HashMap<String, Arc<Hub>>>> = OnceLock::new();

fn hub_registry() -> &'static Mutex<HashMap<String, Arc<Hub>>> {
    HUBS.get_or_init(|| Mutex::new(HashMap::new()))
}

struct SubEntry {
    group: Option<String>,
    delivery: mpsc::Sender<BrokerMessage>,
    handle: Subscription,
}

struct Hub {
    subs: RwLock<HashMap<String, Vec<SubEntry>>>,
    /// Round-robin cursor per (subject, group).
    cursors: Mutex<HashMap<(String, String), usize>>,
    reply_seq: AtomicU64,
}

impl Hub {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            subs: RwLock::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
            reply_seq: AtomicU64::new(0),
        })
    }

    fn add(&self, subject: &str, group: Option<&str>, delivery: mpsc::Sender<BrokerMessage>) -> Subscription {
        let handle = Subscription::new(subject.to_string());
        self.subs
            .write()
            .entry(subject.to_string())
            .or_default()
            .push(SubEntry {
                group: group.map(str::to_string),
                delivery,
                handle: handle.clone(),
            });
        handle
    }

    /// Deliver to all plain subscribers and one subscriber per queue group.
    /// Returns the number of subscribers the message was offered to.
    fn deliver(&self, subject: &str, payload: &Bytes, reply: Option<&str>) -> usize {
        self.prune(subject);
        let subs = self.subs.read();
        let Some(entries) = subs.get(subject) else {
            return 0;
        };
        let message = |payload: &Bytes| BrokerMessage {
            subject: subject.to_string(),
            payload: payload.clone(),
            reply: reply.map(str::to_string),
        };

        let mut offered = 0;
        let mut groups: HashMap<&str, Vec<&SubEntry>> = HashMap::new();
        for entry in entries.iter().filter(|e| e.handle.is_active()) {
            match &entry.group {
                None => {
                    offered += 1;
                    offer(entry, message(payload));
                }
                Some(group) => groups.entry(group.as_str()).or_default().push(entry),
            }
        }
        for (group, members) in groups {
            let key = (subject.to_string(), group.to_string());
            let mut cursors = self.cursors.lock();
            let cursor = cursors.entry(key).or_insert(0);
            let chosen: &SubEntry = members[*cursor % members.len()];
            *cursor = cursor.wrapping_add(1);
            drop(cursors);
            offered += 1;
            offer(chosen, message(payload));
        }
        offered
    }

    fn prune(&self, subject: &str) {
        let needs_prune = {
            let subs = self.subs.read();
            subs.get(subject)
                .is_some_and(|entries| entries.iter().any(|e| !e.handle.is_active() || e.delivery.is_closed()))
        };
        if needs_prune {
            let mut subs = self.subs.write();
            if let Some(entries) = subs.get_mut(subject) {
                entries.retain(|e| e.handle.is_active() && !e.delivery.is_closed());
                if entries.is_empty() {
                    subs.remove(subject);
                }
            }
        }
    }
}

/// Full-buffer deliveries are dropped and counted, mirroring a slow
/// consumer at a real broker.
fn offer(entry: &SubEntry, message: BrokerMessage) {
    match entry.delivery.try_send(message) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            entry.handle.count_drop();
            tracing::debug!(subject = entry.handle.subject(), "dropping message for slow subscriber");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => entry.handle.unsubscribe(),
    }
}

/// Handle onto a shared in-process hub.
#[derive(Clone)]
pub struct MemoryBroker {
    hub: Arc<Hub>,
    connected_tx: Arc<watch::Sender<bool>>,
    connected_rx: watch::Receiver<bool>,
    reconnect_fails: Arc<AtomicBool>,
}

impl MemoryBroker {
    /// New broker on a private hub.
    pub fn new() -> Self {
        Self::attach(Hub::new())
    }

    /// Resolve a `mem://<name>` url to the process-wide named hub.
    pub fn connect(url: &str) -> Result<Self, BrokerError> {
        let name = url
            .strip_prefix(MEM_SCHEME)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| BrokerError::InvalidUrl(url.to_string()))?;
        let hub = hub_registry()
            .lock()
            .entry(name.to_string())
            .or_insert_with(Hub::new)
            .clone();
        Ok(Self::attach(hub))
    }

    /// Another connection to the same hub.
    pub fn client(&self) -> Self {
        Self::attach(self.hub.clone())
    }

    fn attach(hub: Arc<Hub>) -> Self {
        let (connected_tx, connected_rx) = watch::channel(true);
        Self {
            hub,
            connected_tx: Arc::new(connected_tx),
            connected_rx,
            reconnect_fails: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if *self.connected_rx.borrow() {
            Ok(())
        } else {
            Err(BrokerError::ConnectionClosed)
        }
    }

    /// Test hook: simulate a dropped connection.
    pub fn set_connected(&self, connected: bool) {
        let _ = self.connected_tx.send(connected);
    }

    /// Test hook: make subsequent reconnect attempts fail.
    pub fn set_reconnect_fails(&self, fails: bool) {
        self.reconnect_fails.store(fails, Ordering::Relaxed);
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        self.hub.deliver(subject, &payload, None);
        Ok(())
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, BrokerError> {
        self.ensure_connected()?;
        let reply_subject = format!(
            "_reply.{}",
            self.hub.reply_seq.fetch_add(1, Ordering::Relaxed)
        );
        let (tx, mut rx) = mpsc::channel(1);
        let reply_sub = self.hub.add(&reply_subject, None, tx);
        let offered = self.hub.deliver(subject, &payload, Some(&reply_subject));
        if offered == 0 {
            reply_sub.unsubscribe();
            self.hub.prune(&reply_subject);
            return Err(BrokerError::NoResponders(subject.to_string()));
        }
        let outcome = tokio::time::timeout(timeout, rx.recv()).await;
        reply_sub.unsubscribe();
        self.hub.prune(&reply_subject);
        match outcome {
            Ok(Some(message)) => Ok(message.payload),
            Ok(None) => Err(BrokerError::ConnectionClosed),
            Err(_) => Err(BrokerError::RequestTimeout),
        }
    }

    async fn subscribe(
        &self,
        subject: &str,
        group: Option<&str>,
        delivery: mpsc::Sender<BrokerMessage>,
    ) -> Result<Subscription, BrokerError> {
        self.ensure_connected()?;
        Ok(self.hub.add(subject, group, delivery))
    }

    fn health(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    async fn reconnect(&self) -> Result<(), BrokerError> {
        if self.reconnect_fails.load(Ordering::Relaxed) {
            return Err(BrokerError::ConnectionClosed);
        }
        self.set_connected(true);
        Ok(())
    }

    async fn drain(&self) {
        self.set_connected(false);
    }
}
