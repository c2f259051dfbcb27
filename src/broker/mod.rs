//! Message broker seam.
//!
//! The fabric talks subject-based pub/sub with queue groups and
//! request/reply. Subscriptions deliver into caller-owned bounded channels;
//! when a delivery channel is full the message is dropped and counted on
//! the subscription handle, which the engine polls for drop accounting.

pub mod memory;

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("invalid broker url {0}")]
    InvalidUrl(String),
    #[error("broker connection closed")]
    ConnectionClosed,
    #[error("no responders on {0}")]
    NoResponders(String),
    #[error("request timed out")]
    RequestTimeout,
}

/// Raw message delivered by the broker.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub subject: String,
    pub payload: Bytes,
    /// Reply subject for request/reply calls; absent on notify publishes.
    pub reply: Option<String>,
}

/// Handle for an established subscription. Cheap to clone; all clones
/// observe the same drop counter and active flag.
#[derive(Debug, Clone)]
pub struct Subscription {
    subject: String,
    dropped: Arc<AtomicU64>,
    active: Arc<AtomicBool>,
}

impl Subscription {
    pub(crate) fn new(subject: String) -> Self {
        Self {
            subject,
            dropped: Arc::new(AtomicU64::new(0)),
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Messages dropped because the delivery channel was full. Monotonic.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn count_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Stop delivery. Idempotent; the broker prunes the entry lazily.
    pub fn unsubscribe(&self) {
        self.active.store(false, Ordering::Relaxed);
    }
}

/// Broker client surface used by the fabric.
#[async_trait::async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Fire-and-forget publish.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Request/reply: publishes with a per-call reply subject and awaits
    /// the first response.
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, BrokerError>;

    /// Subscribe `delivery` to a subject. With `group`, the broker delivers
    /// each message to exactly one subscriber in the group; without, every
    /// subscriber receives it.
    async fn subscribe(
        &self,
        subject: &str,
        group: Option<&str>,
        delivery: mpsc::Sender<BrokerMessage>,
    ) -> Result<Subscription, BrokerError>;

    /// Connection health; flips false on disconnect.
    fn health(&self) -> watch::Receiver<bool>;

    /// Attempt to re-establish a lost connection.
    async fn reconnect(&self) -> Result<(), BrokerError>;

    /// Flush and stop delivering. Used on shutdown.
    async fn drain(&self);
}
