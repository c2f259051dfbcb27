//! Cluster fabric: topology, subjects, and the broker-facing RPC engine.

pub mod discovery;
pub mod rpc_client;
pub mod rpc_server;
pub mod subjects;

pub use discovery::{Server, ServiceDiscovery, StaticDiscovery};
pub use rpc_client::RpcClient;
pub use rpc_server::{FabricHandler, RpcServer};

use crate::broker::BrokerError;
use crate::protocol::WireError;
use crate::session::cache::CacheError;

/// Fabric error taxonomy. Config variants are fatal at startup; lookup and
/// binding-conflict variants surface to the remote caller as error-status
/// responses; transport variants retry at the broker layer before turning
/// terminal.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no broker connection string provided")]
    NoBrokerUrl,
    #[error("messages buffer size must be greater than zero")]
    MessagesBufferZero,
    #[error("push buffer size must be greater than zero")]
    PushBufferZero,
    #[error("session not found")]
    SessionNotFound,
    #[error("session is already bound")]
    SessionAlreadyBound,
    #[error("uid must not be empty")]
    IllegalUid,
    #[error("session is bound to a different uid")]
    SessionBoundMismatch,
    #[error("bind backend id does not match this server")]
    IllegalBindBackendId,
    #[error("topic already subscribed")]
    AlreadySubscribed,
    #[error("no server of type {0} available")]
    NoServerOfType(String),
    #[error("server {0} not found in discovery")]
    ServerNotFound(String),
    #[error("request timed out")]
    Timeout,
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("handler error: {0}")]
    Handler(String),
}

impl Error {
    /// Stable code carried inside error-status responses.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NoBrokerUrl => "PIT-NO-BROKER-URL",
            Error::MessagesBufferZero => "PIT-MSG-BUF-ZERO",
            Error::PushBufferZero => "PIT-PUSH-BUF-ZERO",
            Error::SessionNotFound => "PIT-404",
            Error::SessionAlreadyBound => "PIT-BOUND",
            Error::IllegalUid => "PIT-ILLEGAL-UID",
            Error::SessionBoundMismatch => "PIT-BOUND-MISMATCH",
            Error::IllegalBindBackendId => "PIT-ILLEGAL-BIND-ID",
            Error::AlreadySubscribed => "PIT-SUBSCRIBED",
            Error::NoServerOfType(_) => "PIT-NO-SERVER-TYPE",
            Error::ServerNotFound(_) => "PIT-NO-SERVER",
            Error::Timeout => "PIT-TIMEOUT",
            Error::Broker(_) => "PIT-TRANSPORT",
            Error::Wire(_) => "PIT-WIRE",
            Error::Cache(_) => "PIT-CACHE",
            Error::Handler(_) => "PIT-HANDLER",
        }
    }
}
