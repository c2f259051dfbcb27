//! Wire records exchanged between peer servers.
//!
//! Payloads travel binary-encoded over the broker. Request/reply pairs use
//! the transport's reply subject, which is stamped onto the decoded request
//! by the receiving engine rather than serialized with the payload.

pub mod routes;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque success payload for handlers that report failure via the error
/// channel rather than the body.
pub const ACK: &[u8] = b"ack";

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, WireError> {
    bincode::serialize(value)
        .map(Bytes::from)
        .map_err(|err| WireError::Encode(err.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    bincode::deserialize(bytes).map_err(|err| WireError::Decode(err.to_string()))
}

/// Message delivery kind. Notify messages never carry a reply subject and
/// never receive a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgKind {
    Request,
    Notify,
}

/// Routed message body inside a [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub route: String,
    pub data: Vec<u8>,
    pub kind: MsgKind,
    /// Reply subject, present only on the receiving side: the transport
    /// materializes it per call and the engine stamps it after decode.
    #[serde(skip)]
    pub reply: Option<String>,
}

impl Message {
    pub fn request(route: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            route: route.into(),
            data,
            kind: MsgKind::Request,
            reply: None,
        }
    }

    pub fn notify(route: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            route: route.into(),
            data,
            kind: MsgKind::Notify,
            reply: None,
        }
    }
}

/// Session identity snapshot carried with a request so the receiving engine
/// can schedule per-user work before any local session lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionData {
    pub id: i64,
    pub uid: String,
    pub data: Vec<u8>,
}

/// RPC envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub msg: Message,
    pub frontend_id: String,
    pub session: Option<SessionData>,
    pub metadata: HashMap<String, String>,
}

impl Request {
    pub fn new(msg: Message) -> Self {
        Self {
            msg,
            frontend_id: String::new(),
            session: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_session(mut self, session: SessionData) -> Self {
        self.session = Some(session);
        self
    }

    /// Uid used for per-user ordered scheduling; empty when unbound.
    pub fn uid(&self) -> &str {
        self.session.as_ref().map_or("", |s| s.uid.as_str())
    }
}

/// Error payload carried inside an error-status [`Response`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorStatus {
    pub code: String,
    pub message: String,
}

/// RPC response envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    pub data: Vec<u8>,
    pub error: Option<ErrorStatus>,
}

impl Response {
    pub fn ack() -> Self {
        Self {
            data: ACK.to_vec(),
            error: None,
        }
    }

    pub fn with_data(data: Vec<u8>) -> Self {
        Self { data, error: None }
    }

    pub fn from_error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            data: Vec::new(),
            error: Some(ErrorStatus {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Per-user message pushed to the frontend that owns the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Push {
    pub route: String,
    pub uid: String,
    pub data: Vec<u8>,
}

/// Kick notification; also the close fan-out payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KickMsg {
    pub user_id: String,
    pub metadata: HashMap<String, String>,
}

/// Reply to a kick request.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct KickAnswer {
    pub kicked: bool,
}

/// Frontend bind announcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindMsg {
    pub uid: String,
    /// Frontend server id that now owns the session.
    pub fid: String,
    /// Frontend session id.
    pub sid: i64,
    pub metadata: HashMap<String, String>,
}

/// Backend bind/unbind announcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindBackendMsg {
    pub uid: String,
    /// Backend server type being bound.
    pub btype: String,
    /// Backend server id being bound.
    pub bid: String,
    pub metadata: HashMap<String, String>,
}
