//! Route strings for the system handler surface.
//!
//! A route is either a bare handler path (`session.bind`) or a handler path
//! prefixed with a destination server type (`room.session.bound`). The
//! prefix form is produced when fan-out needs to address one server type at
//! a time; receivers dispatch on the path alone.

use serde::{Deserialize, Serialize};

/// Frontend-local bind request forwarded from a backend.
pub const SESSION_BIND: &str = "session.bind";
/// Frontend-local session data update.
pub const SESSION_PUSH: &str = "session.push";
/// Frontend-local kick request.
pub const KICK: &str = "kick";
/// Backend bind request forwarded to the target backend.
pub const SESSION_BIND_BACKEND: &str = "session.bind.backend";
/// Backend kick request forwarded to the target backend.
pub const KICK_BACKEND: &str = "kick.backend";
/// Fork to every frontend instance of a type after a frontend bind.
pub const SESSION_BOUND_FORK: &str = "session.bound.fork";
/// Per-type notification after a frontend bind.
pub const SESSION_BOUND: &str = "session.bound";
/// Per-type notification after a session close.
pub const SESSION_CLOSED: &str = "session.closed";
/// Fork to every backend instance of a type after a backend bind.
pub const SESSION_BOUND_BACKEND_FORK: &str = "session.bound.backend.fork";
/// Per-type notification after a backend bind.
pub const SESSION_BOUND_BACKEND: &str = "session.bound.backend";
/// Per-type notification after a backend kick.
pub const SESSION_KICKED_BACKEND: &str = "session.kicked.backend";

/// Handler paths recognized by the decoder, longest first so that
/// `session.bound.backend.fork` wins over its own suffixes.
const KNOWN_PATHS: &[&str] = &[
    SESSION_BOUND_BACKEND_FORK,
    SESSION_BOUND_BACKEND,
    SESSION_KICKED_BACKEND,
    SESSION_BIND_BACKEND,
    SESSION_BOUND_FORK,
    SESSION_CLOSED,
    SESSION_BOUND,
    SESSION_PUSH,
    SESSION_BIND,
    KICK_BACKEND,
    KICK,
];

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("empty route")]
    Empty,
}

/// Decoded route: optional destination server type plus handler path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub server_type: Option<String>,
    pub path: String,
}

impl Route {
    pub fn new(path: &str) -> Self {
        Self {
            server_type: None,
            path: path.to_string(),
        }
    }

    pub fn typed(server_type: &str, path: &str) -> Self {
        Self {
            server_type: Some(server_type.to_string()),
            path: path.to_string(),
        }
    }

    /// Decode a raw route string. A leading `<type>.` prefix is recognized
    /// when the remainder is a known handler path; otherwise the whole
    /// string is the path.
    pub fn decode(raw: &str) -> Result<Self, RouteError> {
        if raw.is_empty() {
            return Err(RouteError::Empty);
        }
        for path in KNOWN_PATHS {
            if raw == *path {
                return Ok(Self::new(path));
            }
            if let Some(prefix) = raw.strip_suffix(path) {
                if let Some(server_type) = prefix.strip_suffix('.') {
                    if !server_type.is_empty() && !server_type.contains('.') {
                        return Ok(Self::typed(server_type, path));
                    }
                }
            }
        }
        Ok(Self::new(raw))
    }

    /// Rewrite the route for a specific destination server type.
    pub fn for_server_type(&self, server_type: &str) -> Self {
        Self::typed(server_type, &self.path)
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.server_type {
            Some(t) => write!(f, "{t}.{}", self.path),
            None => write!(f, "{}", self.path),
        }
    }
}
