//! Broker subject naming.
//!
//! Every cross-server conversation happens on one of these subjects. The
//! functions are pure and total: the same inputs always yield the same
//! subject, and no connection state is consulted. Peer implementations
//! depend on these exact strings, so changes here are wire-breaking.

/// Service name segment used for application publish topics.
pub const PUBLISH_SERVICE: &str = "publish";

/// Subject addressed to a single server instance.
pub fn server_subject(server_type: &str, server_id: &str) -> String {
    format!("pitaya/servers/{server_type}/{server_id}")
}

/// Fork subject: every instance of `server_type` receives (no queue group).
pub fn fork_subject(server_type: &str) -> String {
    format!("pitaya.fork.{server_type}")
}

/// Subject on which session bind events are broadcast to a server type.
pub fn bindings_subject(server_type: &str) -> String {
    format!("pitaya/{server_type}/bindings")
}

/// Per-user push subject, subscribed by the owning frontend while bound.
pub fn user_messages_subject(uid: &str, server_type: &str) -> String {
    format!("pitaya/{server_type}/user/{uid}/push")
}

/// Per-user kick subject, subscribed by the owning frontend while bound.
pub fn user_kick_subject(uid: &str, server_type: &str) -> String {
    format!("pitaya/{server_type}/user/{uid}/kick")
}

/// Application publish topic under the shared publish namespace.
pub fn publish_subject(topic: &str) -> String {
    format!("pitaya.{PUBLISH_SERVICE}.{topic}")
}
