#![deny(unused, dead_code)]
#![deny(clippy::all, clippy::pedantic)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: some functions are inherently complex
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
// Documentation style: many terms don't need backticks
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// API ergonomics: prefer simplicity over must_use annotations
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]
// Passing style
#![allow(clippy::needless_pass_by_value)]
// Numeric casts: intentional in gauge reporting
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
// Control flow style
#![allow(clippy::single_match_else)]
#![allow(clippy::match_same_arms)]
// Option/Result patterns
#![allow(clippy::option_if_let_else)]
#![allow(clippy::map_unwrap_or)]
// Explicit returns
#![allow(clippy::semicolon_if_nothing_returned)]
// Large types
#![allow(clippy::large_enum_variant)]
// Async functions kept async for seam uniformity
#![allow(clippy::unused_async)]

//! Clustered session and RPC fabric for realtime, stateful game backends.
//!
//! A fleet of heterogeneous servers shares a coherent view of each
//! logged-in user's session: which frontend owns the socket, which
//! backends the user is bound to, and when the session appears, mutates,
//! or disappears. The crate provides the broker-mediated RPC transport
//! between peers, the replicated session-binding protocol, targeted
//! per-user push/kick channels, and discovery-driven topology awareness.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Configuration parsing and validation
//! - `core::telemetry` - Tracing setup with reloadable levels
//! - `core::time` - Deterministic time utilities
//! - `core::workers` - Per-user ordered worker shards
//!
//! ## Cluster
//! - `cluster::subjects` - Broker subject naming
//! - `cluster::discovery` - Server identity and topology
//! - `cluster::rpc_server` - Inbound engine: subscriptions, demux, dispatch
//! - `cluster::rpc_client` - Outbound requests, notifies, user push/kick
//!
//! ## Protocol
//! - `protocol` - Wire records and binary encoding
//! - `protocol::routes` - System route table
//!
//! ## Session
//! - `session` - Session entity, pool, lifecycle
//! - `session::cache` - Cluster cache seam and binding record
//!
//! ## Service
//! - `service::remote` - Outbound dispatch primitives, listener registry
//! - `service::sys` - Binding state machine and remote handlers
//!
//! ## Broker
//! - `broker` - Broker seam
//! - `broker::memory` - In-process broker
//!
//! ## Operations
//! - `ops::metrics` - Metrics sink seam

// Core infrastructure
pub mod core;

// Broker seam
pub mod broker;

// Cluster fabric
pub mod cluster;

// Wire protocol
pub mod protocol;

// Sessions
pub mod session;

// Services
pub mod service;

// Operations
pub mod ops;

// Re-exports for convenience
pub use self::core::{config, telemetry, time, workers};
pub use broker::memory::MemoryBroker;
pub use broker::Broker;
pub use cluster::{subjects, Error, FabricHandler, RpcClient, RpcServer, Server};
pub use cluster::{ServiceDiscovery, StaticDiscovery};
pub use ops::metrics;
pub use protocol::routes;
pub use service::{RemoteListener, RemoteService, Sys};
pub use session::{CloseReason, Session, SessionLifecycle, SessionPool, SessionState};
