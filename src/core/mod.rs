//! Core infrastructure.
//!
//! - `config` - Configuration parsing and validation
//! - `telemetry` - Tracing setup with reloadable levels
//! - `time` - Deterministic time utilities
//! - `workers` - Per-user ordered worker shards

pub mod config;
pub mod telemetry;
pub mod time;
pub mod workers;

pub use config::*;
pub use time::*;
pub use workers::*;
