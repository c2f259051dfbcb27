//! Operations and observability.
//!
//! - `metrics` - Metrics sink seam and gauge names

pub mod metrics;

pub use metrics::*;
