//! Outbound dispatch primitives and the system handler surface.

pub mod remote;
pub mod sys;

pub use remote::{RemoteListener, RemoteService};
pub use sys::Sys;
