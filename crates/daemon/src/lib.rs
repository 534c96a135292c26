//! Session port allocator service.
//!
//! One allocator per session owns a fixed pool of ports and leases them to
//! worker processes, reclaiming leases whose process died, disconnected or
//! never started listening.

pub mod allocator;
pub mod config;
pub mod error;
pub mod liveness;
pub mod registry;
pub mod server;

pub use config::Config;
pub use error::{ConfigError, DaemonError};
pub use liveness::{LivenessProbe, OsProbe};
