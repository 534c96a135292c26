use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid port {0:?} in port list")]
    InvalidPort(String),

    #[error("grace period must not be negative, got {0}s")]
    NegativeGrace(i64),
}

/// Failures that keep the service from starting.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("failed to write discovery file {}: {source}", path.display())]
    Discovery { path: PathBuf, source: io::Error },

    #[error("failed to start allocator thread: {0}")]
    Spawn(io::Error),
}
