use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Where the service publishes its listening port unless overridden.
pub const DEFAULT_DISCOVERY_FILE: &str = "/tmp/port_allocator";
/// Overrides [`DEFAULT_DISCOVERY_FILE`] for both the service and its clients.
pub const DISCOVERY_FILE_ENV: &str = "PORT_ALLOCATOR_FILE";
/// Comma separated list of ports the service hands out.
pub const PORTS_ENV: &str = "SPARK_PORTS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnState {
    Connecting,
    Connected,
    Disconnected,
}

impl ConnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnState::Connecting => "connecting",
            ConnState::Connected => "connected",
            ConnState::Disconnected => "disconnected",
        }
    }

    /// Whether a lease currently in `self` may move to `next`.
    /// Nothing leaves `Disconnected`.
    pub fn can_transition_to(self, next: ConnState) -> bool {
        matches!(
            (self, next),
            (ConnState::Connecting, ConnState::Connected)
                | (ConnState::Connecting, ConnState::Disconnected)
                | (ConnState::Connected, ConnState::Disconnected)
        )
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub process: u32,
    pub ports: Vec<u16>,
    pub status: ConnState,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    GetPort { process: u32, n: usize },
    SetStatus { process: u32, status: ConnState },
}

impl Request {
    pub fn process(&self) -> u32 {
        match self {
            Request::GetPort { process, .. } | Request::SetStatus { process, .. } => *process,
        }
    }
}

/// Reply to a [`Request`], encoded as `{"ok": ...}` or `{"error": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Ok(Payload),
    Error(ErrorKind),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Ports(Vec<u16>),
    Status(ConnState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NoPortsAvailable,
    GeneralError,
}

impl Reply {
    pub fn ports(ports: Vec<u16>) -> Self {
        Reply::Ok(Payload::Ports(ports))
    }

    pub fn status(status: ConnState) -> Self {
        Reply::Ok(Payload::Status(status))
    }

    pub fn error(kind: ErrorKind) -> Self {
        Reply::Error(kind)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub available: usize,
    pub leases: usize,
}

/// Discovery file location, honouring [`DISCOVERY_FILE_ENV`].
pub fn discovery_path() -> PathBuf {
    std::env::var_os(DISCOVERY_FILE_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DISCOVERY_FILE))
}

/// Publish the service port, replacing whatever the file held before.
pub fn write_discovery_file(path: &Path, port: u16) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, port.to_string())
}

pub fn read_discovery_file(path: &Path) -> io::Result<u16> {
    let contents = fs::read_to_string(path)?;
    contents.trim().parse::<u16>().map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{}: invalid port {:?}: {}", path.display(), contents.trim(), e),
        )
    })
}
