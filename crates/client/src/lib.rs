//! Client for the session port allocator.
//!
//! ```no_run
//! # async fn demo() -> Result<(), portalloc_client::ClientError> {
//! let mut client = portalloc_client::PortsAllocatorClient::new()?;
//! client.connect().await?;
//! let ports = client.get_ports(3).await?;
//! // ... bind the ports ...
//! client.set_connected().await?;
//! # Ok(())
//! # }
//! ```

use portalloc_common::{
    discovery_path, read_discovery_file, ConnState, ErrorKind, HealthResponse, Lease, Payload,
    Reply, Request,
};
use reqwest::Client;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ClientError {
    /// The pool is exhausted. Worth retrying once someone frees capacity.
    #[error("no ports available: close another session or wait and try again")]
    NoPorts,

    #[error("port allocator reported an error")]
    General,

    #[error("port allocator did not reply within {0:?}")]
    Timeout(Duration),

    #[error("not connected to the port allocator")]
    NotConnected,

    #[error("cannot read discovery file {}: {source}", path.display())]
    Discovery { path: PathBuf, source: io::Error },

    #[error("cannot reach port allocator: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("unexpected reply from port allocator: {0}")]
    InvalidReply(String),
}

/// Handle a worker process uses to lease ports from the session allocator.
///
/// Every request is tagged with the process id, so one client per process is
/// the expected use.
#[derive(Debug)]
pub struct PortsAllocatorClient {
    base_url: String,
    process: u32,
    connect_timeout: Duration,
    reply_timeout: Duration,
    http: Option<Client>,
}

impl PortsAllocatorClient {
    /// Find the allocator through the discovery file.
    pub fn new() -> Result<Self, ClientError> {
        Self::from_discovery_file(&discovery_path())
    }

    pub fn from_discovery_file(path: &Path) -> Result<Self, ClientError> {
        let port = read_discovery_file(path).map_err(|source| ClientError::Discovery {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::with_port(port))
    }

    pub fn with_port(port: u16) -> Self {
        Self {
            base_url: format!("http://127.0.0.1:{}", port),
            process: std::process::id(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            http: None,
        }
    }

    /// Lease on behalf of another process instead of the current one.
    pub fn with_process_id(mut self, process: u32) -> Self {
        self.process = process;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn process_id(&self) -> u32 {
        self.process
    }

    /// Open a fresh channel to the allocator and check that it answers.
    ///
    /// Safe to call again after any failure; the previous channel is
    /// discarded, never reused.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        self.http = None;

        let http = Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.reply_timeout)
            .build()
            .map_err(ClientError::Transport)?;

        let resp = http
            .get(self.url("/health"))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let health: HealthResponse = resp
            .error_for_status()
            .map_err(ClientError::Transport)?
            .json()
            .await
            .map_err(|e| self.transport_error(e))?;
        debug!(
            url = %self.base_url,
            available = health.available,
            leases = health.leases,
            "Connected to port allocator"
        );

        self.http = Some(http);
        Ok(())
    }

    /// Lease `n` ports for this process. Asking again returns the same ports.
    pub async fn get_ports(&self, n: usize) -> Result<Vec<u16>, ClientError> {
        let request = Request::GetPort {
            process: self.process,
            n,
        };
        match self.call(&request).await? {
            Reply::Ok(Payload::Ports(ports)) => {
                info!(process = self.process, ports = ?ports, "Received ports");
                Ok(ports)
            }
            Reply::Ok(other) => Err(ClientError::InvalidReply(format!("{:?}", other))),
            Reply::Error(kind) => Err(error_from_kind(kind)),
        }
    }

    /// Report that the leased ports are now in use.
    pub async fn set_connected(&self) -> Result<(), ClientError> {
        self.set_status(ConnState::Connected).await
    }

    /// Report that the leased ports can be handed to someone else.
    pub async fn set_disconnected(&self) -> Result<(), ClientError> {
        self.set_status(ConnState::Disconnected).await
    }

    pub async fn leases(&self) -> Result<Vec<Lease>, ClientError> {
        let http = self.http.as_ref().ok_or(ClientError::NotConnected)?;
        let resp = http
            .get(self.url("/list"))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        resp.error_for_status()
            .map_err(ClientError::Transport)?
            .json()
            .await
            .map_err(|e| self.transport_error(e))
    }

    async fn set_status(&self, status: ConnState) -> Result<(), ClientError> {
        let request = Request::SetStatus {
            process: self.process,
            status,
        };
        // Wait for the acknowledgement so the status is recorded before we return
        match self.call(&request).await? {
            Reply::Ok(_) => Ok(()),
            Reply::Error(kind) => Err(error_from_kind(kind)),
        }
    }

    async fn call(&self, request: &Request) -> Result<Reply, ClientError> {
        let http = self.http.as_ref().ok_or(ClientError::NotConnected)?;

        // Error replies carry a non-2xx status but still have a JSON body
        let resp = http
            .post(self.url("/request"))
            .json(request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let body = resp.bytes().await.map_err(|e| self.transport_error(e))?;

        serde_json::from_slice(&body).map_err(|e| ClientError::InvalidReply(e.to_string()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn transport_error(&self, e: reqwest::Error) -> ClientError {
        if e.is_timeout() && !e.is_connect() {
            ClientError::Timeout(self.reply_timeout)
        } else {
            ClientError::Transport(e)
        }
    }
}

fn error_from_kind(kind: ErrorKind) -> ClientError {
    match kind {
        ErrorKind::NoPortsAvailable => ClientError::NoPorts,
        ErrorKind::GeneralError => ClientError::General,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_missing_discovery_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("port_allocator");

        match PortsAllocatorClient::from_discovery_file(&path) {
            Err(ClientError::Discovery { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("expected discovery error, got {:?}", other),
        }
    }

    #[test]
    fn test_discovery_file_sets_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("port_allocator");
        std::fs::write(&path, "41000\n").unwrap();

        let client = PortsAllocatorClient::from_discovery_file(&path).unwrap();
        assert_eq!(client.url("/request"), "http://127.0.0.1:41000/request");
        assert_eq!(client.process_id(), std::process::id());
    }

    #[tokio::test]
    async fn test_requests_before_connect_fail() {
        let client = PortsAllocatorClient::with_port(1).with_process_id(5);
        assert!(matches!(client.get_ports(1).await, Err(ClientError::NotConnected)));
        assert!(matches!(client.set_connected().await, Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        // Grab a free port, then close it so nothing listens there
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client = PortsAllocatorClient::with_port(port);
        assert!(matches!(client.connect().await, Err(ClientError::Transport(_))));
    }

    #[tokio::test]
    async fn test_silent_allocator_times_out() {
        // Accepts connections but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let mut client =
            PortsAllocatorClient::with_port(port).with_reply_timeout(Duration::from_millis(200));
        match client.connect().await {
            Err(ClientError::Timeout(after)) => assert_eq!(after, Duration::from_millis(200)),
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
