//! The coordination service proper: a single thread that owns the registry and
//! answers requests one at a time, so the registry needs no locking.

use crate::liveness::LivenessProbe;
use crate::registry::Registry;
use chrono::Utc;
use portalloc_common::{ErrorKind, HealthResponse, Lease, Reply, Request};
use std::io;
use std::thread;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

const QUEUE_DEPTH: usize = 64;

#[derive(Debug, Error)]
#[error("allocator thread is no longer running")]
pub struct AllocatorGone;

enum Command {
    Handle {
        request: Request,
        reply: oneshot::Sender<Reply>,
    },
    List {
        reply: oneshot::Sender<Vec<Lease>>,
    },
    Health {
        reply: oneshot::Sender<HealthResponse>,
    },
}

/// Cheap, cloneable way for request handlers to reach the allocator thread.
#[derive(Clone)]
pub struct AllocatorHandle {
    tx: mpsc::Sender<Command>,
}

impl AllocatorHandle {
    pub async fn request(&self, request: Request) -> Result<Reply, AllocatorGone> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Handle { request, reply }).await?;
        rx.await.map_err(|_| AllocatorGone)
    }

    pub async fn leases(&self) -> Result<Vec<Lease>, AllocatorGone> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::List { reply }).await?;
        rx.await.map_err(|_| AllocatorGone)
    }

    pub async fn health(&self) -> Result<HealthResponse, AllocatorGone> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Health { reply }).await?;
        rx.await.map_err(|_| AllocatorGone)
    }

    async fn send(&self, command: Command) -> Result<(), AllocatorGone> {
        self.tx.send(command).await.map_err(|_| AllocatorGone)
    }
}

pub struct Allocator<P> {
    registry: Registry,
    probe: P,
}

impl<P: LivenessProbe> Allocator<P> {
    pub fn new(registry: Registry, probe: P) -> Self {
        Self { registry, probe }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Process one request to completion.
    pub fn handle(&mut self, request: Request) -> Reply {
        match request {
            Request::GetPort { process, n } => {
                let now = Utc::now();
                self.registry.reclaim(&self.probe, now);

                match self.registry.request_ports(process, n, now) {
                    Ok(ports) => Reply::ports(ports),
                    Err(e) => {
                        warn!(process, error = %e, "Cannot satisfy port request");
                        Reply::error(ErrorKind::NoPortsAvailable)
                    }
                }
            }
            Request::SetStatus { process, status } => {
                self.registry.set_status(process, status);
                Reply::status(status)
            }
        }
    }

    /// Move the allocator onto its own thread. The thread exits once every
    /// [`AllocatorHandle`] has been dropped, taking the registry with it.
    pub fn spawn(self) -> io::Result<(AllocatorHandle, thread::JoinHandle<()>)>
    where
        P: Send + 'static,
    {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let thread = thread::Builder::new()
            .name("ports-allocator".to_string())
            .spawn(move || self.run(rx))?;
        Ok((AllocatorHandle { tx }, thread))
    }

    fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        info!(available = self.registry.available(), "Allocator started");

        while let Some(command) = rx.blocking_recv() {
            // A dropped receiver means the caller went away; nothing to do
            match command {
                Command::Handle { request, reply } => {
                    let _ = reply.send(self.handle(request));
                }
                Command::List { reply } => {
                    let _ = reply.send(self.registry.leases());
                }
                Command::Health { reply } => {
                    let _ = reply.send(HealthResponse {
                        status: "ok".to_string(),
                        available: self.registry.available(),
                        leases: self.registry.lease_count(),
                    });
                }
            }
        }

        info!("Allocator stopped");
    }
}
