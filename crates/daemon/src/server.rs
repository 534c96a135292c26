use crate::allocator::{Allocator, AllocatorHandle};
use crate::config::Config;
use crate::error::DaemonError;
use crate::liveness::LivenessProbe;
use crate::registry::Registry;
use axum::{
    body::Bytes,
    extract::{Json, State},
    http::StatusCode,
    routing::{get, post},
    Router,
};
use portalloc_common::{write_discovery_file, ErrorKind, HealthResponse, Lease, Reply, Request};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub const REBIND_DELAY: Duration = Duration::from_secs(1);

pub fn router(handle: AllocatorHandle) -> Router {
    Router::new()
        .route("/request", post(handle_request))
        .route("/list", get(list_leases))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(handle)
}

/// How the service gets its listener and serves the router on it.
pub trait Transport: Send + 'static {
    fn bind(&mut self, addr: SocketAddr) -> impl Future<Output = io::Result<TcpListener>> + Send;

    /// Serve until `stop` resolves. Returning for any other reason counts as
    /// a transport failure.
    fn serve<S>(
        &mut self,
        listener: TcpListener,
        app: Router,
        stop: S,
    ) -> impl Future<Output = io::Result<()>> + Send
    where
        S: Future<Output = ()> + Send + 'static;
}

/// Plain TCP served by axum.
pub struct AxumTransport;

impl Transport for AxumTransport {
    async fn bind(&mut self, addr: SocketAddr) -> io::Result<TcpListener> {
        TcpListener::bind(addr).await
    }

    async fn serve<S>(&mut self, listener: TcpListener, app: Router, stop: S) -> io::Result<()>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        axum::serve(listener, app).with_graceful_shutdown(stop).await
    }
}

/// Run the service until `shutdown` resolves.
pub async fn run<P, F>(config: Config, probe: P, shutdown: F) -> Result<(), DaemonError>
where
    P: LivenessProbe + Send + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    run_with(config, probe, shutdown, AxumTransport).await
}

/// Run the service over `transport` until `shutdown` resolves.
///
/// The listening port is published to the discovery file once bound. If the
/// transport fails the listener is rebuilt on the same address and serving
/// resumes; only startup failures are returned.
pub async fn run_with<P, F, T>(
    config: Config,
    probe: P,
    shutdown: F,
    mut transport: T,
) -> Result<(), DaemonError>
where
    P: LivenessProbe + Send + 'static,
    F: Future<Output = ()> + Send + 'static,
    T: Transport,
{
    let pool = config.pool()?;
    if pool.is_empty() {
        warn!("Port pool is empty; every port request will be refused");
    }
    let registry = Registry::new(pool).with_grace_period(config.grace()?);
    let (handle, allocator) = Allocator::new(registry, probe)
        .spawn()
        .map_err(DaemonError::Spawn)?;

    let requested = config.listen_addr();
    let listener = transport
        .bind(requested)
        .await
        .map_err(|source| DaemonError::Bind {
            addr: requested,
            source,
        })?;
    let addr = listener
        .local_addr()
        .map_err(|source| DaemonError::Bind {
            addr: requested,
            source,
        })?;

    write_discovery_file(&config.discovery_file, addr.port()).map_err(|source| {
        DaemonError::Discovery {
            path: config.discovery_file.clone(),
            source,
        }
    })?;
    info!(%addr, discovery_file = %config.discovery_file.display(), "Listening");

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown.await;
        let _ = stop_tx.send(true);
    });

    let app = router(handle);
    serve_until_stopped(&mut transport, listener, addr, &app, stop_rx).await;

    info!("Shutting down");
    drop(app);
    if let Err(e) = std::fs::remove_file(&config.discovery_file) {
        warn!(error = %e, "Failed to remove discovery file");
    }
    match tokio::task::spawn_blocking(move || allocator.join()).await {
        Ok(Ok(())) => info!("Registry released"),
        _ => error!("Allocator thread panicked"),
    }
    Ok(())
}

/// Keep `app` served on `addr` until `stop_rx` flips, rebinding whenever the
/// transport gives up. A failed rebind is retried after [`REBIND_DELAY`].
async fn serve_until_stopped<T: Transport>(
    transport: &mut T,
    listener: TcpListener,
    addr: SocketAddr,
    app: &Router,
    stop_rx: watch::Receiver<bool>,
) {
    let mut listener = Some(listener);
    loop {
        let current = match listener.take() {
            Some(current) => current,
            None => match transport.bind(addr).await {
                Ok(current) => {
                    info!(%addr, "Listener rebuilt");
                    current
                }
                Err(e) => {
                    warn!(%addr, error = %e, "Failed to rebuild listener, retrying");
                    let stop = tokio::select! {
                        _ = time::sleep(REBIND_DELAY) => false,
                        _ = stopped(stop_rx.clone()) => true,
                    };
                    if stop {
                        break;
                    }
                    continue;
                }
            },
        };

        let served = transport
            .serve(current, app.clone(), stopped(stop_rx.clone()))
            .await;

        if *stop_rx.borrow() {
            break;
        }
        match served {
            Ok(()) => warn!("Listener closed unexpectedly, rebuilding"),
            Err(e) => warn!(error = %e, "Transport error, rebuilding listener"),
        }
    }
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn handle_request(
    State(handle): State<AllocatorHandle>,
    body: Bytes,
) -> (StatusCode, Json<Reply>) {
    let request: Request = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Malformed request");
            return (
                StatusCode::BAD_REQUEST,
                Json(Reply::error(ErrorKind::GeneralError)),
            );
        }
    };

    match handle.request(request).await {
        Ok(reply) => {
            let status = match &reply {
                Reply::Ok(_) => StatusCode::OK,
                Reply::Error(ErrorKind::NoPortsAvailable) => StatusCode::SERVICE_UNAVAILABLE,
                Reply::Error(ErrorKind::GeneralError) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(reply))
        }
        Err(e) => {
            error!(error = %e, "Request dropped");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(Reply::error(ErrorKind::GeneralError)),
            )
        }
    }
}

async fn list_leases(
    State(handle): State<AllocatorHandle>,
) -> Result<Json<Vec<Lease>>, StatusCode> {
    handle
        .leases()
        .await
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn health(
    State(handle): State<AllocatorHandle>,
) -> Result<Json<HealthResponse>, StatusCode> {
    handle
        .health()
        .await
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
