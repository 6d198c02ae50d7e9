//! Local release service host
//!
//! Binds the configured address and serves the release service on a
//! background task. A bind failure because the address is taken means
//! another instance already serves there, which is not an error.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rudder_common::{Error, Result};
use rudder_infra::ServerTls;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::StreamExt;
use tonic::transport::Server;
use tracing::{debug, error, info};

use crate::idle::{ActivityLayer, IdleTimeout};
use crate::service::ReleaseServer;
use crate::ServiceEnvironment;

const CONTEXT: &str = "local-service";

/// Connections with no RPC in flight for this long are closed
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Minimum interval between keepalive probes
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// How to run the local release service
#[derive(Debug, Clone)]
pub struct LocalServiceOptions {
    /// `host:port` to bind
    pub listen: String,
    /// Serve TLS; mutual when the config carries a client CA
    pub tls: Option<ServerTls>,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// Keepalive probe interval
    pub keepalive_interval: Duration,
}

impl LocalServiceOptions {
    /// Plaintext service on `listen` with the default connection policy
    pub fn new(listen: impl Into<String>) -> Self {
        Self {
            listen: listen.into(),
            tls: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
        }
    }

    /// Serve with `tls`
    pub fn with_tls(mut self, tls: Option<ServerTls>) -> Self {
        self.tls = tls;
        self
    }
}

/// Result of [`start`]
#[derive(Debug)]
pub enum StartOutcome {
    /// A new server is running
    Spawned(ServerHandle),
    /// The address is already bound by another instance
    AlreadyServing,
}

/// Owner of a running local release service
///
/// Dropping the handle stops the server.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    task: Option<JoinHandle<Result<()>>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl ServerHandle {
    /// Bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the serve task has exited
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// The error the serve task exited with, if it has exited.
    ///
    /// A clean exit is reported as an error too: the service is expected to
    /// run for the lifetime of the process. Reported once.
    pub async fn exit_error(&mut self) -> Option<Error> {
        if !self.task.as_ref().is_some_and(|t| t.is_finished()) {
            return None;
        }
        let task = self.task.take()?;
        Some(match task.await {
            Ok(Ok(())) => Error::server(CONTEXT, "release service stopped"),
            Ok(Err(e)) => e,
            Err(e) => Error::server(CONTEXT, format!("release service task failed: {}", e)),
        })
    }

    /// Signal the server to stop without waiting
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }

    /// Stop serving and wait for the task to exit
    pub async fn shutdown(mut self) -> Result<()> {
        self.stop();
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| Error::server(CONTEXT, format!("release service task failed: {}", e)))?,
            None => Ok(()),
        }
    }
}

/// Whether a bind error means the address is taken
pub fn is_addr_in_use(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::AddrInUse || err.to_string().contains("address already in use")
}

/// Bind and serve the release service in the background
pub async fn start(env: ServiceEnvironment, options: LocalServiceOptions) -> Result<StartOutcome> {
    let listener = match TcpListener::bind(options.listen.as_str()).await {
        Ok(listener) => listener,
        Err(e) if is_addr_in_use(&e) => {
            info!(listen = %options.listen, "release service already listening, not starting another");
            return Ok(StartOutcome::AlreadyServing);
        }
        Err(e) => {
            return Err(Error::server(
                CONTEXT,
                format!("failed to bind {}: {}", options.listen, e),
            ))
        }
    };
    let local_addr = listener
        .local_addr()
        .map_err(|e| Error::server(CONTEXT, e.to_string()))?;

    let mut builder = Server::builder()
        .tcp_keepalive(Some(options.keepalive_interval))
        .http2_keepalive_interval(Some(options.keepalive_interval));
    let mutual = options.tls.as_ref().is_some_and(|t| t.is_mutual());
    if let Some(tls) = &options.tls {
        builder = builder
            .tls_config(tls.to_tonic_config())
            .map_err(|e| Error::server(CONTEXT, format!("invalid TLS configuration: {}", e)))?;
    }

    let storage = env.releases.name();
    let api_server = env
        .flags
        .as_ref()
        .and_then(|f| f.api_server.clone())
        .unwrap_or_default();
    let router = builder
        .layer(ActivityLayer)
        .add_service(ReleaseServer::new(Arc::new(env)).into_service());

    let idle = options.idle_timeout;
    let incoming = TcpListenerStream::new(listener).map(move |conn| {
        conn.map(|stream| {
            let _ = stream.set_nodelay(true);
            IdleTimeout::new(stream, idle)
        })
    });

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let result = router
            .serve_with_incoming_shutdown(incoming, async {
                let _ = shutdown_rx.await;
            })
            .await
            .map_err(|e| Error::server(CONTEXT, format!("release service failed: {}", e)));
        match &result {
            Ok(()) => debug!(%local_addr, "release service stopped"),
            Err(e) => error!(%local_addr, error = %e, "release service exited"),
        }
        result
    });

    info!(
        %local_addr,
        storage,
        tls = options.tls.is_some(),
        mutual,
        api_server = %api_server,
        "release service started"
    );
    Ok(StartOutcome::Spawned(ServerHandle {
        local_addr,
        task: Some(task),
        shutdown: Some(shutdown_tx),
    }))
}
