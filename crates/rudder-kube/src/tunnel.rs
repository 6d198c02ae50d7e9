//! Port-forward tunnel to the remote component
//!
//! A [`Tunnel`] listens on an ephemeral loopback port and relays each
//! accepted connection through a [`Forwarder`]. The cluster forwarder opens
//! a Kubernetes port-forward to the running component pod per connection.
//! Dropping the tunnel stops accepting; relays already running finish on
//! their own.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use rudder_common::{Error, Result, COMPONENT_PORT, COMPONENT_SELECTOR};

const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Relays one local connection to the remote end
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Copy bytes both ways until either side closes
    async fn forward(&self, stream: TcpStream) -> Result<()>;
}

/// Forwards to the component port of a single pod
pub struct PodForwarder {
    pods: Api<Pod>,
    pod: String,
    namespace: String,
    port: u16,
}

impl PodForwarder {
    /// Forwarder to `pod` in `namespace` on the component port
    pub fn new(client: Client, namespace: &str, pod: impl Into<String>) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
            pod: pod.into(),
            namespace: namespace.to_string(),
            port: COMPONENT_PORT,
        }
    }

    /// Name of the target pod
    pub fn pod(&self) -> &str {
        &self.pod
    }
}

#[async_trait]
impl Forwarder for PodForwarder {
    async fn forward(&self, mut stream: TcpStream) -> Result<()> {
        let mut pf = self
            .pods
            .portforward(&self.pod, &[self.port])
            .await
            .map_err(|e| {
                Error::tunnel(
                    &self.namespace,
                    format!("portforward to {} failed: {}", self.pod, e),
                )
            })?;
        let mut upstream = pf.take_stream(self.port).ok_or_else(|| {
            Error::tunnel(&self.namespace, format!("no stream for port {}", self.port))
        })?;

        let copied = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
        drop(upstream);
        if let Err(e) = pf.join().await {
            debug!(pod = %self.pod, error = %e, "portforward ended with error");
        }
        let (sent, received) = copied
            .map_err(|e| Error::tunnel(&self.namespace, format!("relay failed: {}", e)))?;
        debug!(pod = %self.pod, sent, received, "tunnel connection closed");
        Ok(())
    }
}

/// Name of a running component pod in `namespace`
pub async fn find_running_pod(client: Client, namespace: &str) -> Result<String> {
    let pods: Api<Pod> = Api::namespaced(client, namespace);
    let params = ListParams::default()
        .labels(COMPONENT_SELECTOR)
        .fields("status.phase=Running");
    let list = pods
        .list(&params)
        .await
        .map_err(|e| Error::tunnel(namespace, format!("failed to list component pods: {}", e)))?;
    list.items
        .into_iter()
        .find_map(|pod| pod.metadata.name)
        .ok_or_else(|| Error::tunnel(namespace, "could not find a ready release service pod"))
}

/// Pause after the `failures`th accept error in a row.
///
/// Errors such as running out of file descriptors persist, so retries slow
/// down from 10ms to at most one second.
fn accept_backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(7);
    (ACCEPT_BACKOFF_BASE * 2u32.pow(exp)).min(ACCEPT_BACKOFF_MAX)
}

/// Local listener relaying to the component
#[derive(Debug)]
pub struct Tunnel {
    local_addr: SocketAddr,
    namespace: String,
    accept: JoinHandle<()>,
}

impl Tunnel {
    /// Tunnel to the running component pod in `namespace`
    pub async fn open(client: Client, namespace: &str) -> Result<Self> {
        let pod = find_running_pod(client.clone(), namespace).await?;
        info!(namespace, pod = %pod, "opening tunnel to release service");
        Self::start(namespace, Arc::new(PodForwarder::new(client, namespace, pod))).await
    }

    /// Bind an ephemeral loopback port and relay connections through `forwarder`
    pub async fn start(namespace: &str, forwarder: Arc<dyn Forwarder>) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| Error::tunnel(namespace, format!("failed to bind local port: {}", e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::tunnel(namespace, e.to_string()))?;

        let ns = namespace.to_string();
        let accept = tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(conn) => {
                        failures = 0;
                        conn
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        let delay = accept_backoff(failures);
                        warn!(namespace = %ns, error = %e, ?delay, "tunnel accept failed");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                };
                debug!(%peer, "tunnel connection accepted");
                let forwarder = forwarder.clone();
                let ns = ns.clone();
                tokio::spawn(async move {
                    if let Err(e) = forwarder.forward(stream).await {
                        warn!(namespace = %ns, error = %e, "tunnel connection failed");
                    }
                });
            }
        });

        debug!(namespace, %local_addr, "tunnel listening");
        Ok(Self {
            local_addr,
            namespace: namespace.to_string(),
            accept,
        })
    }

    /// Local port
    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// `host:port` to dial
    pub fn host(&self) -> String {
        format!("127.0.0.1:{}", self.local_addr.port())
    }

    /// Namespace of the remote component
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Stop accepting connections
    pub fn close(&self) {
        self.accept.abort();
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.accept.abort();
    }
}
