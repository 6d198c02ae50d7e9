//! Connection orchestrator
//!
//! [`Meta`] lazily brings up exactly one connection to a release service
//! and caches it. On first use it runs, under one async mutex:
//!
//! 1. start the in-process release service, when running locally
//! 2. install the remote component, when enabled and no host is given
//! 3. open a port-forward tunnel, when no host is known yet
//! 4. build the client handle for the resulting host
//!
//! A failed step leaves the orchestrator `Failed` and the next call starts
//! over. Once `Ready` the client is reused; if the in-process server has
//! exited in the meantime the caller gets its error and the following call
//! bootstraps again.

use std::sync::Arc;

use async_trait::async_trait;
use rudder_common::{ConnectionSettings, Error, ProviderConfig, Result, DEFAULT_LOCAL_HOST};
use rudder_infra::{ClientTls, TlsMaterial};
use rudder_kube::Tunnel;
use rudder_server::ServerHandle;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::bootstrap::KubeBootstrap;
use crate::client::ReleaseClient;

/// Step name for the in-process service
pub const STEP_LOCAL_SERVICE: &str = "local-service";
/// Step name for the component install
pub const STEP_INSTALL: &str = "install";
/// Step name for the tunnel
pub const STEP_TUNNEL: &str = "tunnel";
/// Step name for the client handle
pub const STEP_CLIENT: &str = "client";

/// Side effects of the bootstrap steps
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Bootstrap: Send + Sync {
    /// Serve the release service in-process on `listen`.
    ///
    /// `None` when another instance already serves that address.
    async fn start_local_service(&self, listen: &str) -> Result<Option<ServerHandle>>;

    /// Install the remote component unless already present
    async fn install_component(&self) -> Result<()>;

    /// Open a tunnel to the remote component
    async fn open_tunnel(&self) -> Result<Tunnel>;
}

/// Observable orchestrator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing attempted yet
    Unconfigured,
    /// A caller holds the bootstrap lock
    Bootstrapping,
    /// Connected
    Ready,
    /// The last attempt failed; the next call retries
    Failed,
}

struct Connection {
    client: ReleaseClient,
    server: Option<ServerHandle>,
    tunnel: Option<Tunnel>,
}

enum State {
    Unconfigured,
    Ready(Connection),
    Failed,
}

/// What the orchestrator needs besides its backend
#[derive(Debug, Clone)]
pub struct MetaOptions {
    /// Where to connect
    pub settings: ConnectionSettings,
    /// Serve the release service in-process
    pub run_locally: bool,
    /// Install the remote component when missing
    pub install_component: bool,
    /// Client TLS; `None` means plaintext
    pub tls: Option<ClientTls>,
}

impl MetaOptions {
    /// Options from the provider configuration, assembling client TLS
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let settings = config.settings();
        let tls = if config.client_tls_enabled() {
            let material = TlsMaterial::resolve_with_defaults(
                &settings.home,
                config.client_key.as_deref(),
                config.client_certificate.as_deref(),
                config.ca_certificate.as_deref(),
            )?;
            ClientTls::build(&material, config.insecure, config.tls_hostname.as_deref())?
        } else {
            None
        };
        Ok(Self {
            settings,
            run_locally: config.run_locally,
            install_component: config.install_component,
            tls,
        })
    }
}

/// Lazily bootstrapped connection to a release service
pub struct Meta {
    options: MetaOptions,
    backend: Arc<dyn Bootstrap>,
    state: Mutex<State>,
}

impl std::fmt::Debug for Meta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Meta")
            .field("options", &self.options)
            .field("phase", &self.phase())
            .finish()
    }
}

impl Meta {
    /// Orchestrator over `backend`
    pub fn new(options: MetaOptions, backend: Arc<dyn Bootstrap>) -> Self {
        Self {
            options,
            backend,
            state: Mutex::new(State::Unconfigured),
        }
    }

    /// Orchestrator for `config` against its cluster
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        rudder_infra::install_crypto_provider();
        let options = MetaOptions::from_config(config)?;
        Ok(Self::new(options, Arc::new(KubeBootstrap::new(config.clone()))))
    }

    /// Connection settings in use
    pub fn settings(&self) -> &ConnectionSettings {
        &self.options.settings
    }

    /// Current state. Reports `Bootstrapping` while any caller holds the lock.
    pub fn phase(&self) -> Phase {
        match self.state.try_lock() {
            Err(_) => Phase::Bootstrapping,
            Ok(state) => match &*state {
                State::Unconfigured => Phase::Unconfigured,
                State::Ready(_) => Phase::Ready,
                State::Failed => Phase::Failed,
            },
        }
    }

    /// Client handle, bootstrapping the connection on first use
    pub async fn client(&self) -> Result<ReleaseClient> {
        let mut state = self.state.lock().await;

        if let State::Ready(conn) = &mut *state {
            let exited = match conn.server.as_mut() {
                Some(server) => server.exit_error().await,
                None => None,
            };
            match exited {
                None => return Ok(conn.client.clone()),
                Some(e) => {
                    warn!(error = %e, "local release service exited");
                    *state = State::Failed;
                    return Err(Error::in_step(STEP_LOCAL_SERVICE, e));
                }
            }
        }

        match self.bootstrap().await {
            Ok(conn) => {
                let client = conn.client.clone();
                *state = State::Ready(conn);
                Ok(client)
            }
            Err(e) => {
                warn!(error = %e, "bootstrap failed");
                *state = State::Failed;
                Err(e)
            }
        }
    }

    #[instrument(skip(self), fields(namespace = %self.options.settings.namespace))]
    async fn bootstrap(&self) -> Result<Connection> {
        let opts = &self.options;
        let mut host = opts.settings.host.clone();

        let mut server = None;
        if opts.run_locally {
            let listen = host
                .clone()
                .unwrap_or_else(|| DEFAULT_LOCAL_HOST.to_string());
            server = self
                .backend
                .start_local_service(&listen)
                .await
                .map_err(|e| Error::in_step(STEP_LOCAL_SERVICE, e))?;
            host = Some(match &server {
                Some(handle) if listen.ends_with(":0") => handle.local_addr().to_string(),
                _ => listen,
            });
        } else if opts.install_component && host.is_none() {
            self.backend
                .install_component()
                .await
                .map_err(|e| Error::in_step(STEP_INSTALL, e))?;
        }

        let mut tunnel = None;
        let host = match host {
            Some(host) => host,
            None => {
                let opened = self
                    .backend
                    .open_tunnel()
                    .await
                    .map_err(|e| Error::in_step(STEP_TUNNEL, e))?;
                debug!(port = opened.local_port(), "using tunnel");
                let host = opened.host();
                tunnel = Some(opened);
                host
            }
        };

        let client = ReleaseClient::connect(&host, opts.tls.as_ref())
            .map_err(|e| Error::in_step(STEP_CLIENT, e))?;
        info!(
            host = %host,
            tls = opts.tls.is_some(),
            local = server.is_some(),
            tunneled = tunnel.is_some(),
            "release service connection ready"
        );
        Ok(Connection {
            client,
            server,
            tunnel,
        })
    }
}

/// Resolve `config` and bootstrap, returning the ready orchestrator
pub async fn connect(config: &ProviderConfig) -> Result<Meta> {
    let meta = Meta::from_config(config)?;
    meta.client().await?;
    Ok(meta)
}
