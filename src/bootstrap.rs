//! Cluster-backed bootstrap steps
//!
//! [`KubeBootstrap`] performs the side effects of each connection step
//! against a real cluster. The cluster connection is resolved on first use
//! and shared by every step afterwards.

use std::time::Duration;

use async_trait::async_trait;
use rudder_common::poll::{StateChangeConf, DEFAULT_POLL_INTERVAL, DEFAULT_READY_TIMEOUT};
use rudder_common::{Error, ProviderConfig, Result};
use rudder_infra::{ServerTls, TlsMaterial};
use rudder_kube::install::{self, component_readiness, wait_for_component};
use rudder_kube::{ClusterConnection, ComponentTls, InstallOptions, KubeComponentApi, Tunnel};
use rudder_server::{LocalServiceOptions, ServerHandle, ServiceEnvironment, StartOutcome};
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

use crate::meta::Bootstrap;

/// Bootstrap steps against the configured cluster
pub struct KubeBootstrap {
    config: ProviderConfig,
    cluster: OnceCell<ClusterConnection>,
    ready_timeout: Duration,
    poll_interval: Duration,
}

impl std::fmt::Debug for KubeBootstrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeBootstrap")
            .field("namespace", &self.config.namespace)
            .field("cluster", &self.cluster.get())
            .finish()
    }
}

impl KubeBootstrap {
    /// Steps for `config`
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            cluster: OnceCell::new(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the component readiness wait
    pub fn with_readiness(mut self, timeout: Duration, interval: Duration) -> Self {
        self.ready_timeout = timeout;
        self.poll_interval = interval;
        self
    }

    async fn cluster(&self) -> Result<&ClusterConnection> {
        self.cluster
            .get_or_try_init(|| ClusterConnection::resolve(&self.config.kubernetes))
            .await
    }

    fn readiness(&self) -> StateChangeConf {
        component_readiness(self.ready_timeout, self.poll_interval)
    }

    /// TLS material served by an installed component.
    ///
    /// The component serves the client key pair; it verifies clients against
    /// the CA unless `insecure` is set.
    fn component_tls(&self) -> Result<Option<ComponentTls>> {
        if !self.config.client_tls_enabled() {
            return Ok(None);
        }
        let material = TlsMaterial::resolve_with_defaults(
            &self.config.home_dir(),
            self.config.client_key.as_deref(),
            self.config.client_certificate.as_deref(),
            self.config.ca_certificate.as_deref(),
        )?;
        let (Some(key_pem), Some(cert_pem)) = (material.key, material.cert) else {
            return Err(Error::credential(
                "enable_tls requires client_key and client_certificate for the installed component",
            ));
        };
        let ca_pem = if self.config.insecure {
            None
        } else {
            Some(material.ca.ok_or_else(|| {
                Error::credential_for(
                    "ca_certificate",
                    "verifying clients of the installed component requires a CA bundle",
                )
            })?)
        };
        Ok(Some(ComponentTls {
            cert_pem,
            key_pem,
            ca_pem,
        }))
    }

    fn local_server_tls(&self) -> Result<Option<ServerTls>> {
        if !self.config.local_tls_enabled() {
            return Ok(None);
        }
        let material = TlsMaterial::resolve(
            self.config.local_tls_key.as_deref(),
            self.config.local_tls_certificate.as_deref(),
            self.config.local_tls_ca_certificate.as_deref(),
        )?;
        ServerTls::build(&material, self.config.local_tls_verify).map(Some)
    }
}

#[async_trait]
impl Bootstrap for KubeBootstrap {
    #[instrument(skip(self))]
    async fn start_local_service(&self, listen: &str) -> Result<Option<ServerHandle>> {
        let tls = self.local_server_tls()?;
        let cluster = self.cluster().await?;
        let namespace = &self.config.namespace;

        let mut releases =
            rudder_storage::init(self.config.local_storage, cluster.client(), namespace);
        if self.config.max_history > 0 {
            releases = releases.with_max_history(self.config.max_history);
        }

        // The CA file only has to outlive server startup.
        let (flags, _ca_file) = cluster.flags()?;
        let env = ServiceEnvironment::new(releases).with_cluster(cluster.client(), flags);

        let options = LocalServiceOptions::new(listen).with_tls(tls);
        match rudder_server::start(env, options).await? {
            StartOutcome::Spawned(handle) => Ok(Some(handle)),
            StartOutcome::AlreadyServing => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn install_component(&self) -> Result<()> {
        let tls = self.component_tls()?;
        let cluster = self.cluster().await?;
        let api = KubeComponentApi::new(cluster.client());
        let options = InstallOptions::from_config(&self.config, tls);
        let outcome = install::install(&api, &options, self.readiness()).await?;
        debug!(?outcome, "component install finished");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn open_tunnel(&self) -> Result<Tunnel> {
        let cluster = self.cluster().await?;
        let namespace = &self.config.namespace;
        let api = KubeComponentApi::new(cluster.client());
        wait_for_component(&api, namespace, self.readiness()).await?;

        let tunnel = Tunnel::open(cluster.client(), namespace).await?;
        info!(namespace = %namespace, port = tunnel.local_port(), "tunnel ready");
        Ok(tunnel)
    }
}
