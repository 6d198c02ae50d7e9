//! Cluster client factory
//!
//! One [`ClusterConnection`] is resolved per process from the `kubernetes`
//! configuration block. Resolution starts from a base configuration
//! (in-cluster service account, or the kubeconfig file) and then applies
//! each explicit override. When the base cannot be loaded the explicit
//! overrides alone must describe the cluster.
//!
//! Both consumer views derive from the same resolved connection: the typed
//! [`kube::Client`] used by the installer, tunnel and stores, and the
//! [`ClusterFlags`] flag set handed to the in-process release service.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::header::{HeaderValue, USER_AGENT};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use rudder_common::{user_agent, Error, KubernetesConfig, Result};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::CertificateDer;
use secrecy::SecretString;
use tempfile::NamedTempFile;
use tracing::{debug, info};
use zeroize::Zeroizing;

const CONTEXT: &str = "cluster-client";

/// Where the base cluster configuration came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    /// In-cluster service account
    InCluster,
    /// Kubeconfig file
    Kubeconfig,
    /// Explicit settings only
    Explicit,
}

/// Resolved cluster access, shared read-only for the process lifetime
#[derive(Clone)]
pub struct ClusterConnection {
    config: Config,
    client: Client,
    source: ConfigSource,
    settings: KubernetesConfig,
}

impl std::fmt::Debug for ClusterConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConnection")
            .field("cluster_url", &self.config.cluster_url)
            .field("source", &self.source)
            .finish()
    }
}

impl ClusterConnection {
    /// Resolve the cluster configuration and build the typed client
    pub async fn resolve(settings: &KubernetesConfig) -> Result<Self> {
        let base = match load_base(settings).await {
            Ok(base) => Some(base),
            Err(e) if settings.has_overrides() => {
                debug!(error = %e, "base cluster config unavailable, using explicit settings");
                None
            }
            Err(e) => return Err(e),
        };

        let (mut config, source) = match base {
            Some(base) => base,
            None => {
                let url = match settings.host.as_deref() {
                    Some(host) => parse_cluster_url(host)?,
                    None => default_cluster_url(settings),
                };
                (Config::new(url), ConfigSource::Explicit)
            }
        };

        apply_overrides(&mut config, settings)?;
        stamp_user_agent(&mut config)?;

        let client = Client::try_from(config.clone()).map_err(|e| {
            Error::configuration(CONTEXT, format!("failed to create client: {}", e))
        })?;

        info!(
            cluster_url = %config.cluster_url,
            source = ?source,
            "cluster client configured"
        );

        Ok(Self {
            config,
            client,
            source,
            settings: settings.clone(),
        })
    }

    /// Typed API client
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Final client configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Where the base configuration came from
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Flag-set view of the same connection.
    ///
    /// A configured cluster CA is written to a temporary file referenced by
    /// the flags. The returned guard deletes that file when dropped.
    pub fn flags(&self) -> Result<(ClusterFlags, Option<TempCaFile>)> {
        let s = &self.settings;
        let mut flags = ClusterFlags::default();

        if !s.in_cluster && s.load_config_file() {
            flags.kubeconfig = Some(s.config_path());
            flags.context = s.config_context.clone();
        }
        flags.api_server = s.host.clone();
        flags.username = s.username.clone();
        flags.password = s.password.clone().map(Zeroizing::new);
        flags.bearer_token = s.token.clone().map(Zeroizing::new);
        flags.insecure = s.insecure();

        let ca_file = match &s.cluster_ca_certificate {
            Some(ca) => {
                let file = TempCaFile::write(ca.as_bytes())?;
                flags.ca_file = Some(file.path().to_path_buf());
                Some(file)
            }
            None => None,
        };

        Ok((flags, ca_file))
    }
}

/// Raw cluster-auth flags, in the shape of kubectl's global options
#[derive(Default, Clone)]
pub struct ClusterFlags {
    /// `--server`
    pub api_server: Option<String>,
    /// `--kubeconfig`
    pub kubeconfig: Option<PathBuf>,
    /// `--context`
    pub context: Option<String>,
    /// `--username`
    pub username: Option<String>,
    /// `--password`
    pub password: Option<Zeroizing<String>>,
    /// `--token`
    pub bearer_token: Option<Zeroizing<String>>,
    /// `--insecure-skip-tls-verify`
    pub insecure: bool,
    /// `--certificate-authority`
    pub ca_file: Option<PathBuf>,
}

impl std::fmt::Debug for ClusterFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterFlags")
            .field("api_server", &self.api_server)
            .field("kubeconfig", &self.kubeconfig)
            .field("context", &self.context)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .field("insecure", &self.insecure)
            .field("ca_file", &self.ca_file)
            .finish()
    }
}

/// Temporary CA bundle referenced by [`ClusterFlags`], removed on drop
#[derive(Debug)]
pub struct TempCaFile {
    file: NamedTempFile,
}

impl TempCaFile {
    fn write(contents: &[u8]) -> Result<Self> {
        use std::io::Write;

        let mut file = tempfile::Builder::new()
            .prefix("rudder-")
            .suffix(".pem")
            .tempfile()
            .map_err(|e| Error::configuration(CONTEXT, format!("failed to create CA file: {}", e)))?;
        file.write_all(contents)
            .and_then(|_| file.flush())
            .map_err(|e| Error::configuration(CONTEXT, format!("failed to write CA file: {}", e)))?;
        Ok(Self { file })
    }

    /// Location of the CA bundle
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

impl Drop for TempCaFile {
    fn drop(&mut self) {
        debug!(path = %self.file.path().display(), "removing temporary CA file");
    }
}

async fn load_base(settings: &KubernetesConfig) -> Result<(Config, ConfigSource)> {
    if settings.in_cluster {
        let config = Config::incluster()
            .map_err(|e| Error::configuration("in-cluster", e.to_string()))?;
        return Ok((config, ConfigSource::InCluster));
    }

    if !settings.load_config_file() {
        return Err(Error::configuration(
            "kubeconfig",
            "kubeconfig loading is disabled and in-cluster config is not requested",
        ));
    }

    let path = settings.config_path();
    let kubeconfig = Kubeconfig::read_from(&path).map_err(|e| {
        Error::configuration(
            "kubeconfig",
            format!("failed to read {}: {}", path.display(), e),
        )
    })?;
    let options = KubeConfigOptions {
        context: settings.config_context.clone(),
        ..Default::default()
    };
    let config = Config::from_custom_kubeconfig(kubeconfig, &options)
        .await
        .map_err(|e| {
            Error::configuration(
                "kubeconfig",
                format!("failed to load {}: {}", path.display(), e),
            )
        })?;
    Ok((config, ConfigSource::Kubeconfig))
}

fn apply_overrides(config: &mut Config, s: &KubernetesConfig) -> Result<()> {
    if let Some(host) = &s.host {
        config.cluster_url = parse_cluster_url(host)?;
    }
    if let Some(username) = &s.username {
        config.auth_info.username = Some(username.clone());
    }
    if let Some(password) = &s.password {
        config.auth_info.password = Some(SecretString::from(password.clone()));
    }
    if let Some(token) = &s.token {
        config.auth_info.token = Some(SecretString::from(token.clone()));
    }
    if s.insecure() {
        config.accept_invalid_certs = true;
    }
    if let Some(ca) = &s.cluster_ca_certificate {
        config.root_cert = Some(parse_ca_bundle(ca)?);
    }
    if let Some(cert) = &s.client_certificate {
        config.auth_info.client_certificate_data = Some(STANDARD.encode(cert));
    }
    if let Some(key) = &s.client_key {
        config.auth_info.client_key_data = Some(SecretString::from(STANDARD.encode(key)));
    }
    Ok(())
}

fn stamp_user_agent(config: &mut Config) -> Result<()> {
    let value = HeaderValue::from_str(&user_agent())
        .map_err(|e| Error::configuration(CONTEXT, format!("invalid user agent: {}", e)))?;
    config.headers.retain(|(name, _)| *name != USER_AGENT);
    config.headers.push((USER_AGENT, value));
    Ok(())
}

/// Parse an API server address, defaulting to https
pub fn parse_cluster_url(host: &str) -> Result<http::Uri> {
    let url = if host.contains("://") {
        host.to_string()
    } else {
        format!("https://{}", host)
    };
    url.parse::<http::Uri>()
        .map_err(|e| Error::configuration(CONTEXT, format!("invalid kubernetes host '{}': {}", host, e)))
}

/// Address used when neither a base config nor `host` names the cluster.
///
/// Matches kubectl: localhost, over TLS only when TLS settings are present.
fn default_cluster_url(settings: &KubernetesConfig) -> http::Uri {
    let tls = settings.insecure()
        || settings.cluster_ca_certificate.is_some()
        || settings.client_certificate.is_some();
    if tls {
        http::Uri::from_static("https://localhost")
    } else {
        http::Uri::from_static("http://localhost")
    }
}

fn parse_ca_bundle(pem: &str) -> Result<Vec<Vec<u8>>> {
    let certs = CertificateDer::pem_slice_iter(pem.as_bytes())
        .map(|cert| cert.map(|c| c.to_vec()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::credential_for("cluster_ca_certificate", format!("invalid CA bundle: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::credential_for(
            "cluster_ca_certificate",
            "no certificates found in CA bundle",
        ));
    }
    Ok(certs)
}
