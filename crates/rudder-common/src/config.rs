//! Provider configuration
//!
//! The configuration is loaded once from a YAML or JSON file, then unset
//! fields are filled from the environment:
//!
//! - `RUDDER_HOST`, `RUDDER_HOME`
//! - `KUBE_HOST`, `KUBE_USER`, `KUBE_PASSWORD`, `KUBE_BEARER_TOKEN`, `KUBE_INSECURE`
//! - `KUBE_CLIENT_CERT_DATA`, `KUBE_CLIENT_KEY_DATA`, `KUBE_CLUSTER_CA_CERT_DATA`
//! - `KUBE_CONFIG` / `KUBECONFIG`, `KUBE_CTX`, `KUBE_LOAD_CONFIG_FILE`
//!
//! Empty strings count as unset everywhere.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::yaml::parse_document;
use crate::{Error, Result, DEFAULT_NAMESPACE};

/// Default settings directory
pub const DEFAULT_HOME: &str = "~/.rudder";

/// Default kubeconfig location
pub const DEFAULT_KUBECONFIG: &str = "~/.kube/config";

/// Default image for the remote release service
pub const DEFAULT_COMPONENT_IMAGE: &str = "ghcr.io/rudder-project/release-service:v0.1.0";

const CONFIG_CONTEXT: &str = "config-file";

/// Store backend used by the in-process release service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Releases stored as Secrets
    #[default]
    Secret,
    /// Releases stored as ConfigMaps
    #[serde(alias = "configmaps")]
    ConfigMap,
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageKind::Secret => write!(f, "secret"),
            StorageKind::ConfigMap => write!(f, "configmap"),
        }
    }
}

/// Cluster access settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    /// API server URL
    pub host: Option<String>,
    /// Basic auth username
    pub username: Option<String>,
    /// Basic auth password
    pub password: Option<String>,
    /// Bearer token
    pub token: Option<String>,
    /// Skip API server certificate verification
    pub insecure: Option<bool>,
    /// PEM client certificate
    pub client_certificate: Option<String>,
    /// PEM client key
    pub client_key: Option<String>,
    /// PEM cluster CA bundle
    pub cluster_ca_certificate: Option<String>,
    /// Kubeconfig path
    pub config_path: Option<String>,
    /// Kubeconfig context
    pub config_context: Option<String>,
    /// Use the in-cluster service account
    pub in_cluster: bool,
    /// Load the kubeconfig file at all
    pub load_config_file: Option<bool>,
}

impl KubernetesConfig {
    /// Whether the API server certificate check is skipped
    pub fn insecure(&self) -> bool {
        self.insecure.unwrap_or(false)
    }

    /// Whether the kubeconfig file is loaded (defaults to true)
    pub fn load_config_file(&self) -> bool {
        self.load_config_file.unwrap_or(true)
    }

    /// Kubeconfig path with `~` expanded
    pub fn config_path(&self) -> PathBuf {
        expand_home(self.config_path.as_deref().unwrap_or(DEFAULT_KUBECONFIG))
    }

    /// True when any explicit cluster override is set
    pub fn has_overrides(&self) -> bool {
        self.host.is_some()
            || self.username.is_some()
            || self.password.is_some()
            || self.token.is_some()
            || self.insecure()
            || self.client_certificate.is_some()
            || self.client_key.is_some()
            || self.cluster_ca_certificate.is_some()
    }

    fn normalize(&mut self) {
        for field in [
            &mut self.host,
            &mut self.username,
            &mut self.password,
            &mut self.token,
            &mut self.client_certificate,
            &mut self.client_key,
            &mut self.cluster_ca_certificate,
            &mut self.config_path,
            &mut self.config_context,
        ] {
            clear_empty(field);
        }
    }
}

/// Full provider configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Release service address (`host:port`); empty means tunnel or local
    pub host: Option<String>,
    /// Settings directory holding default TLS material
    pub home: Option<String>,
    /// Namespace of the release service
    pub namespace: String,
    /// Install the remote component when missing
    pub install_component: bool,
    /// Serve the release service in-process
    pub run_locally: bool,
    /// Image for the remote component
    pub component_image: String,
    /// Service account for the remote component
    pub service_account: String,
    /// Mount the service account token into the component
    pub automount_service_account_token: bool,
    /// `path.to[0].field=value` overrides for the component deployment
    pub overrides: Vec<String>,
    /// Releases kept per name; 0 keeps all
    pub max_history: u32,
    /// Verbose logging
    pub debug: bool,
    /// Skip release service certificate verification
    pub insecure: bool,
    /// Use TLS towards the release service
    pub enable_tls: bool,
    /// Client key (path or PEM)
    pub client_key: Option<String>,
    /// Client certificate (path or PEM)
    pub client_certificate: Option<String>,
    /// CA bundle (path or PEM)
    pub ca_certificate: Option<String>,
    /// Server name presented during the TLS handshake
    pub tls_hostname: Option<String>,
    /// Store backend for the in-process service
    pub local_storage: StorageKind,
    /// In-process server key (path or PEM)
    pub local_tls_key: Option<String>,
    /// In-process server certificate (path or PEM)
    pub local_tls_certificate: Option<String>,
    /// CA bundle used to verify clients of the in-process server
    pub local_tls_ca_certificate: Option<String>,
    /// Serve TLS from the in-process server
    pub local_tls_enable: bool,
    /// Require verified client certificates on the in-process server
    pub local_tls_verify: bool,
    /// Cluster access
    pub kubernetes: KubernetesConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            host: None,
            home: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            install_component: true,
            run_locally: false,
            component_image: DEFAULT_COMPONENT_IMAGE.to_string(),
            service_account: "default".to_string(),
            automount_service_account_token: true,
            overrides: Vec::new(),
            max_history: 0,
            debug: false,
            insecure: false,
            enable_tls: false,
            client_key: None,
            client_certificate: None,
            ca_certificate: None,
            tls_hostname: None,
            local_storage: StorageKind::default(),
            local_tls_key: None,
            local_tls_certificate: None,
            local_tls_ca_certificate: None,
            local_tls_enable: false,
            local_tls_verify: false,
            kubernetes: KubernetesConfig::default(),
        }
    }
}

/// Immutable connection settings derived from the configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Settings directory
    pub home: PathBuf,
    /// Explicit release service address, if any
    pub host: Option<String>,
    /// Namespace of the release service
    pub namespace: String,
    /// Verbose logging
    pub debug: bool,
}

impl ProviderConfig {
    /// Load a configuration file (YAML or JSON) and fill defaults from the environment
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(
                CONFIG_CONTEXT,
                format!("failed to read {}: {}", path.display(), e),
            )
        })?;
        let mut config = Self::from_yaml(&data)?;
        config.resolve_env_defaults();
        Ok(config)
    }

    /// Parse a configuration document without consulting the environment
    pub fn from_yaml(data: &str) -> Result<Self> {
        let value = parse_document(data).map_err(|e| Error::configuration(CONFIG_CONTEXT, e.to_string()))?;
        if value.is_null() {
            return Ok(Self::default());
        }
        let mut config: Self = serde_json::from_value(value)
            .map_err(|e| Error::configuration(CONFIG_CONTEXT, e.to_string()))?;
        config.normalize();
        Ok(config)
    }

    /// Fill unset fields from the process environment
    pub fn resolve_env_defaults(&mut self) {
        self.resolve_env_defaults_with(|key| std::env::var(key).ok());
    }

    /// Fill unset fields using the given variable lookup
    pub fn resolve_env_defaults_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        fill(&mut self.host, var("RUDDER_HOST"));
        fill(&mut self.home, var("RUDDER_HOME"));

        let kube = &mut self.kubernetes;
        fill(&mut kube.host, var("KUBE_HOST"));
        fill(&mut kube.username, var("KUBE_USER"));
        fill(&mut kube.password, var("KUBE_PASSWORD"));
        fill(&mut kube.token, var("KUBE_BEARER_TOKEN"));
        fill(&mut kube.client_certificate, var("KUBE_CLIENT_CERT_DATA"));
        fill(&mut kube.client_key, var("KUBE_CLIENT_KEY_DATA"));
        fill(&mut kube.cluster_ca_certificate, var("KUBE_CLUSTER_CA_CERT_DATA"));
        fill(
            &mut kube.config_path,
            var("KUBE_CONFIG").or_else(|| var("KUBECONFIG")),
        );
        fill(&mut kube.config_context, var("KUBE_CTX"));
        if kube.insecure.is_none() {
            kube.insecure = var("KUBE_INSECURE").map(|v| parse_bool(&v));
        }
        if kube.load_config_file.is_none() {
            kube.load_config_file = var("KUBE_LOAD_CONFIG_FILE").map(|v| parse_bool(&v));
        }
    }

    /// Settings directory with `~` expanded
    pub fn home_dir(&self) -> PathBuf {
        expand_home(self.home.as_deref().unwrap_or(DEFAULT_HOME))
    }

    /// Whether the in-process server serves TLS
    pub fn local_tls_enabled(&self) -> bool {
        self.local_tls_enable || self.local_tls_verify
    }

    /// Whether the client side uses TLS
    pub fn client_tls_enabled(&self) -> bool {
        self.enable_tls
    }

    /// Connection settings for the orchestrator
    pub fn settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            home: self.home_dir(),
            host: self.host.clone(),
            namespace: self.namespace.clone(),
            debug: self.debug,
        }
    }

    fn normalize(&mut self) {
        for field in [
            &mut self.host,
            &mut self.home,
            &mut self.client_key,
            &mut self.client_certificate,
            &mut self.ca_certificate,
            &mut self.tls_hostname,
            &mut self.local_tls_key,
            &mut self.local_tls_certificate,
            &mut self.local_tls_ca_certificate,
        ] {
            clear_empty(field);
        }
        if self.namespace.is_empty() {
            self.namespace = DEFAULT_NAMESPACE.to_string();
        }
        self.overrides.retain(|o| !o.trim().is_empty());
        self.kubernetes.normalize();
    }
}

/// Expand a leading `~` to the user's home directory
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn fill(field: &mut Option<String>, value: Option<String>) {
    if field.is_none() {
        *field = value;
    }
}

fn clear_empty(field: &mut Option<String>) {
    if field.as_deref().is_some_and(str::is_empty) {
        *field = None;
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "t" | "true" | "yes" | "y"
    )
}
