//! Common types for rudder: errors, configuration, telemetry and readiness polling

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod poll;
pub mod telemetry;
pub mod yaml;

pub use config::{ConnectionSettings, KubernetesConfig, ProviderConfig, StorageKind};
pub use error::Error;
pub use poll::StateChangeConf;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace the release service lives in unless configured otherwise
pub const DEFAULT_NAMESPACE: &str = "kube-system";

/// gRPC port of the release service
pub const COMPONENT_PORT: u16 = 44134;

/// Address the in-process release service binds when no host is configured
pub const DEFAULT_LOCAL_HOST: &str = "127.0.0.1:44134";

/// Name of the remote component deployment
pub const COMPONENT_NAME: &str = "release-service";

/// Value of the `app` label on every component resource
pub const COMPONENT_APP_LABEL: &str = "rudder";

/// Label selector matching component pods
pub const COMPONENT_SELECTOR: &str = "app=rudder,name=release-service";

/// Version reported in the user agent and by the release service
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// User agent stamped onto every cluster request
pub fn user_agent() -> String {
    format!("rudder/{}", VERSION)
}
