//! TLS infrastructure for rudder
//!
//! - [`material`]: resolving key, certificate and CA bundles from inline PEM,
//!   file paths, or default files under the settings directory
//! - [`tls`]: rustls client configuration and tonic server configuration

#![deny(missing_docs)]

pub mod material;
pub mod tls;

pub use material::TlsMaterial;
pub use tls::{install_crypto_provider, ClientTls, ServerTls};
