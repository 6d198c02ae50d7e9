//! rudder - connection bootstrap for a release-management client
//!
//! Brings up exactly one authenticated, optionally TLS-secured gRPC channel
//! to a release service, which is either
//!
//! - at an explicitly configured host,
//! - installed into the cluster and reached through a port-forward tunnel, or
//! - served in-process over a cluster-backed release store.
//!
//! # Modules
//!
//! - [`meta`] - the lazy connection orchestrator and its step seam
//! - [`bootstrap`] - cluster-backed implementation of the steps
//! - [`client`] - release service client handle
//!
//! Manifests are made diff-safe with [`sanitize`].

#![deny(missing_docs)]

pub mod bootstrap;
pub mod client;
pub mod meta;

pub use bootstrap::KubeBootstrap;
pub use client::ReleaseClient;
pub use meta::{connect, Bootstrap, Meta, MetaOptions, Phase};
pub use rudder_common::{Error, ProviderConfig, Result};
pub use rudder_manifest::{redact_sensitive_values, sanitize};
