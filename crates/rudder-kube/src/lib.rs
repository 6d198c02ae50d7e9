//! Cluster plumbing for rudder
//!
//! - [`client`]: builds a Kubernetes client from kubeconfig, in-cluster or
//!   explicit settings, and the connection flags handed to child processes
//! - [`install`]: creates the release service in the cluster and waits for it
//! - [`tunnel`]: loopback port-forward to the running release service

#![deny(missing_docs)]

pub mod client;
pub mod install;
pub mod tunnel;

pub use client::{ClusterConnection, ClusterFlags, ConfigSource, TempCaFile};
pub use install::{ComponentApi, ComponentTls, InstallOptions, InstallOutcome, KubeComponentApi};
pub use tunnel::{Forwarder, PodForwarder, Tunnel};
