//! In-process release service for rudder
//!
//! [`start`] binds the configured address and serves [`ReleaseServer`] over
//! a [`ServiceEnvironment`] on a background task owned by the returned
//! [`ServerHandle`].

#![deny(missing_docs)]

pub mod host;
pub mod idle;
pub mod service;

use kube::Client;
use rudder_kube::ClusterFlags;
use rudder_storage::Storage;

pub use host::{
    is_addr_in_use, start, LocalServiceOptions, ServerHandle, StartOutcome,
    DEFAULT_IDLE_TIMEOUT, DEFAULT_KEEPALIVE_INTERVAL,
};
pub use idle::{ActivityLayer, ConnectionActivity, IdleTimeout};
pub use service::ReleaseServer;

/// Everything the release service runs against
#[derive(Clone)]
pub struct ServiceEnvironment {
    /// Release store
    pub releases: Storage,
    /// Cluster the releases belong to
    pub kube: Option<Client>,
    /// Flag-set view of the same cluster
    pub flags: Option<ClusterFlags>,
}

impl std::fmt::Debug for ServiceEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceEnvironment")
            .field("releases", &self.releases)
            .field("cluster", &self.kube.is_some())
            .field("flags", &self.flags)
            .finish()
    }
}

impl ServiceEnvironment {
    /// Environment with only a release store
    pub fn new(releases: Storage) -> Self {
        Self {
            releases,
            kube: None,
            flags: None,
        }
    }

    /// Bind the cluster the releases belong to
    pub fn with_cluster(mut self, kube: Client, flags: ClusterFlags) -> Self {
        self.kube = Some(kube);
        self.flags = Some(flags);
        self
    }
}
