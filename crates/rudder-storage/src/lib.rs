//! Release storage for rudder
//!
//! [`Storage`] wraps a [`Driver`] and enforces the per-release history
//! limit. Drivers: [`ConfigMaps`] and [`Secrets`] in a cluster namespace,
//! and [`Memory`] for ephemeral use.

#![deny(missing_docs)]

pub mod cluster;
pub mod driver;
pub mod memory;
pub mod storage;

use std::sync::Arc;

use rudder_common::StorageKind;

pub use cluster::{ConfigMaps, Secrets};
pub use driver::Driver;
pub use memory::Memory;
pub use storage::Storage;

/// Storage over the namespaced collection selected by `kind`
pub fn init(kind: StorageKind, client: kube::Client, namespace: &str) -> Storage {
    let driver: Arc<dyn Driver> = match kind {
        StorageKind::ConfigMap => Arc::new(ConfigMaps::new(client, namespace)),
        StorageKind::Secret => Arc::new(Secrets::new(client, namespace)),
    };
    Storage::new(driver)
}
