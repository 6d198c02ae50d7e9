//! Store backend abstraction
//!
//! A driver persists release revisions under `<name>.v<version>` keys. The
//! cluster-backed drivers stamp every object with the labels below so that
//! revisions of one release can be queried without reading all of them.

use std::collections::BTreeMap;

use async_trait::async_trait;
use rudder_common::Result;
use rudder_proto::Release;

/// Label holding the release name
pub const LABEL_NAME: &str = "NAME";
/// Label marking objects owned by rudder
pub const LABEL_OWNER: &str = "OWNER";
/// Label holding the release status
pub const LABEL_STATUS: &str = "STATUS";
/// Label holding the release version
pub const LABEL_VERSION: &str = "VERSION";
/// Value of the owner label
pub const OWNER: &str = "RUDDER";

/// Key under which the encoded release is stored inside an object
pub const RELEASE_DATA_KEY: &str = "release";

/// Persistence backend for release revisions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Driver: Send + Sync {
    /// Backend name reported by the release service
    fn name(&self) -> &'static str;

    /// Fetch one revision by key
    async fn get(&self, key: &str) -> Result<Release>;

    /// Create or replace a revision
    async fn put(&self, key: &str, release: &Release) -> Result<()>;

    /// Every stored revision
    async fn list(&self) -> Result<Vec<Release>>;

    /// Every revision of one release name
    async fn query(&self, name: &str) -> Result<Vec<Release>>;

    /// Remove a revision, returning what was stored
    async fn delete(&self, key: &str) -> Result<Release>;
}

/// Labels attached to the object storing a revision
pub fn release_labels(release: &Release) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), release.name.clone()),
        (LABEL_OWNER.to_string(), OWNER.to_string()),
        (LABEL_STATUS.to_string(), release.status_name().to_string()),
        (LABEL_VERSION.to_string(), release.version.to_string()),
    ])
}

/// Selector matching every rudder-owned object
pub fn owner_selector() -> String {
    format!("{}={}", LABEL_OWNER, OWNER)
}

/// Selector matching the revisions of one release
pub fn name_selector(name: &str) -> String {
    format!("{},{}={}", owner_selector(), LABEL_NAME, name)
}

#[cfg(test)]
mod tests {
    use rudder_proto::ReleaseStatus;

    use super::*;

    #[test]
    fn labels_describe_revision() {
        let release = Release {
            name: "web".to_string(),
            version: 4,
            status: ReleaseStatus::Superseded as i32,
            ..Default::default()
        };

        let labels = release_labels(&release);
        assert_eq!(labels["NAME"], "web");
        assert_eq!(labels["OWNER"], "RUDDER");
        assert_eq!(labels["STATUS"], "SUPERSEDED");
        assert_eq!(labels["VERSION"], "4");
    }

    #[test]
    fn selectors() {
        assert_eq!(owner_selector(), "OWNER=RUDDER");
        assert_eq!(name_selector("db"), "OWNER=RUDDER,NAME=db");
    }
}
