//! Release storage over a driver, with per-release history limits

use std::collections::BTreeMap;
use std::sync::Arc;

use rudder_common::{Error, Result};
use rudder_proto::{release_key, Release};
use tracing::{debug, info};

use crate::driver::Driver;

/// Release store used by the release service
#[derive(Clone)]
pub struct Storage {
    driver: Arc<dyn Driver>,
    max_history: u32,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("driver", &self.driver.name())
            .field("max_history", &self.max_history)
            .finish()
    }
}

impl Storage {
    /// Storage keeping every revision
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            max_history: 0,
        }
    }

    /// Keep at most `max_history` revisions per release; 0 keeps all
    pub fn with_max_history(mut self, max_history: u32) -> Self {
        self.max_history = max_history;
        self
    }

    /// Name of the underlying driver
    pub fn name(&self) -> &'static str {
        self.driver.name()
    }

    /// Revision limit per release
    pub fn max_history(&self) -> u32 {
        self.max_history
    }

    /// Fetch one revision
    pub async fn get(&self, name: &str, version: u32) -> Result<Release> {
        self.driver.get(&release_key(name, version)).await
    }

    /// Store a new revision, pruning the oldest ones beyond the history limit.
    ///
    /// Returns how many revisions were removed.
    pub async fn create(&self, release: &Release) -> Result<u32> {
        if release.name.is_empty() {
            return Err(Error::storage(self.name(), "release name is required"));
        }

        let mut pruned = 0;
        if self.max_history > 0 {
            let keep = (self.max_history - 1) as usize;
            let history = self.history(&release.name).await?;
            let older: Vec<_> = history
                .into_iter()
                .filter(|r| r.version != release.version)
                .collect();
            if older.len() > keep {
                for stale in &older[..older.len() - keep] {
                    self.driver.delete(&stale.key()).await?;
                    pruned += 1;
                }
                info!(
                    release = %release.name,
                    pruned,
                    max_history = self.max_history,
                    "pruned release history"
                );
            }
        }

        self.driver.put(&release.key(), release).await?;
        debug!(key = %release.key(), driver = self.name(), "release stored");
        Ok(pruned)
    }

    /// Every revision of a release, oldest first
    pub async fn history(&self, name: &str) -> Result<Vec<Release>> {
        let mut releases = self.driver.query(name).await?;
        releases.sort_by_key(|r| r.version);
        Ok(releases)
    }

    /// Newest revision of a release
    pub async fn latest(&self, name: &str) -> Result<Release> {
        self.history(name)
            .await?
            .pop()
            .ok_or_else(|| Error::release_not_found(name))
    }

    /// Newest revision of every release, ordered by name
    pub async fn list_latest(&self, namespace: Option<&str>) -> Result<Vec<Release>> {
        let mut latest: BTreeMap<String, Release> = BTreeMap::new();
        for release in self.driver.list().await? {
            if namespace.is_some_and(|ns| ns != release.namespace) {
                continue;
            }
            match latest.get(&release.name) {
                Some(existing) if existing.version >= release.version => {}
                _ => {
                    latest.insert(release.name.clone(), release);
                }
            }
        }
        Ok(latest.into_values().collect())
    }

    /// Remove every revision of a release, returning them oldest first
    pub async fn delete_release(&self, name: &str) -> Result<Vec<Release>> {
        let history = self.history(name).await?;
        if history.is_empty() {
            return Err(Error::release_not_found(name));
        }
        let mut removed = Vec::with_capacity(history.len());
        for release in history {
            removed.push(self.driver.delete(&release.key()).await?);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockDriver;
    use crate::memory::Memory;

    fn release(name: &str, version: u32) -> Release {
        Release {
            name: name.to_string(),
            namespace: "apps".to_string(),
            version,
            ..Default::default()
        }
    }

    /// Story: with a history limit of 3, storing revision 5 keeps revisions 3-5
    #[tokio::test]
    async fn story_history_limit_prunes_oldest() {
        let storage = Storage::new(Arc::new(Memory::new())).with_max_history(3);
        for v in 1..=4 {
            storage.create(&release("web", v)).await.unwrap();
        }

        let pruned = storage.create(&release("web", 5)).await.unwrap();

        assert_eq!(pruned, 1);
        let versions: Vec<_> = storage
            .history("web")
            .await
            .unwrap()
            .iter()
            .map(|r| r.version)
            .collect();
        assert_eq!(versions, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn zero_history_keeps_everything() {
        let storage = Storage::new(Arc::new(Memory::new()));
        for v in 1..=6 {
            assert_eq!(storage.create(&release("web", v)).await.unwrap(), 0);
        }
        assert_eq!(storage.history("web").await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn latest_and_list_latest() {
        let storage = Storage::new(Arc::new(Memory::new()));
        for r in [release("web", 1), release("web", 3), release("db", 2)] {
            storage.create(&r).await.unwrap();
        }
        let mut other = release("cache", 1);
        other.namespace = "infra".to_string();
        storage.create(&other).await.unwrap();

        assert_eq!(storage.latest("web").await.unwrap().version, 3);
        assert!(storage.latest("missing").await.unwrap_err().is_not_found());

        let all = storage.list_latest(None).await.unwrap();
        let names: Vec<_> = all.iter().map(|r| (r.name.as_str(), r.version)).collect();
        assert_eq!(names, vec![("cache", 1), ("db", 2), ("web", 3)]);

        assert_eq!(storage.list_latest(Some("infra")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_release_removes_all_revisions() {
        let storage = Storage::new(Arc::new(Memory::new()));
        storage.create(&release("web", 1)).await.unwrap();
        storage.create(&release("web", 2)).await.unwrap();

        let removed = storage.delete_release("web").await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(storage.history("web").await.unwrap().is_empty());
        assert!(storage.delete_release("web").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn unnamed_release_is_rejected() {
        let storage = Storage::new(Arc::new(Memory::new()));
        assert!(matches!(
            storage.create(&Release::default()).await,
            Err(Error::Storage { .. })
        ));
    }

    #[tokio::test]
    async fn driver_errors_propagate() {
        let mut driver = MockDriver::new();
        driver.expect_name().return_const("Mock");
        driver
            .expect_query()
            .withf(|name| name == "web")
            .returning(|_| Err(Error::storage("Mock", "api unavailable")));

        let storage = Storage::new(Arc::new(driver)).with_max_history(2);
        assert_eq!(storage.name(), "Mock");
        assert!(matches!(
            storage.create(&release("web", 1)).await,
            Err(Error::Storage { .. })
        ));
    }
}
