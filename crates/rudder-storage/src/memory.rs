//! In-memory driver for tests and ephemeral servers

use std::collections::BTreeMap;

use async_trait::async_trait;
use rudder_common::{Error, Result};
use rudder_proto::Release;
use tokio::sync::RwLock;

use crate::driver::Driver;

/// Releases held in a process-local map
#[derive(Default)]
pub struct Memory {
    releases: RwLock<BTreeMap<String, Release>>,
}

impl Memory {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Driver for Memory {
    fn name(&self) -> &'static str {
        "Memory"
    }

    async fn get(&self, key: &str) -> Result<Release> {
        self.releases
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| Error::release_not_found(key))
    }

    async fn put(&self, key: &str, release: &Release) -> Result<()> {
        self.releases
            .write()
            .await
            .insert(key.to_string(), release.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Release>> {
        Ok(self.releases.read().await.values().cloned().collect())
    }

    async fn query(&self, name: &str) -> Result<Vec<Release>> {
        Ok(self
            .releases
            .read()
            .await
            .values()
            .filter(|r| r.name == name)
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<Release> {
        self.releases
            .write()
            .await
            .remove(key)
            .ok_or_else(|| Error::release_not_found(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release(name: &str, version: u32) -> Release {
        Release {
            name: name.to_string(),
            version,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn put_get_delete() {
        let store = Memory::new();
        let web = release("web", 1);
        store.put(&web.key(), &web).await.unwrap();

        assert_eq!(store.get("web.v1").await.unwrap(), web);
        assert_eq!(store.delete("web.v1").await.unwrap(), web);
        assert!(store.get("web.v1").await.unwrap_err().is_not_found());
        assert!(store.delete("web.v1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn query_filters_by_name() {
        let store = Memory::new();
        for r in [release("web", 1), release("web", 2), release("db", 1)] {
            store.put(&r.key(), &r).await.unwrap();
        }

        assert_eq!(store.query("web").await.unwrap().len(), 2);
        assert_eq!(store.list().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn put_replaces_existing_key() {
        let store = Memory::new();
        let mut web = release("web", 1);
        store.put(&web.key(), &web).await.unwrap();
        web.manifest = "changed".to_string();
        store.put(&web.key(), &web).await.unwrap();

        assert_eq!(store.get("web.v1").await.unwrap().manifest, "changed");
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
