//! Cluster-backed drivers storing one object per revision
//!
//! ConfigMaps hold the prost-encoded release as base64 text; Secrets hold
//! the raw bytes. Writes use server-side apply so `put` is create-or-replace.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::{Api, Client};
use prost::Message;
use rudder_common::error::is_api_status;
use rudder_common::{Error, Result};
use rudder_proto::Release;
use tracing::debug;

use crate::driver::{name_selector, owner_selector, release_labels, Driver, RELEASE_DATA_KEY};

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "rudder";

const CONFIGMAP_DRIVER: &str = "ConfigMap";
const SECRET_DRIVER: &str = "Secret";

fn decode_release(driver: &str, key: &str, bytes: &[u8]) -> Result<Release> {
    Release::decode(bytes)
        .map_err(|e| Error::storage(driver, format!("failed to decode release {}: {}", key, e)))
}

fn api_error(driver: &str, action: &str, key: &str, err: kube::Error) -> Error {
    if is_api_status(&err, 404) {
        return Error::release_not_found(key);
    }
    Error::storage(driver, format!("failed to {} {}: {}", action, key, err))
}

/// Build the ConfigMap storing a revision
pub fn release_to_configmap(key: &str, namespace: &str, release: &Release) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(key.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(release_labels(release)),
            ..Default::default()
        },
        data: Some(
            [(
                RELEASE_DATA_KEY.to_string(),
                STANDARD.encode(release.encode_to_vec()),
            )]
            .into(),
        ),
        ..Default::default()
    }
}

/// Decode the revision stored in a ConfigMap
pub fn configmap_to_release(cm: &ConfigMap) -> Result<Release> {
    let key = cm.metadata.name.as_deref().unwrap_or_default();
    let encoded = cm
        .data
        .as_ref()
        .and_then(|d| d.get(RELEASE_DATA_KEY))
        .ok_or_else(|| Error::storage(CONFIGMAP_DRIVER, format!("{} has no release data", key)))?;
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| Error::storage(CONFIGMAP_DRIVER, format!("{} is not base64: {}", key, e)))?;
    decode_release(CONFIGMAP_DRIVER, key, &bytes)
}

/// Build the Secret storing a revision
pub fn release_to_secret(key: &str, namespace: &str, release: &Release) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(key.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(release_labels(release)),
            ..Default::default()
        },
        type_: Some("rudder.sh/release.v1".to_string()),
        data: Some([(RELEASE_DATA_KEY.to_string(), ByteString(release.encode_to_vec()))].into()),
        ..Default::default()
    }
}

/// Decode the revision stored in a Secret
pub fn secret_to_release(secret: &Secret) -> Result<Release> {
    let key = secret.metadata.name.as_deref().unwrap_or_default();
    let bytes = secret
        .data
        .as_ref()
        .and_then(|d| d.get(RELEASE_DATA_KEY))
        .ok_or_else(|| Error::storage(SECRET_DRIVER, format!("{} has no release data", key)))?;
    decode_release(SECRET_DRIVER, key, &bytes.0)
}

/// Releases stored as ConfigMaps in one namespace
#[derive(Clone)]
pub struct ConfigMaps {
    api: Api<ConfigMap>,
    namespace: String,
}

impl ConfigMaps {
    /// Driver over the ConfigMaps of `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }

    async fn list_selected(&self, selector: &str) -> Result<Vec<Release>> {
        let list = self
            .api
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| api_error(CONFIGMAP_DRIVER, "list", selector, e))?;
        list.items.iter().map(configmap_to_release).collect()
    }
}

#[async_trait]
impl Driver for ConfigMaps {
    fn name(&self) -> &'static str {
        CONFIGMAP_DRIVER
    }

    async fn get(&self, key: &str) -> Result<Release> {
        match self.api.get_opt(key).await {
            Ok(Some(cm)) => configmap_to_release(&cm),
            Ok(None) => Err(Error::release_not_found(key)),
            Err(e) => Err(api_error(CONFIGMAP_DRIVER, "get", key, e)),
        }
    }

    async fn put(&self, key: &str, release: &Release) -> Result<()> {
        let cm = release_to_configmap(key, &self.namespace, release);
        self.api
            .patch(key, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&cm))
            .await
            .map_err(|e| api_error(CONFIGMAP_DRIVER, "store", key, e))?;
        debug!(key, namespace = %self.namespace, "stored release configmap");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Release>> {
        self.list_selected(&owner_selector()).await
    }

    async fn query(&self, name: &str) -> Result<Vec<Release>> {
        self.list_selected(&name_selector(name)).await
    }

    async fn delete(&self, key: &str) -> Result<Release> {
        let release = self.get(key).await?;
        self.api
            .delete(key, &DeleteParams::default())
            .await
            .map_err(|e| api_error(CONFIGMAP_DRIVER, "delete", key, e))?;
        Ok(release)
    }
}

/// Releases stored as Secrets in one namespace
#[derive(Clone)]
pub struct Secrets {
    api: Api<Secret>,
    namespace: String,
}

impl Secrets {
    /// Driver over the Secrets of `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }

    async fn list_selected(&self, selector: &str) -> Result<Vec<Release>> {
        let list = self
            .api
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| api_error(SECRET_DRIVER, "list", selector, e))?;
        list.items.iter().map(secret_to_release).collect()
    }
}

#[async_trait]
impl Driver for Secrets {
    fn name(&self) -> &'static str {
        SECRET_DRIVER
    }

    async fn get(&self, key: &str) -> Result<Release> {
        match self.api.get_opt(key).await {
            Ok(Some(secret)) => secret_to_release(&secret),
            Ok(None) => Err(Error::release_not_found(key)),
            Err(e) => Err(api_error(SECRET_DRIVER, "get", key, e)),
        }
    }

    async fn put(&self, key: &str, release: &Release) -> Result<()> {
        let secret = release_to_secret(key, &self.namespace, release);
        self.api
            .patch(key, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&secret))
            .await
            .map_err(|e| api_error(SECRET_DRIVER, "store", key, e))?;
        debug!(key, namespace = %self.namespace, "stored release secret");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Release>> {
        self.list_selected(&owner_selector()).await
    }

    async fn query(&self, name: &str) -> Result<Vec<Release>> {
        self.list_selected(&name_selector(name)).await
    }

    async fn delete(&self, key: &str) -> Result<Release> {
        let release = self.get(key).await?;
        self.api
            .delete(key, &DeleteParams::default())
            .await
            .map_err(|e| api_error(SECRET_DRIVER, "delete", key, e))?;
        Ok(release)
    }
}
