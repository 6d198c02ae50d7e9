//! Remote component installer
//!
//! Creates the release service in the cluster: a Deployment, a ClusterIP
//! Service in front of its gRPC port, and (when TLS is enabled) a Secret
//! holding the serving certificate. A Deployment that already exists means
//! the component is installed and nothing is waited on. After a fresh
//! install the Deployment is polled until it reports a ready replica.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, PostParams};
use kube::Client;
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use zeroize::Zeroizing;

use rudder_common::error::is_already_exists;
use rudder_common::poll::{StateChangeConf, STATE_PENDING, STATE_RUNNING};
use rudder_common::{
    Error, ProviderConfig, Result, COMPONENT_APP_LABEL, COMPONENT_NAME, COMPONENT_PORT,
};

/// Port serving liveness and readiness probes
pub const PROBE_PORT: u16 = 44135;

/// Name of the Secret holding the component's TLS material
pub const TLS_SECRET_NAME: &str = "release-service-secret";

/// Mount path of the TLS Secret inside the component container
pub const TLS_CERTS_PATH: &str = "/etc/certs";

/// TLS material for the remote component
#[derive(Clone)]
pub struct ComponentTls {
    /// Serving certificate PEM
    pub cert_pem: Vec<u8>,
    /// Serving key PEM
    pub key_pem: Zeroizing<Vec<u8>>,
    /// CA bundle used to verify clients, when verification is on
    pub ca_pem: Option<Vec<u8>>,
}

impl std::fmt::Debug for ComponentTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentTls")
            .field("verify", &self.ca_pem.is_some())
            .finish()
    }
}

/// What to install
#[derive(Debug, Clone)]
pub struct InstallOptions {
    /// Target namespace
    pub namespace: String,
    /// Container image
    pub image: String,
    /// Service account the pod runs as
    pub service_account: String,
    /// Mount the service account token
    pub automount_service_account_token: bool,
    /// Revisions kept per release; 0 keeps all
    pub max_history: u32,
    /// `path.to[0].field=value` overrides applied to the Deployment
    pub overrides: Vec<String>,
    /// Serve TLS from the component
    pub tls: Option<ComponentTls>,
}

impl InstallOptions {
    /// Options from the provider configuration
    pub fn from_config(config: &ProviderConfig, tls: Option<ComponentTls>) -> Self {
        Self {
            namespace: config.namespace.clone(),
            image: config.component_image.clone(),
            service_account: config.service_account.clone(),
            automount_service_account_token: config.automount_service_account_token,
            max_history: config.max_history,
            overrides: config.overrides.clone(),
            tls,
        }
    }
}

/// Outcome of an install attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Resources were created and the deployment became ready
    Installed,
    /// The deployment was already present
    AlreadyPresent,
}

/// Cluster operations the installer needs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ComponentApi: Send + Sync {
    /// Create a Deployment
    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> std::result::Result<(), kube::Error>;

    /// Create a Service
    async fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> std::result::Result<(), kube::Error>;

    /// Create a Secret
    async fn create_secret(
        &self,
        namespace: &str,
        secret: &Secret,
    ) -> std::result::Result<(), kube::Error>;

    /// Ready replica count of a Deployment
    async fn ready_replicas(
        &self,
        namespace: &str,
        name: &str,
    ) -> std::result::Result<Option<i32>, kube::Error>;
}

/// [`ComponentApi`] over a live cluster
#[derive(Clone)]
pub struct KubeComponentApi {
    client: Client,
}

impl KubeComponentApi {
    /// Wrap a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ComponentApi for KubeComponentApi {
    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> std::result::Result<(), kube::Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), deployment).await.map(|_| ())
    }

    async fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> std::result::Result<(), kube::Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), service).await.map(|_| ())
    }

    async fn create_secret(
        &self,
        namespace: &str,
        secret: &Secret,
    ) -> std::result::Result<(), kube::Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), secret).await.map(|_| ())
    }

    async fn ready_replicas(
        &self,
        namespace: &str,
        name: &str,
    ) -> std::result::Result<Option<i32>, kube::Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let deployment = api.get(name).await?;
        Ok(deployment.status.and_then(|s| s.ready_replicas))
    }
}

/// Install the component unless its Deployment already exists
pub async fn install(
    api: &dyn ComponentApi,
    options: &InstallOptions,
    readiness: StateChangeConf,
) -> Result<InstallOutcome> {
    let ns = options.namespace.as_str();
    let failed =
        |what: &str, e: kube::Error| Error::installation(ns, format!("failed to create {}: {}", what, e));

    if let Some(tls) = &options.tls {
        match api.create_secret(ns, &tls_secret(ns, tls)).await {
            Ok(()) => debug!(namespace = ns, "created component TLS secret"),
            Err(e) if is_already_exists(&e) => debug!(namespace = ns, "component TLS secret exists"),
            Err(e) => return Err(failed("TLS secret", e)),
        }
    }

    let deployment = deployment(options)?;
    match api.create_deployment(ns, &deployment).await {
        Ok(()) => {}
        Err(e) if is_already_exists(&e) => {
            info!(namespace = ns, "release service already installed");
            return Ok(InstallOutcome::AlreadyPresent);
        }
        Err(e) => return Err(failed("deployment", e)),
    }

    match api.create_service(ns, &service(ns)?).await {
        Ok(()) => {}
        Err(e) if is_already_exists(&e) => debug!(namespace = ns, "component service exists"),
        Err(e) => return Err(failed("service", e)),
    }

    wait_for_component(api, ns, readiness).await?;
    info!(namespace = ns, image = %options.image, "release service installed");
    Ok(InstallOutcome::Installed)
}

/// Poll the component Deployment until it has a ready replica
pub async fn wait_for_component(
    api: &dyn ComponentApi,
    namespace: &str,
    readiness: StateChangeConf,
) -> Result<()> {
    readiness
        .with_target([STATE_RUNNING])
        .with_pending([STATE_PENDING])
        .wait_for_state(|| async move {
            debug!(namespace, "waiting for {} to become available", COMPONENT_NAME);
            let ready = api
                .ready_replicas(namespace, COMPONENT_NAME)
                .await
                .map_err(|e| {
                    Error::installation(namespace, format!("failed to read {}: {}", COMPONENT_NAME, e))
                })?;
            let state = if ready.unwrap_or(0) > 0 {
                STATE_RUNNING
            } else {
                STATE_PENDING
            };
            Ok::<_, Error>(((), state.to_string()))
        })
        .await
}

/// Readiness wait used for the component
pub fn component_readiness(timeout: Duration, interval: Duration) -> StateChangeConf {
    StateChangeConf::new(COMPONENT_NAME)
        .with_timeout(timeout)
        .with_interval(interval)
}

fn component_labels() -> Value {
    json!({ "app": COMPONENT_APP_LABEL, "name": COMPONENT_NAME })
}

/// Component Deployment with overrides applied
pub fn deployment(options: &InstallOptions) -> Result<Deployment> {
    let mut env = vec![
        json!({ "name": "RUDDER_NAMESPACE", "value": options.namespace }),
        json!({ "name": "RUDDER_HISTORY_MAX", "value": options.max_history.to_string() }),
    ];
    let mut volume_mounts = Vec::new();
    let mut volumes = Vec::new();
    if let Some(tls) = &options.tls {
        env.push(json!({ "name": "RUDDER_TLS_ENABLE", "value": "1" }));
        env.push(json!({
            "name": "RUDDER_TLS_VERIFY",
            "value": if tls.ca_pem.is_some() { "1" } else { "" }
        }));
        env.push(json!({ "name": "RUDDER_TLS_CERTS", "value": TLS_CERTS_PATH }));
        volume_mounts.push(json!({ "name": "tls-certs", "mountPath": TLS_CERTS_PATH, "readOnly": true }));
        volumes.push(json!({ "name": "tls-certs", "secret": { "secretName": TLS_SECRET_NAME } }));
    }

    let mut doc = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": COMPONENT_NAME,
            "namespace": options.namespace,
            "labels": component_labels(),
        },
        "spec": {
            "replicas": 1,
            "selector": { "matchLabels": component_labels() },
            "template": {
                "metadata": { "labels": component_labels() },
                "spec": {
                    "serviceAccountName": options.service_account,
                    "automountServiceAccountToken": options.automount_service_account_token,
                    "containers": [{
                        "name": "rudder",
                        "image": options.image,
                        "imagePullPolicy": "IfNotPresent",
                        "ports": [
                            { "containerPort": COMPONENT_PORT, "name": "grpc" },
                            { "containerPort": PROBE_PORT, "name": "http" },
                        ],
                        "env": env,
                        "livenessProbe": {
                            "httpGet": { "path": "/liveness", "port": PROBE_PORT },
                            "initialDelaySeconds": 1,
                            "timeoutSeconds": 1,
                        },
                        "readinessProbe": {
                            "httpGet": { "path": "/readiness", "port": PROBE_PORT },
                            "initialDelaySeconds": 1,
                            "timeoutSeconds": 1,
                        },
                        "volumeMounts": volume_mounts,
                    }],
                    "volumes": volumes,
                }
            }
        }
    });

    for expr in &options.overrides {
        apply_override(&mut doc, expr)
            .map_err(|e| Error::installation(&options.namespace, format!("invalid override '{}': {}", expr, e)))?;
    }

    serde_json::from_value(doc).map_err(|e| {
        Error::installation(&options.namespace, format!("overrides produced an invalid deployment: {}", e))
    })
}

/// Component Service
pub fn service(namespace: &str) -> Result<Service> {
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": COMPONENT_NAME,
            "namespace": namespace,
            "labels": component_labels(),
        },
        "spec": {
            "type": "ClusterIP",
            "ports": [{ "name": "grpc", "port": COMPONENT_PORT, "targetPort": "grpc" }],
            "selector": component_labels(),
        }
    }))
    .map_err(|e| Error::installation(namespace, format!("invalid service: {}", e)))
}

/// Component TLS Secret
pub fn tls_secret(namespace: &str, tls: &ComponentTls) -> Secret {
    let mut data = BTreeMap::new();
    data.insert("tls.crt".to_string(), ByteString(tls.cert_pem.clone()));
    data.insert("tls.key".to_string(), ByteString(tls.key_pem.to_vec()));
    if let Some(ca) = &tls.ca_pem {
        data.insert("ca.crt".to_string(), ByteString(ca.clone()));
    }
    Secret {
        metadata: ObjectMeta {
            name: Some(TLS_SECRET_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                ("app".to_string(), COMPONENT_APP_LABEL.to_string()),
                ("name".to_string(), COMPONENT_NAME.to_string()),
            ])),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(data),
        ..Default::default()
    }
}

/// Apply one or more comma-separated `path.to[0].field=value` assignments.
///
/// Values are typed the way command-line overrides usually are: integers,
/// `true`/`false` and `null` keep their type, everything else is a string.
/// Missing intermediate objects and list slots are created.
pub fn apply_override(doc: &mut Value, expr: &str) -> std::result::Result<(), String> {
    for assignment in expr.split(',').filter(|a| !a.trim().is_empty()) {
        let (path, raw) = assignment
            .split_once('=')
            .ok_or_else(|| format!("'{}' is not of the form key=value", assignment))?;
        let segments = parse_path(path.trim())?;
        set_path(doc, &segments, typed_value(raw))?;
    }
    Ok(())
}

#[derive(Debug, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

fn parse_path(path: &str) -> std::result::Result<Vec<Segment>, String> {
    if path.is_empty() {
        return Err("empty key".to_string());
    }
    let mut segments = Vec::new();
    for part in path.split('.') {
        let (name, mut rest) = match part.find('[') {
            Some(i) => (&part[..i], &part[i..]),
            None => (part, ""),
        };
        if name.is_empty() {
            return Err(format!("empty key segment in '{}'", path));
        }
        segments.push(Segment::Key(name.to_string()));
        while let Some(stripped) = rest.strip_prefix('[') {
            let (index, tail) = stripped
                .split_once(']')
                .ok_or_else(|| format!("unclosed index in '{}'", part))?;
            let index = index
                .parse::<usize>()
                .map_err(|_| format!("invalid index '{}' in '{}'", index, part))?;
            segments.push(Segment::Index(index));
            rest = tail;
        }
        if !rest.is_empty() {
            return Err(format!("unexpected '{}' in '{}'", rest, part));
        }
    }
    Ok(segments)
}

fn set_path(node: &mut Value, segments: &[Segment], value: Value) -> std::result::Result<(), String> {
    let Some((head, tail)) = segments.split_first() else {
        *node = value;
        return Ok(());
    };
    match head {
        Segment::Key(key) => {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            let child = node
                .as_object_mut()
                .map(|map| map.entry(key.clone()).or_insert(Value::Null))
                .ok_or_else(|| format!("cannot set '{}'", key))?;
            set_path(child, tail, value)
        }
        Segment::Index(index) => {
            if !node.is_array() {
                *node = Value::Array(Vec::new());
            }
            let list = node
                .as_array_mut()
                .ok_or_else(|| format!("cannot index [{}]", index))?;
            if list.len() <= *index {
                list.resize(index + 1, Value::Null);
            }
            set_path(&mut list[*index], tail, value)
        }
    }
}

fn typed_value(raw: &str) -> Value {
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ => match raw.parse::<i64>() {
            Ok(n) if !(raw.len() > 1 && raw.starts_with('0')) => Value::from(n),
            _ => Value::String(raw.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> InstallOptions {
        InstallOptions::from_config(&ProviderConfig::default(), None)
    }

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: reason.to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    fn fast_readiness() -> StateChangeConf {
        component_readiness(Duration::from_secs(10), Duration::from_secs(1))
    }

    /// Story: the component is already installed, so nothing is polled
    #[tokio::test(start_paused = true)]
    async fn story_existing_component_skips_polling() {
        let mut api = MockComponentApi::new();
        api.expect_create_deployment()
            .times(1)
            .returning(|_, _| Err(api_error(409, "AlreadyExists")));
        api.expect_create_service().never();
        api.expect_ready_replicas().never();

        let outcome = install(&api, &options(), fast_readiness()).await.unwrap();
        assert_eq!(outcome, InstallOutcome::AlreadyPresent);
    }

    /// Story: a fresh install waits until the deployment reports a ready replica
    #[tokio::test(start_paused = true)]
    async fn story_fresh_install_waits_for_ready_replica() {
        let mut api = MockComponentApi::new();
        api.expect_create_deployment().times(1).returning(|_, _| Ok(()));
        api.expect_create_service().times(1).returning(|_, _| Ok(()));
        let mut polls = 0;
        api.expect_ready_replicas()
            .times(3)
            .returning(move |ns, name| {
                assert_eq!(ns, "kube-system");
                assert_eq!(name, COMPONENT_NAME);
                polls += 1;
                Ok(if polls < 3 { None } else { Some(1) })
            });

        let outcome = install(&api, &options(), fast_readiness()).await.unwrap();
        assert_eq!(outcome, InstallOutcome::Installed);
    }

    #[tokio::test(start_paused = true)]
    async fn other_create_failures_are_installation_errors() {
        let mut api = MockComponentApi::new();
        api.expect_create_deployment()
            .returning(|_, _| Err(api_error(403, "Forbidden")));

        let err = install(&api, &options(), fast_readiness()).await.unwrap_err();
        assert!(matches!(err, Error::Installation { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn never_ready_times_out() {
        let mut api = MockComponentApi::new();
        api.expect_create_deployment().returning(|_, _| Ok(()));
        api.expect_create_service().returning(|_, _| Ok(()));
        api.expect_ready_replicas().returning(|_, _| Ok(Some(0)));

        let err = install(&api, &options(), fast_readiness()).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn tls_install_creates_secret_first() {
        let mut api = MockComponentApi::new();
        let mut seq = mockall::Sequence::new();
        api.expect_create_secret()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, secret| {
                let data = secret.data.as_ref().unwrap();
                assert!(data.contains_key("tls.crt"));
                assert!(data.contains_key("ca.crt"));
                Ok(())
            });
        api.expect_create_deployment()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(api_error(409, "AlreadyExists")));

        let mut opts = options();
        opts.tls = Some(ComponentTls {
            cert_pem: b"cert".to_vec(),
            key_pem: Zeroizing::new(b"key".to_vec()),
            ca_pem: Some(b"ca".to_vec()),
        });
        assert_eq!(
            install(&api, &opts, fast_readiness()).await.unwrap(),
            InstallOutcome::AlreadyPresent
        );
    }

    #[test]
    fn deployment_carries_component_settings() {
        let mut opts = options();
        opts.max_history = 10;
        opts.service_account = "rudder".to_string();
        let d = deployment(&opts).unwrap();

        assert_eq!(d.metadata.name.as_deref(), Some("release-service"));
        let labels = d.metadata.labels.as_ref().unwrap();
        assert_eq!(labels["app"], "rudder");
        let pod = d.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some("rudder"));
        let container = &pod.containers[0];
        let env = container.env.as_ref().unwrap();
        assert!(env
            .iter()
            .any(|e| e.name == "RUDDER_HISTORY_MAX" && e.value.as_deref() == Some("10")));
    }

    #[test]
    fn overrides_modify_deployment() {
        let mut opts = options();
        opts.overrides = vec![
            "spec.replicas=2".to_string(),
            "spec.template.spec.nodeSelector.pool=system,spec.template.spec.containers[0].imagePullPolicy=Always"
                .to_string(),
        ];
        let d = deployment(&opts).unwrap();
        let spec = d.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.node_selector.unwrap()["pool"], "system");
        assert_eq!(pod.containers[0].image_pull_policy.as_deref(), Some("Always"));
        assert_eq!(pod.containers[0].name, "rudder");
    }

    #[test]
    fn malformed_override_is_installation_error() {
        let mut opts = options();
        opts.overrides = vec!["spec.replicas".to_string()];
        assert!(matches!(deployment(&opts), Err(Error::Installation { .. })));
    }

    #[test]
    fn apply_override_creates_paths_and_types_values() {
        let mut doc = json!({});
        apply_override(&mut doc, "a.b[1].c=42").unwrap();
        apply_override(&mut doc, "flag=true,name=007,nothing=null").unwrap();

        assert_eq!(doc["a"]["b"][0], Value::Null);
        assert_eq!(doc["a"]["b"][1]["c"], 42);
        assert_eq!(doc["flag"], true);
        assert_eq!(doc["name"], "007");
        assert!(doc["nothing"].is_null());
    }

    #[test]
    fn parse_path_rejects_garbage() {
        assert!(parse_path("").is_err());
        assert!(parse_path("a..b").is_err());
        assert!(parse_path("a[x]").is_err());
        assert!(parse_path("a[0").is_err());
        assert_eq!(
            parse_path("a[0][2]").unwrap(),
            vec![Segment::Key("a".into()), Segment::Index(0), Segment::Index(2)]
        );
    }

    #[test]
    fn service_targets_grpc_port() {
        let svc = service("ops").unwrap();
        let spec = svc.spec.unwrap();
        assert_eq!(spec.ports.unwrap()[0].port, COMPONENT_PORT as i32);
        assert_eq!(spec.selector.unwrap()["name"], "release-service");
    }
}
