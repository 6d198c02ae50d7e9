//! In-process release service driven through the real client

use std::sync::Arc;

use rcgen::{BasicConstraints, Certificate, CertificateParams, IsCa, KeyPair, KeyUsagePurpose};
use rudder::ReleaseClient;
use rudder_infra::{ClientTls, ServerTls, TlsMaterial};
use rudder_proto::{Release, ReleaseInfo, ReleaseStatus};
use rudder_server::{LocalServiceOptions, ServerHandle, ServiceEnvironment, StartOutcome};
use rudder_storage::{Memory, Storage};

fn release(name: &str, version: u32) -> Release {
    Release {
        name: name.to_string(),
        namespace: "apps".to_string(),
        version,
        status: ReleaseStatus::Deployed as i32,
        manifest: "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\n".to_string(),
        chart: "web-1.0.0".to_string(),
        config: String::new(),
        info: Some(ReleaseInfo {
            first_deployed: 1_700_000_000,
            last_deployed: 1_700_000_000 + i64::from(version),
            description: format!("revision {}", version),
        }),
    }
}

async fn spawn(tls: Option<ServerTls>) -> ServerHandle {
    let env = ServiceEnvironment::new(Storage::new(Arc::new(Memory::new())).with_max_history(3));
    let options = LocalServiceOptions::new("127.0.0.1:0").with_tls(tls);
    match rudder_server::start(env, options).await.unwrap() {
        StartOutcome::Spawned(handle) => handle,
        StartOutcome::AlreadyServing => panic!("ephemeral port reported in use"),
    }
}

struct Pki {
    ca: Certificate,
    ca_key: KeyPair,
}

struct Leaf {
    cert_pem: String,
    key_pem: String,
}

impl Pki {
    fn new() -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca_key = KeyPair::generate().unwrap();
        let ca = params.self_signed(&ca_key).unwrap();
        Self { ca, ca_key }
    }

    fn ca_pem(&self) -> String {
        self.ca.pem()
    }

    fn issue(&self, name: &str) -> Leaf {
        let params = CertificateParams::new(vec![name.to_string()]).unwrap();
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.ca, &self.ca_key).unwrap();
        Leaf {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        }
    }
}

fn mutual_server_tls(pki: &Pki) -> ServerTls {
    let server = pki.issue("localhost");
    let ca = pki.ca_pem();
    let material = TlsMaterial::from_pem(Some(&server.key_pem), Some(&server.cert_pem), Some(&ca));
    ServerTls::build(&material, true).unwrap()
}

fn client_tls(pki: &Pki, leaf: &Leaf, insecure: bool) -> ClientTls {
    let ca = pki.ca_pem();
    let material = TlsMaterial::from_pem(Some(&leaf.key_pem), Some(&leaf.cert_pem), Some(&ca));
    ClientTls::build(&material, insecure, Some("localhost"))
        .unwrap()
        .unwrap()
}

/// Story: store three revisions of a release over plaintext and read them back
#[tokio::test]
async fn story_plaintext_release_lifecycle() {
    let mut server = spawn(None).await;
    let client = ReleaseClient::connect(&server.local_addr().to_string(), None).unwrap();

    let version = client.version().await.unwrap();
    assert_eq!(version.storage_driver, "Memory");
    assert!(!version.version.is_empty());

    for v in 1..=3 {
        client.store_release(release("web", v)).await.unwrap();
    }
    client.store_release(release("api", 1)).await.unwrap();

    let latest = client.get_release("web", 0).await.unwrap();
    assert_eq!(latest.version, 3);
    assert_eq!(client.get_release("web", 2).await.unwrap().version, 2);

    let history = client.history("web", 0).await.unwrap();
    let versions: Vec<u32> = history.iter().map(|r| r.version).collect();
    assert_eq!(versions, vec![3, 2, 1]);
    assert_eq!(client.history("web", 1).await.unwrap().len(), 1);

    let listed = client.list_releases(Some("apps"), 0).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(client.list_releases(Some("other"), 0).await.unwrap().is_empty());

    // A fourth revision pushes the oldest out of a three-revision history.
    assert_eq!(client.store_release(release("web", 4)).await.unwrap(), 1);
    assert!(client.get_release("web", 1).await.unwrap_err().is_not_found());

    let deleted = client.delete_release("web").await.unwrap();
    assert_eq!(deleted.len(), 3);
    assert!(client.get_release("web", 0).await.unwrap_err().is_not_found());

    server.stop();
}

#[tokio::test]
async fn mutual_tls_round_trip() {
    rudder_infra::install_crypto_provider();
    let pki = Pki::new();
    let mut server = spawn(Some(mutual_server_tls(&pki))).await;
    let host = server.local_addr().to_string();

    let client_leaf = pki.issue("rudder-client");
    let tls = client_tls(&pki, &client_leaf, false);
    let client = ReleaseClient::connect(&host, Some(&tls)).unwrap();
    assert!(client.is_tls());

    client.store_release(release("web", 1)).await.unwrap();
    assert_eq!(client.get_release("web", 0).await.unwrap().version, 1);

    server.stop();
}

#[tokio::test]
async fn mutual_tls_rejects_untrusted_clients() {
    rudder_infra::install_crypto_provider();
    let pki = Pki::new();
    let mut server = spawn(Some(mutual_server_tls(&pki))).await;
    let host = server.local_addr().to_string();

    let plaintext = ReleaseClient::connect(&host, None).unwrap();
    assert!(plaintext.version().await.is_err());

    // A certificate from another authority is refused even when the client
    // skips verifying the server.
    let stranger = Pki::new();
    let leaf = stranger.issue("rudder-client");
    let tls = client_tls(&stranger, &leaf, true);
    let client = ReleaseClient::connect(&host, Some(&tls)).unwrap();
    assert!(client.version().await.is_err());

    server.stop();
}

#[tokio::test]
async fn insecure_client_accepts_unknown_server() {
    rudder_infra::install_crypto_provider();
    let server_pki = Pki::new();
    let server_leaf = server_pki.issue("localhost");
    let material = TlsMaterial::from_pem(
        Some(&server_leaf.key_pem),
        Some(&server_leaf.cert_pem),
        None,
    );
    let mut server = spawn(Some(ServerTls::build(&material, false).unwrap())).await;
    let host = server.local_addr().to_string();

    let client_pki = Pki::new();
    let leaf = client_pki.issue("rudder-client");

    let strict = ReleaseClient::connect(&host, Some(&client_tls(&client_pki, &leaf, false))).unwrap();
    assert!(strict.version().await.is_err());

    let insecure = ReleaseClient::connect(&host, Some(&client_tls(&client_pki, &leaf, true))).unwrap();
    assert_eq!(insecure.version().await.unwrap().storage_driver, "Memory");

    server.stop();
}
