//! TLS configuration for the release service connection
//!
//! Client role: a rustls `ClientConfig` speaking `h2`, optionally presenting a
//! client certificate, trusting either the configured CA bundle or the public
//! web roots, or skipping verification entirely when asked to.
//!
//! Server role: a tonic `ServerTlsConfig` whose client CA, when present,
//! makes client certificates mandatory.

use std::sync::Arc;

use rudder_common::{Error, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, InconsistentKeys, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;
use tonic::transport::{Certificate, Identity, ServerTlsConfig};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::material::TlsMaterial;

/// ALPN protocol negotiated with the release service
pub const ALPN_H2: &[u8] = b"h2";

/// Install the aws-lc-rs crypto provider for this process.
///
/// Safe to call more than once; later calls are no-ops.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Client-side TLS settings for the release service channel
#[derive(Clone)]
pub struct ClientTls {
    config: Arc<ClientConfig>,
    server_name: Option<String>,
    verify: bool,
}

impl std::fmt::Debug for ClientTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTls")
            .field("server_name", &self.server_name)
            .field("verify", &self.verify)
            .finish()
    }
}

impl ClientTls {
    /// Assemble the client config.
    ///
    /// Returns `Ok(None)` when either half of the key pair is missing.
    pub fn build(
        material: &TlsMaterial,
        insecure: bool,
        server_name: Option<&str>,
    ) -> Result<Option<Self>> {
        let (Some(key_pem), Some(cert_pem)) = (&material.key, &material.cert) else {
            debug!(
                has_key = material.key.is_some(),
                has_cert = material.cert.is_some(),
                "incomplete client key pair, TLS disabled"
            );
            return Ok(None);
        };

        let provider = provider();
        let chain = parse_certificates("client_certificate", cert_pem)?;
        let key = parse_private_key("client_key", key_pem)?;
        check_key_pair(&provider, &chain, &key)?;

        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::credential(format!("TLS protocol setup failed: {}", e)))?;

        let builder = if insecure {
            warn!("release service certificate verification disabled");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification::new(&provider)))
        } else {
            let roots = match &material.ca {
                Some(ca) => root_store("ca_certificate", ca)?,
                None => {
                    debug!("no CA bundle configured, trusting public web roots");
                    let mut roots = RootCertStore::empty();
                    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                    roots
                }
            };
            builder.with_root_certificates(roots)
        };

        let mut config = builder
            .with_client_auth_cert(chain, key)
            .map_err(|e| Error::credential(format!("invalid client key pair: {}", e)))?;
        config.alpn_protocols = vec![ALPN_H2.to_vec()];

        Ok(Some(Self {
            config: Arc::new(config),
            server_name: server_name.filter(|s| !s.is_empty()).map(str::to_string),
            verify: !insecure,
        }))
    }

    /// The rustls client config
    pub fn config(&self) -> Arc<ClientConfig> {
        self.config.clone()
    }

    /// Connector for wrapping TCP streams
    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.config.clone())
    }

    /// Whether the server certificate is verified
    pub fn verifies_server(&self) -> bool {
        self.verify
    }

    /// Server name for a `host:port` target, honoring the configured override
    pub fn server_name_for(&self, target: &str) -> Result<ServerName<'static>> {
        let name = match &self.server_name {
            Some(name) => name.clone(),
            None => host_part(target).to_string(),
        };
        ServerName::try_from(name.clone())
            .map_err(|e| Error::credential(format!("invalid TLS server name '{}': {}", name, e)))
    }
}

/// Server-side TLS settings for the in-process release service
#[derive(Clone)]
pub struct ServerTls {
    cert_pem: Vec<u8>,
    key_pem: Zeroizing<Vec<u8>>,
    client_ca_pem: Option<Vec<u8>>,
}

impl std::fmt::Debug for ServerTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTls")
            .field("mutual", &self.client_ca_pem.is_some())
            .finish()
    }
}

impl ServerTls {
    /// Validate server material.
    ///
    /// With `verify_clients`, a CA bundle is required and every client must
    /// present a certificate signed by it.
    pub fn build(material: &TlsMaterial, verify_clients: bool) -> Result<Self> {
        let key_pem = material
            .key
            .clone()
            .ok_or_else(|| Error::credential_for("local_tls_key", "server TLS requires a private key"))?;
        let cert_pem = material.cert.clone().ok_or_else(|| {
            Error::credential_for("local_tls_certificate", "server TLS requires a certificate")
        })?;

        let provider = provider();
        let chain = parse_certificates("local_tls_certificate", &cert_pem)?;
        let key = parse_private_key("local_tls_key", &key_pem)?;
        check_key_pair(&provider, &chain, &key)?;

        let client_ca_pem = if verify_clients {
            let ca = material.ca.clone().ok_or_else(|| {
                Error::credential_for(
                    "local_tls_ca_certificate",
                    "client verification requires a CA bundle",
                )
            })?;
            root_store("local_tls_ca_certificate", &ca)?;
            Some(ca)
        } else {
            None
        };

        Ok(Self {
            cert_pem,
            key_pem,
            client_ca_pem,
        })
    }

    /// Whether client certificates are required
    pub fn is_mutual(&self) -> bool {
        self.client_ca_pem.is_some()
    }

    /// Build a tonic ServerTlsConfig
    pub fn to_tonic_config(&self) -> ServerTlsConfig {
        let identity = Identity::from_pem(&self.cert_pem, &*self.key_pem);
        let config = ServerTlsConfig::new().identity(identity);
        match &self.client_ca_pem {
            Some(ca) => config.client_ca_root(Certificate::from_pem(ca)),
            None => config,
        }
    }
}

/// Host portion of a `host:port` target
pub fn host_part(target: &str) -> &str {
    let without_scheme = target
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(target);
    if let Some(rest) = without_scheme.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match without_scheme.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => without_scheme,
    }
}

fn parse_certificates(field: &str, pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::credential_for(field, format!("failed to parse certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::credential_for(field, "no certificates found"));
    }
    Ok(certs)
}

fn parse_private_key(field: &str, pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_slice(pem)
        .map_err(|e| Error::credential_for(field, format!("failed to parse private key: {}", e)))
}

fn root_store(field: &str, pem: &[u8]) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certificates(field, pem)? {
        roots
            .add(cert)
            .map_err(|e| Error::credential_for(field, format!("failed to add CA certificate: {}", e)))?;
    }
    Ok(roots)
}

fn check_key_pair(
    provider: &CryptoProvider,
    chain: &[CertificateDer<'static>],
    key: &PrivateKeyDer<'static>,
) -> Result<()> {
    let signing_key = provider
        .key_provider
        .load_private_key(key.clone_key())
        .map_err(|e| Error::credential(format!("unsupported private key: {}", e)))?;
    let certified = CertifiedKey::new(chain.to_vec(), signing_key);
    match certified.keys_match() {
        Ok(()) | Err(rustls::Error::InconsistentKeys(InconsistentKeys::Unknown)) => Ok(()),
        Err(e) => Err(Error::credential(format!(
            "certificate does not match private key: {}",
            e
        ))),
    }
}

/// Verifier that accepts any server certificate while still checking handshake signatures
#[derive(Debug)]
struct SkipServerVerification {
    algorithms: WebPkiSupportedAlgorithms,
}

impl SkipServerVerification {
    fn new(provider: &CryptoProvider) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
