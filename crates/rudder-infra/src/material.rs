//! TLS material resolution
//!
//! Each field (key, certificate, CA bundle) comes from the first of:
//! an explicit value, then the default file under the settings directory.
//! A value naming an existing file is read from disk; any other value is
//! taken as the PEM content itself. If nothing but the default path itself
//! comes back (the default file does not exist), the field is absent.

use std::path::Path;

use rudder_common::config::expand_home;
use rudder_common::{Error, Result};
use tracing::debug;
use zeroize::Zeroizing;

/// Default client key file name under the settings directory
pub const DEFAULT_KEY_FILE: &str = "key.pem";
/// Default client certificate file name under the settings directory
pub const DEFAULT_CERT_FILE: &str = "cert.pem";
/// Default CA bundle file name under the settings directory
pub const DEFAULT_CA_FILE: &str = "ca.pem";

/// PEM material for one TLS role
#[derive(Default, Clone)]
pub struct TlsMaterial {
    /// Private key PEM (zeroized on drop)
    pub key: Option<Zeroizing<Vec<u8>>>,
    /// Certificate chain PEM
    pub cert: Option<Vec<u8>>,
    /// CA bundle PEM
    pub ca: Option<Vec<u8>>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("cert", &self.cert.as_ref().map(Vec::len))
            .field("ca", &self.ca.as_ref().map(Vec::len))
            .finish()
    }
}

impl TlsMaterial {
    /// Build material from in-memory PEM
    pub fn from_pem(key: Option<&str>, cert: Option<&str>, ca: Option<&str>) -> Self {
        let non_empty = |s: Option<&str>| s.filter(|s| !s.is_empty()).map(|s| s.as_bytes().to_vec());
        Self {
            key: non_empty(key).map(Zeroizing::new),
            cert: non_empty(cert),
            ca: non_empty(ca),
        }
    }

    /// Resolve client material, falling back to `<home>/key.pem`, `<home>/cert.pem`, `<home>/ca.pem`
    pub fn resolve_with_defaults(
        home: &Path,
        key: Option<&str>,
        cert: Option<&str>,
        ca: Option<&str>,
    ) -> Result<Self> {
        Ok(Self {
            key: resolve_material("client_key", key, Some(&home.join(DEFAULT_KEY_FILE)))?
                .map(Zeroizing::new),
            cert: resolve_material("client_certificate", cert, Some(&home.join(DEFAULT_CERT_FILE)))?,
            ca: resolve_material("ca_certificate", ca, Some(&home.join(DEFAULT_CA_FILE)))?,
        })
    }

    /// Resolve material with no default files
    pub fn resolve(key: Option<&str>, cert: Option<&str>, ca: Option<&str>) -> Result<Self> {
        Ok(Self {
            key: resolve_material("key", key, None)?.map(Zeroizing::new),
            cert: resolve_material("certificate", cert, None)?,
            ca: resolve_material("ca_certificate", ca, None)?,
        })
    }

    /// True when both halves of the key pair are present
    pub fn has_key_pair(&self) -> bool {
        self.key.is_some() && self.cert.is_some()
    }
}

/// Read a value that is either a file path or the content itself.
///
/// Returns the content and whether it came from a file.
pub fn read_path_or_contents(value: &str) -> std::io::Result<(String, bool)> {
    let path = expand_home(value);
    if path.is_file() {
        return std::fs::read_to_string(&path).map(|content| (content, true));
    }
    Ok((value.to_string(), false))
}

/// Resolve one field from its explicit value or default path.
///
/// `None` when the field is unset and the default file does not exist, or
/// when the content is empty.
pub fn resolve_material(
    field: &str,
    explicit: Option<&str>,
    default_path: Option<&Path>,
) -> Result<Option<Vec<u8>>> {
    let default = default_path.map(|p| p.to_string_lossy().into_owned());
    let source = match (explicit.filter(|v| !v.is_empty()), default.as_deref()) {
        (Some(value), _) => value,
        (None, Some(default)) => default,
        (None, None) => return Ok(None),
    };

    debug!(field, "resolving TLS material");
    let (content, from_file) = read_path_or_contents(source)
        .map_err(|e| Error::credential_for(field, format!("failed to read {}: {}", source, e)))?;

    if !from_file && default.as_deref() == Some(content.as_str()) {
        return Ok(None);
    }
    if content.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(content.into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_content_is_used_verbatim() {
        let pem = "-----BEGIN CERTIFICATE-----\nabc\n-----END CERTIFICATE-----\n";
        let resolved = resolve_material("cert", Some(pem), None).unwrap();
        assert_eq!(resolved.as_deref(), Some(pem.as_bytes()));
    }

    #[test]
    fn explicit_path_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.pem");
        std::fs::write(&path, "file-content").unwrap();

        let resolved = resolve_material("cert", Some(path.to_str().unwrap()), None).unwrap();
        assert_eq!(resolved.as_deref(), Some(b"file-content".as_slice()));
    }

    #[test]
    fn missing_default_file_means_absent() {
        let dir = tempfile::tempdir().unwrap();
        let default = dir.path().join(DEFAULT_KEY_FILE);

        let resolved = resolve_material("client_key", None, Some(&default)).unwrap();
        assert!(resolved.is_none());
    }

    #[test]
    fn existing_default_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DEFAULT_CA_FILE), "ca-bundle").unwrap();

        let material = TlsMaterial::resolve_with_defaults(dir.path(), None, None, None).unwrap();
        assert_eq!(material.ca.as_deref(), Some(b"ca-bundle".as_slice()));
        assert!(material.key.is_none());
        assert!(material.cert.is_none());
        assert!(!material.has_key_pair());
    }

    #[test]
    fn explicit_value_wins_over_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DEFAULT_CERT_FILE), "default-cert").unwrap();

        let material =
            TlsMaterial::resolve_with_defaults(dir.path(), None, Some("inline-cert"), None).unwrap();
        assert_eq!(material.cert.as_deref(), Some(b"inline-cert".as_slice()));
    }

    #[test]
    fn empty_values_are_absent() {
        let material = TlsMaterial::from_pem(Some(""), Some("cert"), None);
        assert!(material.key.is_none());
        assert!(material.cert.is_some());
        assert!(resolve_material("key", Some(""), None).unwrap().is_none());
    }

    #[test]
    fn debug_output_hides_key() {
        let material = TlsMaterial::from_pem(Some("super-secret-key"), None, None);
        let rendered = format!("{:?}", material);
        assert!(!rendered.contains("super-secret-key"));
        assert!(rendered.contains("<redacted>"));
    }
}
