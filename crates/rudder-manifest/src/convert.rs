//! Multi-document manifest to keyed canonical JSON

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rudder_common::yaml::parse_document;
use rudder_common::{Error, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::redact::hash_sensitive_value;

/// Separator between documents in a rendered manifest
pub const DOCUMENT_SEPARATOR: &str = "\n---";

const SECRET_KIND: &str = "Secret";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Identity {
    #[serde(default)]
    api_version: String,
    kind: String,
    #[serde(default)]
    metadata: IdentityMeta,
}

#[derive(Debug, Default, Deserialize)]
struct IdentityMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: Option<String>,
}

impl Identity {
    fn group(&self) -> &str {
        match self.api_version.split_once('/') {
            Some((group, _)) => group,
            None => "",
        }
    }

    /// `[namespace/]lower(kind[.group])/name`
    fn key(&self) -> String {
        let group = self.group();
        let kind = if group.is_empty() {
            self.kind.to_lowercase()
        } else {
            format!("{}.{}", self.kind, group).to_lowercase()
        };
        match self.metadata.namespace.as_deref().filter(|ns| !ns.is_empty()) {
            Some(ns) => format!("{}/{}/{}", ns, kind, self.metadata.name),
            None => format!("{}/{}", kind, self.metadata.name),
        }
    }
}

/// Convert a rendered manifest into a JSON object keyed by resource identity.
///
/// Documents holding nothing but whitespace or comments are skipped. When
/// two documents share a key the later one wins. Values of `Secret` data and
/// stringData are replaced by redaction markers.
pub fn convert_manifest_to_json(manifest: &str) -> Result<String> {
    let mut resources: BTreeMap<String, Value> = BTreeMap::new();

    for (index, document) in manifest.split(DOCUMENT_SEPARATOR).enumerate() {
        let mut value =
            parse_document(document).map_err(|e| Error::manifest_parse_at(index, e.to_string()))?;
        if value.is_null() {
            continue;
        }

        let identity: Identity = serde_json::from_value(value.clone())
            .map_err(|e| Error::manifest_parse_at(index, format!("invalid resource identity: {}", e)))?;
        if identity.kind == SECRET_KIND && identity.group().is_empty() {
            mask_secret(&mut value).map_err(|e| Error::manifest_parse_at(index, e))?;
        }

        let key = identity.key();
        if resources.insert(key.clone(), value).is_some() {
            debug!(key = %key, "duplicate resource key, keeping the later document");
        }
    }

    serde_json::to_string(&resources)
        .map_err(|e| Error::manifest_parse(format!("failed to serialize manifest: {}", e)))
}

fn mask_secret(secret: &mut Value) -> std::result::Result<(), String> {
    if let Some(data) = secret.get_mut("data").and_then(Value::as_object_mut) {
        for (field, value) in data.iter_mut() {
            let decoded = match &*value {
                Value::Null => Vec::new(),
                Value::String(encoded) => STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| format!("secret data field '{}' is not base64: {}", field, e))?,
                _ => return Err(format!("secret data field '{}' is not a string", field)),
            };
            *value = Value::String(hash_sensitive_value(&decoded));
        }
    }
    if let Some(data) = secret.get_mut("stringData").and_then(Value::as_object_mut) {
        for value in data.values_mut() {
            let plain = match &*value {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            *value = Value::String(hash_sensitive_value(plain.as_bytes()));
        }
    }
    Ok(())
}
