//! Manifest sanitizer
//!
//! Turns a rendered multi-document manifest into one JSON object keyed by
//! `[namespace/]kind[.group]/name`, masking secret values with one-way
//! markers so that a diff shows a change without showing the value.

#![deny(missing_docs)]

pub mod convert;
pub mod redact;

use rudder_common::Result;

pub use convert::{convert_manifest_to_json, DOCUMENT_SEPARATOR};
pub use redact::{hash_sensitive_value, redact_sensitive_values};

/// Canonical JSON of `manifest` with every sensitive literal masked
pub fn sanitize<S: AsRef<str>>(manifest: &str, sensitive: &[S]) -> Result<String> {
    let json = convert_manifest_to_json(manifest)?;
    Ok(redact_sensitive_values(&json, sensitive))
}
