//! One-way redaction markers

use aws_lc_rs::digest::{digest, SHA512};

/// Marker for a sensitive value.
///
/// Deterministic: equal inputs give equal markers, so a diff still shows
/// that a value changed without showing the value.
pub fn hash_sensitive_value(value: &[u8]) -> String {
    let sum = digest(&SHA512, value);
    let hex: String = sum.as_ref()[..8]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    format!("(sensitive value {})", hex)
}

/// Replace every occurrence of each literal in `text` with its marker.
///
/// Empty literals are ignored.
pub fn redact_sensitive_values<S: AsRef<str>>(text: &str, literals: &[S]) -> String {
    let mut masked = text.to_string();
    for literal in literals {
        let literal: &str = literal.as_ref();
        if literal.is_empty() {
            continue;
        }
        masked = masked.replace(literal, &hash_sensitive_value(literal.as_bytes()));
    }
    masked
}
