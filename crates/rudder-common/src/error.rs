//! Error types for rudder
//!
//! Every failure the bootstrap sequence can produce falls into one of the
//! variants below. Bootstrap steps wrap the underlying error in
//! [`Error::Bootstrap`] so callers see which step failed while still being
//! able to classify the cause through [`Error::root`].

use std::time::Duration;

use thiserror::Error;

/// Main error type for rudder operations
#[derive(Debug, Error)]
pub enum Error {
    /// Cluster configuration could not be resolved
    #[error("configuration error [{context}]: {message}")]
    Configuration {
        /// Description of what's wrong
        message: String,
        /// Where the configuration was being resolved (e.g., "kubeconfig", "config-file")
        context: String,
    },

    /// TLS material is malformed or inconsistent
    #[error("credential error: {message}")]
    Credential {
        /// Description of what failed
        message: String,
        /// The configuration field the material came from (if known)
        field: Option<String>,
    },

    /// Remote component installation failed
    #[error("installation error in {namespace}: {message}")]
    Installation {
        /// Description of what failed
        message: String,
        /// Namespace the component was being installed into
        namespace: String,
    },

    /// A readiness wait ran out of time
    #[error("timed out after {waited:?}: {message}")]
    Timeout {
        /// What was being waited on
        message: String,
        /// How long the wait lasted
        waited: Duration,
    },

    /// Port-forward tunnel setup failed
    #[error("tunnel error in {namespace}: {message}")]
    Tunnel {
        /// Description of what failed
        message: String,
        /// Namespace of the forwarded component
        namespace: String,
    },

    /// A manifest document could not be parsed
    #[error("manifest parse error: {message}")]
    ManifestParse {
        /// Description of the underlying parse failure
        message: String,
        /// Zero-based index of the offending document (if known)
        document: Option<usize>,
    },

    /// Local release server failed to start or stopped serving
    #[error("server error [{context}]: {message}")]
    Server {
        /// Description of what failed
        message: String,
        /// Where the failure occurred (e.g., "listen", "serve", "tls")
        context: String,
    },

    /// Release store operation failed
    #[error("storage error [{driver}]: {message}")]
    Storage {
        /// Description of what failed
        message: String,
        /// Name of the store backend
        driver: String,
    },

    /// Release record does not exist
    #[error("release not found: {key}")]
    ReleaseNotFound {
        /// Storage key that was looked up
        key: String,
    },

    /// A bootstrap step failed
    #[error("bootstrap step '{step}' failed: {source}")]
    Bootstrap {
        /// Name of the failed step
        step: &'static str,
        /// The error the step produced
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a configuration error with context
    pub fn configuration(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Create a credential error with the given message
    pub fn credential(msg: impl Into<String>) -> Self {
        Self::Credential {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a credential error tied to a configuration field
    pub fn credential_for(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Credential {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an installation error
    pub fn installation(namespace: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Installation {
            message: msg.into(),
            namespace: namespace.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>, waited: Duration) -> Self {
        Self::Timeout {
            message: msg.into(),
            waited,
        }
    }

    /// Create a tunnel error
    pub fn tunnel(namespace: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Tunnel {
            message: msg.into(),
            namespace: namespace.into(),
        }
    }

    /// Create a manifest parse error
    pub fn manifest_parse(msg: impl Into<String>) -> Self {
        Self::ManifestParse {
            message: msg.into(),
            document: None,
        }
    }

    /// Create a manifest parse error for a specific document
    pub fn manifest_parse_at(document: usize, msg: impl Into<String>) -> Self {
        Self::ManifestParse {
            message: msg.into(),
            document: Some(document),
        }
    }

    /// Create a server error with context
    pub fn server(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Server {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Create a storage error for a driver
    pub fn storage(driver: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Storage {
            message: msg.into(),
            driver: driver.into(),
        }
    }

    /// Create a not-found error for a storage key
    pub fn release_not_found(key: impl Into<String>) -> Self {
        Self::ReleaseNotFound { key: key.into() }
    }

    /// Wrap an error with the name of the bootstrap step that produced it
    pub fn in_step(step: &'static str, source: Error) -> Self {
        Self::Bootstrap {
            step,
            source: Box::new(source),
        }
    }

    /// The innermost error, skipping any bootstrap step wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Bootstrap { source, .. } => source.root(),
            other => other,
        }
    }

    /// Name of the bootstrap step this error came from, if it was wrapped
    pub fn step(&self) -> Option<&'static str> {
        match self {
            Error::Bootstrap { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Check if this error (or its root) is a missing release record.
    ///
    /// Stores map API 404s onto [`Error::ReleaseNotFound`].
    pub fn is_not_found(&self) -> bool {
        match self.root() {
            Error::ReleaseNotFound { .. } => true,
            _ => false,
        }
    }
}

/// Check whether a kube error is an API error with the given HTTP status
pub fn is_api_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == code)
}

/// Check whether a kube error reports that the object already exists
pub fn is_already_exists(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(ae) => ae.code == 409 && ae.reason == "AlreadyExists",
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    /// Story: bootstrap failures keep their classification through step context
    #[test]
    fn story_step_context_preserves_root_cause() {
        let err = Error::in_step("tunnel", Error::tunnel("kube-system", "no running pods"));

        assert!(err.to_string().contains("bootstrap step 'tunnel' failed"));
        assert!(err.to_string().contains("no running pods"));
        assert_eq!(err.step(), Some("tunnel"));
        assert!(matches!(err.root(), Error::Tunnel { .. }));
    }

    #[test]
    fn nested_steps_unwrap_to_innermost() {
        let inner = Error::in_step("wait", Error::timeout("component", Duration::from_secs(1)));
        let err = Error::in_step("install", inner);
        assert!(matches!(err.root(), Error::Timeout { .. }));
        assert_eq!(err.step(), Some("install"));
    }

    #[test]
    fn already_exists_requires_reason() {
        assert!(is_already_exists(&api_error(409, "AlreadyExists")));
        assert!(!is_already_exists(&api_error(409, "Conflict")));
        assert!(!is_already_exists(&api_error(404, "NotFound")));
    }

    #[test]
    fn not_found_covers_store_and_api() {
        assert!(Error::release_not_found("web.v1").is_not_found());
        assert!(Error::in_step("local-service", Error::release_not_found("web.v2")).is_not_found());
        assert!(is_api_status(&api_error(404, "NotFound"), 404));
        assert!(!Error::storage("memory", "broken").is_not_found());
    }

    #[test]
    fn credential_field_is_recorded() {
        match Error::credential_for("client_key", "bad key") {
            Error::Credential { field, message } => {
                assert_eq!(field.as_deref(), Some("client_key"));
                assert_eq!(message, "bad key");
            }
            _ => panic!("Expected Credential variant"),
        }
    }
}
