//! gRPC definitions for the rudder release service.
//!
//! The release service is a small unary API over the release store:
//!
//! | RPC | Request | Response |
//! |---|---|---|
//! | `GetVersion` | [`GetVersionRequest`] | [`GetVersionResponse`] |
//! | `ListReleases` | [`ListReleasesRequest`] | [`ListReleasesResponse`] |
//! | `GetRelease` | [`GetReleaseRequest`] | [`GetReleaseResponse`] |
//! | `GetHistory` | [`GetHistoryRequest`] | [`GetHistoryResponse`] |
//! | `StoreRelease` | [`StoreReleaseRequest`] | [`StoreReleaseResponse`] |
//! | `DeleteRelease` | [`DeleteReleaseRequest`] | [`DeleteReleaseResponse`] |
//!
//! [`Release`] is opaque to the connection bootstrap: it is stored and
//! returned as-is, keyed by name and version.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use rudder_proto::release_service_client::ReleaseServiceClient;
//! use rudder_proto::GetVersionRequest;
//!
//! let mut client = ReleaseServiceClient::new(channel);
//! let version = client.get_version(GetVersionRequest {}).await?.into_inner();
//! ```

// Generated service code doesn't have docs
#![allow(missing_docs)]

include!(concat!(env!("OUT_DIR"), "/rudder.release.v1.ReleaseService.rs"));

/// Lifecycle state of a release revision
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ReleaseStatus {
    Unknown = 0,
    Deployed = 1,
    Deleted = 2,
    Superseded = 3,
    Failed = 4,
    Deleting = 5,
    PendingInstall = 6,
    PendingUpgrade = 7,
    PendingRollback = 8,
}

impl ReleaseStatus {
    /// Label value used by the release stores
    pub fn as_str_name(&self) -> &'static str {
        match self {
            ReleaseStatus::Unknown => "UNKNOWN",
            ReleaseStatus::Deployed => "DEPLOYED",
            ReleaseStatus::Deleted => "DELETED",
            ReleaseStatus::Superseded => "SUPERSEDED",
            ReleaseStatus::Failed => "FAILED",
            ReleaseStatus::Deleting => "DELETING",
            ReleaseStatus::PendingInstall => "PENDING_INSTALL",
            ReleaseStatus::PendingUpgrade => "PENDING_UPGRADE",
            ReleaseStatus::PendingRollback => "PENDING_ROLLBACK",
        }
    }

    /// Parse a label value produced by [`Self::as_str_name`]
    pub fn from_str_name(value: &str) -> Option<Self> {
        match value {
            "UNKNOWN" => Some(Self::Unknown),
            "DEPLOYED" => Some(Self::Deployed),
            "DELETED" => Some(Self::Deleted),
            "SUPERSEDED" => Some(Self::Superseded),
            "FAILED" => Some(Self::Failed),
            "DELETING" => Some(Self::Deleting),
            "PENDING_INSTALL" => Some(Self::PendingInstall),
            "PENDING_UPGRADE" => Some(Self::PendingUpgrade),
            "PENDING_ROLLBACK" => Some(Self::PendingRollback),
            _ => None,
        }
    }
}

/// Timestamps and description of a release revision
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReleaseInfo {
    /// Unix seconds of the first deployment of this release name
    #[prost(int64, tag = "1")]
    pub first_deployed: i64,
    /// Unix seconds of this revision's deployment
    #[prost(int64, tag = "2")]
    pub last_deployed: i64,
    #[prost(string, tag = "3")]
    pub description: ::prost::alloc::string::String,
}

/// One revision of a release
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Release {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub namespace: ::prost::alloc::string::String,
    #[prost(uint32, tag = "3")]
    pub version: u32,
    #[prost(enumeration = "ReleaseStatus", tag = "4")]
    pub status: i32,
    /// Rendered manifest
    #[prost(string, tag = "5")]
    pub manifest: ::prost::alloc::string::String,
    /// Chart reference the release was rendered from
    #[prost(string, tag = "6")]
    pub chart: ::prost::alloc::string::String,
    /// Raw values document
    #[prost(string, tag = "7")]
    pub config: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "8")]
    pub info: ::core::option::Option<ReleaseInfo>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct GetVersionRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetVersionResponse {
    #[prost(string, tag = "1")]
    pub version: ::prost::alloc::string::String,
    /// Name of the store backend serving releases
    #[prost(string, tag = "2")]
    pub storage_driver: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListReleasesRequest {
    /// Only releases in this namespace; empty means all
    #[prost(string, tag = "1")]
    pub namespace: ::prost::alloc::string::String,
    /// Maximum number of releases; 0 means unlimited
    #[prost(uint32, tag = "2")]
    pub limit: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListReleasesResponse {
    /// Latest revision of each release name
    #[prost(message, repeated, tag = "1")]
    pub releases: ::prost::alloc::vec::Vec<Release>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetReleaseRequest {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    /// Revision to fetch; 0 means latest
    #[prost(uint32, tag = "2")]
    pub version: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetReleaseResponse {
    #[prost(message, optional, tag = "1")]
    pub release: ::core::option::Option<Release>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetHistoryRequest {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    /// Maximum number of revisions, newest first; 0 means all
    #[prost(uint32, tag = "2")]
    pub max: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetHistoryResponse {
    #[prost(message, repeated, tag = "1")]
    pub releases: ::prost::alloc::vec::Vec<Release>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StoreReleaseRequest {
    #[prost(message, optional, tag = "1")]
    pub release: ::core::option::Option<Release>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StoreReleaseResponse {
    /// Revisions removed to honor the history limit
    #[prost(uint32, tag = "1")]
    pub pruned: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteReleaseRequest {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteReleaseResponse {
    /// Every revision that was removed
    #[prost(message, repeated, tag = "1")]
    pub releases: ::prost::alloc::vec::Vec<Release>,
}

impl Release {
    /// Storage key `<name>.v<version>`
    pub fn key(&self) -> String {
        release_key(&self.name, self.version)
    }

    /// Status label value
    pub fn status_name(&self) -> &'static str {
        ReleaseStatus::try_from(self.status)
            .unwrap_or(ReleaseStatus::Unknown)
            .as_str_name()
    }
}

/// Storage key for a release revision
pub fn release_key(name: &str, version: u32) -> String {
    format!("{}.v{}", name, version)
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;

    #[test]
    fn release_key_format() {
        let release = Release {
            name: "web".to_string(),
            version: 3,
            ..Default::default()
        };
        assert_eq!(release.key(), "web.v3");
    }

    #[test]
    fn status_label_names() {
        let mut release = Release {
            status: ReleaseStatus::PendingUpgrade as i32,
            ..Default::default()
        };
        assert_eq!(release.status_name(), "PENDING_UPGRADE");
        assert_eq!(
            ReleaseStatus::from_str_name("PENDING_UPGRADE"),
            Some(ReleaseStatus::PendingUpgrade)
        );

        release.status = 99;
        assert_eq!(release.status_name(), "UNKNOWN");
    }

    #[test]
    fn release_survives_wire_encoding() {
        let release = Release {
            name: "db".to_string(),
            namespace: "data".to_string(),
            version: 7,
            status: ReleaseStatus::Deployed as i32,
            manifest: "kind: ConfigMap\n".to_string(),
            info: Some(ReleaseInfo {
                first_deployed: 1,
                last_deployed: 2,
                description: "upgrade complete".to_string(),
            }),
            ..Default::default()
        };

        let bytes = release.encode_to_vec();
        assert_eq!(Release::decode(bytes.as_slice()).unwrap(), release);
    }
}
