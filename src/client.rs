//! Release service client handle

use std::time::Duration;

use hyper_util::rt::TokioIo;
use rudder_common::{Error, Result};
use rudder_infra::ClientTls;
use rudder_proto::release_service_client::ReleaseServiceClient;
use rudder_proto::{
    DeleteReleaseRequest, GetHistoryRequest, GetReleaseRequest, GetVersionRequest,
    GetVersionResponse, ListReleasesRequest, Release, StoreReleaseRequest,
};
use tokio::net::TcpStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::{Code, Status};
use tower::service_fn;
use tracing::debug;

const CONTEXT: &str = "release-client";

/// Time allowed to establish a connection
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection to a release service.
///
/// Cheap to clone; clones share the underlying channel. The channel
/// connects on first use.
#[derive(Clone)]
pub struct ReleaseClient {
    inner: ReleaseServiceClient<Channel>,
    host: String,
    tls: bool,
}

impl std::fmt::Debug for ReleaseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseClient")
            .field("host", &self.host)
            .field("tls", &self.tls)
            .finish()
    }
}

impl ReleaseClient {
    /// Client for the service at `host` (`host:port`), over TLS when given
    pub fn connect(host: &str, tls: Option<&ClientTls>) -> Result<Self> {
        let endpoint = Endpoint::from_shared(format!("http://{}", host))
            .map_err(|e| Error::configuration(CONTEXT, format!("invalid host '{}': {}", host, e)))?
            .connect_timeout(CONNECT_TIMEOUT)
            .http2_keep_alive_interval(Duration::from_secs(30))
            .keep_alive_while_idle(true);

        let channel = match tls {
            None => endpoint.connect_lazy(),
            Some(tls) => {
                let connector = tls.connector();
                let server_name = tls.server_name_for(host)?;
                let addr = host.to_string();
                endpoint.connect_with_connector_lazy(service_fn(move |_: Uri| {
                    let connector = connector.clone();
                    let server_name = server_name.clone();
                    let addr = addr.clone();
                    async move {
                        let tcp = TcpStream::connect(addr).await?;
                        tcp.set_nodelay(true)?;
                        let stream = connector.connect(server_name, tcp).await?;
                        Ok::<_, std::io::Error>(TokioIo::new(stream))
                    }
                }))
            }
        };

        debug!(host, tls = tls.is_some(), "release client configured");
        Ok(Self {
            inner: ReleaseServiceClient::new(channel),
            host: host.to_string(),
            tls: tls.is_some(),
        })
    }

    /// Target `host:port`
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Whether the channel uses TLS
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Generated client, for calls not wrapped here
    pub fn service(&self) -> ReleaseServiceClient<Channel> {
        self.inner.clone()
    }

    /// Server version and store backend
    pub async fn version(&self) -> Result<GetVersionResponse> {
        let resp = self
            .service()
            .get_version(GetVersionRequest {})
            .await
            .map_err(|s| from_status(s, ""))?;
        Ok(resp.into_inner())
    }

    /// Latest revision of each release, optionally in one namespace
    pub async fn list_releases(&self, namespace: Option<&str>, limit: u32) -> Result<Vec<Release>> {
        let req = ListReleasesRequest {
            namespace: namespace.unwrap_or_default().to_string(),
            limit,
        };
        let resp = self
            .service()
            .list_releases(req)
            .await
            .map_err(|s| from_status(s, ""))?;
        Ok(resp.into_inner().releases)
    }

    /// One revision; `version` 0 is the latest
    pub async fn get_release(&self, name: &str, version: u32) -> Result<Release> {
        let req = GetReleaseRequest {
            name: name.to_string(),
            version,
        };
        self.service()
            .get_release(req)
            .await
            .map_err(|s| from_status(s, name))?
            .into_inner()
            .release
            .ok_or_else(|| Error::release_not_found(name))
    }

    /// Revisions of a release, newest first; `max` 0 returns all
    pub async fn history(&self, name: &str, max: u32) -> Result<Vec<Release>> {
        let req = GetHistoryRequest {
            name: name.to_string(),
            max,
        };
        let resp = self
            .service()
            .get_history(req)
            .await
            .map_err(|s| from_status(s, name))?;
        Ok(resp.into_inner().releases)
    }

    /// Store a revision, returning how many old revisions were pruned
    pub async fn store_release(&self, release: Release) -> Result<u32> {
        let name = release.name.clone();
        let resp = self
            .service()
            .store_release(StoreReleaseRequest {
                release: Some(release),
            })
            .await
            .map_err(|s| from_status(s, &name))?;
        Ok(resp.into_inner().pruned)
    }

    /// Delete every revision of a release
    pub async fn delete_release(&self, name: &str) -> Result<Vec<Release>> {
        let resp = self
            .service()
            .delete_release(DeleteReleaseRequest {
                name: name.to_string(),
            })
            .await
            .map_err(|s| from_status(s, name))?;
        Ok(resp.into_inner().releases)
    }
}

fn from_status(status: Status, name: &str) -> Error {
    match status.code() {
        Code::NotFound if !name.is_empty() => Error::release_not_found(name),
        code => Error::server(CONTEXT, format!("{:?}: {}", code, status.message())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_release_not_found() {
        assert!(from_status(Status::not_found("gone"), "web").is_not_found());
        assert!(matches!(
            from_status(Status::unavailable("down"), "web"),
            Error::Server { .. }
        ));
    }

    #[tokio::test]
    async fn invalid_host_is_configuration_error() {
        assert!(matches!(
            ReleaseClient::connect("bad host^", None),
            Err(Error::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn plaintext_client_is_lazy() {
        let client = ReleaseClient::connect("127.0.0.1:1", None).unwrap();
        assert_eq!(client.host(), "127.0.0.1:1");
        assert!(!client.is_tls());
        assert!(client.version().await.is_err());
    }
}
