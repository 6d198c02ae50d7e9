//! Release service over the configured store

use std::sync::Arc;

use rudder_common::{Error, VERSION};
use rudder_proto::release_service_server::{ReleaseService, ReleaseServiceServer};
use rudder_proto::{
    DeleteReleaseRequest, DeleteReleaseResponse, GetHistoryRequest, GetHistoryResponse,
    GetReleaseRequest, GetReleaseResponse, GetVersionRequest, GetVersionResponse,
    ListReleasesRequest, ListReleasesResponse, StoreReleaseRequest, StoreReleaseResponse,
};
use tonic::{Request, Response, Status};
use tracing::{debug, instrument, warn};

use crate::ServiceEnvironment;

/// gRPC handler for the release service
#[derive(Clone)]
pub struct ReleaseServer {
    env: Arc<ServiceEnvironment>,
}

impl ReleaseServer {
    /// Handler over `env`
    pub fn new(env: Arc<ServiceEnvironment>) -> Self {
        Self { env }
    }

    /// Convert to a tonic service
    pub fn into_service(self) -> ReleaseServiceServer<Self> {
        ReleaseServiceServer::new(self)
    }
}

fn to_status(err: Error) -> Status {
    if err.is_not_found() {
        Status::not_found(err.to_string())
    } else {
        warn!(error = %err, "release store request failed");
        Status::internal(err.to_string())
    }
}

fn require_name(name: &str) -> Result<(), Status> {
    if name.is_empty() {
        return Err(Status::invalid_argument("release name is required"));
    }
    Ok(())
}

fn truncate<T>(mut items: Vec<T>, limit: u32) -> Vec<T> {
    if limit > 0 {
        items.truncate(limit as usize);
    }
    items
}

#[tonic::async_trait]
impl ReleaseService for ReleaseServer {
    async fn get_version(
        &self,
        _request: Request<GetVersionRequest>,
    ) -> Result<Response<GetVersionResponse>, Status> {
        Ok(Response::new(GetVersionResponse {
            version: VERSION.to_string(),
            storage_driver: self.env.releases.name().to_string(),
        }))
    }

    #[instrument(skip(self, request))]
    async fn list_releases(
        &self,
        request: Request<ListReleasesRequest>,
    ) -> Result<Response<ListReleasesResponse>, Status> {
        let req = request.into_inner();
        let namespace = Some(req.namespace.as_str()).filter(|ns| !ns.is_empty());
        let releases = self
            .env
            .releases
            .list_latest(namespace)
            .await
            .map_err(to_status)?;
        debug!(count = releases.len(), "listed releases");
        Ok(Response::new(ListReleasesResponse {
            releases: truncate(releases, req.limit),
        }))
    }

    async fn get_release(
        &self,
        request: Request<GetReleaseRequest>,
    ) -> Result<Response<GetReleaseResponse>, Status> {
        let req = request.into_inner();
        require_name(&req.name)?;
        let release = match req.version {
            0 => self.env.releases.latest(&req.name).await,
            v => self.env.releases.get(&req.name, v).await,
        }
        .map_err(to_status)?;
        Ok(Response::new(GetReleaseResponse {
            release: Some(release),
        }))
    }

    async fn get_history(
        &self,
        request: Request<GetHistoryRequest>,
    ) -> Result<Response<GetHistoryResponse>, Status> {
        let req = request.into_inner();
        require_name(&req.name)?;
        let mut releases = self
            .env
            .releases
            .history(&req.name)
            .await
            .map_err(to_status)?;
        releases.reverse();
        Ok(Response::new(GetHistoryResponse {
            releases: truncate(releases, req.max),
        }))
    }

    #[instrument(skip(self, request))]
    async fn store_release(
        &self,
        request: Request<StoreReleaseRequest>,
    ) -> Result<Response<StoreReleaseResponse>, Status> {
        let release = request
            .into_inner()
            .release
            .ok_or_else(|| Status::invalid_argument("release is required"))?;
        require_name(&release.name)?;
        let pruned = self
            .env
            .releases
            .create(&release)
            .await
            .map_err(to_status)?;
        Ok(Response::new(StoreReleaseResponse { pruned }))
    }

    #[instrument(skip(self, request))]
    async fn delete_release(
        &self,
        request: Request<DeleteReleaseRequest>,
    ) -> Result<Response<DeleteReleaseResponse>, Status> {
        let req = request.into_inner();
        require_name(&req.name)?;
        let releases = self
            .env
            .releases
            .delete_release(&req.name)
            .await
            .map_err(to_status)?;
        Ok(Response::new(DeleteReleaseResponse { releases }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudder_proto::{Release, ReleaseStatus};
    use rudder_storage::{Memory, Storage};
    use tonic::Code;

    fn server(max_history: u32) -> ReleaseServer {
        let storage = Storage::new(Arc::new(Memory::new())).with_max_history(max_history);
        ReleaseServer::new(Arc::new(ServiceEnvironment::new(storage)))
    }

    fn release(name: &str, namespace: &str, version: u32) -> Release {
        Release {
            name: name.to_string(),
            namespace: namespace.to_string(),
            version,
            status: ReleaseStatus::Deployed as i32,
            ..Default::default()
        }
    }

    async fn store(server: &ReleaseServer, r: Release) -> u32 {
        server
            .store_release(Request::new(StoreReleaseRequest { release: Some(r) }))
            .await
            .unwrap()
            .into_inner()
            .pruned
    }

    #[tokio::test]
    async fn version_reports_driver() {
        let resp = server(0)
            .get_version(Request::new(GetVersionRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.version, VERSION);
        assert_eq!(resp.storage_driver, "Memory");
    }

    /// Story: a release is stored three times under a limit of two, then read back
    #[tokio::test]
    async fn story_store_read_history_delete() {
        let server = server(2);
        assert_eq!(store(&server, release("web", "apps", 1)).await, 0);
        assert_eq!(store(&server, release("web", "apps", 2)).await, 0);
        assert_eq!(store(&server, release("web", "apps", 3)).await, 1);

        let latest = server
            .get_release(Request::new(GetReleaseRequest {
                name: "web".to_string(),
                version: 0,
            }))
            .await
            .unwrap()
            .into_inner()
            .release
            .unwrap();
        assert_eq!(latest.version, 3);

        let history = server
            .get_history(Request::new(GetHistoryRequest {
                name: "web".to_string(),
                max: 0,
            }))
            .await
            .unwrap()
            .into_inner()
            .releases;
        let versions: Vec<_> = history.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![3, 2]);

        let removed = server
            .delete_release(Request::new(DeleteReleaseRequest {
                name: "web".to_string(),
            }))
            .await
            .unwrap()
            .into_inner()
            .releases;
        assert_eq!(removed.len(), 2);

        let missing = server
            .get_release(Request::new(GetReleaseRequest {
                name: "web".to_string(),
                version: 0,
            }))
            .await
            .unwrap_err();
        assert_eq!(missing.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn list_filters_namespace_and_limits() {
        let server = server(0);
        store(&server, release("web", "apps", 1)).await;
        store(&server, release("web", "apps", 2)).await;
        store(&server, release("db", "data", 1)).await;
        store(&server, release("api", "apps", 1)).await;

        let all = server
            .list_releases(Request::new(ListReleasesRequest::default()))
            .await
            .unwrap()
            .into_inner()
            .releases;
        assert_eq!(all.len(), 3);

        let apps = server
            .list_releases(Request::new(ListReleasesRequest {
                namespace: "apps".to_string(),
                limit: 1,
            }))
            .await
            .unwrap()
            .into_inner()
            .releases;
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].name, "api");
    }

    #[tokio::test]
    async fn missing_arguments_are_rejected() {
        let server = server(0);
        let err = server
            .store_release(Request::new(StoreReleaseRequest { release: None }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let err = server
            .get_history(Request::new(GetHistoryRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn specific_revision_lookup() {
        let server = server(0);
        store(&server, release("web", "apps", 1)).await;
        store(&server, release("web", "apps", 2)).await;

        let first = server
            .get_release(Request::new(GetReleaseRequest {
                name: "web".to_string(),
                version: 1,
            }))
            .await
            .unwrap()
            .into_inner()
            .release
            .unwrap();
        assert_eq!(first.version, 1);
    }
}
