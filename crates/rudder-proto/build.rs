use tonic_build::manual::{Builder, Method, Service};

/// Unary method on the release service, encoded with prost
fn unary(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(format!("crate::{input}"))
        .output_type(format!("crate::{output}"))
        .codec_path("tonic::codec::ProstCodec")
        .build()
}

fn main() {
    // Messages are hand-written prost structs in src/lib.rs, so only the
    // service stubs are generated here and no protoc is needed.
    let service = Service::builder()
        .name("ReleaseService")
        .package("rudder.release.v1")
        .method(unary(
            "get_version",
            "GetVersion",
            "GetVersionRequest",
            "GetVersionResponse",
        ))
        .method(unary(
            "list_releases",
            "ListReleases",
            "ListReleasesRequest",
            "ListReleasesResponse",
        ))
        .method(unary(
            "get_release",
            "GetRelease",
            "GetReleaseRequest",
            "GetReleaseResponse",
        ))
        .method(unary(
            "get_history",
            "GetHistory",
            "GetHistoryRequest",
            "GetHistoryResponse",
        ))
        .method(unary(
            "store_release",
            "StoreRelease",
            "StoreReleaseRequest",
            "StoreReleaseResponse",
        ))
        .method(unary(
            "delete_release",
            "DeleteRelease",
            "DeleteReleaseRequest",
            "DeleteReleaseResponse",
        ))
        .build();

    Builder::new().compile(&[service]);

    println!("cargo:rerun-if-changed=build.rs");
}
