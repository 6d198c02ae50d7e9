//! Idle connections are closed even while keepalive pings flow

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use rudder_proto::release_service_client::ReleaseServiceClient;
use rudder_proto::GetVersionRequest;
use rudder_server::{LocalServiceOptions, ServerHandle, ServiceEnvironment, StartOutcome};
use rudder_storage::{Memory, Storage};
use tokio::net::TcpStream;
use tonic::transport::{Channel, Endpoint, Uri};

async fn spawn(idle_timeout: Duration, keepalive_interval: Duration) -> ServerHandle {
    let env = ServiceEnvironment::new(Storage::new(Arc::new(Memory::new())));
    let mut options = LocalServiceOptions::new("127.0.0.1:0");
    options.idle_timeout = idle_timeout;
    options.keepalive_interval = keepalive_interval;
    match rudder_server::start(env, options).await.unwrap() {
        StartOutcome::Spawned(handle) => handle,
        StartOutcome::AlreadyServing => panic!("ephemeral port reported in use"),
    }
}

/// Client whose every new TCP connection bumps `connections`
fn counting_client(addr: SocketAddr, connections: Arc<AtomicUsize>) -> ReleaseServiceClient<Channel> {
    let channel = Endpoint::from_shared(format!("http://{}", addr))
        .unwrap()
        .connect_with_connector_lazy(tower::service_fn(move |_: Uri| {
            connections.fetch_add(1, Ordering::SeqCst);
            async move { TcpStream::connect(addr).await.map(TokioIo::new) }
        }));
    ReleaseServiceClient::new(channel)
}

async fn version(client: &mut ReleaseServiceClient<Channel>) {
    // The first call after the server hung up may see the closed connection.
    if client.get_version(GetVersionRequest {}).await.is_err() {
        client.get_version(GetVersionRequest {}).await.unwrap();
    }
}

/// Story: keepalive pings every 200ms do not keep an unused connection open
#[tokio::test]
async fn story_idle_connection_closed_despite_keepalive() {
    let mut server = spawn(Duration::from_secs(1), Duration::from_millis(200)).await;
    let connections = Arc::new(AtomicUsize::new(0));
    let mut client = counting_client(server.local_addr(), connections.clone());

    version(&mut client).await;
    assert_eq!(connections.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    version(&mut client).await;
    assert_eq!(connections.load(Ordering::SeqCst), 2);

    server.stop();
}

#[tokio::test]
async fn busy_connection_is_reused() {
    let mut server = spawn(Duration::from_secs(2), Duration::from_millis(200)).await;
    let connections = Arc::new(AtomicUsize::new(0));
    let mut client = counting_client(server.local_addr(), connections.clone());

    for _ in 0..6 {
        version(&mut client).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
    assert_eq!(connections.load(Ordering::SeqCst), 1);

    server.stop();
}
