//! Connection idle policy
//!
//! A connection is idle when no RPC has been in flight on it for the idle
//! timeout. Raw socket traffic does not count: HTTP/2 keepalive pings move
//! bytes on a connection nobody is using.
//!
//! [`IdleTimeout`] wraps each accepted stream and owns the deadline.
//! [`ActivityLayer`] sits in front of the service and marks the connection a
//! request arrived on as busy until the response is produced.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{Instant, Sleep};
use tonic::codegen::http::Request;
use tonic::transport::server::{Connected, TcpConnectInfo, TlsConnectInfo};
use tower::{Layer, Service};
use tracing::warn;

/// RPC activity on one connection
#[derive(Debug)]
pub struct ConnectionActivity {
    in_flight: AtomicUsize,
    idle_since: Mutex<Instant>,
}

impl ConnectionActivity {
    /// Activity for a connection accepted now
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            in_flight: AtomicUsize::new(0),
            idle_since: Mutex::new(Instant::now()),
        })
    }

    /// Mark one request as running until the guard drops
    pub fn begin(self: &Arc<Self>) -> RequestGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        RequestGuard(Arc::clone(self))
    }

    /// Requests currently running
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// When the connection went idle, or `None` while requests run
    fn idle_since(&self) -> Option<Instant> {
        if self.in_flight() > 0 {
            return None;
        }
        self.idle_since.lock().ok().map(|since| *since)
    }

    fn end(&self) {
        if let Ok(mut since) = self.idle_since.lock() {
            *since = Instant::now();
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Keeps a connection busy while alive
#[derive(Debug)]
pub struct RequestGuard(Arc<ConnectionActivity>);

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.0.end();
    }
}

/// Connection info tonic attaches to every request
#[derive(Debug, Clone)]
pub struct IdleConnectInfo {
    /// Peer addresses
    pub tcp: TcpConnectInfo,
    /// Activity of the connection the request arrived on
    pub activity: Arc<ConnectionActivity>,
}

fn request_activity<B>(req: &Request<B>) -> Option<Arc<ConnectionActivity>> {
    let extensions = req.extensions();
    extensions
        .get::<IdleConnectInfo>()
        .or_else(|| {
            extensions
                .get::<TlsConnectInfo<IdleConnectInfo>>()
                .map(|tls| tls.get_ref())
        })
        .map(|info| Arc::clone(&info.activity))
}

/// Stream that fails reads once its connection has been idle for `timeout`
#[derive(Debug)]
pub struct IdleTimeout<S> {
    inner: S,
    timeout: Duration,
    activity: Arc<ConnectionActivity>,
    deadline: Pin<Box<Sleep>>,
}

impl<S> IdleTimeout<S> {
    /// Wrap `inner` with fresh activity tracking
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self::with_activity(inner, timeout, ConnectionActivity::new())
    }

    /// Wrap `inner`, judging idleness by `activity`
    pub fn with_activity(inner: S, timeout: Duration, activity: Arc<ConnectionActivity>) -> Self {
        Self {
            inner,
            timeout,
            activity,
            deadline: Box::pin(tokio::time::sleep(timeout)),
        }
    }

    /// Activity shared with the request layer
    pub fn activity(&self) -> &Arc<ConnectionActivity> {
        &self.activity
    }

    /// Whether the connection is past its idle deadline.
    ///
    /// Re-arms the deadline when it fired early. A running request pushes the
    /// deadline a full timeout out.
    fn poll_expired(&mut self, cx: &mut Context<'_>) -> bool {
        loop {
            if self.deadline.as_mut().poll(cx).is_pending() {
                return false;
            }
            let next = match self.activity.idle_since() {
                Some(since) => since + self.timeout,
                None => Instant::now() + self.timeout,
            };
            if next <= Instant::now() {
                return true;
            }
            self.deadline.as_mut().reset(next);
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for IdleTimeout<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let read = Pin::new(&mut this.inner).poll_read(cx, buf);
        match read {
            Poll::Ready(result) => Poll::Ready(result),
            Poll::Pending if this.poll_expired(cx) => {
                warn!("closing idle release service connection");
                Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connection idle timeout",
                )))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleTimeout<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Connected for IdleTimeout<TcpStream> {
    type ConnectInfo = IdleConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        IdleConnectInfo {
            tcp: self.inner.connect_info(),
            activity: Arc::clone(&self.activity),
        }
    }
}

/// Marks connections busy for the duration of each request
#[derive(Debug, Clone, Copy, Default)]
pub struct ActivityLayer;

impl<S> Layer<S> for ActivityLayer {
    type Service = TrackActivity<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TrackActivity { inner }
    }
}

/// Service produced by [`ActivityLayer`]
#[derive(Debug, Clone)]
pub struct TrackActivity<S> {
    inner: S,
}

impl<S, B> Service<Request<B>> for TrackActivity<S>
where
    S: Service<Request<B>>,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let guard = request_activity(&req).map(|activity| activity.begin());
        let response = self.inner.call(req);
        Box::pin(async move {
            let result = response.await;
            drop(guard);
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const TIMEOUT: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn traffic_without_requests_does_not_extend_the_deadline() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut idle = IdleTimeout::new(server, TIMEOUT);
        let start = Instant::now();

        // Keepalive-like chatter every 20s.
        for _ in 0..2 {
            tokio::time::advance(Duration::from_secs(20)).await;
            client.write_all(b"p").await.unwrap();
            let mut one = [0u8; 1];
            idle.read_exact(&mut one).await.unwrap();
        }

        let mut one = [0u8; 1];
        let err = idle.read(&mut one).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(start.elapsed() >= TIMEOUT);
        assert!(start.elapsed() < TIMEOUT + Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn running_request_keeps_connection_open() {
        let (_client, server) = tokio::io::duplex(64);
        let mut idle = IdleTimeout::new(server, TIMEOUT);
        let guard = idle.activity().begin();
        assert_eq!(idle.activity().in_flight(), 1);

        let mut one = [0u8; 1];
        let still_open =
            tokio::time::timeout(Duration::from_secs(300), idle.read(&mut one)).await;
        assert!(still_open.is_err());

        drop(guard);
        assert_eq!(idle.activity().in_flight(), 0);
        let finished = Instant::now();
        let err = idle.read(&mut one).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(finished.elapsed() >= TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn layer_marks_the_request_connection_busy() {
        let activity = ConnectionActivity::new();
        let seen = Arc::clone(&activity);
        let mut svc = ActivityLayer.layer(tower::service_fn(move |_: Request<()>| {
            let seen = Arc::clone(&seen);
            async move { Ok::<_, std::convert::Infallible>(seen.in_flight()) }
        }));

        let mut req = Request::new(());
        req.extensions_mut().insert(IdleConnectInfo {
            tcp: TcpConnectInfo {
                local_addr: None,
                remote_addr: None,
            },
            activity: Arc::clone(&activity),
        });

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(svc.call(req).await.unwrap(), 1);
        assert_eq!(activity.in_flight(), 0);
        assert_eq!(activity.idle_since(), Some(Instant::now()));

        // Requests without connection info pass straight through.
        assert_eq!(svc.call(Request::new(())).await.unwrap(), 0);
    }
}
