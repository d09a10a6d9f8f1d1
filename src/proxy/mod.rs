//! Protocol handlers and the plumbing they share: backend dialing through
//! the health tracker, the byte splice, and response body helpers.

pub mod http;
pub mod https;
pub mod rewrite;
pub mod sniff;
pub mod tcp;
pub mod udp;
pub mod upgrade;

use crate::engine::EngineContext;
use crate::error::ProxyErrorCode;
use crate::listener::Target;
use crate::metrics::Meter;
use crate::tls::server_name;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Sleep;
use tracing::debug;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

const SPLICE_BUF_SIZE: usize = 16 * 1024;

/// A backend connection, plain TCP or TLS
pub trait BackendIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> BackendIo for T {}

#[derive(Debug, Error)]
pub enum DialError {
    #[error("backend {0} is cooling down")]
    Down(String),

    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    #[error("connect timed out")]
    Timeout,

    #[error("TLS handshake failed: {0}")]
    Tls(#[source] io::Error),
}

impl DialError {
    pub fn error_code(&self) -> ProxyErrorCode {
        match self {
            DialError::Down(_) => ProxyErrorCode::BackendUnavailable,
            DialError::Timeout => ProxyErrorCode::RequestTimeout,
            DialError::Connect(_) | DialError::Tls(_) => ProxyErrorCode::ConnectionFailed,
        }
    }
}

/// Open a TCP connection to `target`, honoring the health tracker.
///
/// Returns [`DialError::Down`] without connecting while the target (or the
/// target for `hostname`) is cooling down. Failures are recorded against
/// the same key.
pub async fn dial(
    ctx: &EngineContext,
    target: &Target,
    hostname: Option<&str>,
) -> Result<TcpStream, DialError> {
    let addr = target.addr();
    ctx.health.register(&addr);

    if ctx.health.is_down(&addr, hostname) {
        return Err(DialError::Down(addr));
    }

    match tokio::time::timeout(ctx.config.connect_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => {
            ctx.health.mark_failure(&addr, hostname);
            Err(DialError::Connect(e))
        }
        Err(_) => {
            ctx.health.mark_failure(&addr, hostname);
            Err(DialError::Timeout)
        }
    }
}

/// [`dial`], then wrap the stream in TLS for `https` targets
pub async fn connect_backend(
    ctx: &EngineContext,
    target: &Target,
    hostname: Option<&str>,
) -> Result<Box<dyn BackendIo>, DialError> {
    let stream = dial(ctx, target, hostname).await?;
    if !target.is_tls() {
        return Ok(Box::new(stream));
    }

    let name = server_name(&target.host)
        .map_err(|e| DialError::Tls(io::Error::new(io::ErrorKind::InvalidInput, e.to_string())))?;

    let handshake = ctx.backend_tls.connect(name, stream);
    match tokio::time::timeout(ctx.config.connect_timeout, handshake).await {
        Ok(Ok(tls)) => Ok(Box::new(tls)),
        Ok(Err(e)) => {
            ctx.health.mark_failure(&target.addr(), hostname);
            Err(DialError::Tls(e))
        }
        Err(_) => {
            ctx.health.mark_failure(&target.addr(), hostname);
            Err(DialError::Timeout)
        }
    }
}

/// Last time either direction of a splice moved data
struct Activity {
    started: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let now = self.started.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_ms.load(Ordering::Relaxed)))
    }
}

async fn pump<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    idle: Duration,
    activity: &Activity,
    mut count: F,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u64),
{
    let mut buf = vec![0u8; SPLICE_BUF_SIZE];
    let mut total = 0u64;

    loop {
        let n = match tokio::time::timeout(idle, reader.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                // the other direction may still be busy
                if activity.idle_for() >= idle {
                    debug!(idle_secs = idle.as_secs(), "Stream idle, closing");
                    break;
                }
                continue;
            }
        };

        writer.write_all(&buf[..n]).await?;
        activity.touch();
        total += n as u64;
        count(n as u64);
    }

    // half-close so the peer sees EOF
    let _ = writer.shutdown().await;
    Ok(total)
}

/// Copy bytes both ways until both sides finish, an error occurs, or
/// neither side has sent anything for `idle`.
///
/// Returns `(client_to_backend, backend_to_client)` byte counts. Bytes are
/// also reported to `meter` as they move.
pub async fn splice<A, B>(client: A, backend: B, idle: Duration, meter: &Meter) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (mut backend_r, mut backend_w) = tokio::io::split(backend);
    let activity = Activity::new();

    let upstream = pump(&mut client_r, &mut backend_w, idle, &activity, |n| meter.add_in(n));
    let downstream = pump(&mut backend_r, &mut client_w, idle, &activity, |n| meter.add_out(n));

    tokio::try_join!(upstream, downstream)
}

/// Fails an I/O operation that stays pending with no progress in either
/// direction for `timeout`.
///
/// Writes are always watched. Reads are watched only with
/// [`IdleTimeout::with_read_watch`], and only once the first byte has been
/// read, so waiting for a response head stays under the response timeout.
pub struct IdleTimeout<T> {
    inner: T,
    timeout: Duration,
    deadline: Pin<Box<Sleep>>,
    watch_reads: bool,
    read_started: bool,
    waiting: bool,
}

impl<T> IdleTimeout<T> {
    pub fn new(inner: T, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            deadline: Box::pin(tokio::time::sleep(timeout)),
            watch_reads: false,
            read_started: false,
            waiting: false,
        }
    }

    pub fn with_read_watch(mut self) -> Self {
        self.watch_reads = true;
        self
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    fn progress(&mut self) {
        self.waiting = false;
    }

    fn stalled(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        if !self.waiting {
            self.waiting = true;
            let deadline = tokio::time::Instant::now() + self.timeout;
            self.deadline.as_mut().reset(deadline);
        }
        match self.deadline.as_mut().poll(cx) {
            Poll::Ready(()) => {
                debug!(idle_secs = self.timeout.as_secs_f32(), "Connection idle, aborting");
                Poll::Ready(io::Error::new(io::ErrorKind::TimedOut, "connection idle"))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for IdleTimeout<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                if buf.filled().len() > before {
                    this.read_started = true;
                    this.progress();
                }
                Poll::Ready(result)
            }
            Poll::Pending if this.watch_reads && this.read_started => {
                this.stalled(cx).map(Err)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for IdleTimeout<T> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.progress();
                Poll::Ready(result)
            }
            Poll::Pending => this.stalled(cx).map(Err),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(result) => {
                this.progress();
                Poll::Ready(result)
            }
            Poll::Pending => this.stalled(cx).map(Err),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Peer address with IPv4-mapped IPv6 folded back to IPv4
pub fn client_ip(addr: SocketAddr) -> IpAddr {
    match addr.ip() {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

pub fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}
