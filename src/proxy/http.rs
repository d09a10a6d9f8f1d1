//! Plain HTTP listener: answers ACME HTTP-01 challenges and redirects
//! everything else to HTTPS.

use crate::acme::{is_valid_token, CHALLENGE_PATH_PREFIX};
use crate::engine::EngineContext;
use crate::error::{html_error_response, ProxyErrorCode};
use crate::listener::{ListenerSpec, SharedSpec};
use crate::metrics::MetricsSample;
use crate::proxy::rewrite::https_origin;
use crate::proxy::{client_ip, full, ProxyBody};
use crate::sni::normalize_host;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, Instrument};

pub async fn serve(
    listener: TcpListener,
    spec: SharedSpec,
    ctx: Arc<EngineContext>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, id = spec.load().id, "HTTP listener started");
    }

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let spec = spec.load_full();
                        let ctx = Arc::clone(&ctx);
                        let span = info_span!("conn", listener = spec.id, peer = %addr);
                        tokio::spawn(handle_connection(stream, addr, spec, ctx).instrument(span));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!(id = spec.load().id, "HTTP listener shutting down");
                    break;
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, spec: Arc<ListenerSpec>, ctx: Arc<EngineContext>) {
    let idle = ctx.config.idle_timeout;
    let service = service_fn(move |req: Request<Incoming>| {
        let spec = Arc::clone(&spec);
        let ctx = Arc::clone(&ctx);
        async move { handle_request(req, peer, spec, ctx).await }
    });

    let mut builder = http1::Builder::new();
    builder.timer(TokioTimer::new()).header_read_timeout(idle);
    if let Err(e) = builder.serve_connection(TokioIo::new(stream), service).await {
        debug!(error = %e, "HTTP connection closed with error");
    }
}

async fn handle_request(
    req: Request<Incoming>,
    peer: SocketAddr,
    spec: Arc<ListenerSpec>,
    ctx: Arc<EngineContext>,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let started = Instant::now();
    let hostname = request_host(&req);

    let response = if let Some(token) = req.uri().path().strip_prefix(CHALLENGE_PATH_PREFIX) {
        serve_challenge(&ctx, token).await
    } else {
        match hostname.as_deref() {
            Some(host) => {
                if !ctx.certs.has_certificate(host) {
                    // warm the certificate before the client comes back over TLS
                    ctx.certs.request_issuance(host);
                }
                https_redirect(&req, host, ctx.config.https_port)
            }
            None => html_error_response(
                ProxyErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
                None,
            ),
        }
    };

    ctx.metrics.record(
        MetricsSample::new(spec.id)
            .requests(1)
            .status(response.status().as_u16())
            .latency(started.elapsed())
            .hostname(hostname.as_deref())
            .client_ip(client_ip(peer)),
    );

    Ok(response)
}

/// Hostname from the Host header, or the request target in absolute form
pub(crate) fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .and_then(normalize_host)
}

/// Answer an HTTP-01 challenge from memory or the webroot
async fn serve_challenge(ctx: &EngineContext, token: &str) -> Response<ProxyBody> {
    if !is_valid_token(token) {
        debug!("Rejected malformed challenge token");
        return not_found();
    }

    if let Some(key_auth) = ctx.challenges.get(token).await {
        debug!(token, "Responding to ACME HTTP-01 challenge");
        return plain_text(key_auth);
    }

    if let Some(webroot) = &ctx.config.webroot {
        if let Some(body) = read_webroot_challenge(webroot, token).await {
            debug!(token, "Responding to ACME HTTP-01 challenge from webroot");
            return plain_text(body);
        }
    }

    not_found()
}

/// Read a challenge file, refusing anything that resolves outside the webroot
async fn read_webroot_challenge(webroot: &Path, token: &str) -> Option<Vec<u8>> {
    let root = tokio::fs::canonicalize(webroot).await.ok()?;
    let path = root.join(".well-known").join("acme-challenge").join(token);
    let resolved = tokio::fs::canonicalize(&path).await.ok()?;
    if !resolved.starts_with(&root) {
        return None;
    }
    tokio::fs::read(&resolved).await.ok()
}

fn plain_text(body: impl Into<hyper::body::Bytes>) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(full(body))
        .expect("valid response builder")
}

fn not_found() -> Response<ProxyBody> {
    html_error_response(ProxyErrorCode::NotFound, "Not found", None)
}

/// Build an HTTPS redirect response (301 Moved Permanently)
fn https_redirect<B>(req: &Request<B>, host: &str, https_port: u16) -> Response<ProxyBody> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    let location = format!("{}{}", https_origin(host, https_port), path);

    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(hyper::header::LOCATION, location)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(full("Redirecting to HTTPS"))
        .expect("valid response builder")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::CertStoreConfig;
    use crate::engine::EngineConfig;
    use crate::listener::tests::record;
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Harness {
        addr: SocketAddr,
        ctx: Arc<EngineContext>,
        shutdown_tx: watch::Sender<bool>,
        _certs: tempfile::TempDir,
    }

    async fn start(https_port: u16, webroot: Option<PathBuf>) -> Harness {
        let certs = tempfile::tempdir().unwrap();
        let ctx = EngineContext::builder()
            .with_config(EngineConfig {
                https_port,
                webroot,
                ..Default::default()
            })
            .with_cert_store(CertStoreConfig::new(certs.path()))
            .build()
            .unwrap();

        let spec = ListenerSpec::from_record(&record(7, "http", 80), &[])
            .unwrap()
            .into_shared();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(serve(listener, spec, Arc::clone(&ctx), shutdown_rx));

        Harness {
            addr,
            ctx,
            shutdown_tx,
            _certs: certs,
        }
    }

    async fn get(addr: SocketAddr, raw: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    #[tokio::test]
    async fn test_redirects_to_https() {
        let h = start(443, None).await;
        let response = get(
            h.addr,
            "GET /docs?page=2 HTTP/1.1\r\nHost: Example.com:8080\r\nConnection: close\r\n\r\n",
        )
        .await;

        assert!(response.starts_with("HTTP/1.1 301"), "{}", response);
        assert!(response
            .to_lowercase()
            .contains("location: https://example.com/docs?page=2\r\n"));
        let _ = h.shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn test_redirect_keeps_non_default_port() {
        let h = start(8443, None).await;
        let response = get(h.addr, "GET / HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n").await;
        assert!(response
            .to_lowercase()
            .contains("location: https://example.com:8443/\r\n"));

        let mut rx = h.ctx.metrics.subscribe();
        h.ctx.metrics.flush().await;
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].proxy_id, 7);
        assert_eq!(batch[0].status_code, 301);
        assert_eq!(batch[0].hostname.as_deref(), Some("example.com"));
    }

    #[tokio::test]
    async fn test_missing_host_is_bad_request() {
        let h = start(443, None).await;
        let response = get(h.addr, "GET / HTTP/1.0\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.0 400") || response.starts_with("HTTP/1.1 400"), "{}", response);
    }

    #[tokio::test]
    async fn test_challenge_from_memory() {
        let h = start(443, None).await;
        h.ctx
            .challenges
            .set("tok_123".to_string(), "tok_123.thumbprint".to_string())
            .await;

        let response = get(
            h.addr,
            "GET /.well-known/acme-challenge/tok_123 HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
        assert!(response.ends_with("tok_123.thumbprint"));
    }

    #[tokio::test]
    async fn test_challenge_from_webroot_and_traversal() {
        let webroot = tempfile::tempdir().unwrap();
        let dir = webroot.path().join(".well-known").join("acme-challenge");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("filetoken"), "filetoken.abc").unwrap();
        std::fs::write(webroot.path().join("secret"), "do not serve").unwrap();

        let h = start(443, Some(webroot.path().to_path_buf())).await;

        let response = get(
            h.addr,
            "GET /.well-known/acme-challenge/filetoken HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.ends_with("filetoken.abc"), "{}", response);

        for path in [
            "/.well-known/acme-challenge/../../secret",
            "/.well-known/acme-challenge/..%2F..%2Fsecret",
            "/.well-known/acme-challenge/missing",
        ] {
            let raw = format!("GET {} HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n", path);
            let response = get(h.addr, &raw).await;
            assert!(response.starts_with("HTTP/1.1 404"), "{}: {}", path, response);
            assert!(!response.contains("do not serve"));
        }
    }

    #[test]
    fn test_request_host_sources() {
        let req = Request::builder()
            .uri("/")
            .header("Host", "App.Example.com:80")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("app.example.com"));

        let req = Request::builder()
            .uri("http://absolute.example.com/x")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("absolute.example.com"));

        let req = Request::builder().uri("/").header("Host", "bad host!").body(()).unwrap();
        assert!(request_host(&req).is_none());
    }

    #[test]
    fn test_redirect_brackets_ipv6() {
        let req = Request::builder().uri("/a").body(()).unwrap();
        let response = https_redirect(&req, "::1", 443);
        assert_eq!(response.headers()["location"], "https://[::1]/a");
    }
}
