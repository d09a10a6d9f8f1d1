//! TLS-terminating HTTP reverse proxy.
//!
//! Certificates come from the SNI resolver installed in the engine's server
//! config. Every request opens a fresh backend connection (plain or TLS
//! depending on the target protocol) and is forwarded as HTTP/1.1.

use crate::collab::ChallengeDecision;
use crate::engine::EngineContext;
use crate::error::{escape_html, html_error_response, html_response, ProxyErrorCode};
use crate::listener::{ListenerSpec, SharedSpec, Target};
use crate::metrics::{Meter, MetricsSample};
use crate::proxy::http::request_host;
use crate::proxy::rewrite::{rewrite_location, rewrite_set_cookie};
use crate::proxy::upgrade::{handle_upgrade, is_upgrade_request};
use crate::proxy::{client_ip, connect_backend, BackendIo, IdleTimeout, ProxyBody};
use http_body_util::BodyExt;
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Time allowed for the client TLS handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Paths that never get the bot challenge
const CHALLENGE_BYPASS_PREFIXES: &[&str] = &["/api/", "/static/"];
const CHALLENGE_VERIFY_PATH: &str = "/__challenge/verify";

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub async fn serve(
    listener: TcpListener,
    spec: SharedSpec,
    ctx: Arc<EngineContext>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let acceptor = TlsAcceptor::from(Arc::clone(&ctx.tls));
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, id = spec.load().id, "HTTPS listener started");
    }

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let spec = spec.load_full();
                        let ctx = Arc::clone(&ctx);
                        let acceptor = acceptor.clone();
                        let span = info_span!("conn", listener = spec.id, peer = %addr);
                        tokio::spawn(handle_connection(stream, addr, acceptor, spec, ctx).instrument(span));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!(id = spec.load().id, "HTTPS listener shutting down");
                    break;
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    spec: Arc<ListenerSpec>,
    ctx: Arc<EngineContext>,
) {
    let stream = IdleTimeout::new(stream, ctx.config.idle_timeout);
    let tls = match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            debug!(error = %e, "TLS handshake failed");
            return;
        }
        Err(_) => {
            debug!("TLS handshake timed out");
            return;
        }
    };

    let sni = tls.get_ref().1.server_name().map(str::to_string);
    debug!(sni = sni.as_deref(), "TLS established");

    let idle = ctx.config.idle_timeout;
    let service = service_fn(move |req: Request<Incoming>| {
        let spec = Arc::clone(&spec);
        let ctx = Arc::clone(&ctx);
        async move { Ok::<_, hyper::Error>(handle_request(req, peer, spec, ctx).await) }
    });

    let mut builder = http1::Builder::new();
    builder.timer(TokioTimer::new()).header_read_timeout(idle);
    if let Err(e) = builder
        .serve_connection(TokioIo::new(tls), service)
        .with_upgrades()
        .await
    {
        debug!(error = %e, "HTTPS connection closed with error");
    }
}

/// Per-request bookkeeping for the metrics sample
struct Exchange {
    proxy_id: i64,
    ip: IpAddr,
    hostname: Option<String>,
    started: Instant,
    bytes_in: u64,
}

impl Exchange {
    fn finish(&self, ctx: &EngineContext, response: &Response<ProxyBody>) {
        let bytes_out = response.body().size_hint().exact().unwrap_or(0);
        ctx.metrics.record(
            MetricsSample::new(self.proxy_id)
                .bytes(self.bytes_in, bytes_out)
                .requests(1)
                .latency(self.started.elapsed())
                .status(response.status().as_u16())
                .hostname(self.hostname.as_deref())
                .client_ip(self.ip),
        );
    }
}

/// Route one request. Generic over the body so tests can drive it without
/// a TLS client.
pub(crate) async fn handle_request<B>(
    req: Request<B>,
    peer: SocketAddr,
    spec: Arc<ListenerSpec>,
    ctx: Arc<EngineContext>,
) -> Response<ProxyBody>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let exchange = Exchange {
        proxy_id: spec.id,
        ip: client_ip(peer),
        hostname: request_host(&req),
        started: Instant::now(),
        bytes_in: req.body().size_hint().exact().unwrap_or(0),
    };

    let Some(host) = exchange.hostname.clone() else {
        let response = html_error_response(
            ProxyErrorCode::MissingHostHeader,
            "Missing or invalid Host header",
            None,
        );
        exchange.finish(&ctx, &response);
        return response;
    };

    let path = req.uri().path().to_string();
    let user_agent = req
        .headers()
        .get(hyper::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    if let Some(response) = precheck(&path, &user_agent, &host, exchange.ip, &spec, &ctx).await {
        exchange.finish(&ctx, &response);
        return response;
    }

    let Some(target) = spec.resolve_target(Some(&host), ctx.config.strict_vhosts) else {
        debug!(hostname = %host, "No virtual host for hostname");
        let response = html_error_response(
            ProxyErrorCode::UnknownHost,
            "Unknown or unconfigured host",
            None,
        );
        exchange.finish(&ctx, &response);
        return response;
    };

    let custom_page = spec.error_page_html.as_deref();
    let addr = target.addr();
    ctx.health.register(&addr);
    if ctx.health.is_down(&addr, Some(&host)) {
        debug!(hostname = %host, target = %addr, "Backend cooling down");
        let response = html_error_response(
            ProxyErrorCode::BackendUnavailable,
            "Backend is temporarily unavailable",
            custom_page,
        );
        exchange.finish(&ctx, &response);
        return response;
    }

    let upgrade = is_upgrade_request(&req);
    let req = prepare_request(req, exchange.ip, upgrade);

    let backend: Box<dyn BackendIo> = match connect_backend(&ctx, &target, Some(&host)).await {
        Ok(backend) => Box::new(IdleTimeout::new(backend, ctx.config.idle_timeout).with_read_watch()),
        Err(e) => {
            warn!(hostname = %host, target = %addr, error = %e, "Backend connect failed");
            let response = html_error_response(e.error_code(), "Failed to connect to backend", custom_page);
            exchange.finish(&ctx, &response);
            return response;
        }
    };

    if upgrade {
        let meter = Meter::new(Arc::clone(&ctx.metrics), spec.id, Some(&host), Some(exchange.ip));
        if exchange.bytes_in > 0 {
            meter.add_in(exchange.bytes_in);
        }
        return handle_upgrade(req, backend, Arc::clone(&ctx), target, host, meter, custom_page).await;
    }

    let response = forward(req, backend, &ctx, &target, &host, spec.listen_port, custom_page).await;
    exchange.finish(&ctx, &response);
    response
}

/// IP reputation, maintenance and bot challenge, in that order
async fn precheck(
    path: &str,
    user_agent: &str,
    host: &str,
    ip: IpAddr,
    spec: &ListenerSpec,
    ctx: &EngineContext,
) -> Option<Response<ProxyBody>> {
    if ctx.ip_reputation.should_reject(ip) {
        debug!(hostname = host, "Blocked client");
        return Some(html_error_response(ProxyErrorCode::Forbidden, "Access denied", None));
    }

    let maintenance = ctx.maintenance.status(host).await;
    if maintenance.enabled {
        return Some(maintenance_page(maintenance.page_path.as_deref()).await);
    }

    if bypasses_challenge(path) {
        return None;
    }

    match ctx.bot_challenge.should_challenge(ip, host, user_agent).await {
        ChallengeDecision::Pass => None,
        ChallengeDecision::Banned => {
            debug!(hostname = host, listener = spec.id, "Banned client");
            Some(html_error_response(ProxyErrorCode::Forbidden, "Access denied", None))
        }
        ChallengeDecision::Challenge => match ctx.bot_challenge.get_or_create_challenge(ip, host).await {
            Ok(code) => Some(challenge_page(&code)),
            Err(e) => {
                error!(hostname = host, error = %e, "Failed to create challenge");
                Some(html_error_response(ProxyErrorCode::InternalError, "Internal error", None))
            }
        },
    }
}

fn bypasses_challenge(path: &str) -> bool {
    path == CHALLENGE_VERIFY_PATH || CHALLENGE_BYPASS_PREFIXES.iter().any(|p| path.starts_with(p))
}

async fn maintenance_page(page_path: Option<&std::path::Path>) -> Response<ProxyBody> {
    if let Some(path) = page_path {
        match tokio::fs::read(path).await {
            Ok(page) => {
                let mut response = html_response(StatusCode::SERVICE_UNAVAILABLE, page);
                response.headers_mut().insert(
                    "X-Proxy-Error",
                    HeaderValue::from_static(ProxyErrorCode::Maintenance.as_header_value()),
                );
                return response;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read maintenance page");
            }
        }
    }
    html_error_response(
        ProxyErrorCode::Maintenance,
        "This site is undergoing maintenance. Please check back soon.",
        None,
    )
}

fn challenge_page(code: &str) -> Response<ProxyBody> {
    let body = format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Checking your browser</title></head>\
         <body><h1>Checking your browser</h1>\
         <form method=\"post\" action=\"{action}\">\
         <input type=\"hidden\" name=\"challenge\" value=\"{code}\">\
         <button type=\"submit\">Continue</button></form></body></html>\n",
        action = CHALLENGE_VERIFY_PATH,
        code = escape_html(code),
    );
    html_response(StatusCode::FORBIDDEN, body)
}

/// Remove hop-by-hop headers, including any named by `Connection`.
/// Upgrade requests keep `Connection` and `Upgrade`.
fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
    let named: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        if keep_upgrade && name == hyper::header::UPGRADE {
            continue;
        }
        headers.remove(name);
    }

    for name in HOP_BY_HOP {
        if keep_upgrade && (*name == "connection" || *name == "upgrade") {
            continue;
        }
        headers.remove(*name);
    }
}

/// Origin-form URI, HTTP/1.1, forwarding headers set
fn prepare_request<B>(mut req: Request<B>, ip: IpAddr, upgrade: bool) -> Request<B> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    *req.uri_mut() = path.parse().unwrap_or_else(|_| Uri::from_static("/"));
    *req.version_mut() = Version::HTTP_11;

    let headers = req.headers_mut();
    strip_hop_by_hop(headers, upgrade);

    let request_id = headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    // client-supplied forwarding headers are overwritten, not appended to
    if let Ok(value) = HeaderValue::from_str(&ip.to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));

    req
}

async fn forward<B>(
    req: Request<B>,
    backend: Box<dyn BackendIo>,
    ctx: &EngineContext,
    target: &Target,
    host: &str,
    public_port: u16,
    custom_page: Option<&str>,
) -> Response<ProxyBody>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let addr = target.addr();

    let (mut sender, conn) = match hyper::client::conn::http1::handshake(TokioIo::new(backend)).await {
        Ok(parts) => parts,
        Err(e) => {
            warn!(hostname = host, target = %addr, error = %e, "Backend handshake failed");
            ctx.health.mark_failure(&addr, Some(host));
            return html_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend", custom_page);
        }
    };
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "Backend connection closed with error");
        }
    });

    debug!(hostname = host, method = %req.method(), uri = %req.uri(), "Forwarding request");

    match tokio::time::timeout(ctx.config.response_timeout, sender.send_request(req)).await {
        Ok(Ok(response)) => {
            ctx.health.mark_success(&addr, Some(host));
            let mut response = response.map(|b| b.boxed());
            rewrite_response(response.headers_mut(), target, host, public_port);
            response
        }
        Ok(Err(e)) => {
            warn!(hostname = host, target = %addr, error = %e, "Failed to forward request");
            ctx.health.mark_failure(&addr, Some(host));
            html_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend", custom_page)
        }
        Err(_) => {
            warn!(
                hostname = host,
                target = %addr,
                timeout_secs = ctx.config.response_timeout.as_secs(),
                "Request timed out"
            );
            ctx.health.mark_failure(&addr, Some(host));
            html_error_response(ProxyErrorCode::RequestTimeout, "Backend did not respond in time", custom_page)
        }
    }
}

/// Point backend references in `Location` and `Set-Cookie` at the public host
fn rewrite_response(headers: &mut HeaderMap, target: &Target, host: &str, public_port: u16) {
    strip_hop_by_hop(headers, false);

    let location = headers
        .get(hyper::header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| rewrite_location(v, target, host, public_port))
        .and_then(|v| HeaderValue::from_str(&v).ok());
    if let Some(location) = location {
        headers.insert(hyper::header::LOCATION, location);
    }

    let mut changed = false;
    let cookies: Vec<HeaderValue> = headers
        .get_all(hyper::header::SET_COOKIE)
        .iter()
        .map(|value| {
            match value
                .to_str()
                .ok()
                .and_then(|v| rewrite_set_cookie(v, &target.host, host))
                .and_then(|v| HeaderValue::from_str(&v).ok())
            {
                Some(rewritten) => {
                    changed = true;
                    rewritten
                }
                None => value.clone(),
            }
        })
        .collect();

    if changed {
        headers.remove(hyper::header::SET_COOKIE);
        for cookie in cookies {
            headers.append(hyper::header::SET_COOKIE, cookie);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::CertStoreConfig;
    use crate::collab::{BotChallenge, StaticIpReputation, StaticMaintenance};
    use crate::engine::{EngineConfig, EngineContextBuilder};
    use crate::listener::tests::{mapping, record};
    use crate::listener::VHostMapping;
    use async_trait::async_trait;
    use http_body_util::Full;
    use hyper::body::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const PEER: &str = "192.0.2.7:50000";

    fn builder(certs: &tempfile::TempDir) -> EngineContextBuilder {
        EngineContext::builder()
            .with_config(EngineConfig {
                response_timeout: Duration::from_millis(300),
                ..Default::default()
            })
            .with_cert_store(CertStoreConfig::new(certs.path()))
    }

    fn spec_for(port: u16, mappings: &[VHostMapping]) -> Arc<ListenerSpec> {
        let mut r = record(3, "https", 443);
        r.target_port = port;
        r.error_page_html = Some("<h1>custom outage page</h1>".to_string());
        Arc::new(ListenerSpec::from_record(&r, mappings).unwrap())
    }

    fn request(host: &str, path: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .uri(path)
            .header("Host", host)
            .header("X-Forwarded-For", "6.6.6.6")
            .header("Connection", "keep-alive, x-drop-me")
            .header("X-Drop-Me", "1")
            .body(Full::new(Bytes::from_static(b"hello")))
            .unwrap()
    }

    async fn body_string(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Backend that captures one request head and answers with `reply`
    async fn backend(reply: &'static str) -> (u16, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let mut head = Vec::new();
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            stream.write_all(reply.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&head).to_lowercase()
        });
        (port, task)
    }

    fn unused_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_forwards_with_headers_and_rewrites() {
        let certs = tempfile::tempdir().unwrap();
        let ctx = builder(&certs).build().unwrap();
        let (port, captured) = backend(
            "HTTP/1.1 302 Found\r\nLocation: http://127.0.0.1/login\r\n\
             Set-Cookie: sid=1; Domain=127.0.0.1; Path=/\r\nSet-Cookie: theme=dark\r\n\
             Content-Length: 0\r\n\r\n",
        )
        .await;

        let response = handle_request(
            request("App.Example.com", "/start?x=1"),
            PEER.parse().unwrap(),
            spec_for(port, &[]),
            Arc::clone(&ctx),
        )
        .await;

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()["location"], "https://app.example.com/login");
        let cookies: Vec<&str> = response
            .headers()
            .get_all("set-cookie")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(cookies, vec!["sid=1; Domain=app.example.com; Path=/", "theme=dark"]);

        let head = captured.await.unwrap();
        assert!(head.starts_with("get /start?x=1 http/1.1\r\n"));
        assert!(head.contains("x-forwarded-for: 192.0.2.7\r\n"));
        assert!(head.contains("x-forwarded-proto: https\r\n"));
        assert!(head.contains("x-forwarded-host: app.example.com\r\n"));
        assert!(head.contains("x-request-id: "));
        assert!(!head.contains("x-drop-me"));
        assert!(!head.contains("6.6.6.6"));

        let target = format!("127.0.0.1:{}", port);
        assert!(!ctx.health.is_down(&target, Some("app.example.com")));

        let mut rx = ctx.metrics.subscribe();
        ctx.metrics.flush().await;
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].status_code, 302);
        assert_eq!(batch[0].bytes_in, 5);
        assert_eq!(batch[0].hostname.as_deref(), Some("app.example.com"));
    }

    #[tokio::test]
    async fn test_down_backend_served_custom_page_without_dialing() {
        let certs = tempfile::tempdir().unwrap();
        let ctx = builder(&certs).build().unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while listener.accept().await.is_ok() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let target = format!("127.0.0.1:{}", port);
        for _ in 0..3 {
            ctx.health.mark_failure(&target, None);
        }

        let response = handle_request(
            request("app.example.com", "/"),
            PEER.parse().unwrap(),
            spec_for(port, &[]),
            Arc::clone(&ctx),
        )
        .await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()["x-proxy-error"], "BACKEND_UNAVAILABLE");
        assert_eq!(body_string(response).await, "<h1>custom outage page</h1>");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_is_bad_gateway_and_counted() {
        let certs = tempfile::tempdir().unwrap();
        let ctx = builder(&certs).build().unwrap();
        let port = unused_port();

        let response = handle_request(
            request("app.example.com", "/"),
            PEER.parse().unwrap(),
            spec_for(port, &[]),
            Arc::clone(&ctx),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let entry = ctx
            .health
            .snapshot()
            .into_iter()
            .find(|e| e.target == format!("127.0.0.1:{}", port))
            .unwrap();
        assert_eq!(entry.hostname.as_deref(), Some("app.example.com"));
        assert_eq!(entry.failure_count, 1);
    }

    #[tokio::test]
    async fn test_response_timeout_is_gateway_timeout() {
        let certs = tempfile::tempdir().unwrap();
        let ctx = builder(&certs).build().unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let response = handle_request(
            request("app.example.com", "/slow"),
            PEER.parse().unwrap(),
            spec_for(port, &[]),
            Arc::clone(&ctx),
        )
        .await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_stalled_body_is_aborted_after_idle_timeout() {
        let certs = tempfile::tempdir().unwrap();
        let ctx = builder(&certs)
            .with_config(EngineConfig {
                idle_timeout: Duration::from_millis(200),
                ..Default::default()
            })
            .build()
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let _ = stream.read(&mut buf).await;
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nhello")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let response = handle_request(
            request("app.example.com", "/download"),
            PEER.parse().unwrap(),
            spec_for(port, &[]),
            Arc::clone(&ctx),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = tokio::time::timeout(Duration::from_secs(2), response.into_body().collect())
            .await
            .expect("body ends once the backend goes idle");
        assert!(body.is_err());
    }

    #[tokio::test]
    async fn test_missing_host_and_unknown_vhost() {
        let certs = tempfile::tempdir().unwrap();
        let ctx = builder(&certs)
            .with_config(EngineConfig {
                strict_vhosts: true,
                ..Default::default()
            })
            .build()
            .unwrap();
        let spec = spec_for(9000, &[mapping(3, "known.example.com", 9001)]);

        let req = Request::builder()
            .uri("/")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = handle_request(req, PEER.parse().unwrap(), Arc::clone(&spec), Arc::clone(&ctx)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = handle_request(
            request("other.example.com", "/"),
            PEER.parse().unwrap(),
            spec,
            ctx,
        )
        .await;
        assert_eq!(response.status(), StatusCode::MISDIRECTED_REQUEST);
    }

    #[tokio::test]
    async fn test_blocked_client_and_maintenance() {
        let certs = tempfile::tempdir().unwrap();
        let page = certs.path().join("maintenance.html");
        std::fs::write(&page, "<p>back at noon</p>").unwrap();

        let ctx = builder(&certs)
            .with_ip_reputation(Arc::new(StaticIpReputation::new(
                ["192.0.2.66".parse().unwrap()],
                [],
            )))
            .with_maintenance(Arc::new(
                StaticMaintenance::new()
                    .with_site("down.example.com", Some(page))
                    .with_site("plain.example.com", None),
            ))
            .build()
            .unwrap();
        let spec = spec_for(unused_port(), &[]);

        let response = handle_request(
            request("app.example.com", "/"),
            "192.0.2.66:1234".parse().unwrap(),
            Arc::clone(&spec),
            Arc::clone(&ctx),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = handle_request(
            request("down.example.com", "/"),
            PEER.parse().unwrap(),
            Arc::clone(&spec),
            Arc::clone(&ctx),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_string(response).await, "<p>back at noon</p>");

        let response = handle_request(request("plain.example.com", "/"), PEER.parse().unwrap(), spec, ctx).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()["x-proxy-error"], "MAINTENANCE");
    }

    struct AlwaysChallenge {
        banned: IpAddr,
    }

    #[async_trait]
    impl BotChallenge for AlwaysChallenge {
        async fn should_challenge(&self, ip: IpAddr, _domain: &str, _user_agent: &str) -> ChallengeDecision {
            if ip == self.banned {
                ChallengeDecision::Banned
            } else {
                ChallengeDecision::Challenge
            }
        }

        async fn get_or_create_challenge(&self, _ip: IpAddr, _domain: &str) -> anyhow::Result<String> {
            Ok("abc<123>".to_string())
        }
    }

    #[tokio::test]
    async fn test_bot_challenge_decisions() {
        let certs = tempfile::tempdir().unwrap();
        let ctx = builder(&certs)
            .with_bot_challenge(Arc::new(AlwaysChallenge {
                banned: "192.0.2.99".parse().unwrap(),
            }))
            .build()
            .unwrap();
        let (port, _captured) = backend("HTTP/1.1 204 No Content\r\n\r\n").await;
        let spec = spec_for(port, &[]);

        let response = handle_request(
            request("app.example.com", "/"),
            PEER.parse().unwrap(),
            Arc::clone(&spec),
            Arc::clone(&ctx),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let page = body_string(response).await;
        assert!(page.contains("abc&lt;123&gt;"));
        assert!(page.contains(CHALLENGE_VERIFY_PATH));

        let response = handle_request(
            request("app.example.com", "/"),
            "192.0.2.99:1".parse().unwrap(),
            Arc::clone(&spec),
            Arc::clone(&ctx),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers()["x-proxy-error"], "FORBIDDEN");

        // API paths reach the backend
        let response = handle_request(request("app.example.com", "/api/items"), PEER.parse().unwrap(), spec, ctx).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[test]
    fn test_bypasses_challenge() {
        assert!(bypasses_challenge("/api/v1"));
        assert!(bypasses_challenge("/static/app.css"));
        assert!(bypasses_challenge("/__challenge/verify"));
        assert!(!bypasses_challenge("/"));
        assert!(!bypasses_challenge("/apix"));
    }

    #[test]
    fn test_strip_hop_by_hop_keeps_upgrade() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("Upgrade"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("sec-websocket-key", HeaderValue::from_static("x"));

        let mut plain = headers.clone();
        strip_hop_by_hop(&mut plain, false);
        assert!(!plain.contains_key("connection"));
        assert!(!plain.contains_key("upgrade"));
        assert!(plain.contains_key("sec-websocket-key"));

        strip_hop_by_hop(&mut headers, true);
        assert!(headers.contains_key("connection"));
        assert!(headers.contains_key("upgrade"));
        assert!(!headers.contains_key("keep-alive"));
    }
}
