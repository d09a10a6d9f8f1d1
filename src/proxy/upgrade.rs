//! HTTP/1.1 upgrades (WebSocket and friends).
//!
//! The upgrade request is written to the backend by hand so the raw
//! connection stays ours once the backend answers `101`. After that both
//! sides are spliced like a TCP stream.

use crate::engine::EngineContext;
use crate::error::{html_error_response, ProxyErrorCode};
use crate::listener::Target;
use crate::metrics::Meter;
use crate::proxy::{empty, full, splice, BackendIo, ProxyBody};
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Largest backend response head we accept
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Largest body we pass through when the backend refuses the upgrade
const MAX_REFUSAL_BODY: usize = 64 * 1024;

/// Check if a request is an upgrade request
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|token| token.trim().eq_ignore_ascii_case("upgrade")));

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Serialize the request head for the backend
fn build_upgrade_request<B>(req: &Request<B>) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut raw = format!("{} {} HTTP/1.1\r\n", req.method(), path).into_bytes();

    for (name, value) in req.headers() {
        raw.extend_from_slice(name.as_str().as_bytes());
        raw.extend_from_slice(b": ");
        raw.extend_from_slice(value.as_bytes());
        raw.extend_from_slice(b"\r\n");
    }
    raw.extend_from_slice(b"\r\n");
    raw
}

/// Status line and headers of the backend's answer
#[derive(Debug)]
struct ResponseHead {
    status: StatusCode,
    headers: Vec<(String, String)>,
}

impl ResponseHead {
    fn content_length(&self) -> Option<usize> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.parse().ok())
    }
}

fn parse_response_head(data: &[u8]) -> Option<ResponseHead> {
    let text = std::str::from_utf8(data).ok()?;
    let mut lines = text.split("\r\n");

    // HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    if !parts.next()?.starts_with("HTTP/1.") {
        return None;
    }
    let status = StatusCode::from_u16(parts.next()?.parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some(ResponseHead { status, headers })
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

#[derive(Debug, Error)]
enum ReadHeadError {
    #[error("backend closed the connection")]
    Closed,
    #[error("response head too large")]
    TooLarge,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read until the end of the response head. Returns the head and whatever
/// arrived after it.
async fn read_response_head(backend: &mut dyn BackendIo) -> Result<(Vec<u8>, Vec<u8>), ReadHeadError> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = backend.read(&mut chunk).await?;
        if n == 0 {
            return Err(ReadHeadError::Closed);
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_head_end(&buf) {
            let rest = buf.split_off(end);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(ReadHeadError::TooLarge);
        }
    }
}

fn response_with_headers(head: &ResponseHead, skip_framing: bool) -> hyper::http::response::Builder {
    let mut response = Response::builder().status(head.status);
    for (name, value) in &head.headers {
        if skip_framing
            && (name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding"))
        {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            response = response.header(name, value);
        }
    }
    response
}

/// Forward an upgrade request over `backend` and, on `101`, splice the
/// upgraded client connection with it in a background task.
///
/// `req` must already carry the forwarding headers.
pub async fn handle_upgrade<B: Send>(
    mut req: Request<B>,
    mut backend: Box<dyn BackendIo>,
    ctx: Arc<EngineContext>,
    target: Target,
    hostname: String,
    meter: Meter,
    custom_page: Option<&str>,
) -> Response<ProxyBody> {
    let addr = target.addr();
    let upgrade_type = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default();
    debug!(hostname, upgrade_type, "Handling upgrade request");

    let raw = build_upgrade_request(&req);
    if let Err(e) = backend.write_all(&raw).await {
        warn!(hostname, target = %addr, error = %e, "Failed to send upgrade request to backend");
        ctx.health.mark_failure(&addr, Some(&hostname));
        meter.finish(502);
        return html_error_response(ProxyErrorCode::ConnectionFailed, "Failed to reach backend", custom_page);
    }

    let read = tokio::time::timeout(ctx.config.response_timeout, read_response_head(backend.as_mut())).await;
    let (head_bytes, rest) = match read {
        Ok(Ok(parts)) => parts,
        Ok(Err(e)) => {
            warn!(hostname, target = %addr, error = %e, "Backend failed to answer upgrade");
            ctx.health.mark_failure(&addr, Some(&hostname));
            meter.finish(502);
            return html_error_response(ProxyErrorCode::ConnectionFailed, "Invalid response from backend", custom_page);
        }
        Err(_) => {
            warn!(hostname, target = %addr, "Upgrade response timed out");
            ctx.health.mark_failure(&addr, Some(&hostname));
            meter.finish(504);
            return html_error_response(ProxyErrorCode::RequestTimeout, "Backend did not respond in time", custom_page);
        }
    };

    let Some(head) = parse_response_head(&head_bytes) else {
        warn!(hostname, "Failed to parse backend upgrade response");
        meter.finish(502);
        return html_error_response(ProxyErrorCode::ConnectionFailed, "Invalid response from backend", custom_page);
    };
    ctx.health.mark_success(&addr, Some(&hostname));

    if head.status != StatusCode::SWITCHING_PROTOCOLS {
        debug!(hostname, status = %head.status, "Backend refused upgrade");
        let body = read_refusal_body(backend.as_mut(), &head, rest, ctx.config.idle_timeout).await;
        meter.add_out(body.len() as u64);
        meter.finish(head.status.as_u16());
        return response_with_headers(&head, true)
            .body(full(body))
            .expect("valid response builder");
    }

    info!(hostname, upgrade_type, "Upgrade established");
    let on_upgrade = hyper::upgrade::on(&mut req);
    let idle = ctx.config.idle_timeout;

    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                if !rest.is_empty() {
                    if let Err(e) = client.write_all(&rest).await {
                        debug!(error = %e, "Failed to flush early backend bytes");
                        meter.finish(101);
                        return;
                    }
                    meter.add_out(rest.len() as u64);
                }
                match splice(client, backend, idle, &meter).await {
                    Ok((bytes_in, bytes_out)) => {
                        debug!(hostname, bytes_in, bytes_out, "Upgraded connection closed");
                    }
                    Err(e) => {
                        debug!(hostname, error = %e, "Upgraded connection closed with error");
                    }
                }
            }
            Err(e) => {
                warn!(hostname, error = %e, "Client upgrade failed");
            }
        }
        meter.finish(101);
    });

    response_with_headers(&head, true)
        .body(empty())
        .expect("valid response builder")
}

/// Body of a refused upgrade, bounded by Content-Length
async fn read_refusal_body(
    backend: &mut dyn BackendIo,
    head: &ResponseHead,
    mut body: Vec<u8>,
    idle: Duration,
) -> Vec<u8> {
    let Some(len) = head.content_length().filter(|len| *len <= MAX_REFUSAL_BODY) else {
        return Vec::new();
    };
    if body.len() < len {
        let mut remaining = vec![0u8; len - body.len()];
        if tokio::time::timeout(idle, backend.read_exact(&mut remaining)).await.is_err() {
            return Vec::new();
        }
        body.extend_from_slice(&remaining);
    }
    body.truncate(len);
    body
}
