//! Error types and HTML error responses for the proxy

use crate::proxy::ProxyBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Error codes for locally synthesized responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// Missing or invalid Host header
    MissingHostHeader,
    /// Client address is blocked
    Forbidden,
    /// Host does not map to any virtual host on this listener
    UnknownHost,
    /// Backend is inside its failure cooldown
    BackendUnavailable,
    /// Site is in maintenance mode
    Maintenance,
    /// Failed to connect to or talk to the backend
    ConnectionFailed,
    /// Backend did not answer in time
    RequestTimeout,
    /// Resource not found
    NotFound,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ProxyErrorCode::UnknownHost => StatusCode::MISDIRECTED_REQUEST,
            ProxyErrorCode::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::Maintenance => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::Forbidden => "FORBIDDEN",
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::BackendUnavailable => "BACKEND_UNAVAILABLE",
            ProxyErrorCode::Maintenance => "MAINTENANCE",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    fn title(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "Bad Request",
            ProxyErrorCode::Forbidden => "Forbidden",
            ProxyErrorCode::UnknownHost => "Misdirected Request",
            ProxyErrorCode::BackendUnavailable => "Service Unavailable",
            ProxyErrorCode::Maintenance => "Down for Maintenance",
            ProxyErrorCode::ConnectionFailed => "Bad Gateway",
            ProxyErrorCode::RequestTimeout => "Gateway Timeout",
            ProxyErrorCode::NotFound => "Not Found",
            ProxyErrorCode::InternalError => "Internal Server Error",
        }
    }

    /// Whether a listener's custom error page may replace the generic body
    pub fn uses_custom_page(&self) -> bool {
        matches!(
            self,
            ProxyErrorCode::BackendUnavailable
                | ProxyErrorCode::ConnectionFailed
                | ProxyErrorCode::RequestTimeout
        )
    }
}

/// Configuration errors found while turning stored listeners into live ones
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("listener {id}: unknown protocol '{protocol}'")]
    UnknownProtocol { id: i64, protocol: String },

    #[error("listener {id}: listen port must be non-zero")]
    ZeroListenPort { id: i64 },

    #[error("listener {id}: listen host '{host}' is not an IP address")]
    InvalidListenHost { id: i64, host: String },

    #[error("listener {id}: target host is required for {protocol} listeners")]
    MissingTargetHost { id: i64, protocol: &'static str },

    #[error("listener {id}: target port must be non-zero")]
    ZeroTargetPort { id: i64 },

    #[error("listener {id}: {bind} is already bound by listener {owner}")]
    BindConflict { id: i64, bind: String, owner: i64 },

    #[error("vhost '{hostname}': {reason}")]
    InvalidVHost { hostname: String, reason: String },
}

impl ConfigError {
    /// The listener the error belongs to, when there is one
    pub fn listener_id(&self) -> Option<i64> {
        match self {
            ConfigError::UnknownProtocol { id, .. }
            | ConfigError::ZeroListenPort { id }
            | ConfigError::InvalidListenHost { id, .. }
            | ConfigError::MissingTargetHost { id, .. }
            | ConfigError::ZeroTargetPort { id }
            | ConfigError::BindConflict { id, .. } => Some(*id),
            ConfigError::InvalidVHost { .. } => None,
        }
    }
}

pub(crate) fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn generic_page(code: ProxyErrorCode, message: &str) -> String {
    let status = code.status_code();
    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{status} {title}</title></head>\
         <body><h1>{title}</h1><p>{message}</p><hr><p>edgegate</p></body></html>\n",
        status = status.as_u16(),
        title = code.title(),
        message = escape_html(message),
    )
}

/// HTML response carrying the body as given
pub fn html_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/html; charset=utf-8")
        .header("Cache-Control", "no-store")
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Create an HTML error response with X-Proxy-Error header.
///
/// `custom_page` replaces the generic body for backend failures only.
pub fn html_error_response(
    code: ProxyErrorCode,
    message: impl AsRef<str>,
    custom_page: Option<&str>,
) -> Response<ProxyBody> {
    let body = match custom_page {
        Some(page) if code.uses_custom_page() => page.to_string(),
        _ => generic_page(code, message.as_ref()),
    };

    let mut response = html_response(code.status_code(), body);
    response.headers_mut().insert(
        "X-Proxy-Error",
        hyper::header::HeaderValue::from_static(code.as_header_value()),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::MissingHostHeader.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyErrorCode::UnknownHost.status_code(),
            StatusCode::MISDIRECTED_REQUEST
        );
        assert_eq!(
            ProxyErrorCode::BackendUnavailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::RequestTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyErrorCode::ConnectionFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_html_error_response_headers() {
        let response =
            html_error_response(ProxyErrorCode::RequestTimeout, "Request timed out", None);

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/html; charset=utf-8"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "REQUEST_TIMEOUT"
        );
    }

    #[test]
    fn test_generic_page_escapes_message() {
        let page = generic_page(ProxyErrorCode::NotFound, "<script>alert(1)</script>");
        assert!(page.contains("&lt;script&gt;"));
        assert!(!page.contains("<script>"));
        assert!(page.contains("404 Not Found"));
    }

    #[tokio::test]
    async fn test_custom_page_only_for_backend_errors() {
        let custom = "<h1>we'll be right back</h1>";

        let response =
            html_error_response(ProxyErrorCode::BackendUnavailable, "down", Some(custom));
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], custom.as_bytes());

        let response = html_error_response(ProxyErrorCode::Forbidden, "blocked", Some(custom));
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(!String::from_utf8_lossy(&body).contains("right back"));
    }

    #[test]
    fn test_config_error_listener_id() {
        let err = ConfigError::ZeroListenPort { id: 7 };
        assert_eq!(err.listener_id(), Some(7));
        assert_eq!(err.to_string(), "listener 7: listen port must be non-zero");

        let err = ConfigError::InvalidVHost {
            hostname: "bad host".into(),
            reason: "invalid characters".into(),
        };
        assert_eq!(err.listener_id(), None);
    }
}
