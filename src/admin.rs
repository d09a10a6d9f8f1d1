//! Diagnostics API.
//!
//! `GET /health` and `GET /version` are open. Everything else needs the
//! bearer token: backend health, running listeners, and `POST /reconcile`
//! to re-read the configuration store on demand.

use crate::engine::Engine;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("valid response with StatusCode enum and static header")
}

pub struct AdminServer {
    bind_addr: SocketAddr,
    engine: Arc<Engine>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        engine: Arc<Engine>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            engine,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound socket
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let engine = Arc::clone(&self.engine);
                            let auth_token = Arc::clone(&self.auth_token);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, engine, auth_token).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(
    stream: TcpStream,
    engine: Arc<Engine>,
    auth_token: Arc<String>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let engine = Arc::clone(&engine);
        let token = Arc::clone(&auth_token);
        async move { Ok::<_, hyper::Error>(handle_admin_request(req, engine, token).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|token| token == expected_token)
        .unwrap_or(false)
}

async fn handle_admin_request<B>(
    req: Request<B>,
    engine: Arc<Engine>,
    auth_token: Arc<String>,
) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, %path, "Admin API request");

    match (&method, path.as_str()) {
        (&Method::GET, "/health") => return response(StatusCode::OK, "ok"),
        (&Method::GET, "/version") => {
            return json_response(
                StatusCode::OK,
                &serde_json::json!({ "name": PKG_NAME, "version": VERSION }),
            )
        }
        _ => {}
    }

    let protected = matches!(
        (&method, path.as_str()),
        (&Method::GET, "/backends/health") | (&Method::GET, "/listeners") | (&Method::POST, "/reconcile")
    );
    if !protected {
        return response(StatusCode::NOT_FOUND, "not found");
    }
    if !check_auth(&req, &auth_token) {
        warn!(path = %path, "Unauthorized admin API request");
        return response(StatusCode::UNAUTHORIZED, "unauthorized");
    }

    match path.as_str() {
        "/backends/health" => {
            let backends = engine.health_snapshot();
            json_response(
                StatusCode::OK,
                &serde_json::json!({ "count": backends.len(), "backends": backends }),
            )
        }
        "/listeners" => {
            let listeners = engine.listeners();
            json_response(
                StatusCode::OK,
                &serde_json::json!({
                    "count": listeners.len(),
                    "reloading": engine.is_reloading(),
                    "listeners": listeners,
                }),
            )
        }
        _ => match engine.reconcile_all_listeners().await {
            Ok(report) => {
                info!(
                    started = report.started.len(),
                    stopped = report.stopped.len(),
                    updated = report.updated.len(),
                    "Reconcile requested via admin API"
                );
                json_response(StatusCode::OK, &serde_json::json!(report))
            }
            Err(e) => {
                error!(error = %e, "Reconcile failed");
                json_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &serde_json::json!({ "error": format!("{:#}", e) }),
                )
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::CertStoreConfig;
    use crate::collab::ConfigStore;
    use crate::engine::EngineContext;
    use crate::listener::tests::record;
    use crate::listener::{ListenerRecord, VHostMapping};
    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Default)]
    struct MemoryStore {
        listeners: Mutex<Vec<ListenerRecord>>,
        fail: Mutex<bool>,
    }

    #[async_trait]
    impl ConfigStore for MemoryStore {
        async fn list_enabled_listeners(&self) -> anyhow::Result<Vec<ListenerRecord>> {
            if *self.fail.lock() {
                anyhow::bail!("store offline");
            }
            Ok(self.listeners.lock().clone())
        }

        async fn list_vhost_mappings(&self) -> anyhow::Result<Vec<VHostMapping>> {
            Ok(Vec::new())
        }
    }

    fn engine(store: Arc<MemoryStore>) -> (Arc<Engine>, tempfile::TempDir) {
        let certs = tempfile::tempdir().unwrap();
        let ctx = EngineContext::builder()
            .with_cert_store(CertStoreConfig::new(certs.path()))
            .build()
            .unwrap();
        (Arc::new(Engine::new(ctx, store)), certs)
    }

    fn request(method: Method, path: &str, token: Option<&str>) -> Request<Full<Bytes>> {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Full::new(Bytes::new())).unwrap()
    }

    async fn call(engine: &Arc<Engine>, req: Request<Full<Bytes>>) -> (StatusCode, String) {
        let resp = handle_admin_request(req, Arc::clone(engine), Arc::new("secret".to_string())).await;
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[tokio::test]
    async fn test_open_routes() {
        let (engine, _certs) = engine(Arc::new(MemoryStore::default()));

        let (status, body) = call(&engine, request(Method::GET, "/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");

        let (status, body) = call(&engine, request(Method::GET, "/version", None)).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["name"], PKG_NAME);
        assert_eq!(json["version"], VERSION);

        let (status, _) = call(&engine, request(Method::GET, "/nope", Some("secret"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_protected_routes_need_token() {
        let (engine, _certs) = engine(Arc::new(MemoryStore::default()));

        for (method, path) in [
            (Method::GET, "/backends/health"),
            (Method::GET, "/listeners"),
            (Method::POST, "/reconcile"),
        ] {
            let (status, _) = call(&engine, request(method.clone(), path, None)).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{} {}", method, path);
            let (status, _) = call(&engine, request(method, path, Some("wrong"))).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        }

        // a bare token without the Bearer scheme is refused
        let mut req = request(Method::GET, "/listeners", None);
        req.headers_mut().insert(AUTHORIZATION, "secret".parse().unwrap());
        let (status, _) = call(&engine, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_reconcile_and_listeners() {
        let store = Arc::new(MemoryStore::default());
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        store.listeners.lock().push(record(7, "tcp", port));
        let (engine, _certs) = engine(Arc::clone(&store));

        let (status, body) = call(&engine, request(Method::POST, "/reconcile", Some("secret"))).await;
        assert_eq!(status, StatusCode::OK);
        let report: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(report["started"], serde_json::json!([7]));

        let (status, body) = call(&engine, request(Method::GET, "/listeners", Some("secret"))).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["count"], 1);
        assert_eq!(json["reloading"], false);
        assert_eq!(json["listeners"][0]["id"], 7);

        engine.context().health.mark_failure("127.0.0.1:9000", Some("app.example.com"));
        let (status, body) = call(&engine, request(Method::GET, "/backends/health", Some("secret"))).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["count"], 1);
        assert_eq!(json["backends"][0]["target"], "127.0.0.1:9000");
        assert_eq!(json["backends"][0]["hostname"], "app.example.com");
        assert_eq!(json["backends"][0]["failure_count"], 1);

        *store.fail.lock() = true;
        let (status, body) = call(&engine, request(Method::POST, "/reconcile", Some("secret"))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("store offline"));

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_server_over_tcp() {
        let (engine, _certs) = engine(Arc::new(MemoryStore::default()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = AdminServer::new(addr, engine, shutdown_rx, "secret".to_string());
        assert_eq!(server.auth_token(), "secret");
        let handle = tokio::spawn(server.serve(listener));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf);
        assert!(text.starts_with("HTTP/1.1 200"), "{}", text);
        assert!(text.ends_with("ok"));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
