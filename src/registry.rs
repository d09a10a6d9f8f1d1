//! Running listeners, keyed by bind address.
//!
//! Each entry owns one bound socket and the accept loop serving it. The
//! loop reads its configuration from a [`SharedSpec`], so [`update`] swaps
//! vhosts and targets without touching the socket.
//!
//! [`update`]: ListenerRegistry::update

use crate::engine::EngineContext;
use crate::listener::{BindKey, ListenerKind, ListenerSpec, Protocol, SharedSpec};
use crate::proxy;
use anyhow::Context;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How long a stopping accept loop gets before it is aborted
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct ActiveListener {
    spec: SharedSpec,
    kind: ListenerKind,
    /// Proxy ids served by this socket, lowest first
    members: Vec<i64>,
    local_addr: SocketAddr,
    started_at: DateTime<Utc>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Diagnostics view of a running listener
#[derive(Debug, Clone, Serialize)]
pub struct ListenerInfo {
    pub id: i64,
    pub members: Vec<i64>,
    pub protocol: Protocol,
    pub kind: ListenerKind,
    pub bind: String,
    pub local_addr: SocketAddr,
    pub target: Option<String>,
    pub vhosts: Vec<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct ListenerRegistry {
    listeners: DashMap<BindKey, ActiveListener>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Bind the socket for `spec` and spawn its accept loop
    pub async fn start(
        &self,
        spec: ListenerSpec,
        members: Vec<i64>,
        ctx: &Arc<EngineContext>,
    ) -> anyhow::Result<SocketAddr> {
        let key = spec.bind_key();
        if self.listeners.contains_key(&key) {
            anyhow::bail!("{} is already running", key);
        }

        let kind = spec.kind();
        let id = spec.id;
        let shared = spec.into_shared();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = Arc::clone(ctx);

        let spec = Arc::clone(&shared);
        let (local_addr, task) = match kind {
            ListenerKind::Udp => {
                let socket = UdpSocket::bind(key.addr)
                    .await
                    .with_context(|| format!("Failed to bind {}", key))?;
                let local_addr = socket.local_addr()?;
                (local_addr, tokio::spawn(proxy::udp::serve(socket, spec, ctx, shutdown_rx)))
            }
            ListenerKind::Tcp => {
                let listener = bind_tcp(&key).await?;
                (listener.local_addr()?, tokio::spawn(proxy::tcp::serve(listener, spec, ctx, shutdown_rx)))
            }
            ListenerKind::TransparentTcp => {
                let listener = bind_tcp(&key).await?;
                (listener.local_addr()?, tokio::spawn(proxy::sniff::serve(listener, spec, ctx, shutdown_rx)))
            }
            ListenerKind::HttpRedirect => {
                let listener = bind_tcp(&key).await?;
                (listener.local_addr()?, tokio::spawn(proxy::http::serve(listener, spec, ctx, shutdown_rx)))
            }
            ListenerKind::Https => {
                let listener = bind_tcp(&key).await?;
                (listener.local_addr()?, tokio::spawn(proxy::https::serve(listener, spec, ctx, shutdown_rx)))
            }
        };

        info!(id, bind = %key, local_addr = %local_addr, kind = ?kind, "Listener started");

        self.listeners.insert(
            key,
            ActiveListener {
                spec: shared,
                kind,
                members,
                local_addr,
                started_at: Utc::now(),
                shutdown_tx,
                task,
            },
        );
        Ok(local_addr)
    }

    /// Replace the live spec of a running listener. Returns false if nothing
    /// runs on that bind or the new spec needs a different accept loop.
    pub fn update(&self, spec: ListenerSpec, members: Vec<i64>) -> bool {
        let key = spec.bind_key();
        let Some(mut active) = self.listeners.get_mut(&key) else {
            return false;
        };
        if active.kind != spec.kind() {
            return false;
        }
        active.spec.store(Arc::new(spec));
        active.members = members;
        true
    }

    pub fn kind_of(&self, key: &BindKey) -> Option<ListenerKind> {
        self.listeners.get(key).map(|l| l.kind)
    }

    /// Current spec and member ids of a running listener
    pub fn current(&self, key: &BindKey) -> Option<(Arc<ListenerSpec>, Vec<i64>)> {
        self.listeners
            .get(key)
            .map(|l| (l.spec.load_full(), l.members.clone()))
    }

    pub fn bind_keys(&self) -> Vec<BindKey> {
        let mut keys: Vec<BindKey> = self.listeners.iter().map(|e| *e.key()).collect();
        keys.sort();
        keys
    }

    /// Stop the accept loop and release the socket. Connections already
    /// accepted keep running until they finish. Returns the member ids.
    pub async fn stop(&self, key: &BindKey) -> Option<Vec<i64>> {
        let (_, active) = self.listeners.remove(key)?;
        let _ = active.shutdown_tx.send(true);

        let mut task = active.task;
        if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
            warn!(bind = %key, "Listener did not stop in time, aborting");
            task.abort();
        }

        info!(bind = %key, members = ?active.members, "Listener stopped");
        Some(active.members)
    }

    pub async fn stop_all(&self) {
        for key in self.bind_keys() {
            self.stop(&key).await;
        }
    }

    /// Bound address of the listener serving proxy `id`
    pub fn local_addr(&self, id: i64) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|e| e.value().members.contains(&id))
            .map(|e| e.value().local_addr)
    }

    pub fn snapshot(&self) -> Vec<ListenerInfo> {
        let mut infos: Vec<ListenerInfo> = self
            .listeners
            .iter()
            .map(|entry| {
                let active = entry.value();
                let spec = active.spec.load();
                ListenerInfo {
                    id: spec.id,
                    members: active.members.clone(),
                    protocol: spec.listen_protocol,
                    kind: active.kind,
                    bind: entry.key().to_string(),
                    local_addr: active.local_addr,
                    target: spec.static_target().map(|t| t.to_string()),
                    vhosts: spec.vhosts.keys().cloned().collect(),
                    started_at: active.started_at,
                }
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }
}

async fn bind_tcp(key: &BindKey) -> anyhow::Result<TcpListener> {
    TcpListener::bind(key.addr)
        .await
        .with_context(|| format!("Failed to bind {}", key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::CertStoreConfig;
    use crate::listener::tests::{mapping, record};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn context() -> (Arc<EngineContext>, tempfile::TempDir) {
        let certs = tempfile::tempdir().unwrap();
        let ctx = EngineContext::builder()
            .with_cert_store(CertStoreConfig::new(certs.path()))
            .build()
            .unwrap();
        (ctx, certs)
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_start_snapshot_and_stop() {
        let (ctx, _certs) = context();
        let registry = ListenerRegistry::new();
        let port = free_port();
        let spec = ListenerSpec::from_record(&record(4, "tcp", port), &[]).unwrap();
        let key = spec.bind_key();

        let addr = registry.start(spec, vec![4], &ctx).await.unwrap();
        assert_eq!(addr.port(), port);
        assert_eq!(registry.local_addr(4), Some(addr));
        assert_eq!(registry.kind_of(&key), Some(ListenerKind::Tcp));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].bind, format!("tcp/127.0.0.1:{}", port));
        assert_eq!(snapshot[0].target.as_deref(), Some("tcp://127.0.0.1:9000"));

        // a second start on the same bind is refused
        let again = ListenerSpec::from_record(&record(5, "tcp", port), &[]).unwrap();
        assert!(registry.start(again, vec![5], &ctx).await.is_err());

        assert_eq!(registry.stop(&key).await, Some(vec![4]));
        assert!(registry.is_empty());
        assert!(registry.local_addr(4).is_none());

        // the port is free again
        let rebound = ListenerSpec::from_record(&record(4, "tcp", port), &[]).unwrap();
        registry.start(rebound, vec![4], &ctx).await.unwrap();
        registry.stop_all().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_update_swaps_spec_in_place() {
        let (ctx, _certs) = context();
        let registry = ListenerRegistry::new();

        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_port = backend.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = backend.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    if let Ok(n) = stream.read(&mut buf).await {
                        let _ = stream.write_all(&buf[..n]).await;
                    }
                });
            }
        });

        let port = free_port();
        let spec = ListenerSpec::from_record(&record(1, "tcp", port), &[]).unwrap();
        let addr = registry.start(spec, vec![1], &ctx).await.unwrap();

        // point the listener at the echo backend without rebinding
        let mut r = record(1, "tcp", port);
        r.target_port = backend_port;
        assert!(registry.update(ListenerSpec::from_record(&r, &[]).unwrap(), vec![1]));
        assert_eq!(registry.local_addr(1), Some(addr));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"after update").await.unwrap();
        let mut buf = [0u8; 12];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"after update");

        // vhosts turn a plain TCP listener into a sniffing one
        let with_vhost = ListenerSpec::from_record(&r, &[mapping(1, "a.example.com", backend_port)]).unwrap();
        assert!(!registry.update(with_vhost, vec![1]));

        registry.stop_all().await;
    }

    #[tokio::test]
    async fn test_udp_and_tcp_share_port_number() {
        let (ctx, _certs) = context();
        let registry = ListenerRegistry::new();
        let port = free_port();

        registry
            .start(ListenerSpec::from_record(&record(1, "tcp", port), &[]).unwrap(), vec![1], &ctx)
            .await
            .unwrap();
        let udp = registry
            .start(ListenerSpec::from_record(&record(2, "udp", port), &[]).unwrap(), vec![2], &ctx)
            .await;
        // the UDP port may be taken by something else on a busy host
        if udp.is_ok() {
            assert_eq!(registry.len(), 2);
        }
        registry.stop_all().await;
    }
}
