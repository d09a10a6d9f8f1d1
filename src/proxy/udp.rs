//! UDP passthrough.
//!
//! Every client address gets its own session task with a connected
//! upstream socket so replies can be routed back. The receive loop only
//! queues datagrams; resolving and connecting the upstream happens in the
//! session task. A session ends after `udp_idle_timeout` without datagrams
//! in either direction.

use crate::engine::EngineContext;
use crate::listener::{ListenerSpec, SharedSpec, Target};
use crate::metrics::Meter;
use crate::proxy::client_ip;
use dashmap::DashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, Instrument};

/// Largest UDP payload
const MAX_DATAGRAM: usize = 65_535;

/// Datagrams held per client while its session is busy; more are dropped
const SESSION_QUEUE: usize = 256;

type Sessions = Arc<DashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>;

pub async fn serve(
    socket: UdpSocket,
    spec: SharedSpec,
    ctx: Arc<EngineContext>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let socket = Arc::new(socket);
    let sessions: Sessions = Arc::new(DashMap::new());
    let mut buf = vec![0u8; MAX_DATAGRAM];

    if let Ok(addr) = socket.local_addr() {
        info!(addr = %addr, id = spec.load().id, "UDP listener started");
    }

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((n, peer)) => {
                        dispatch(&socket, &sessions, &spec, &ctx, &shutdown_rx, peer, &buf[..n]);
                    }
                    Err(e) => {
                        // ICMP errors from earlier sends surface here on some platforms
                        debug!(error = %e, "UDP receive error");
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!(id = spec.load().id, sessions = sessions.len(), "UDP listener shutting down");
                    break;
                }
            }
        }
    }
}

/// Queue a datagram on the client's session, starting one if needed.
/// Never waits, so one slow client cannot hold up the others.
#[allow(clippy::too_many_arguments)]
fn dispatch(
    socket: &Arc<UdpSocket>,
    sessions: &Sessions,
    spec: &SharedSpec,
    ctx: &Arc<EngineContext>,
    shutdown_rx: &watch::Receiver<bool>,
    peer: SocketAddr,
    datagram: &[u8],
) {
    let queued = sessions.get(&peer).map(|tx| tx.try_send(datagram.to_vec()));
    match queued {
        Some(Ok(())) => return,
        Some(Err(TrySendError::Full(_))) => {
            debug!(peer = %peer, "Session queue full, dropping datagram");
            return;
        }
        // closed: the session is winding down, start a fresh one
        Some(Err(TrySendError::Closed(_))) | None => {}
    }

    let spec = spec.load_full();
    let Some(target) = admit(&spec, ctx, peer) else {
        return;
    };

    let (tx, rx) = mpsc::channel(SESSION_QUEUE);
    let _ = tx.try_send(datagram.to_vec());
    sessions.insert(peer, tx.clone());

    let session = Session {
        socket: Arc::clone(socket),
        sessions: Arc::clone(sessions),
        tx,
        target,
        peer,
        meter: Meter::new(Arc::clone(&ctx.metrics), spec.id, None, Some(client_ip(peer))),
    };
    let span = info_span!("udp", listener = spec.id, peer = %peer);
    tokio::spawn(session.run(rx, Arc::clone(ctx), shutdown_rx.clone()).instrument(span));
}

/// Target for a new client, or `None` to drop its datagram (blocked
/// client, no target, backend down)
fn admit(spec: &ListenerSpec, ctx: &EngineContext, peer: SocketAddr) -> Option<Target> {
    if ctx.ip_reputation.should_reject(client_ip(peer)) {
        debug!(peer = %peer, "Blocked client, dropping datagram");
        return None;
    }

    let target = spec.static_target()?;
    if ctx.health.is_down(&target.addr(), None) {
        debug!(target = %target, "Backend down, dropping datagram");
        return None;
    }
    Some(target)
}

/// Resolve the target and open a connected socket to it
async fn connect_upstream(target: &Target) -> io::Result<UdpSocket> {
    let addr = target.addr();
    let remote = tokio::net::lookup_host(&addr)
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("No address for {}", addr)))?;

    let local: SocketAddr = if remote.is_ipv4() {
        ([0u8; 4], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let upstream = UdpSocket::bind(local).await?;
    upstream.connect(remote).await?;
    Ok(upstream)
}

struct Session {
    socket: Arc<UdpSocket>,
    sessions: Sessions,
    tx: mpsc::Sender<Vec<u8>>,
    target: Target,
    peer: SocketAddr,
    meter: Meter,
}

impl Session {
    async fn run(
        self,
        mut rx: mpsc::Receiver<Vec<u8>>,
        ctx: Arc<EngineContext>,
        shutdown_rx: watch::Receiver<bool>,
    ) {
        match connect_upstream(&self.target).await {
            Ok(upstream) => {
                debug!(target = %self.target, "UDP session opened");
                self.relay(&upstream, &mut rx, &ctx, shutdown_rx).await;
            }
            Err(e) => {
                error!(target = %self.target, error = %e, "Failed to open UDP session");
            }
        }

        rx.close();
        self.sessions
            .remove_if(&self.peer, |_, current| current.same_channel(&self.tx));
        self.meter.finish(0);
        debug!("UDP session closed");
    }

    /// Move datagrams both ways until the session idles out
    async fn relay(
        &self,
        upstream: &UdpSocket,
        rx: &mut mpsc::Receiver<Vec<u8>>,
        ctx: &EngineContext,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let idle = ctx.config.udp_idle_timeout;
        let addr = self.target.addr();
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                Some(datagram) = rx.recv() => {
                    match upstream.send(&datagram).await {
                        Ok(n) => self.meter.add_in(n as u64),
                        Err(e) => debug!(error = %e, "Failed to forward datagram"),
                    }
                }
                result = upstream.recv(&mut buf) => {
                    match result {
                        Ok(n) => {
                            ctx.health.mark_success(&addr, None);
                            match self.socket.send_to(&buf[..n], self.peer).await {
                                Ok(sent) => self.meter.add_out(sent as u64),
                                Err(e) => debug!(error = %e, "Failed to send reply to client"),
                            }
                        }
                        Err(e) => {
                            if e.kind() == io::ErrorKind::ConnectionRefused {
                                ctx.health.mark_failure(&addr, None);
                            }
                            debug!(error = %e, "Upstream receive error, closing session");
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep(idle) => break,
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
