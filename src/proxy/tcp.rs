//! Plain TCP passthrough to the listener's static target

use crate::engine::EngineContext;
use crate::listener::{ListenerSpec, SharedSpec};
use crate::metrics::Meter;
use crate::proxy::{client_ip, dial, splice};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
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
        info!(addr = %addr, id = spec.load().id, "TCP listener started");
    }

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let spec = spec.load_full();
                        let ctx = Arc::clone(&ctx);
                        let span = info_span!("conn", listener = spec.id, peer = %addr);
                        tokio::spawn(handle(stream, addr, spec, ctx).instrument(span));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!(id = spec.load().id, "TCP listener shutting down");
                    break;
                }
            }
        }
    }
}

async fn handle(client: TcpStream, peer: SocketAddr, spec: Arc<ListenerSpec>, ctx: Arc<EngineContext>) {
    let ip = client_ip(peer);
    if ctx.ip_reputation.should_reject(ip) {
        debug!("Blocked client, closing");
        return;
    }

    let Some(target) = spec.static_target() else {
        debug!("Listener has no target, closing");
        return;
    };

    let backend = match dial(&ctx, &target, None).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(target = %target, error = %e, "Backend unavailable, closing");
            return;
        }
    };
    ctx.health.mark_success(&target.addr(), None);
    let _ = client.set_nodelay(true);

    let meter = Meter::new(Arc::clone(&ctx.metrics), spec.id, None, Some(ip));
    match splice(client, backend, ctx.config.idle_timeout, &meter).await {
        Ok((bytes_in, bytes_out)) => {
            debug!(bytes_in, bytes_out, "Connection closed");
        }
        Err(e) => {
            debug!(error = %e, "Connection closed with error");
        }
    }
    meter.finish(0);
}
