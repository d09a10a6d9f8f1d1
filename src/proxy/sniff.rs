//! Transparent TCP routed by the hostname found in the first bytes.
//!
//! Serves `tcp` listeners that have vhosts and `https` listeners in
//! passthrough mode. TLS is never terminated; the sniffed bytes are
//! replayed to the backend before splicing.

use crate::engine::EngineContext;
use crate::listener::{ListenerSpec, SharedSpec};
use crate::metrics::Meter;
use crate::proxy::{client_ip, dial, splice};
use crate::sni;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
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
        info!(addr = %addr, id = spec.load().id, "Transparent listener started");
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
                    info!(id = spec.load().id, "Transparent listener shutting down");
                    break;
                }
            }
        }
    }
}

async fn handle(mut client: TcpStream, peer: SocketAddr, spec: Arc<ListenerSpec>, ctx: Arc<EngineContext>) {
    let ip = client_ip(peer);
    if ctx.ip_reputation.should_reject(ip) {
        debug!("Blocked client, closing");
        return;
    }

    let sniffed = match sni::sniff(&mut client, ctx.config.sniff_timeout, ctx.config.sniff_max_bytes).await {
        Ok(sniffed) => sniffed,
        Err(e) => {
            debug!(error = %e, "Read failed while sniffing");
            return;
        }
    };
    let hostname = sniffed.hostname.as_deref();

    let Some(target) = spec.resolve_target(hostname, ctx.config.strict_vhosts) else {
        debug!(hostname, "No route for hostname, closing");
        return;
    };

    let mut backend = match dial(&ctx, &target, hostname).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(hostname, target = %target, error = %e, "Backend unavailable, closing");
            return;
        }
    };
    ctx.health.mark_success(&target.addr(), hostname);

    let meter = Meter::new(Arc::clone(&ctx.metrics), spec.id, hostname, Some(ip));
    if !sniffed.buffered.is_empty() {
        if let Err(e) = backend.write_all(&sniffed.buffered).await {
            debug!(error = %e, "Failed to replay sniffed bytes");
            meter.finish(0);
            return;
        }
        meter.add_in(sniffed.buffered.len() as u64);
    }

    let _ = client.set_nodelay(true);
    match splice(client, backend, ctx.config.idle_timeout, &meter).await {
        Ok((bytes_in, bytes_out)) => {
            debug!(hostname, bytes_in, bytes_out, "Connection closed");
        }
        Err(e) => {
            debug!(hostname, error = %e, "Connection closed with error");
        }
    }
    meter.finish(0);
}
