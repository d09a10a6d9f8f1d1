use edgegate::acme::{AcmeIssuer, Http01Challenges};
use edgegate::admin::{AdminServer, PKG_NAME, VERSION};
use edgegate::alerting::{LogAlerter, WebhookAlerter};
use edgegate::certs::SelfSignedIssuer;
use edgegate::collab::{
    Alerting, CertificateIssuer, MetricsStore, Noop, StaticIpReputation, StaticMaintenance,
};
use edgegate::config::{Config, FileConfigStore};
use edgegate::db::SqliteMetricsStore;
use edgegate::engine::{Engine, EngineContext};
use edgegate::tls;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("edgegate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let ctx = build_context(&config)?;
    let engine = Arc::new(Engine::new(ctx, Arc::new(FileConfigStore::new(&config_path))));
    engine.spawn_background();

    match engine.reconcile_all_listeners().await {
        Ok(report) => {
            for (id, reason) in &report.skipped {
                warn!(id, reason = %reason, "Listener not started");
            }
        }
        Err(e) => error!(error = %e, "Initial reconcile failed"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admin_handle = if config.server.admin_port > 0 {
        let admin_addr: SocketAddr = format!("{}:{}", config.server.admin_bind, config.server.admin_port)
            .parse()
            .map_err(|e| {
                error!(bind = %config.server.admin_bind, port = config.server.admin_port, error = %e, "Invalid admin bind address");
                anyhow::anyhow!("Invalid admin bind address: {}", e)
            })?;

        let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
            let token = uuid::Uuid::new_v4().to_string();
            info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
            token
        });

        let admin_server = AdminServer::new(admin_addr, Arc::clone(&engine), shutdown_rx, admin_token);
        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Admin server error");
            }
        }))
    } else {
        None
    };

    // Ctrl+C or SIGTERM stops; SIGHUP re-reads the listener configuration
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reconciling listeners...");
                    match engine.reconcile_all_listeners().await {
                        Ok(report) => {
                            info!(
                                started = ?report.started,
                                stopped = ?report.stopped,
                                updated = ?report.updated,
                                skipped = report.skipped.len(),
                                "Listeners reloaded"
                            );
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to reload listeners");
                        }
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);
    engine.shutdown().await;

    if let Some(handle) = admin_handle {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }

    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wire the collaborators selected by the configuration file
fn build_context(config: &Config) -> anyhow::Result<Arc<EngineContext>> {
    let cert_store = config.cert_store_config();
    let challenges = Http01Challenges::new();

    let issuer: Arc<dyn CertificateIssuer> = if config.acme.enabled {
        std::fs::create_dir_all(&config.acme.account_dir).map_err(|e| {
            anyhow::anyhow!("Failed to create ACME account directory '{}': {}", config.acme.account_dir, e)
        })?;
        info!(
            email = ?config.acme.email,
            directory = ?config.acme.directory_url,
            "ACME certificate issuance enabled"
        );
        Arc::new(
            AcmeIssuer::new(config.acme.clone(), &cert_store.cert_root, challenges.clone())?
                .with_webroot(config.tls.webroot.as_ref().map(PathBuf::from))
                .with_renew_before_days(config.tls.renew_before_days),
        )
    } else {
        warn!("ACME disabled, issuing self-signed certificates (not for production)");
        Arc::new(SelfSignedIssuer::new(&cert_store.cert_root))
    };

    let metrics_store: Arc<dyn MetricsStore> = match &config.metrics.sqlite_path {
        Some(path) => {
            info!(path = %path, "Persisting traffic samples to SQLite");
            Arc::new(SqliteMetricsStore::open(path)?)
        }
        None => Arc::new(Noop),
    };

    let alerter: Arc<dyn Alerting> = match &config.alerts.webhook_url {
        Some(url) => Arc::new(WebhookAlerter::new(url.clone())?),
        None => Arc::new(LogAlerter),
    };

    let mut maintenance = StaticMaintenance::new();
    for entry in config.maintenance.iter().filter(|m| m.enabled) {
        maintenance = maintenance.with_site(&entry.hostname, entry.page_path.as_ref().map(PathBuf::from));
    }

    let mut builder = EngineContext::builder()
        .with_config(config.engine_config())
        .with_cert_store(cert_store)
        .with_health(config.health_config())
        .with_metrics(config.metrics_config(), config.alerts.thresholds.clone())
        .with_challenges(challenges)
        .with_issuer(issuer)
        .with_metrics_store(metrics_store)
        .with_alerter(alerter)
        .with_ip_reputation(Arc::new(StaticIpReputation::new(
            config.ip.blocked.iter().copied(),
            config.ip.trusted.iter().copied(),
        )))
        .with_maintenance(Arc::new(maintenance));

    if let (Some(cert), Some(key)) = (&config.tls.default_cert, &config.tls.default_key) {
        let certs = tls::load_certs(Path::new(cert))?;
        let key = tls::load_key(Path::new(key))?;
        info!(cert = %cert, "Default certificate loaded");
        builder = builder.with_default_key(tls::certified_key(certs, &key)?);
    } else {
        warn!("No default certificate configured, using an auto-generated self-signed one");
    }

    builder.build()
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        writeln!(&file, "{}", std::process::id())?;

        // the lock lives as long as the handle
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting edge proxy");
    info!(
        admin_bind = %config.server.admin_bind,
        admin_port = if config.server.admin_port > 0 { Some(config.server.admin_port) } else { None },
        listeners = config.listeners.len(),
        vhosts = config.vhosts.len(),
        "Server configuration"
    );
    info!(
        idle_timeout_secs = config.engine.idle_timeout_secs,
        connect_timeout_ms = config.engine.connect_timeout_ms,
        response_timeout_secs = config.engine.response_timeout_secs,
        strict_vhosts = config.engine.strict_vhosts,
        "Proxy settings"
    );
    info!(
        failure_threshold = config.engine.failure_threshold,
        cooldown_secs = config.engine.cooldown_secs,
        probe_interval_secs = config.engine.probe_interval_secs,
        "Backend health settings"
    );
    info!(
        cert_root = %config.tls.cert_root,
        acme = config.acme.enabled,
        metrics_capacity = config.metrics.capacity,
        metrics_sqlite = config.metrics.sqlite_path.is_some(),
        "Certificates and metrics"
    );
}
