//! Engine wiring.
//!
//! [`EngineContext`] is the set of shared services every handler receives:
//! certificate resolver, health tracker, metrics buffer and the external
//! collaborators. [`Engine`] owns the context, the listener registry and the
//! reconciler, and runs the background loops.

use crate::acme::Http01Challenges;
use crate::alerting::TrafficThresholds;
use crate::certs::{generate_self_signed_for, CertResolver, CertStoreConfig};
use crate::collab::{
    Alerting, BotChallenge, CertificateIssuer, ConfigStore, IpReputation, MaintenanceMode,
    MetricsStore, Noop,
};
use crate::health::{HealthConfig, HealthEntry, HealthTracker};
use crate::metrics::{MetricsBatch, MetricsBuffer, MetricsConfig};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::registry::{ListenerInfo, ListenerRegistry};
use crate::tls;
use parking_lot::Mutex;
use rustls::server::ResolvesServerCert;
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::info;

/// Data-plane timeouts and limits
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Streams with no traffic in either direction are closed after this
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    /// Time allowed for a backend to send response headers
    pub response_timeout: Duration,
    pub sniff_timeout: Duration,
    pub sniff_max_bytes: usize,
    /// Refuse hostnames no vhost matches instead of using the listener target
    pub strict_vhosts: bool,
    /// Port used in HTTP to HTTPS redirects
    pub https_port: u16,
    /// Served under `/.well-known/acme-challenge/`
    pub webroot: Option<PathBuf>,
    pub udp_idle_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(2),
            response_timeout: Duration::from_secs(60),
            sniff_timeout: Duration::from_millis(800),
            sniff_max_bytes: 16 * 1024,
            strict_vhosts: false,
            https_port: 443,
            webroot: None,
            udp_idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Shared services handed to every listener
pub struct EngineContext {
    pub config: EngineConfig,
    pub certs: Arc<CertResolver>,
    /// Server config with the SNI resolver installed
    pub tls: Arc<ServerConfig>,
    pub backend_tls: TlsConnector,
    pub health: Arc<HealthTracker>,
    pub metrics: Arc<MetricsBuffer>,
    pub challenges: Http01Challenges,
    pub ip_reputation: Arc<dyn IpReputation>,
    pub bot_challenge: Arc<dyn BotChallenge>,
    pub maintenance: Arc<dyn MaintenanceMode>,
}

impl EngineContext {
    pub fn builder() -> EngineContextBuilder {
        EngineContextBuilder::default()
    }
}

pub struct EngineContextBuilder {
    config: EngineConfig,
    cert_store: CertStoreConfig,
    health: HealthConfig,
    metrics: MetricsConfig,
    thresholds: TrafficThresholds,
    default_key: Option<Arc<CertifiedKey>>,
    challenges: Http01Challenges,
    issuer: Arc<dyn CertificateIssuer>,
    metrics_store: Arc<dyn MetricsStore>,
    alerter: Arc<dyn Alerting>,
    ip_reputation: Arc<dyn IpReputation>,
    bot_challenge: Arc<dyn BotChallenge>,
    maintenance: Arc<dyn MaintenanceMode>,
}

impl Default for EngineContextBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            cert_store: CertStoreConfig::default(),
            health: HealthConfig::default(),
            metrics: MetricsConfig::default(),
            thresholds: TrafficThresholds::default(),
            default_key: None,
            challenges: Http01Challenges::new(),
            issuer: Arc::new(Noop),
            metrics_store: Arc::new(Noop),
            alerter: Arc::new(Noop),
            ip_reputation: Arc::new(Noop),
            bot_challenge: Arc::new(Noop),
            maintenance: Arc::new(Noop),
        }
    }
}

impl EngineContextBuilder {
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cert_store(mut self, cert_store: CertStoreConfig) -> Self {
        self.cert_store = cert_store;
        self
    }

    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsConfig, thresholds: TrafficThresholds) -> Self {
        self.metrics = metrics;
        self.thresholds = thresholds;
        self
    }

    /// Certificate for connections without a usable SNI name
    pub fn with_default_key(mut self, key: Arc<CertifiedKey>) -> Self {
        self.default_key = Some(key);
        self
    }

    /// Token store shared with the ACME issuer
    pub fn with_challenges(mut self, challenges: Http01Challenges) -> Self {
        self.challenges = challenges;
        self
    }

    pub fn with_issuer(mut self, issuer: Arc<dyn CertificateIssuer>) -> Self {
        self.issuer = issuer;
        self
    }

    pub fn with_metrics_store(mut self, store: Arc<dyn MetricsStore>) -> Self {
        self.metrics_store = store;
        self
    }

    pub fn with_alerter(mut self, alerter: Arc<dyn Alerting>) -> Self {
        self.alerter = alerter;
        self
    }

    pub fn with_ip_reputation(mut self, reputation: Arc<dyn IpReputation>) -> Self {
        self.ip_reputation = reputation;
        self
    }

    pub fn with_bot_challenge(mut self, challenge: Arc<dyn BotChallenge>) -> Self {
        self.bot_challenge = challenge;
        self
    }

    pub fn with_maintenance(mut self, maintenance: Arc<dyn MaintenanceMode>) -> Self {
        self.maintenance = maintenance;
        self
    }

    pub fn build(self) -> anyhow::Result<Arc<EngineContext>> {
        let default_key = match self.default_key {
            Some(key) => key,
            None => generate_self_signed_for(&["localhost", "127.0.0.1"])?.certified_key()?,
        };

        let certs = Arc::new(CertResolver::new(self.cert_store, self.issuer, default_key));
        let tls = tls::server_config(Arc::clone(&certs) as Arc<dyn ResolvesServerCert>)?;

        Ok(Arc::new(EngineContext {
            config: self.config,
            certs,
            tls,
            backend_tls: tls::backend_connector()?,
            health: Arc::new(HealthTracker::new(self.health)),
            metrics: MetricsBuffer::new(self.metrics, self.metrics_store, self.alerter, self.thresholds),
            challenges: self.challenges,
            ip_reputation: self.ip_reputation,
            bot_challenge: self.bot_challenge,
            maintenance: self.maintenance,
        }))
    }
}

/// The running data plane
pub struct Engine {
    ctx: Arc<EngineContext>,
    store: Arc<dyn ConfigStore>,
    registry: Arc<ListenerRegistry>,
    reconciler: Reconciler,
    shutdown_tx: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(ctx: Arc<EngineContext>, store: Arc<dyn ConfigStore>) -> Self {
        let registry = Arc::new(ListenerRegistry::new());
        let reconciler = Reconciler::new(Arc::clone(&registry), Arc::clone(&ctx));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            ctx,
            store,
            registry,
            reconciler,
            shutdown_tx,
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    /// Read the desired listeners from the config store and converge on them
    pub async fn reconcile_all_listeners(&self) -> anyhow::Result<ReconcileReport> {
        let listeners = self.store.list_enabled_listeners().await?;
        let mappings = self.store.list_vhost_mappings().await?;
        Ok(self.reconciler.reconcile(&listeners, &mappings).await)
    }

    pub fn is_reloading(&self) -> bool {
        self.reconciler.is_reloading()
    }

    pub fn health_snapshot(&self) -> Vec<HealthEntry> {
        self.ctx.health.snapshot()
    }

    pub fn subscribe_metrics(&self) -> broadcast::Receiver<MetricsBatch> {
        self.ctx.metrics.subscribe()
    }

    pub fn listeners(&self) -> Vec<ListenerInfo> {
        self.registry.snapshot()
    }

    /// Bound address of the listener serving `id`
    pub fn local_addr(&self, id: i64) -> Option<SocketAddr> {
        self.registry.local_addr(id)
    }

    /// Start the health prober and the metrics flusher
    pub fn spawn_background(&self) {
        let mut background = self.background.lock();

        if !self.ctx.health.config().probe_interval.is_zero() {
            let health = Arc::clone(&self.ctx.health);
            background.push(tokio::spawn(health.run(self.shutdown_tx.subscribe())));
        }

        let metrics = Arc::clone(&self.ctx.metrics);
        background.push(tokio::spawn(metrics.run(self.shutdown_tx.subscribe())));
    }

    /// Stop every listener, then the background loops (final metrics flush)
    pub async fn shutdown(&self) {
        info!("Stopping listeners");
        self.registry.stop_all().await;

        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.background.lock());
        for task in tasks {
            let _ = task.await;
        }

        // nothing flushes when spawn_background was never called
        self.ctx.metrics.flush().await;
        info!("Engine stopped");
    }
}
