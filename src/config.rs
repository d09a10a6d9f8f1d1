use crate::alerting::TrafficThresholds;
use crate::certs::CertStoreConfig;
use crate::collab::ConfigStore;
use crate::engine::EngineConfig;
use crate::health::HealthConfig;
use crate::listener::{ListenerRecord, VHostMapping};
use crate::metrics::MetricsConfig;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration file
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Admin server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Timeouts and limits for the data plane
    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub tls: TlsSection,

    #[serde(default)]
    pub acme: AcmeConfig,

    #[serde(default)]
    pub metrics: MetricsSection,

    #[serde(default)]
    pub alerts: AlertsSection,

    #[serde(default)]
    pub ip: IpSection,

    #[serde(default)]
    pub maintenance: Vec<MaintenanceEntry>,

    /// Listener definitions, re-read on every reconcile
    #[serde(default)]
    pub listeners: Vec<ListenerRecord>,

    #[serde(default)]
    pub vhosts: Vec<VHostMapping>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Port for the admin API (0 disables it)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bind address for the admin API (default: 127.0.0.1)
    #[serde(default = "default_admin_bind")]
    pub admin_bind: String,

    /// Bearer token for protected admin routes.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            admin_port: default_admin_port(),
            admin_bind: default_admin_bind(),
            admin_token: None,
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineSection {
    /// Idle timeout for proxied streams in seconds (default: 30)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Backend connect timeout in milliseconds (default: 2000)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Time to wait for backend response headers in seconds (default: 60)
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,

    /// How long to wait for a ClientHello or request head (default: 800)
    #[serde(default = "default_sniff_timeout")]
    pub sniff_timeout_ms: u64,

    /// Maximum bytes buffered while sniffing (default: 16384)
    #[serde(default = "default_sniff_max_bytes")]
    pub sniff_max_bytes: usize,

    /// Refuse hostnames that match no vhost instead of using the listener target
    #[serde(default)]
    pub strict_vhosts: bool,

    /// Public HTTPS port used in redirects (default: 443)
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Consecutive failures before a backend is marked down (default: 3)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long a backend stays down in seconds (default: 60)
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    /// Background probe interval in seconds (default: 30, 0 disables probing)
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    /// Probe connect timeout in milliseconds (default: 2000)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// UDP sessions without traffic are dropped after this many seconds (default: 30)
    #[serde(default = "default_udp_idle_timeout")]
    pub udp_idle_timeout_secs: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            response_timeout_secs: default_response_timeout(),
            sniff_timeout_ms: default_sniff_timeout(),
            sniff_max_bytes: default_sniff_max_bytes(),
            strict_vhosts: false,
            https_port: default_https_port(),
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown(),
            probe_interval_secs: default_probe_interval(),
            probe_timeout_ms: default_probe_timeout(),
            udp_idle_timeout_secs: default_udp_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TlsSection {
    /// Directory holding issued certificates as `<host>/fullchain.pem`
    #[serde(default = "default_cert_root")]
    pub cert_root: String,

    /// Uploaded certificates, same layout, checked first
    pub manual_cert_dir: Option<String>,

    /// Directory with `.well-known/acme-challenge/` files written by an
    /// external client
    pub webroot: Option<String>,

    /// Certificate served when SNI matches nothing (PEM)
    pub default_cert: Option<String>,

    /// Key for `default_cert` (PEM)
    pub default_key: Option<String>,

    /// Renew certificates expiring within this many days (default: 30)
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: u64,

    /// Parallel certificate issuances (default: 4)
    #[serde(default = "default_max_concurrent_issuance")]
    pub max_concurrent_issuance: usize,

    /// Certificates held in memory (default: 10000)
    #[serde(default = "default_max_cached_certs")]
    pub max_cached_certs: usize,
}

impl Default for TlsSection {
    fn default() -> Self {
        Self {
            cert_root: default_cert_root(),
            manual_cert_dir: None,
            webroot: None,
            default_cert: None,
            default_key: None,
            renew_before_days: default_renew_before_days(),
            max_concurrent_issuance: default_max_concurrent_issuance(),
            max_cached_certs: default_max_cached_certs(),
        }
    }
}

impl TlsSection {
    pub fn has_default_files(&self) -> bool {
        self.default_cert.is_some() && self.default_key.is_some()
    }
}

/// ACME (Let's Encrypt) configuration for automatic certificate provisioning
#[derive(Debug, Deserialize, Clone)]
pub struct AcmeConfig {
    /// Issue certificates through ACME. Without it, self-signed
    /// certificates are written to the store instead.
    #[serde(default)]
    pub enabled: bool,

    /// Contact email for Let's Encrypt notifications (required when enabled)
    pub email: Option<String>,

    /// ACME directory URL (defaults to Let's Encrypt production)
    /// Use "https://acme-staging-v02.api.letsencrypt.org/directory" for testing
    pub directory_url: Option<String>,

    /// Local directory for the account credentials
    #[serde(default = "default_acme_account_dir")]
    pub account_dir: String,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            email: None,
            directory_url: None,
            account_dir: default_acme_account_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsSection {
    /// Buffered samples before new ones are dropped (default: 100000)
    #[serde(default = "default_metrics_capacity")]
    pub capacity: usize,

    /// Flush interval in seconds (default: 5)
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// SQLite database for flushed samples. Not persisted when unset.
    pub sqlite_path: Option<String>,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            capacity: default_metrics_capacity(),
            flush_interval_secs: default_flush_interval(),
            sqlite_path: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AlertsSection {
    /// Alerts are POSTed here as JSON; logged only when unset
    pub webhook_url: Option<String>,

    #[serde(flatten)]
    pub thresholds: TrafficThresholds,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct IpSection {
    #[serde(default)]
    pub blocked: Vec<IpAddr>,

    /// Never rejected, even when also blocked
    #[serde(default)]
    pub trusted: Vec<IpAddr>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MaintenanceEntry {
    pub hostname: String,

    /// HTML file served instead of the built-in maintenance page
    pub page_path: Option<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_admin_port() -> u16 {
    9999
}

fn default_admin_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_idle_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    2000
}

fn default_response_timeout() -> u64 {
    60
}

fn default_sniff_timeout() -> u64 {
    800
}

fn default_sniff_max_bytes() -> usize {
    16 * 1024
}

fn default_https_port() -> u16 {
    443
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown() -> u64 {
    60
}

fn default_probe_interval() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    2000
}

fn default_udp_idle_timeout() -> u64 {
    30
}

fn default_cert_root() -> String {
    "./certs".to_string()
}

fn default_renew_before_days() -> u64 {
    30
}

fn default_max_concurrent_issuance() -> usize {
    4
}

fn default_max_cached_certs() -> usize {
    10_000
}

fn default_acme_account_dir() -> String {
    "./acme_cache".to_string()
}

fn default_metrics_capacity() -> usize {
    100_000
}

fn default_flush_interval() -> u64 {
    5
}

fn default_enabled() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-section constraints. Individual listener problems are
    /// reported by the reconciler and do not fail the whole file.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let mut ids = HashSet::new();
        for listener in &self.listeners {
            if !ids.insert(listener.id) {
                errors.push(format!("Duplicate listener id {}", listener.id));
            }
        }

        for vhost in &self.vhosts {
            if !ids.contains(&vhost.listener_id) {
                errors.push(format!(
                    "VHost '{}' refers to unknown listener {}",
                    vhost.hostname, vhost.listener_id
                ));
            }
        }

        if self.acme.enabled && self.acme.email.as_deref().unwrap_or("").is_empty() {
            errors.push("ACME requires an email address".to_string());
        }

        if self.tls.default_cert.is_some() != self.tls.default_key.is_some() {
            errors.push("default_cert and default_key must be set together".to_string());
        }

        if self.metrics.capacity == 0 {
            errors.push("Metrics capacity must be non-zero".to_string());
        }

        if self.metrics.flush_interval_secs == 0 {
            errors.push("Metrics flush interval must be non-zero".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        let engine = &self.engine;
        EngineConfig {
            idle_timeout: Duration::from_secs(engine.idle_timeout_secs),
            connect_timeout: Duration::from_millis(engine.connect_timeout_ms),
            response_timeout: Duration::from_secs(engine.response_timeout_secs),
            sniff_timeout: Duration::from_millis(engine.sniff_timeout_ms),
            sniff_max_bytes: engine.sniff_max_bytes,
            strict_vhosts: engine.strict_vhosts,
            https_port: engine.https_port,
            webroot: self.tls.webroot.as_ref().map(PathBuf::from),
            udp_idle_timeout: Duration::from_secs(engine.udp_idle_timeout_secs),
        }
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig::default()
            .with_failure_threshold(self.engine.failure_threshold)
            .with_cooldown(Duration::from_secs(self.engine.cooldown_secs))
            .with_probe_interval(Duration::from_secs(self.engine.probe_interval_secs))
            .with_probe_timeout(Duration::from_millis(self.engine.probe_timeout_ms))
    }

    pub fn metrics_config(&self) -> MetricsConfig {
        MetricsConfig {
            capacity: self.metrics.capacity,
            flush_interval: Duration::from_secs(self.metrics.flush_interval_secs),
        }
    }

    pub fn cert_store_config(&self) -> CertStoreConfig {
        CertStoreConfig {
            cert_root: PathBuf::from(&self.tls.cert_root),
            manual_dir: self.tls.manual_cert_dir.as_ref().map(PathBuf::from),
            renew_before_days: self.tls.renew_before_days,
            max_concurrent_issuance: self.tls.max_concurrent_issuance,
            max_cached: self.tls.max_cached_certs,
            ..CertStoreConfig::default()
        }
    }
}

/// Listener configuration read from the TOML file on every call, so edits
/// are picked up by the next reconcile
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read(&self) -> anyhow::Result<Config> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || Config::load(path)).await?
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn list_enabled_listeners(&self) -> anyhow::Result<Vec<ListenerRecord>> {
        let config = self.read().await?;
        Ok(config.listeners.into_iter().filter(|l| l.enabled).collect())
    }

    async fn list_vhost_mappings(&self) -> anyhow::Result<Vec<VHostMapping>> {
        Ok(self.read().await?.vhosts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
admin_port = 9000
admin_token = "secret"

[engine]
idle_timeout_secs = 10
strict_vhosts = true
https_port = 8443

[tls]
cert_root = "/var/lib/edgegate/certs"
webroot = "/var/www/acme"

[alerts]
webhook_url = "https://hooks.example.com/edge"
per_ip_requests = 1000

[ip]
blocked = ["198.51.100.7"]

[[maintenance]]
hostname = "shop.example.com"
page_path = "/srv/maintenance.html"

[[listeners]]
id = 1
listen_protocol = "https"
listen_port = 443
target_host = "127.0.0.1"
target_port = 3000

[[listeners]]
id = 2
listen_protocol = "udp"
listen_port = 5353
target_host = "10.0.0.53"
target_port = 53
enabled = false

[[vhosts]]
listener_id = 1
hostname = "app.example.com"
target_host = "127.0.0.1"
target_port = 3001
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.admin_port, 9000);
        assert_eq!(config.engine.idle_timeout_secs, 10);
        assert!(config.engine.strict_vhosts);
        assert_eq!(config.alerts.thresholds.per_ip_requests, Some(1000));
        assert_eq!(config.ip.blocked.len(), 1);
        assert_eq!(config.maintenance.len(), 1);
        assert!(config.maintenance[0].enabled);
        assert_eq!(config.listeners.len(), 2);
        assert!(!config.listeners[1].enabled);
        assert_eq!(config.vhosts[0].target_port, 3001);

        let engine = config.engine_config();
        assert_eq!(engine.idle_timeout, Duration::from_secs(10));
        assert_eq!(engine.https_port, 8443);
        assert_eq!(engine.webroot, Some(PathBuf::from("/var/www/acme")));
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.admin_port, 9999);
        assert_eq!(config.server.admin_bind, "127.0.0.1");
        assert_eq!(config.engine.sniff_timeout_ms, 800);
        assert_eq!(config.engine.sniff_max_bytes, 16384);
        assert_eq!(config.engine.failure_threshold, 3);
        assert_eq!(config.tls.cert_root, "./certs");
        assert_eq!(config.metrics.capacity, 100_000);
        assert!(config.alerts.thresholds.is_empty());
        assert!(config.listeners.is_empty());
    }

    #[test]
    fn test_health_and_metrics_config() {
        let toml = r#"
[engine]
failure_threshold = 5
cooldown_secs = 10
probe_interval_secs = 0

[metrics]
capacity = 10
flush_interval_secs = 1
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let health = config.health_config();
        assert_eq!(health.failure_threshold, 5);
        assert_eq!(health.cooldown, Duration::from_secs(10));
        assert_eq!(health.probe_interval, Duration::ZERO);

        let metrics = config.metrics_config();
        assert_eq!(metrics.capacity, 10);
        assert_eq!(metrics.flush_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_validate_duplicate_listener_ids() {
        let toml = r#"
[[listeners]]
id = 1
listen_protocol = "tcp"
listen_port = 7000
target_host = "127.0.0.1"
target_port = 7001

[[listeners]]
id = 1
listen_protocol = "tcp"
listen_port = 7002
target_host = "127.0.0.1"
target_port = 7003
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("Duplicate listener id 1"));
    }

    #[test]
    fn test_validate_orphan_vhost() {
        let toml = r#"
[[vhosts]]
listener_id = 7
hostname = "a.example.com"
target_host = "127.0.0.1"
target_port = 3000
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_acme_requires_email() {
        let toml = r#"
[acme]
enabled = true
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());

        let toml = r#"
[acme]
enabled = true
email = "ops@example.com"
directory_url = "https://acme-staging-v02.api.letsencrypt.org/directory"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.acme.account_dir, "./acme_cache");
    }

    #[test]
    fn test_default_cert_requires_key() {
        let toml = r#"
[tls]
default_cert = "/etc/edgegate/default.pem"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(!config.tls.has_default_files());
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_file_config_store_filters_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edgegate.toml");
        std::fs::write(
            &path,
            r#"
[[listeners]]
id = 1
listen_protocol = "tcp"
listen_port = 7000
target_host = "127.0.0.1"
target_port = 7001

[[listeners]]
id = 2
listen_protocol = "tcp"
listen_port = 7002
target_host = "127.0.0.1"
target_port = 7003
enabled = false
"#,
        )
        .unwrap();

        let store = FileConfigStore::new(&path);
        let listeners = store.list_enabled_listeners().await.unwrap();
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].id, 1);
        assert!(store.list_vhost_mappings().await.unwrap().is_empty());

        // edits are seen on the next read
        std::fs::write(&path, "").unwrap();
        assert!(store.list_enabled_listeners().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_config_store_missing_file() {
        let store = FileConfigStore::new("/nonexistent/edgegate.toml");
        assert!(store.list_enabled_listeners().await.is_err());
    }
}
