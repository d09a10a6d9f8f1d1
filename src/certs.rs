//! Per-hostname certificate resolution.
//!
//! [`CertResolver`] backs the TLS SNI callback. Lookups go cache, then the
//! certificate store on disk (manual override directory first, then the
//! issued certificate root), then a generated self-signed certificate while
//! issuance runs in the background. Store layout:
//!
//! ```text
//! <root>/<hostname>/fullchain.pem
//! <root>/<hostname>/privkey.pem
//! ```

use crate::collab::CertificateIssuer;
use crate::sni::normalize_host;
use crate::tls::{certified_key, load_certs, load_key};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Datelike;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

const FULLCHAIN: &str = "fullchain.pem";
const PRIVKEY: &str = "privkey.pem";

#[derive(Debug, Clone)]
pub struct CertStoreConfig {
    /// Where issued certificates are written
    pub cert_root: PathBuf,
    /// Checked before `cert_root`
    pub manual_dir: Option<PathBuf>,
    /// Certificates expiring sooner than this are renewed
    pub renew_before_days: u64,
    pub cache_ttl: Duration,
    /// Issuances running at once; requests beyond this are deferred
    pub max_concurrent_issuance: usize,
    pub max_cached: usize,
}

impl Default for CertStoreConfig {
    fn default() -> Self {
        Self {
            cert_root: PathBuf::from("./certs"),
            manual_dir: None,
            renew_before_days: 30,
            cache_ttl: Duration::from_secs(60 * 60),
            max_concurrent_issuance: 4,
            max_cached: 10_000,
        }
    }
}

impl CertStoreConfig {
    pub fn new(cert_root: impl Into<PathBuf>) -> Self {
        Self {
            cert_root: cert_root.into(),
            ..Default::default()
        }
    }

    pub fn with_manual_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.manual_dir = Some(dir.into());
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_max_concurrent_issuance(mut self, max: usize) -> Self {
        self.max_concurrent_issuance = max;
        self
    }

    pub fn with_max_cached(mut self, max: usize) -> Self {
        self.max_cached = max;
        self
    }

    /// Directories searched for `hostname`, in priority order
    fn candidate_dirs(&self, hostname: &str) -> Vec<PathBuf> {
        let mut dirs = Vec::with_capacity(2);
        if let Some(manual) = &self.manual_dir {
            dirs.push(manual.join(hostname));
        }
        dirs.push(self.cert_root.join(hostname));
        dirs
    }
}

#[derive(Clone)]
struct CachedKey {
    key: Arc<CertifiedKey>,
    created_at: Instant,
    self_signed: bool,
}

pub struct CertResolver {
    config: CertStoreConfig,
    cache: Arc<DashMap<String, CachedKey>>,
    pending: Arc<DashSet<String>>,
    permits: Arc<Semaphore>,
    /// Hostnames issuance may be requested for; unrestricted when `None`
    issuable: RwLock<Option<HashSet<String>>>,
    issuer: Arc<dyn CertificateIssuer>,
    default_key: Arc<CertifiedKey>,
}

impl std::fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertResolver")
            .field("cert_root", &self.config.cert_root)
            .field("cached", &self.cache.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl CertResolver {
    pub fn new(
        config: CertStoreConfig,
        issuer: Arc<dyn CertificateIssuer>,
        default_key: Arc<CertifiedKey>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_issuance.max(1)));
        Self {
            config,
            cache: Arc::new(DashMap::new()),
            pending: Arc::new(DashSet::new()),
            permits,
            issuable: RwLock::new(None),
            issuer,
            default_key,
        }
    }

    pub fn config(&self) -> &CertStoreConfig {
        &self.config
    }

    /// Certificate served when SNI is missing or nothing else resolves
    pub fn default_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.default_key)
    }

    /// Resolve a certificate for `hostname`.
    ///
    /// Returns `None` only when no certificate, not even a self-signed one,
    /// can be produced; the caller then uses the default certificate.
    pub fn resolve(&self, hostname: &str) -> Option<Arc<CertifiedKey>> {
        let host = normalize_host(hostname)?;

        let cached = self.cache.get(&host).map(|entry| entry.clone());
        if let Some(entry) = cached {
            if entry.created_at.elapsed() < self.config.cache_ttl {
                if !entry.self_signed {
                    return Some(entry.key);
                }
                if !self.has_certificate(&host) {
                    // a failed issuance is retried on the next handshake
                    if !self.is_pending(&host) {
                        self.request_issuance(&host);
                    }
                    return Some(entry.key);
                }
            }
        }

        match self.load_from_store(&host) {
            Ok(Some((key, needs_renewal))) => {
                if needs_renewal {
                    self.request_issuance(&host);
                }
                self.cache_insert(
                    host,
                    CachedKey {
                        key: Arc::clone(&key),
                        created_at: Instant::now(),
                        self_signed: false,
                    },
                );
                return Some(key);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(hostname = %host, error = %e, "Stored certificate unusable");
            }
        }

        if host.parse::<IpAddr>().is_ok() {
            return None;
        }

        self.request_issuance(&host);

        match generate_self_signed(&host).and_then(|generated| generated.certified_key()) {
            Ok(key) => {
                debug!(hostname = %host, "Serving self-signed certificate");
                self.cache_insert(
                    host,
                    CachedKey {
                        key: Arc::clone(&key),
                        created_at: Instant::now(),
                        self_signed: true,
                    },
                );
                Some(key)
            }
            Err(e) => {
                error!(hostname = %host, error = %e, "Failed to generate self-signed certificate");
                None
            }
        }
    }

    /// Cache `entry`. A full cache first sheds expired entries; if it is
    /// still full, self-signed fallbacks are not cached at all.
    fn cache_insert(&self, host: String, entry: CachedKey) {
        if self.cache.len() >= self.config.max_cached {
            let ttl = self.config.cache_ttl;
            self.cache.retain(|_, cached| cached.created_at.elapsed() < ttl);
            if self.cache.len() >= self.config.max_cached && entry.self_signed {
                debug!(hostname = %host, "Certificate cache full, not caching fallback");
                return;
            }
        }
        self.cache.insert(host, entry);
    }

    /// Limit issuance to `hosts`, or lift the limit with `None`
    pub fn restrict_issuance(&self, hosts: Option<HashSet<String>>) {
        *self.issuable.write() = hosts;
    }

    fn may_issue(&self, hostname: &str) -> bool {
        self.issuable
            .read()
            .as_ref()
            .map_or(true, |hosts| {
                hosts.contains(hostname)
                    || hostname
                        .split_once('.')
                        .is_some_and(|(_, parent)| hosts.contains(&format!("*.{}", parent)))
            })
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Drop the cached entry so the next handshake reloads from the store
    pub fn invalidate(&self, hostname: &str) {
        self.cache.remove(hostname);
    }

    /// Whether the store holds a certificate for `hostname` (no parsing)
    pub fn has_certificate(&self, hostname: &str) -> bool {
        self.config
            .candidate_dirs(hostname)
            .iter()
            .any(|dir| dir.join(FULLCHAIN).is_file() && dir.join(PRIVKEY).is_file())
    }

    pub fn is_pending(&self, hostname: &str) -> bool {
        self.pending.contains(hostname)
    }

    /// Start background issuance unless one is already running for `hostname`.
    /// Returns true if a task was spawned.
    pub fn request_issuance(&self, hostname: &str) -> bool {
        if hostname.parse::<IpAddr>().is_ok() || hostname == "localhost" {
            return false;
        }
        if !self.may_issue(hostname) {
            debug!(hostname, "Hostname not mapped, not requesting a certificate");
            return false;
        }
        if self.pending.contains(hostname) {
            return false;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return false;
        };

        // no waiting tasks: a busy issuer defers the hostname to a later handshake
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!(hostname, "Issuance slots busy, deferring");
                return false;
            }
        };
        if !self.pending.insert(hostname.to_string()) {
            return false;
        }

        let host = hostname.to_string();
        let issuer = Arc::clone(&self.issuer);
        let cache = Arc::clone(&self.cache);
        let pending = Arc::clone(&self.pending);

        handle.spawn(async move {
            let _permit = permit;
            info!(hostname = %host, "Requesting certificate");
            match issuer.ensure_certificate(&host).await {
                Ok(()) => {
                    cache.remove(&host);
                    info!(hostname = %host, "Certificate ready");
                }
                Err(e) => {
                    warn!(hostname = %host, error = %e, "Certificate issuance failed");
                }
            }
            pending.remove(&host);
        });

        true
    }

    /// Load `hostname` from the store. The flag is true when the
    /// certificate should be renewed.
    fn load_from_store(&self, hostname: &str) -> Result<Option<(Arc<CertifiedKey>, bool)>> {
        for dir in self.config.candidate_dirs(hostname) {
            let Some((certs, key)) = load_pair(&dir)? else {
                continue;
            };
            let needs_renewal = certs
                .first()
                .map(|cert| !is_cert_valid_for_days(cert, self.config.renew_before_days))
                .unwrap_or(true);
            let key = certified_key(certs, &key)?;
            debug!(hostname, dir = %dir.display(), "Loaded certificate from store");
            return Ok(Some((key, needs_renewal)));
        }
        Ok(None)
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let resolved = client_hello
            .server_name()
            .and_then(|name| CertResolver::resolve(self, name));
        Some(resolved.unwrap_or_else(|| self.default_key()))
    }
}

/// Read `fullchain.pem` and `privkey.pem` from `dir`, if both exist
pub fn load_pair(
    dir: &Path,
) -> Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>> {
    let cert_path = dir.join(FULLCHAIN);
    let key_path = dir.join(PRIVKEY);
    if !cert_path.is_file() || !key_path.is_file() {
        return Ok(None);
    }
    Ok(Some((load_certs(&cert_path)?, load_key(&key_path)?)))
}

/// Write a certificate pair into `<root>/<hostname>/`, key readable by owner only
pub fn save_pair(root: &Path, hostname: &str, cert_chain_pem: &str, private_key_pem: &str) -> Result<PathBuf> {
    let dir = root.join(hostname);
    std::fs::create_dir_all(&dir)?;

    let cert_path = dir.join(FULLCHAIN);
    let key_path = dir.join(PRIVKEY);

    // key first, so a visible fullchain always has its key
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&key_path)?;
        std::io::Write::write_all(&mut file, private_key_pem.as_bytes())?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(&key_path, private_key_pem)?;
    }

    std::fs::write(&cert_path, cert_chain_pem)?;

    info!(path = %cert_path.display(), "Certificate saved");
    Ok(dir)
}

pub fn is_cert_valid_for_days(cert: &CertificateDer<'_>, days: u64) -> bool {
    use x509_parser::prelude::*;

    let (_, parsed) = match X509Certificate::from_der(cert.as_ref()) {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Failed to parse X.509 certificate");
            return false;
        }
    };

    let expiry = parsed.validity().not_after.timestamp();
    let remaining_secs = expiry - chrono::Utc::now().timestamp();
    if remaining_secs < 0 {
        info!("Certificate has already expired");
        return false;
    }

    let remaining_days = remaining_secs as u64 / (24 * 60 * 60);
    if remaining_days < days {
        info!(
            remaining_days,
            required_days = days,
            "Certificate expires soon, renewal needed"
        );
        return false;
    }

    true
}

/// A freshly generated certificate in both DER and PEM form
pub struct GeneratedCert {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub cert_pem: String,
    pub key_pem: String,
}

impl GeneratedCert {
    pub fn certified_key(&self) -> Result<Arc<CertifiedKey>> {
        certified_key(self.certs.clone(), &self.key)
    }
}

/// Self-signed certificate for `hostnames` (first one is the CN), valid
/// from today for 365 days, ECDSA P-256 key
pub fn generate_self_signed_for(hostnames: &[&str]) -> Result<GeneratedCert> {
    let names: Vec<String> = hostnames.iter().map(|h| h.to_string()).collect();
    let common_name = names
        .first()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("At least one hostname is required"))?;

    let mut params = CertificateParams::new(names)?;
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, common_name);

    let today = chrono::Utc::now().date_naive();
    let until = today
        .checked_add_days(chrono::Days::new(365))
        .unwrap_or(today);
    params.not_before = rcgen::date_time_ymd(today.year(), today.month() as u8, today.day() as u8);
    params.not_after = rcgen::date_time_ymd(until.year(), until.month() as u8, until.day() as u8);

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
    let cert = params.self_signed(&key_pair)?;

    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;

    Ok(GeneratedCert {
        certs: vec![CertificateDer::from(cert.der().to_vec())],
        key,
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

pub fn generate_self_signed(hostname: &str) -> Result<GeneratedCert> {
    generate_self_signed_for(&[hostname])
}

/// Issuer that writes self-signed certificates into the store.
/// For development setups without a reachable ACME directory.
pub struct SelfSignedIssuer {
    cert_root: PathBuf,
}

impl SelfSignedIssuer {
    pub fn new(cert_root: impl Into<PathBuf>) -> Self {
        Self {
            cert_root: cert_root.into(),
        }
    }
}

#[async_trait]
impl CertificateIssuer for SelfSignedIssuer {
    async fn ensure_certificate(&self, hostname: &str) -> Result<()> {
        if load_pair(&self.cert_root.join(hostname))?.is_some() {
            return Ok(());
        }
        let generated = generate_self_signed(hostname)?;
        let root = self.cert_root.clone();
        let host = hostname.to_string();
        tokio::task::spawn_blocking(move || {
            save_pair(&root, &host, &generated.cert_pem, &generated.key_pem)
        })
        .await??;
        Ok(())
    }
}
