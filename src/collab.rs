//! Interfaces to the systems around the data plane.
//!
//! The engine consumes these through trait objects held by the
//! [`EngineContext`](crate::engine::EngineContext). [`Noop`] implements all
//! of them for embedding and tests; concrete implementations live next to
//! the concern they serve (TOML file store in `config`, ACME issuer in
//! `acme`, SQLite metrics store in `db`, alerters in `alerting`).

use crate::alerting::TrafficAlert;
use crate::listener::{ListenerRecord, VHostMapping};
use crate::metrics::MetricsSample;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;

/// Source of listener configuration
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn list_enabled_listeners(&self) -> Result<Vec<ListenerRecord>>;
    async fn list_vhost_mappings(&self) -> Result<Vec<VHostMapping>>;
}

/// Obtains certificates and writes them to the certificate store.
/// Must be idempotent; concurrent calls for one hostname are deduplicated
/// by the caller.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn ensure_certificate(&self, hostname: &str) -> Result<()>;
}

#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn insert_batch(&self, samples: &[MetricsSample]) -> Result<()>;
}

/// Client address reputation. Consulted on the accept path, so it is sync.
pub trait IpReputation: Send + Sync {
    fn is_blocked(&self, ip: IpAddr) -> bool;
    fn is_trusted(&self, ip: IpAddr) -> bool;

    /// Blocked and not explicitly trusted
    fn should_reject(&self, ip: IpAddr) -> bool {
        self.is_blocked(ip) && !self.is_trusted(ip)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeDecision {
    Pass,
    Challenge,
    Banned,
}

#[async_trait]
pub trait BotChallenge: Send + Sync {
    async fn should_challenge(&self, ip: IpAddr, domain: &str, user_agent: &str) -> ChallengeDecision;

    /// Challenge code to embed in the challenge page
    async fn get_or_create_challenge(&self, ip: IpAddr, domain: &str) -> Result<String>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceStatus {
    pub enabled: bool,
    /// HTML page to serve instead of the built-in one
    pub page_path: Option<PathBuf>,
}

#[async_trait]
pub trait MaintenanceMode: Send + Sync {
    async fn status(&self, hostname: &str) -> MaintenanceStatus;
}

#[async_trait]
pub trait Alerting: Send + Sync {
    async fn traffic_threshold_breached(&self, alert: &TrafficAlert) -> Result<()>;
}

/// Does nothing, allows everything
#[derive(Debug, Clone, Copy, Default)]
pub struct Noop;

#[async_trait]
impl ConfigStore for Noop {
    async fn list_enabled_listeners(&self) -> Result<Vec<ListenerRecord>> {
        Ok(Vec::new())
    }

    async fn list_vhost_mappings(&self) -> Result<Vec<VHostMapping>> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl CertificateIssuer for Noop {
    async fn ensure_certificate(&self, _hostname: &str) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl MetricsStore for Noop {
    async fn insert_batch(&self, _samples: &[MetricsSample]) -> Result<()> {
        Ok(())
    }
}

impl IpReputation for Noop {
    fn is_blocked(&self, _ip: IpAddr) -> bool {
        false
    }

    fn is_trusted(&self, _ip: IpAddr) -> bool {
        false
    }
}

#[async_trait]
impl BotChallenge for Noop {
    async fn should_challenge(&self, _ip: IpAddr, _domain: &str, _user_agent: &str) -> ChallengeDecision {
        ChallengeDecision::Pass
    }

    async fn get_or_create_challenge(&self, _ip: IpAddr, _domain: &str) -> Result<String> {
        Ok(String::new())
    }
}

#[async_trait]
impl MaintenanceMode for Noop {
    async fn status(&self, _hostname: &str) -> MaintenanceStatus {
        MaintenanceStatus::default()
    }
}

#[async_trait]
impl Alerting for Noop {
    async fn traffic_threshold_breached(&self, _alert: &TrafficAlert) -> Result<()> {
        Ok(())
    }
}

/// Fixed block and trust lists
#[derive(Debug, Clone, Default)]
pub struct StaticIpReputation {
    blocked: HashSet<IpAddr>,
    trusted: HashSet<IpAddr>,
}

impl StaticIpReputation {
    pub fn new(
        blocked: impl IntoIterator<Item = IpAddr>,
        trusted: impl IntoIterator<Item = IpAddr>,
    ) -> Self {
        Self {
            blocked: blocked.into_iter().collect(),
            trusted: trusted.into_iter().collect(),
        }
    }
}

impl IpReputation for StaticIpReputation {
    fn is_blocked(&self, ip: IpAddr) -> bool {
        self.blocked.contains(&canonical(ip))
    }

    fn is_trusted(&self, ip: IpAddr) -> bool {
        self.trusted.contains(&canonical(ip))
    }
}

/// IPv4-mapped IPv6 peers are matched against IPv4 entries
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

/// Maintenance flags keyed by hostname
#[derive(Debug, Clone, Default)]
pub struct StaticMaintenance {
    sites: HashMap<String, MaintenanceStatus>,
}

impl StaticMaintenance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_site(mut self, hostname: &str, page_path: Option<PathBuf>) -> Self {
        self.sites.insert(
            hostname.to_ascii_lowercase(),
            MaintenanceStatus {
                enabled: true,
                page_path,
            },
        );
        self
    }
}

#[async_trait]
impl MaintenanceMode for StaticMaintenance {
    async fn status(&self, hostname: &str) -> MaintenanceStatus {
        self.sites.get(hostname).cloned().unwrap_or_default()
    }
}
