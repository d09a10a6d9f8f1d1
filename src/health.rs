//! Backend health tracking with circuit-breaker cooldowns.
//!
//! Records are keyed by (`host:port`, hostname). The empty hostname is the
//! host-scoped key shared by every virtual host of a backend. After
//! `failure_threshold` consecutive failures a key is down for `cooldown`,
//! then it is optimistically considered up again.

use dashmap::{DashMap, DashSet};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Health tracker configuration
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Consecutive failures before a key is marked down
    pub failure_threshold: u32,
    /// How long a key stays down
    pub cooldown: Duration,
    /// Interval between active probe rounds
    pub probe_interval: Duration,
    /// Timeout for each TCP connect probe
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

impl HealthConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HealthKey {
    target: String,
    hostname: String,
}

impl HealthKey {
    fn new(target: &str, hostname: Option<&str>) -> Self {
        Self {
            target: target.to_string(),
            hostname: hostname.unwrap_or_default().to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct HealthRecord {
    failure_count: u32,
    down_until: Option<Instant>,
}

impl HealthRecord {
    fn is_down(&self, now: Instant) -> bool {
        self.down_until.map(|until| until > now).unwrap_or(false)
    }
}

/// One record as reported by diagnostics
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthEntry {
    pub target: String,
    pub hostname: Option<String>,
    pub failure_count: u32,
    pub down: bool,
    /// Seconds left in the cooldown, when down
    pub retry_in_secs: Option<u64>,
}

pub struct HealthTracker {
    config: HealthConfig,
    records: DashMap<HealthKey, HealthRecord>,
    known: DashSet<String>,
}

impl HealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            records: DashMap::new(),
            known: DashSet::new(),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Add a target to the active probe set
    pub fn register(&self, target: &str) {
        if self.known.insert(target.to_string()) {
            debug!(target, "Tracking backend");
        }
    }

    /// Forget targets outside `keep`, along with their failure records
    pub fn retain_known(&self, keep: &HashSet<String>) {
        self.known.retain(|target| {
            let kept = keep.contains(target);
            if !kept {
                debug!(target = %target, "No longer tracking backend");
            }
            kept
        });
        self.records.retain(|key, _| keep.contains(&key.target));
    }

    pub fn known_targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.known.iter().map(|t| t.clone()).collect();
        targets.sort();
        targets
    }

    /// True if either the hostname-scoped or the host-scoped key is cooling down
    pub fn is_down(&self, target: &str, hostname: Option<&str>) -> bool {
        let now = Instant::now();
        let down = |key: &HealthKey| {
            self.records
                .get(key)
                .map(|r| r.is_down(now))
                .unwrap_or(false)
        };

        if down(&HealthKey::new(target, None)) {
            return true;
        }
        match hostname {
            Some(h) if !h.is_empty() => down(&HealthKey::new(target, Some(h))),
            _ => false,
        }
    }

    /// Count a failure. Returns true when this failure opened the cooldown.
    pub fn mark_failure(&self, target: &str, hostname: Option<&str>) -> bool {
        let now = Instant::now();
        let mut record = self
            .records
            .entry(HealthKey::new(target, hostname))
            .or_default();

        if record.is_down(now) {
            return false;
        }

        record.failure_count += 1;
        if record.failure_count >= self.config.failure_threshold {
            record.failure_count = 0;
            record.down_until = Some(now + self.config.cooldown);
            warn!(
                target,
                hostname = hostname.unwrap_or(""),
                cooldown_secs = self.config.cooldown.as_secs(),
                "Backend marked down"
            );
            return true;
        }

        debug!(
            target,
            hostname = hostname.unwrap_or(""),
            failures = record.failure_count,
            "Backend failure recorded"
        );
        false
    }

    /// Clear failures. With a hostname only that key is cleared; without one
    /// the host key and every hostname-scoped key of the target are cleared.
    pub fn mark_success(&self, target: &str, hostname: Option<&str>) {
        match hostname {
            Some(h) if !h.is_empty() => {
                if let Some(mut record) = self.records.get_mut(&HealthKey::new(target, Some(h))) {
                    *record = HealthRecord::default();
                }
            }
            _ => {
                let mut recovered = false;
                for mut entry in self.records.iter_mut() {
                    if entry.key().target == target {
                        recovered |= entry.value().down_until.is_some();
                        *entry.value_mut() = HealthRecord::default();
                    }
                }
                if recovered {
                    info!(target, "Backend recovered");
                }
            }
        }
    }

    /// All records, sorted by target then hostname
    pub fn snapshot(&self) -> Vec<HealthEntry> {
        let now = Instant::now();
        let mut entries: Vec<HealthEntry> = self
            .records
            .iter()
            .map(|entry| {
                let record = entry.value();
                let down = record.is_down(now);
                HealthEntry {
                    target: entry.key().target.clone(),
                    hostname: Some(entry.key().hostname.clone()).filter(|h| !h.is_empty()),
                    failure_count: record.failure_count,
                    down,
                    retry_in_secs: record
                        .down_until
                        .filter(|_| down)
                        .map(|until| until.saturating_duration_since(now).as_secs()),
                }
            })
            .collect();
        entries.sort_by(|a, b| (&a.target, &a.hostname).cmp(&(&b.target, &b.hostname)));
        entries
    }

    /// Probe one target with a TCP connect
    pub async fn probe(&self, target: &str) -> bool {
        let healthy = matches!(
            tokio::time::timeout(self.config.probe_timeout, TcpStream::connect(target)).await,
            Ok(Ok(_))
        );

        if healthy {
            self.mark_success(target, None);
        } else {
            debug!(target, "Health probe failed");
            self.mark_failure(target, None);
        }
        healthy
    }

    /// Probe every known target once
    pub async fn probe_all(&self) {
        let targets = self.known_targets();
        let probes = targets.iter().map(|t| self.probe(t));
        futures::future::join_all(probes).await;
    }

    /// Run the active probe loop until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.probe_interval.as_secs(),
            "Health prober started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.probe_interval) => {
                    self.probe_all().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Health prober shutting down");
                        break;
                    }
                }
            }
        }
    }
}
