//! Traffic threshold alerting.
//!
//! The metrics buffer feeds every sample into [`TrafficCounters`]. On each
//! flush the counters are compared with the configured per-IP and
//! per-domain thresholds, breaches become [`TrafficAlert`]s for the
//! [`Alerting`] collaborator, and the counters start over.

use crate::collab::Alerting;
use crate::metrics::MetricsSample;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, warn};

/// Supported metric types for traffic alerts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    /// Bytes in both directions within one window
    Bytes,
    /// Completed requests or connections within one window
    Requests,
}

impl MetricType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "bytes" => Some(MetricType::Bytes),
            "requests" => Some(MetricType::Requests),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Bytes => "bytes",
            MetricType::Requests => "requests",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            MetricType::Bytes => "Traffic Volume",
            MetricType::Requests => "Request Count",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            MetricType::Bytes => "bytes",
            MetricType::Requests => "req",
        }
    }
}

/// What a counter is keyed by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Ip,
    Domain,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Ip => "ip",
            Scope::Domain => "domain",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TrafficAlert {
    pub scope: Scope,
    /// The client IP or hostname
    pub key: String,
    pub metric: MetricType,
    pub value: u64,
    pub threshold: u64,
    pub window_secs: u64,
    pub timestamp: DateTime<Utc>,
}

impl TrafficAlert {
    pub fn summary(&self) -> String {
        format!(
            "{} for {} {} is {} {} (threshold {} {} per {}s)",
            self.metric.display_name(),
            self.scope.as_str(),
            self.key,
            self.value,
            self.metric.unit(),
            self.threshold,
            self.metric.unit(),
            self.window_secs
        )
    }
}

/// Per-window limits. `None` disables a check.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct TrafficThresholds {
    #[serde(default)]
    pub per_ip_bytes: Option<u64>,
    #[serde(default)]
    pub per_ip_requests: Option<u64>,
    #[serde(default)]
    pub per_domain_bytes: Option<u64>,
    #[serde(default)]
    pub per_domain_requests: Option<u64>,
}

impl TrafficThresholds {
    pub fn is_empty(&self) -> bool {
        self.per_ip_bytes.is_none()
            && self.per_ip_requests.is_none()
            && self.per_domain_bytes.is_none()
            && self.per_domain_requests.is_none()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Counter {
    pub bytes: u64,
    pub requests: u64,
}

impl Counter {
    fn add(&mut self, sample: &MetricsSample) {
        self.bytes = self
            .bytes
            .saturating_add(sample.bytes_in as u64 + sample.bytes_out as u64);
        self.requests = self.requests.saturating_add(sample.requests as u64);
    }
}

#[derive(Default)]
pub struct TrafficCounters {
    by_ip: DashMap<IpAddr, Counter>,
    by_domain: DashMap<String, Counter>,
}

impl TrafficCounters {
    pub fn observe(&self, sample: &MetricsSample) {
        if let Some(ip) = sample.client_ip {
            self.by_ip.entry(ip).or_default().add(sample);
        }
        if let Some(hostname) = &sample.hostname {
            self.by_domain.entry(hostname.clone()).or_default().add(sample);
        }
    }

    pub fn ip(&self, ip: &IpAddr) -> Counter {
        self.by_ip.get(ip).map(|c| *c).unwrap_or_default()
    }

    pub fn domain(&self, hostname: &str) -> Counter {
        self.by_domain.get(hostname).map(|c| *c).unwrap_or_default()
    }

    /// Compare the window's counters against `thresholds` and reset them
    pub fn evaluate(&self, thresholds: &TrafficThresholds, window: Duration) -> Vec<TrafficAlert> {
        let now = Utc::now();
        let window_secs = window.as_secs();
        let mut alerts = Vec::new();

        let mut check = |scope: Scope, key: String, counter: Counter, bytes: Option<u64>, requests: Option<u64>| {
            for (metric, value, limit) in [
                (MetricType::Bytes, counter.bytes, bytes),
                (MetricType::Requests, counter.requests, requests),
            ] {
                if let Some(threshold) = limit {
                    if value > threshold {
                        alerts.push(TrafficAlert {
                            scope,
                            key: key.clone(),
                            metric,
                            value,
                            threshold,
                            window_secs,
                            timestamp: now,
                        });
                    }
                }
            }
        };

        let ips: Vec<(IpAddr, Counter)> = self.by_ip.iter().map(|e| (*e.key(), *e.value())).collect();
        self.by_ip.clear();
        for (ip, counter) in ips {
            check(Scope::Ip, ip.to_string(), counter, thresholds.per_ip_bytes, thresholds.per_ip_requests);
        }

        let domains: Vec<(String, Counter)> = self
            .by_domain
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        self.by_domain.clear();
        for (domain, counter) in domains {
            check(
                Scope::Domain,
                domain,
                counter,
                thresholds.per_domain_bytes,
                thresholds.per_domain_requests,
            );
        }

        alerts
    }
}

/// Writes alerts to the log only
pub struct LogAlerter;

#[async_trait]
impl Alerting for LogAlerter {
    async fn traffic_threshold_breached(&self, alert: &TrafficAlert) -> Result<()> {
        warn!(alert = %alert.summary(), "Traffic alert");
        Ok(())
    }
}

/// POSTs each alert as JSON to a webhook URL
pub struct WebhookAlerter {
    http_client: reqwest::Client,
    url: String,
}

impl WebhookAlerter {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http_client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Alerting for WebhookAlerter {
    async fn traffic_threshold_breached(&self, alert: &TrafficAlert) -> Result<()> {
        let payload = serde_json::json!({
            "event": "traffic_threshold_breached",
            "summary": alert.summary(),
            "alert": alert,
        });

        let response = self.http_client.post(&self.url).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Webhook returned status {}", status);
        }

        debug!(url = %self.url, key = %alert.key, "Traffic alert delivered");
        Ok(())
    }
}
