//! Traffic metrics buffering.
//!
//! Handlers record one [`MetricsSample`] per unit of work into a bounded
//! in-memory buffer. A flush swaps the buffer out, persists it through the
//! [`MetricsStore`], broadcasts it to subscribers and evaluates traffic
//! alert thresholds.

use crate::alerting::{TrafficCounters, TrafficThresholds};
use crate::collab::{Alerting, MetricsStore};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

const MAX_COUNTER: u64 = i32::MAX as u64;

/// A flushed batch as seen by subscribers
pub type MetricsBatch = Arc<Vec<MetricsSample>>;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSample {
    pub proxy_id: i64,
    pub timestamp: DateTime<Utc>,
    pub bytes_in: u32,
    pub bytes_out: u32,
    pub requests: u16,
    pub latency_ms: u32,
    pub status_code: u16,
    pub hostname: Option<String>,
    pub client_ip: Option<IpAddr>,
}

impl MetricsSample {
    pub fn new(proxy_id: i64) -> Self {
        Self {
            proxy_id,
            timestamp: Utc::now(),
            bytes_in: 0,
            bytes_out: 0,
            requests: 0,
            latency_ms: 0,
            status_code: 0,
            hostname: None,
            client_ip: None,
        }
    }

    pub fn bytes(mut self, bytes_in: u64, bytes_out: u64) -> Self {
        self.bytes_in = bytes_in.min(MAX_COUNTER) as u32;
        self.bytes_out = bytes_out.min(MAX_COUNTER) as u32;
        self
    }

    pub fn requests(mut self, requests: u64) -> Self {
        self.requests = requests.min(u16::MAX as u64) as u16;
        self
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency_ms = (latency.as_millis()).min(MAX_COUNTER as u128) as u32;
        self
    }

    pub fn status(mut self, status_code: u16) -> Self {
        self.status_code = status_code.min(999);
        self
    }

    pub fn hostname(mut self, hostname: Option<&str>) -> Self {
        self.hostname = hostname.map(str::to_string);
        self
    }

    pub fn client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Buffered samples before new ones are dropped
    pub capacity: usize,
    pub flush_interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            capacity: 100_000,
            flush_interval: Duration::from_secs(5),
        }
    }
}

pub struct MetricsBuffer {
    config: MetricsConfig,
    buffer: Mutex<Vec<MetricsSample>>,
    store: Arc<dyn MetricsStore>,
    alerter: Arc<dyn Alerting>,
    thresholds: TrafficThresholds,
    counters: TrafficCounters,
    tx: broadcast::Sender<MetricsBatch>,
    dropped: AtomicU64,
    overflow_flush_pending: AtomicBool,
}

impl MetricsBuffer {
    pub fn new(
        config: MetricsConfig,
        store: Arc<dyn MetricsStore>,
        alerter: Arc<dyn Alerting>,
        thresholds: TrafficThresholds,
    ) -> Arc<Self> {
        let (tx, _) = broadcast::channel(64);
        Arc::new(Self {
            buffer: Mutex::new(Vec::with_capacity(config.capacity.min(4096))),
            config,
            store,
            alerter,
            thresholds,
            counters: TrafficCounters::default(),
            tx,
            dropped: AtomicU64::new(0),
            overflow_flush_pending: AtomicBool::new(false),
        })
    }

    /// Append a sample. When the buffer is full the sample is dropped and a
    /// flush is spawned.
    pub fn record(self: &Arc<Self>, sample: MetricsSample) {
        self.counters.observe(&sample);

        {
            let mut buffer = self.buffer.lock();
            if buffer.len() < self.config.capacity {
                buffer.push(sample);
                return;
            }
        }

        self.dropped.fetch_add(1, Ordering::Relaxed);
        if self.overflow_flush_pending.swap(true, Ordering::AcqRel) {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("Metrics buffer full, flushing early");
                let this = Arc::clone(self);
                handle.spawn(async move {
                    this.flush().await;
                });
            }
            Err(_) => {
                self.overflow_flush_pending.store(false, Ordering::Release);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Samples dropped because the buffer was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetricsBatch> {
        self.tx.subscribe()
    }

    /// Persist and broadcast everything buffered, then evaluate alerts.
    /// Returns the number of samples flushed.
    pub async fn flush(&self) -> usize {
        let batch = std::mem::take(&mut *self.buffer.lock());
        self.overflow_flush_pending.store(false, Ordering::Release);
        let count = batch.len();

        if count > 0 {
            if let Err(e) = self.store.insert_batch(&batch).await {
                warn!(error = %e, samples = count, "Failed to persist metrics batch");
            }
            // no subscribers is fine
            let _ = self.tx.send(Arc::new(batch));
            debug!(samples = count, "Metrics flushed");
        }

        let window = self.config.flush_interval;
        for alert in self.counters.evaluate(&self.thresholds, window) {
            warn!(
                scope = alert.scope.as_str(),
                key = %alert.key,
                metric = alert.metric.as_str(),
                value = alert.value,
                threshold = alert.threshold,
                "Traffic threshold breached"
            );
            if let Err(e) = self.alerter.traffic_threshold_breached(&alert).await {
                warn!(error = %e, "Failed to deliver traffic alert");
            }
        }

        count
    }

    /// Flush on a timer until shutdown, then flush once more
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.flush_interval.as_secs(),
            capacity = self.config.capacity,
            "Metrics flusher started"
        );

        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        let flushed = self.flush().await;
        info!(flushed, dropped = self.dropped(), "Metrics flusher stopped");
    }
}

/// Byte accounting for a long-lived stream.
///
/// Emits an interim sample at most once per `interval` while traffic flows
/// and a final sample with `requests = 1` when the stream ends.
pub struct Meter {
    metrics: Arc<MetricsBuffer>,
    proxy_id: i64,
    hostname: Option<String>,
    client_ip: Option<IpAddr>,
    started: Instant,
    interval: Duration,
    last_emit: Mutex<Instant>,
    pending_in: AtomicU64,
    pending_out: AtomicU64,
    total_in: AtomicU64,
    total_out: AtomicU64,
}

impl Meter {
    pub fn new(
        metrics: Arc<MetricsBuffer>,
        proxy_id: i64,
        hostname: Option<&str>,
        client_ip: Option<IpAddr>,
    ) -> Self {
        let now = Instant::now();
        Self {
            metrics,
            proxy_id,
            hostname: hostname.map(str::to_string),
            client_ip,
            started: now,
            interval: Duration::from_secs(1),
            last_emit: Mutex::new(now),
            pending_in: AtomicU64::new(0),
            pending_out: AtomicU64::new(0),
            total_in: AtomicU64::new(0),
            total_out: AtomicU64::new(0),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Client to backend bytes
    pub fn add_in(&self, n: u64) {
        self.pending_in.fetch_add(n, Ordering::Relaxed);
        self.total_in.fetch_add(n, Ordering::Relaxed);
        self.maybe_emit();
    }

    /// Backend to client bytes
    pub fn add_out(&self, n: u64) {
        self.pending_out.fetch_add(n, Ordering::Relaxed);
        self.total_out.fetch_add(n, Ordering::Relaxed);
        self.maybe_emit();
    }

    pub fn totals(&self) -> (u64, u64) {
        (
            self.total_in.load(Ordering::Relaxed),
            self.total_out.load(Ordering::Relaxed),
        )
    }

    fn sample(&self) -> MetricsSample {
        let bytes_in = self.pending_in.swap(0, Ordering::Relaxed);
        let bytes_out = self.pending_out.swap(0, Ordering::Relaxed);
        let mut sample = MetricsSample::new(self.proxy_id)
            .bytes(bytes_in, bytes_out)
            .hostname(self.hostname.as_deref());
        if let Some(ip) = self.client_ip {
            sample = sample.client_ip(ip);
        }
        sample
    }

    fn maybe_emit(&self) {
        {
            let mut last = self.last_emit.lock();
            if last.elapsed() < self.interval {
                return;
            }
            *last = Instant::now();
        }
        let sample = self.sample();
        self.metrics.record(sample);
    }

    /// Emit the closing sample
    pub fn finish(&self, status_code: u16) {
        let sample = self
            .sample()
            .requests(1)
            .latency(self.started.elapsed())
            .status(status_code);
        self.metrics.record(sample);
    }
}
