//! SQLite persistence for traffic metrics

use crate::collab::MetricsStore;
use crate::metrics::MetricsSample;
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Totals for one listener, as stored
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TrafficTotals {
    pub proxy_id: i64,
    pub bytes_in: i64,
    pub bytes_out: i64,
    pub requests: i64,
    pub samples: i64,
}

/// Metrics store backed by a single SQLite connection
#[derive(Clone)]
pub struct SqliteMetricsStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMetricsStore {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).context("Failed to open metrics database")?;

        // WAL keeps readers out of the flusher's way
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;

        info!("Metrics database opened at {}", path.display());
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .context("Failed to open in-memory metrics database")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);
            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    fn migrate_v1(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS traffic_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                proxy_id INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                bytes_in INTEGER NOT NULL,
                bytes_out INTEGER NOT NULL,
                requests INTEGER NOT NULL,
                latency_ms INTEGER NOT NULL,
                status_code INTEGER NOT NULL,
                hostname TEXT,
                client_ip TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_traffic_metrics_proxy_time
                ON traffic_metrics(proxy_id, timestamp);
            INSERT INTO schema_migrations (version) VALUES (1);",
        )?;
        Ok(())
    }

    fn insert_blocking(&self, samples: &[MetricsSample]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO traffic_metrics
                    (proxy_id, timestamp, bytes_in, bytes_out, requests, latency_ms, status_code, hostname, client_ip)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for sample in samples {
                stmt.execute(params![
                    sample.proxy_id,
                    sample.timestamp.to_rfc3339(),
                    sample.bytes_in,
                    sample.bytes_out,
                    sample.requests,
                    sample.latency_ms,
                    sample.status_code,
                    sample.hostname,
                    sample.client_ip.map(|ip| ip.to_string()),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Number of stored samples
    pub fn count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row("SELECT COUNT(*) FROM traffic_metrics", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Summed traffic per listener
    pub fn totals(&self) -> Result<Vec<TrafficTotals>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT proxy_id, SUM(bytes_in), SUM(bytes_out), SUM(requests), COUNT(*)
             FROM traffic_metrics GROUP BY proxy_id ORDER BY proxy_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(TrafficTotals {
                proxy_id: row.get(0)?,
                bytes_in: row.get(1)?,
                bytes_out: row.get(2)?,
                requests: row.get(3)?,
                samples: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

#[async_trait]
impl MetricsStore for SqliteMetricsStore {
    async fn insert_batch(&self, samples: &[MetricsSample]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let store = self.clone();
        let samples = samples.to_vec();
        tokio::task::spawn_blocking(move || store.insert_blocking(&samples))
            .await
            .context("Metrics insert task panicked")?
    }
}
