//! Flow retention strategies
//!
//! The reconciliation store keeps its working set in memory and delegates
//! "how long do flows live" to a [`RetentionStrategy`]:
//!
//! - [`CappedRetention`]: session-scoped, bounded by flow count. Cheap and
//!   predictable in memory, nothing survives a restart.
//! - [`DurableRetention`]: every upsert is written through to SQLite and
//!   restored on open; flows older than a horizon are pruned. Survives
//!   restarts, costs a write per event.

use anyhow::Context;
use rusqlite::{params, Connection};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use crate::models::Flow;
use crate::storage::flow_store::FlowTable;

pub const DEFAULT_MAX_FLOWS: usize = 500;
pub const DEFAULT_HORIZON_DAYS: u32 = 7;
const SECONDS_PER_DAY: f64 = 24.0 * 60.0 * 60.0;

pub trait RetentionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Flows to seed the store with when it is opened
    fn restore(&self) -> anyhow::Result<Vec<Flow>> {
        Ok(Vec::new())
    }

    /// Called with the merged flow after every insert or patch
    fn record(&self, _flow: &Flow) -> anyhow::Result<()> {
        Ok(())
    }

    /// Ids to evict right after an ingest
    fn evict_after_ingest(&self, _table: &FlowTable) -> Vec<String> {
        Vec::new()
    }

    /// Ids to evict on an explicit prune at `now` (seconds since epoch)
    fn evict_on_prune(&self, _table: &FlowTable, _now: f64) -> Vec<String> {
        Vec::new()
    }

    /// Remove expired rows that are not in memory. Returns rows deleted.
    fn prune_storage(&self, _now: f64) -> anyhow::Result<u64> {
        Ok(0)
    }

    fn forget(&self, _ids: &[String]) -> anyhow::Result<()> {
        Ok(())
    }

    fn clear(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Keep at most `max_flows`, evicting the oldest by timestamp
pub struct CappedRetention {
    max_flows: usize,
}

impl CappedRetention {
    pub fn new(max_flows: usize) -> Self {
        Self {
            max_flows: max_flows.max(1),
        }
    }
}

impl Default for CappedRetention {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FLOWS)
    }
}

impl RetentionStrategy for CappedRetention {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    fn evict_after_ingest(&self, table: &FlowTable) -> Vec<String> {
        let excess = table.len().saturating_sub(self.max_flows);
        if excess == 0 {
            return Vec::new();
        }
        // Paused flows stay even when that leaves the table over the cap
        table
            .oldest_first()
            .into_iter()
            .filter(|flow| !flow.is_paused())
            .take(excess)
            .map(|flow| flow.id.clone())
            .collect()
    }
}

/// SQLite-backed retention pruned by age
pub struct DurableRetention {
    db: Mutex<Connection>,
    horizon_days: u32,
}

impl DurableRetention {
    pub fn open(base_path: &Path, horizon_days: u32) -> anyhow::Result<Self> {
        if !base_path.exists() {
            fs::create_dir_all(base_path)
                .with_context(|| format!("creating storage directory {:?}", base_path))?;
        }
        let db_path = base_path.join("frtmproxy_flows.sqlite");
        let conn = Connection::open(&db_path)
            .with_context(|| format!("opening database at {:?}", db_path))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS flows (
                id TEXT PRIMARY KEY,
                timestamp REAL,
                host TEXT,
                status INTEGER,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_flows_timestamp
                ON flows(timestamp DESC);
            ",
        )?;

        Ok(Self {
            db: Mutex::new(conn),
            horizon_days,
        })
    }

    fn cutoff(&self, now: f64) -> f64 {
        now - self.horizon_days as f64 * SECONDS_PER_DAY
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn count(&self) -> anyhow::Result<u64> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM flows", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}

impl RetentionStrategy for DurableRetention {
    fn name(&self) -> &'static str {
        "durable"
    }

    fn restore(&self) -> anyhow::Result<Vec<Flow>> {
        let cutoff = self.cutoff(crate::storage::now_seconds());
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, data FROM flows
             WHERE timestamp IS NULL OR timestamp >= ?1
             ORDER BY timestamp ASC",
        )?;
        let mut rows = stmt.query(params![cutoff])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let data: String = row.get(1)?;
            match serde_json::from_str::<Flow>(&data) {
                Ok(flow) => out.push(flow),
                Err(err) => tracing::warn!("Skipping undecodable stored flow {}: {}", id, err),
            }
        }
        Ok(out)
    }

    fn record(&self, flow: &Flow) -> anyhow::Result<()> {
        let payload = serde_json::to_string(flow)?;
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO flows (id, timestamp, host, status, data)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    flow.id,
                    flow.timestamp,
                    flow.host(),
                    flow.status().map(|s| s as i64),
                    payload
                ],
            )
            .context("inserting flow")?;
        Ok(())
    }

    fn evict_on_prune(&self, table: &FlowTable, now: f64) -> Vec<String> {
        let cutoff = self.cutoff(now);
        table
            .iter()
            .filter(|flow| !flow.is_paused() && flow.timestamp.is_some_and(|ts| ts < cutoff))
            .map(|flow| flow.id.clone())
            .collect()
    }

    fn prune_storage(&self, now: f64) -> anyhow::Result<u64> {
        let cutoff = self.cutoff(now);
        let conn = self.conn();
        let count = conn.execute("DELETE FROM flows WHERE timestamp < ?1", params![cutoff])?;
        if count > 0 {
            // Reclaim disk space after deleting rows
            conn.execute_batch("VACUUM")?;
        }
        Ok(count as u64)
    }

    fn forget(&self, ids: &[String]) -> anyhow::Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("DELETE FROM flows WHERE id = ?1")?;
            for id in ids {
                stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn clear(&self) -> anyhow::Result<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM flows", [])?;
        conn.execute_batch("VACUUM")?;
        Ok(())
    }
}
