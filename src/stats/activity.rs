//! Per-domain activity table.

use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::config;

/// One per-domain activity row.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityRecord {
    pub timestamp: i64,
    pub domain: String,
    pub request_count: i64,
    pub encrypted_count: i64,
    pub blocked_count: i64,
    pub elapsed_sum_ms: i64,
}

/// Totals for one domain over a time window.
#[derive(Debug, Clone, Serialize)]
pub struct DomainSummary {
    pub domain: String,
    pub total_requests: i64,
    pub total_blocked: i64,
}

/// Append-only per-domain activity store, compacted once it outgrows its
/// row threshold.
pub struct ActivityStore {
    conn: Mutex<Connection>,
}

impl ActivityStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::init(super::open_connection(path)?)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS activity (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                domain TEXT NOT NULL,
                request_count INTEGER NOT NULL DEFAULT 0,
                encrypted_count INTEGER NOT NULL DEFAULT 0,
                blocked_count INTEGER NOT NULL DEFAULT 0,
                elapsed_sum_ms INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_activity_timestamp ON activity(timestamp);
            CREATE INDEX IF NOT EXISTS idx_activity_domain ON activity(domain);
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a batch of flushed activity rows.
    pub fn insert_batch(&self, records: &[ActivityRecord]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO activity (timestamp, domain, request_count, encrypted_count, blocked_count, elapsed_sum_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for r in records {
            stmt.execute(params![
                r.timestamp,
                r.domain,
                r.request_count,
                r.encrypted_count,
                r.blocked_count,
                r.elapsed_sum_ms,
            ])?;
        }
        Ok(())
    }

    /// Query activity rows within a time range.
    pub fn query_range(&self, from_timestamp: i64, to_timestamp: i64) -> Result<Vec<ActivityRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT timestamp, domain, request_count, encrypted_count, blocked_count, elapsed_sum_ms
             FROM activity
             WHERE timestamp >= ?1 AND timestamp <= ?2
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![from_timestamp, to_timestamp], |row| {
            Ok(ActivityRecord {
                timestamp: row.get(0)?,
                domain: row.get(1)?,
                request_count: row.get(2)?,
                encrypted_count: row.get(3)?,
                blocked_count: row.get(4)?,
                elapsed_sum_ms: row.get(5)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Most requested domains over a time window.
    pub fn top_domains(
        &self,
        from_timestamp: i64,
        to_timestamp: i64,
        limit: usize,
    ) -> Result<Vec<DomainSummary>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT domain, SUM(request_count) AS total_requests, SUM(blocked_count) AS total_blocked
             FROM activity
             WHERE timestamp >= ?1 AND timestamp <= ?2
             GROUP BY domain
             ORDER BY total_requests DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![from_timestamp, to_timestamp, limit], |row| {
            Ok(DomainSummary {
                domain: row.get(0)?,
                total_requests: row.get(1)?,
                total_blocked: row.get(2)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Re-bucket the table into at most `COMPRESS_TARGET_BUCKETS` uniform
    /// time intervals once it exceeds its row threshold, summing counters
    /// per (bucket, domain). Returns whether a compaction ran.
    pub fn compress_table_if_needed(&self) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let rows: i64 = conn.query_row("SELECT COUNT(*) FROM activity", [], |r| r.get(0))?;
        if rows <= config::ACTIVITY_COMPRESS_THRESHOLD_ROWS {
            return Ok(false);
        }

        let (min_ts, max_ts): (i64, i64) = conn.query_row(
            "SELECT MIN(timestamp), MAX(timestamp) FROM activity",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        let width = bucket_width(min_ts, max_ts);

        let tx = conn.transaction()?;
        tx.execute_batch(&format!(
            "
            CREATE TEMP TABLE activity_compact AS
                SELECT {min_ts} + (((timestamp - {min_ts}) / {width}) * {width}) AS timestamp,
                       domain,
                       SUM(request_count) AS request_count,
                       SUM(encrypted_count) AS encrypted_count,
                       SUM(blocked_count) AS blocked_count,
                       SUM(elapsed_sum_ms) AS elapsed_sum_ms
                FROM activity
                GROUP BY (timestamp - {min_ts}) / {width}, domain;
            DELETE FROM activity;
            INSERT INTO activity (timestamp, domain, request_count, encrypted_count, blocked_count, elapsed_sum_ms)
                SELECT timestamp, domain, request_count, encrypted_count, blocked_count, elapsed_sum_ms
                FROM activity_compact;
            DROP TABLE activity_compact;
            ",
        ))?;
        tx.commit()?;

        tracing::info!("Compacted activity table from {rows} rows");
        Ok(true)
    }
}

/// Width that maps the `[min_ts, max_ts]` span onto the target bucket count.
pub(crate) fn bucket_width(min_ts: i64, max_ts: i64) -> i64 {
    let span = (max_ts - min_ts).max(0) + 1;
    (span + config::COMPRESS_TARGET_BUCKETS - 1) / config::COMPRESS_TARGET_BUCKETS
}
