//! Chart totals table: one row of summed counters per flush interval.

use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::config;

use super::activity::bucket_width;

/// One chart row: request totals at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct ChartRecord {
    pub timestamp: i64,
    pub request_count: i64,
    pub encrypted_count: i64,
    pub blocked_count: i64,
    pub elapsed_sum_ms: i64,
}

/// Append-only totals store backing the activity chart.
pub struct ChartStore {
    conn: Mutex<Connection>,
}

impl ChartStore {
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
            CREATE TABLE IF NOT EXISTS chart (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                request_count INTEGER NOT NULL DEFAULT 0,
                encrypted_count INTEGER NOT NULL DEFAULT 0,
                blocked_count INTEGER NOT NULL DEFAULT 0,
                elapsed_sum_ms INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_chart_timestamp ON chart(timestamp);
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn insert(&self, record: &ChartRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.prepare_cached(
            "INSERT INTO chart (timestamp, request_count, encrypted_count, blocked_count, elapsed_sum_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?
        .execute(params![
            record.timestamp,
            record.request_count,
            record.encrypted_count,
            record.blocked_count,
            record.elapsed_sum_ms,
        ])?;
        Ok(())
    }

    pub fn query_range(&self, from_timestamp: i64, to_timestamp: i64) -> Result<Vec<ChartRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT timestamp, request_count, encrypted_count, blocked_count, elapsed_sum_ms
             FROM chart
             WHERE timestamp >= ?1 AND timestamp <= ?2
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![from_timestamp, to_timestamp], |row| {
            Ok(ChartRecord {
                timestamp: row.get(0)?,
                request_count: row.get(1)?,
                encrypted_count: row.get(2)?,
                blocked_count: row.get(3)?,
                elapsed_sum_ms: row.get(4)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Summed counters over a time window.
    pub fn totals(&self, from_timestamp: i64, to_timestamp: i64) -> Result<ChartRecord> {
        let conn = self.conn.lock().unwrap();
        let record = conn.query_row(
            "SELECT COALESCE(SUM(request_count), 0),
                    COALESCE(SUM(encrypted_count), 0),
                    COALESCE(SUM(blocked_count), 0),
                    COALESCE(SUM(elapsed_sum_ms), 0)
             FROM chart
             WHERE timestamp >= ?1 AND timestamp <= ?2",
            params![from_timestamp, to_timestamp],
            |row| {
                Ok(ChartRecord {
                    timestamp: to_timestamp,
                    request_count: row.get(0)?,
                    encrypted_count: row.get(1)?,
                    blocked_count: row.get(2)?,
                    elapsed_sum_ms: row.get(3)?,
                })
            },
        )?;
        Ok(record)
    }

    /// Re-bucket the table into at most `COMPRESS_TARGET_BUCKETS` uniform
    /// time intervals once it exceeds its row threshold, preserving summed
    /// counters within each bucket. Returns whether a compaction ran.
    pub fn compress_table_if_needed(&self) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let rows: i64 = conn.query_row("SELECT COUNT(*) FROM chart", [], |r| r.get(0))?;
        if rows <= config::CHART_COMPRESS_THRESHOLD_ROWS {
            return Ok(false);
        }

        let (min_ts, max_ts): (i64, i64) = conn.query_row(
            "SELECT MIN(timestamp), MAX(timestamp) FROM chart",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        let width = bucket_width(min_ts, max_ts);

        let tx = conn.transaction()?;
        tx.execute_batch(&format!(
            "
            CREATE TEMP TABLE chart_compact AS
                SELECT {min_ts} + (((timestamp - {min_ts}) / {width}) * {width}) AS timestamp,
                       SUM(request_count) AS request_count,
                       SUM(encrypted_count) AS encrypted_count,
                       SUM(blocked_count) AS blocked_count,
                       SUM(elapsed_sum_ms) AS elapsed_sum_ms
                FROM chart
                GROUP BY (timestamp - {min_ts}) / {width};
            DELETE FROM chart;
            INSERT INTO chart (timestamp, request_count, encrypted_count, blocked_count, elapsed_sum_ms)
                SELECT timestamp, request_count, encrypted_count, blocked_count, elapsed_sum_ms
                FROM chart_compact;
            DROP TABLE chart_compact;
            ",
        ))?;
        tx.commit()?;

        tracing::info!("Compacted chart table from {rows} rows");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::memory_chart;
    use super::*;

    fn record(timestamp: i64, requests: i64) -> ChartRecord {
        ChartRecord {
            timestamp,
            request_count: requests,
            encrypted_count: requests / 2,
            blocked_count: requests / 4,
            elapsed_sum_ms: requests * 3,
        }
    }

    #[test]
    fn test_insert_query_and_totals() {
        let store = memory_chart();
        store.insert(&record(1000, 8)).unwrap();
        store.insert(&record(2000, 4)).unwrap();

        let rows = store.query_range(0, 3000).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].timestamp, 1000);

        let totals = store.totals(0, 3000).unwrap();
        assert_eq!(totals.request_count, 12);
        assert_eq!(totals.encrypted_count, 6);
        assert_eq!(totals.blocked_count, 3);
    }

    #[test]
    fn test_totals_over_empty_window_are_zero() {
        let store = memory_chart();
        let totals = store.totals(0, 1000).unwrap();
        assert_eq!(totals.request_count, 0);
    }

    #[test]
    fn test_thousand_rows_compact_to_target_buckets() {
        let store = memory_chart();
        for i in 0..1200 {
            store.insert(&record(i * 5, 2)).unwrap();
        }

        let before = store.totals(0, i64::MAX).unwrap();
        assert!(store.compress_table_if_needed().unwrap());

        let rows = store.query_range(0, i64::MAX).unwrap();
        assert!(rows.len() <= config::COMPRESS_TARGET_BUCKETS as usize);

        // Summed counters survive compaction.
        let after = store.totals(0, i64::MAX).unwrap();
        assert_eq!(after.request_count, before.request_count);
        assert_eq!(after.encrypted_count, before.encrypted_count);
        assert_eq!(after.blocked_count, before.blocked_count);
        assert_eq!(after.elapsed_sum_ms, before.elapsed_sum_ms);
    }

    #[test]
    fn test_compaction_keeps_rows_within_original_span() {
        let store = memory_chart();
        for i in 0..1100 {
            store.insert(&record(10_000 + i, 1)).unwrap();
        }
        store.compress_table_if_needed().unwrap();

        let rows = store.query_range(0, i64::MAX).unwrap();
        assert!(rows.iter().all(|r| r.timestamp >= 10_000));
        assert!(rows.iter().all(|r| r.timestamp <= 10_000 + 1100));
    }
}
