//! DNS request log table.
//!
//! A rolling log of individual requests, pruned by age and row cap rather
//! than compacted — old entries lose their value entirely.

use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::config;

/// One logged DNS request.
#[derive(Debug, Clone, Serialize)]
pub struct DnsLogRecord {
    pub timestamp: i64,
    pub domain: String,
    pub answered: bool,
    pub blocked: bool,
}

pub struct DnsLogStore {
    conn: Mutex<Connection>,
}

impl DnsLogStore {
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
            CREATE TABLE IF NOT EXISTS dns_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                domain TEXT NOT NULL,
                answered INTEGER NOT NULL DEFAULT 0,
                blocked INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_dns_log_timestamp ON dns_log(timestamp);
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn insert_batch(&self, records: &[DnsLogRecord]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO dns_log (timestamp, domain, answered, blocked) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for r in records {
            stmt.execute(params![
                r.timestamp,
                r.domain,
                r.answered as i32,
                r.blocked as i32
            ])?;
        }
        Ok(())
    }

    /// Most recent log entries, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<DnsLogRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT timestamp, domain, answered, blocked
             FROM dns_log
             ORDER BY id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(DnsLogRecord {
                timestamp: row.get(0)?,
                domain: row.get(1)?,
                answered: row.get::<_, i32>(2)? != 0,
                blocked: row.get::<_, i32>(3)? != 0,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Delete rows past the age limit, then oldest rows past the row cap.
    pub fn prune(&self) -> Result<usize> {
        let cutoff = super::unix_timestamp() - config::DNS_LOG_MAX_AGE_DAYS * 86400;
        let conn = self.conn.lock().unwrap();
        let mut deleted = conn.execute(
            "DELETE FROM dns_log WHERE timestamp < ?1",
            params![cutoff],
        )?;
        deleted += conn.execute(
            "DELETE FROM dns_log WHERE id NOT IN (
                 SELECT id FROM dns_log ORDER BY id DESC LIMIT ?1
             )",
            params![config::DNS_LOG_MAX_ROWS],
        )?;
        if deleted > 0 {
            tracing::debug!("Pruned {deleted} DNS log rows");
        }
        Ok(deleted)
    }
}
