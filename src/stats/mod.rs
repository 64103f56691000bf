//! SQLite persistence for DNS activity statistics.
//!
//! Uses `rusqlite` with bundled SQLite. One store per statistics kind:
//! - Per-domain activity rows (`activity.rs`)
//! - Chart totals at flush granularity (`chart.rs`)
//! - DNS request log (`dns_log.rs`)
//!
//! The stores are shared with other processes; every connection sets a busy
//! timeout so a concurrently held write lock is waited out instead of
//! failing immediately. Tables are periodically compacted to bound growth.

pub mod activity;
pub mod chart;
pub mod dns_log;

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use dashmap::DashMap;
use rusqlite::Connection;

use crate::config;

pub use activity::{ActivityRecord, ActivityStore, DomainSummary};
pub use chart::{ChartRecord, ChartStore};
pub use dns_log::{DnsLogRecord, DnsLogStore};

/// Outcome of one resolved (or dropped) DNS request.
#[derive(Debug, Clone, Copy)]
pub struct RequestOutcome {
    pub answered: bool,
    pub encrypted: bool,
    pub blocked: bool,
    pub elapsed_ms: u64,
}

/// Sink for per-request activity. Implemented by the statistics subsystem;
/// the packet pump and the filtering layer only ever hold this interface.
pub trait ActivityRecorder: Send + Sync + 'static {
    fn record_request(&self, domain: &str, outcome: RequestOutcome);
}

/// Open a statistics connection with the shared pragmas applied.
fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(std::time::Duration::from_millis(
        config::STORE_BUSY_RETRY_WINDOW_MS,
    ))?;
    // WAL keeps readers unblocked while another process writes.
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(conn)
}

/// Current Unix timestamp in seconds.
pub fn unix_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

/// Running counters for one domain between flushes.
#[derive(Debug, Default, Clone, Copy)]
struct PendingCounters {
    requests: i64,
    encrypted: i64,
    blocked: i64,
    elapsed_ms: i64,
}

/// Buffers per-request outcomes in memory and flushes them to the three
/// stores on a fixed interval, running compaction checks as it goes.
pub struct StatsRecorder {
    activity: Arc<ActivityStore>,
    chart: Arc<ChartStore>,
    dns_log: Arc<DnsLogStore>,
    counters: DashMap<String, PendingCounters>,
    log_rows: Mutex<Vec<DnsLogRecord>>,
}

impl StatsRecorder {
    pub fn new(
        activity: Arc<ActivityStore>,
        chart: Arc<ChartStore>,
        dns_log: Arc<DnsLogStore>,
    ) -> Self {
        Self {
            activity,
            chart,
            dns_log,
            counters: DashMap::new(),
            log_rows: Mutex::new(Vec::new()),
        }
    }

    /// Write buffered counters out and compact any oversized table.
    pub fn flush(&self) -> Result<()> {
        let now = unix_timestamp();

        let domains: Vec<String> = self.counters.iter().map(|e| e.key().clone()).collect();
        let mut activity_rows = Vec::with_capacity(domains.len());
        let mut totals = PendingCounters::default();
        for domain in domains {
            if let Some((domain, c)) = self.counters.remove(&domain) {
                totals.requests += c.requests;
                totals.encrypted += c.encrypted;
                totals.blocked += c.blocked;
                totals.elapsed_ms += c.elapsed_ms;
                activity_rows.push(ActivityRecord {
                    timestamp: now,
                    domain,
                    request_count: c.requests,
                    encrypted_count: c.encrypted,
                    blocked_count: c.blocked,
                    elapsed_sum_ms: c.elapsed_ms,
                });
            }
        }

        if !activity_rows.is_empty() {
            self.activity.insert_batch(&activity_rows)?;
            self.chart.insert(&ChartRecord {
                timestamp: now,
                request_count: totals.requests,
                encrypted_count: totals.encrypted,
                blocked_count: totals.blocked,
                elapsed_sum_ms: totals.elapsed_ms,
            })?;
        }

        let log_rows: Vec<DnsLogRecord> = std::mem::take(&mut *self.log_rows.lock().unwrap());
        if !log_rows.is_empty() {
            self.dns_log.insert_batch(&log_rows)?;
        }

        self.activity.compress_table_if_needed()?;
        self.chart.compress_table_if_needed()?;
        self.dns_log.prune()?;
        Ok(())
    }

    /// Start a background thread that flushes on a fixed interval.
    pub fn start_flusher(self: &Arc<Self>, interval_secs: u64) {
        let recorder = Arc::clone(self);
        std::thread::Builder::new()
            .name("stats-flusher".into())
            .spawn(move || loop {
                std::thread::sleep(std::time::Duration::from_secs(interval_secs));
                if let Err(e) = recorder.flush() {
                    tracing::warn!("Failed to flush statistics: {e:#}");
                }
            })
            .expect("failed to spawn stats flusher thread");
    }
}

impl ActivityRecorder for StatsRecorder {
    fn record_request(&self, domain: &str, outcome: RequestOutcome) {
        let mut entry = self
            .counters
            .entry(domain.to_string())
            .or_insert_with(PendingCounters::default);
        entry.requests += 1;
        entry.encrypted += i64::from(outcome.encrypted);
        entry.blocked += i64::from(outcome.blocked);
        entry.elapsed_ms += outcome.elapsed_ms as i64;
        drop(entry);

        self.log_rows.lock().unwrap().push(DnsLogRecord {
            timestamp: unix_timestamp(),
            domain: domain.to_string(),
            answered: outcome.answered,
            blocked: outcome.blocked,
        });
    }
}
