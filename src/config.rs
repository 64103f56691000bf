//! Centralized runtime constants for dnsguard.
//!
//! All tunable intervals, thresholds, and reserved ids are collected here so
//! they can be found and adjusted in a single place rather than scattered
//! across modules.

/// Minimum interval between non-forced filter metadata refreshes (seconds).
pub const UPDATE_CHECK_PERIOD_SECS: i64 = 6 * 3600;

/// Fixed delay between applying empty tunnel settings and re-reading the
/// system DNS servers (milliseconds). The OS reports an empty server list
/// for a short window after settings change.
pub const DNS_SETTLE_DELAY_MS: u64 = 1000;

/// Total window for retrying a temporarily busy metadata store before the
/// busy condition is surfaced to the caller (milliseconds).
pub const STORE_BUSY_RETRY_WINDOW_MS: u64 = 1000;

/// Pause between attempts within the busy-retry window (milliseconds).
pub const STORE_BUSY_RETRY_STEP_MS: u64 = 50;

/// Timeout for a single upstream DNS exchange (seconds).
pub const DNS_QUERY_TIMEOUT_SECS: u64 = 5;

/// First id handed out to user-subscribed custom filters. Catalog filter ids
/// always stay below this value.
pub const CUSTOM_FILTER_BASE_ID: i64 = 1_000_000;

/// Id of the reserved group that owns all custom filters.
pub const CUSTOM_GROUP_ID: i64 = 101;

/// Catalog filter ids that are never installed, regardless of what the
/// remote metadata payload advertises. Already-installed copies are left
/// untouched.
pub const DENYLISTED_FILTER_IDS: &[i64] = &[208, 209, 210];

/// DNS servers used when neither the user configuration nor the system
/// reports any usable upstream.
pub const BUILTIN_DNS_SERVERS: &[&str] = &["94.140.14.140", "94.140.14.141"];

/// IPv4 address the local DNS proxy claims inside the tunnel.
pub const LOCAL_PROXY_IPV4: &str = "198.18.0.1";

/// IPv6 address the local DNS proxy claims inside the tunnel.
pub const LOCAL_PROXY_IPV6: &str = "fd12:1:1:1::1";

/// Row count above which a chart statistics table is compacted.
pub const CHART_COMPRESS_THRESHOLD_ROWS: i64 = 1000;

/// Row count above which the activity statistics table is compacted.
pub const ACTIVITY_COMPRESS_THRESHOLD_ROWS: i64 = 1500;

/// Number of time buckets a compacted statistics table is reduced to.
pub const COMPRESS_TARGET_BUCKETS: i64 = 100;

/// Maximum number of rows kept in the DNS request log.
pub const DNS_LOG_MAX_ROWS: i64 = 5000;

/// Maximum age of DNS request log rows before they are pruned (days).
pub const DNS_LOG_MAX_AGE_DAYS: i64 = 7;
