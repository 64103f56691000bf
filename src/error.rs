//! Error taxonomy for the tunnel and filter subsystems.
//!
//! Two enums cover the two subsystems. Each variant maps to a distinct
//! failure domain; `kind()` returns the variant name so callers can
//! programmatically distinguish categories without matching exhaustively.

/// Errors surfaced by the tunnel controller and its components.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Applying tunnel network settings failed.
    #[error("settings negotiation failed: {0}")]
    Negotiation(String),

    /// The upstream resolver could not be started.
    #[error("resolver start failed: {0}")]
    ResolverStart(String),

    /// An operation requires a running tunnel session.
    #[error("tunnel is not running")]
    NotRunning,

    /// The user declined the VPN configuration install prompt.
    #[error("tunnel configuration install was cancelled")]
    Cancelled,
}

impl TunnelError {
    /// Returns the error kind as a string matching the variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            TunnelError::Negotiation(_) => "Negotiation",
            TunnelError::ResolverStart(_) => "ResolverStart",
            TunnelError::NotRunning => "NotRunning",
            TunnelError::Cancelled => "Cancelled",
        }
    }
}

/// Errors surfaced by the filter stores and sync engine.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    /// Less than the minimum refresh interval has passed; not a failure.
    #[error("last update check was too recent")]
    UpdatePeriod,

    /// The persistent store is temporarily locked by another process.
    #[error("store busy: {0}")]
    StoreBusy(String),

    /// Durable store failure (corrupt row, constraint violation, I/O).
    #[error("store error: {0}")]
    Store(String),

    /// A network fetch failed. Carries the filter id for per-filter
    /// fetches, which never abort the surrounding batch.
    #[error("fetch failed (filter {filter_id:?}): {reason}")]
    NetworkFetch {
        filter_id: Option<i64>,
        reason: String,
    },

    /// A custom filter request was malformed (bad id range, duplicate
    /// subscription URL).
    #[error("invalid custom filter: {0}")]
    InvalidCustomFilter(String),

    /// The remote catalog payload carried no download page for a filter.
    #[error("filter {0} has no download page")]
    MissingDownloadPage(i64),

    /// Raw rule text could not be read or written.
    #[error("content error: {0}")]
    Content(String),
}

impl FilterError {
    /// Returns the error kind as a string matching the variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            FilterError::UpdatePeriod => "UpdatePeriod",
            FilterError::StoreBusy(_) => "StoreBusy",
            FilterError::Store(_) => "Store",
            FilterError::NetworkFetch { .. } => "NetworkFetch",
            FilterError::InvalidCustomFilter(_) => "InvalidCustomFilter",
            FilterError::MissingDownloadPage(_) => "MissingDownloadPage",
            FilterError::Content(_) => "Content",
        }
    }

    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FilterError::StoreBusy(_) | FilterError::NetworkFetch { .. }
        )
    }
}

// ---- From implementations for ergonomic error conversion ----

impl From<rusqlite::Error> for FilterError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::DatabaseBusy
                    || e.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                FilterError::StoreBusy(err.to_string())
            }
            _ => FilterError::Store(err.to_string()),
        }
    }
}

impl From<std::io::Error> for FilterError {
    fn from(err: std::io::Error) -> Self {
        FilterError::Content(err.to_string())
    }
}
