//! dnsguard: DNS tunneling proxy core and filter-list synchronization.
//!
//! Two subsystems, wired together by the embedding host:
//! - [`tunnel`]: a controller that negotiates tunnel settings, pumps
//!   intercepted packets through configurable DNS upstreams, and restarts
//!   cleanly on network changes.
//! - [`filters`]: a synchronization engine over a SQLite metadata store and
//!   a file-per-filter content store, publishing an immutable group/filter
//!   snapshot to readers.
//!
//! [`stats`] carries the time-series stores both subsystems report into.

pub mod config;
pub mod error;
pub mod filters;
pub mod stats;
pub mod tunnel;

pub use error::{FilterError, TunnelError};
pub use filters::{FilterSyncEngine, UpdateSummary};
pub use tunnel::{
    ProtocolFamily, SystemDnsProvider, TunnelConfig, TunnelController, TunnelHost, TunnelState,
};

/// Install the default tracing subscriber. Hosts with their own subscriber
/// simply skip this.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dnsguard=info".into()),
        )
        .try_init();
}
