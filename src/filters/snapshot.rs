//! Immutable Group/Filter snapshot and its publisher.
//!
//! The snapshot is rebuilt wholesale from the metadata store after every
//! mutation and published with a single atomic pointer swap: readers never
//! block and never observe a half-built state. `ArcSwap` carries the hot
//! pointer; a `watch` channel notifies subscribers of each new generation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::watch;

/// A tag attached to a filter (`{id, type}` pairs from the catalog).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterTag {
    pub id: i64,
    pub tag_type: String,
}

/// One rule list.
#[derive(Debug, Clone, Serialize)]
pub struct Filter {
    pub id: i64,
    pub group_id: i64,
    pub is_enabled: bool,
    pub version: String,
    pub display_number: i64,
    pub name: String,
    pub description: String,
    pub home_page: String,
    /// Present for custom filters only.
    pub subscription_url: Option<String>,
    pub languages: Vec<String>,
    pub tags: Vec<FilterTag>,
    /// Refreshed asynchronously after snapshot rebuilds; `None` until the
    /// first count completes.
    pub rules_count: Option<u64>,
    pub is_custom: bool,
}

/// Category of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GroupType {
    Predefined,
    Custom,
}

/// A named category of filters.
#[derive(Debug, Clone, Serialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub group_type: GroupType,
    pub is_enabled: bool,
    pub filters: Vec<Filter>,
}

/// The immutable view published to readers.
#[derive(Debug, Clone, Serialize)]
pub struct FilterSnapshot {
    /// Increments on every rebuild; all groups in one snapshot share it.
    pub generation: u64,
    pub groups: Vec<Group>,
}

impl FilterSnapshot {
    fn empty() -> Self {
        Self {
            generation: 0,
            groups: Vec::new(),
        }
    }

    /// Look a filter up across all groups.
    pub fn filter(&self, id: i64) -> Option<&Filter> {
        self.groups
            .iter()
            .flat_map(|g| g.filters.iter())
            .find(|f| f.id == id)
    }
}

/// Multiple-reader/single-writer snapshot holder.
pub struct SnapshotPublisher {
    current: ArcSwap<FilterSnapshot>,
    generation: AtomicU64,
    tx: watch::Sender<Arc<FilterSnapshot>>,
}

impl SnapshotPublisher {
    pub fn new() -> Self {
        let empty = Arc::new(FilterSnapshot::empty());
        let (tx, _) = watch::channel(Arc::clone(&empty));
        Self {
            current: ArcSwap::new(empty),
            generation: AtomicU64::new(0),
            tx,
        }
    }

    /// Lock-free read of the current snapshot.
    pub fn load(&self) -> Arc<FilterSnapshot> {
        self.current.load_full()
    }

    /// Publish a fully built replacement snapshot.
    pub fn publish(&self, groups: Vec<Group>) -> Arc<FilterSnapshot> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Arc::new(FilterSnapshot { generation, groups });
        self.current.store(Arc::clone(&snapshot));
        let _ = self.tx.send(Arc::clone(&snapshot));
        tracing::debug!("Published filter snapshot generation {generation}");
        snapshot
    }

    /// Typed observer notified on every publish.
    pub fn subscribe(&self) -> watch::Receiver<Arc<FilterSnapshot>> {
        self.tx.subscribe()
    }
}

impl Default for SnapshotPublisher {
    fn default() -> Self {
        Self::new()
    }
}
