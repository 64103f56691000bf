//! Filter-list synchronization engine.
//!
//! `FilterSyncEngine` orchestrates periodic and forced refreshes of filter
//! metadata and content, custom-filter CRUD, and enable/disable state. The
//! persistent stores are the source of truth; after every mutation the
//! engine rebuilds the immutable Group/Filter snapshot from them and
//! publishes it atomically. Per-filter fetch failures are collected into the
//! update summary and never abort the surrounding sync.

pub mod catalog;
pub mod content;
pub mod metadata;
pub mod parser;
pub mod snapshot;

#[cfg(test)]
pub(crate) mod testutil;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::config;
use crate::error::FilterError;
use crate::stats::unix_timestamp;
use catalog::{CatalogClient, CatalogFetcher, CatalogFilter, CatalogPayload};
use content::FilterContentStore;
use metadata::{CustomFilterMeta, FilterMetadataStore, FilterUpsert, GroupUpsert, LocalizedEntity};
use parser::{count_rules, parse_header};
use snapshot::{FilterSnapshot, FilterTag, SnapshotPublisher};

/// Result sets of one sync pass.
#[derive(Debug, Default, Clone)]
pub struct UpdateSummary {
    pub updated_ids: Vec<i64>,
    pub failed_ids: Vec<i64>,
    pub added_ids: Vec<i64>,
    pub removed_ids: Vec<i64>,
}

/// Orchestrates the metadata store, content store, and remote catalog, and
/// publishes the in-memory snapshot. All mutating entry points are
/// serialized on one internal lock: a pending call waits behind the
/// in-flight one, and no two sync stages ever overlap.
pub struct FilterSyncEngine<F> {
    metadata: Arc<FilterMetadataStore>,
    content: Arc<FilterContentStore>,
    catalog: CatalogClient<F>,
    publisher: Arc<SnapshotPublisher>,
    /// Preferred display languages, most specific first.
    languages: Vec<String>,
    sync_lock: tokio::sync::Mutex<()>,
}

impl<F: CatalogFetcher> FilterSyncEngine<F> {
    pub fn new(
        metadata: Arc<FilterMetadataStore>,
        content: Arc<FilterContentStore>,
        catalog: CatalogClient<F>,
        languages: Vec<String>,
    ) -> Result<Self, FilterError> {
        let engine = Self {
            metadata,
            content,
            catalog,
            publisher: Arc::new(SnapshotPublisher::new()),
            languages,
            sync_lock: tokio::sync::Mutex::new(()),
        };
        engine.rebuild_snapshot()?;
        Ok(engine)
    }

    /// Current immutable snapshot. Never blocks.
    pub fn snapshot(&self) -> Arc<FilterSnapshot> {
        self.publisher.load()
    }

    /// Observer notified on every snapshot rebuild.
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<Arc<FilterSnapshot>> {
        self.publisher.subscribe()
    }

    /// Raw rule text for a filter.
    pub fn get_content(&self, filter_id: i64) -> Result<Option<String>, FilterError> {
        self.content.content(filter_id)
    }

    /// Refresh content and metadata for every eligible filter.
    ///
    /// Unless `forcibly` is set, a refresh within the minimum check period
    /// aborts with `UpdatePeriod` before any network traffic. The snapshot
    /// is rebuilt from the stores regardless of partial failure, so it
    /// always reflects the latest durable state; the check clock only
    /// advances when every filter succeeded.
    pub async fn update_all_meta(&self, forcibly: bool) -> Result<UpdateSummary, FilterError> {
        let _guard = self.sync_lock.lock().await;

        let now = unix_timestamp();
        if !forcibly {
            if let Some(last) = self.metadata.last_check_time()? {
                if now - last < config::UPDATE_CHECK_PERIOD_SECS {
                    return Err(FilterError::UpdatePeriod);
                }
            }
        }

        let result = self.run_sync(now).await;
        self.rebuild_snapshot()?;
        self.spawn_rule_count_refresh();
        result
    }

    async fn run_sync(&self, now: i64) -> Result<UpdateSummary, FilterError> {
        let mut summary = UpdateSummary::default();

        let refreshed = self.refresh_enabled_content(&mut summary).await?;

        let mut payload = self.catalog.metadata().await?;
        payload
            .filters
            .retain(|f| !config::DENYLISTED_FILTER_IDS.contains(&f.filter_id));
        self.reconcile_catalog(&payload, &refreshed, &mut summary)
            .await?;
        self.apply_localizations().await?;

        self.refresh_custom_filters(&mut summary).await?;

        if summary.failed_ids.is_empty() {
            self.metadata.set_last_check_time(now)?;
        } else {
            tracing::warn!(
                "Sync finished with {} failed filters, keeping previous check time",
                summary.failed_ids.len()
            );
        }
        Ok(summary)
    }

    /// Stage 2: re-download content for every enabled catalog filter in an
    /// enabled group, concurrently per filter. Returns the ids whose
    /// content was refreshed.
    async fn refresh_enabled_content(
        &self,
        summary: &mut UpdateSummary,
    ) -> Result<HashSet<i64>, FilterError> {
        let targets = self.metadata.enabled_catalog_filters()?;
        let mut tasks = JoinSet::new();
        for target in targets {
            let client = self.catalog.clone();
            tasks.spawn(async move {
                let result = client
                    .filter_content(target.filter_id, &target.download_page)
                    .await;
                (target.filter_id, result)
            });
        }

        let mut refreshed = HashSet::new();
        while let Some(joined) = tasks.join_next().await {
            let Ok((filter_id, result)) = joined else {
                continue;
            };
            match result {
                Ok(text) => {
                    if let Err(e) = self.content.save_content(filter_id, &text) {
                        tracing::warn!("Saving content for filter {filter_id} failed: {e}");
                        summary.failed_ids.push(filter_id);
                    } else {
                        refreshed.insert(filter_id);
                    }
                }
                Err(e) => {
                    tracing::warn!("Content refresh for filter {filter_id} failed: {e}");
                    summary.failed_ids.push(filter_id);
                }
            }
        }
        Ok(refreshed)
    }

    /// Stage 3: reconcile the remote catalog against the local filter set.
    async fn reconcile_catalog(
        &self,
        payload: &CatalogPayload,
        refreshed: &HashSet<i64>,
        summary: &mut UpdateSummary,
    ) -> Result<(), FilterError> {
        let known: HashSet<i64> = self.metadata.known_catalog_ids()?.into_iter().collect();
        let remote: HashSet<i64> = payload.filters.iter().map(|f| f.filter_id).collect();
        let tag_types: HashMap<i64, String> = payload
            .tags
            .iter()
            .map(|t| (t.tag_id, t.keyword.clone()))
            .collect();

        for group in &payload.groups {
            self.metadata.upsert_group(&GroupUpsert {
                group_id: group.group_id,
                name: group.group_name.clone(),
                display_number: group.display_number,
            })?;
        }

        for filter in &payload.filters {
            let upsert = to_upsert(filter, &tag_types);
            if !known.contains(&filter.filter_id) {
                // New filters get their content before their metadata, so a
                // visible filter always has rules on disk.
                let download = filter.download_page.as_deref().unwrap_or_default();
                match self.catalog.filter_content(filter.filter_id, download).await {
                    Ok(text) => {
                        self.content.save_content(filter.filter_id, &text)?;
                        self.metadata.upsert_catalog_filter(&upsert)?;
                        summary.added_ids.push(filter.filter_id);
                    }
                    Err(e) => {
                        tracing::warn!("Installing filter {} failed: {e}", filter.filter_id);
                        summary.failed_ids.push(filter.filter_id);
                    }
                }
            } else if refreshed.contains(&filter.filter_id) {
                self.metadata.upsert_catalog_filter(&upsert)?;
                summary.updated_ids.push(filter.filter_id);
            }
        }

        for stale in known.difference(&remote) {
            // Denylisted ids are dropped from the payload, not force-removed
            // from an installation that already carries them.
            if config::DENYLISTED_FILTER_IDS.contains(stale) {
                continue;
            }
            self.metadata.delete_filter(*stale)?;
            self.content.delete_content(*stale)?;
            summary.removed_ids.push(*stale);
        }
        Ok(())
    }

    /// Fetch localizations for the configured languages and persist them.
    /// Fetch failures are soft; store failures are not.
    async fn apply_localizations(&self) -> Result<(), FilterError> {
        let payload = self.catalog.localizations(&self.languages).await;
        for (id, langs) in &payload.groups {
            let Ok(entity_id) = id.parse::<i64>() else {
                continue;
            };
            for (lang, fields) in langs {
                self.metadata.update_localization(
                    LocalizedEntity::Group,
                    entity_id,
                    lang,
                    fields.name.as_deref(),
                    fields.description.as_deref(),
                )?;
            }
        }
        for (id, langs) in &payload.filters {
            let Ok(entity_id) = id.parse::<i64>() else {
                continue;
            };
            for (lang, fields) in langs {
                self.metadata.update_localization(
                    LocalizedEntity::Filter,
                    entity_id,
                    lang,
                    fields.name.as_deref(),
                    fields.description.as_deref(),
                )?;
            }
        }
        Ok(())
    }

    /// Stage 4: refresh every enabled custom filter from its subscription
    /// URL, re-parsing the embedded metadata header. Failures are per
    /// filter.
    async fn refresh_custom_filters(
        &self,
        summary: &mut UpdateSummary,
    ) -> Result<(), FilterError> {
        let customs = self.metadata.enabled_custom_filters()?;
        let mut tasks = JoinSet::new();
        for custom in customs {
            let client = self.catalog.clone();
            tasks.spawn(async move {
                let result = client
                    .subscription(Some(custom.filter_id), &custom.subscription_url)
                    .await;
                (custom.filter_id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let Ok((filter_id, result)) = joined else {
                continue;
            };
            match result {
                Ok(text) => {
                    let header = parse_header(&text);
                    if let Err(e) = self
                        .content
                        .save_content(filter_id, &text)
                        .and_then(|()| self.metadata.update_custom_filter(filter_id, &header))
                    {
                        tracing::warn!("Updating custom filter {filter_id} failed: {e}");
                        summary.failed_ids.push(filter_id);
                    } else {
                        summary.updated_ids.push(filter_id);
                    }
                }
                Err(e) => {
                    tracing::warn!("Custom filter {filter_id} refresh failed: {e}");
                    summary.failed_ids.push(filter_id);
                }
            }
        }
        Ok(())
    }

    // ---- Custom filter CRUD ----

    /// Subscribe to a new custom rule list. The list is fetched, its header
    /// parsed for metadata, and a fresh id allocated from the reserved
    /// range.
    pub async fn add_custom_filter(
        &self,
        subscription_url: &str,
        enabled: bool,
        name_override: Option<&str>,
    ) -> Result<i64, FilterError> {
        let _guard = self.sync_lock.lock().await;

        let text = self.catalog.subscription(None, subscription_url).await?;
        let header = parse_header(&text);
        let meta = CustomFilterMeta {
            name: name_override
                .map(str::to_string)
                .or_else(|| header.title.clone())
                .unwrap_or_else(|| subscription_url.to_string()),
            description: header.description.unwrap_or_default(),
            home_page: header.homepage.unwrap_or_default(),
            subscription_url: subscription_url.to_string(),
            version: header.version.unwrap_or_default(),
        };

        let filter_id = self.metadata.add_custom_filter(&meta, enabled)?;
        self.content.save_content(filter_id, &text)?;
        self.rebuild_snapshot()?;
        self.spawn_rule_count_refresh();
        Ok(filter_id)
    }

    /// Remove a custom filter's metadata row and content file.
    pub async fn delete_custom_filter(&self, filter_id: i64) -> Result<(), FilterError> {
        let _guard = self.sync_lock.lock().await;
        require_custom_id(filter_id)?;
        self.metadata.delete_filter(filter_id)?;
        self.content.delete_content(filter_id)?;
        self.rebuild_snapshot()?;
        Ok(())
    }

    pub async fn rename_custom_filter(
        &self,
        filter_id: i64,
        new_name: &str,
    ) -> Result<(), FilterError> {
        let _guard = self.sync_lock.lock().await;
        require_custom_id(filter_id)?;
        self.metadata.rename_filter(filter_id, new_name)?;
        self.rebuild_snapshot()?;
        Ok(())
    }

    // ---- Enable state ----

    pub async fn set_group_enabled(&self, group_id: i64, enabled: bool) -> Result<(), FilterError> {
        let _guard = self.sync_lock.lock().await;
        self.metadata.set_group_enabled(group_id, enabled)?;
        self.rebuild_snapshot()?;
        Ok(())
    }

    pub async fn set_filter_enabled(
        &self,
        filter_id: i64,
        group_id: i64,
        enabled: bool,
    ) -> Result<(), FilterError> {
        let _guard = self.sync_lock.lock().await;
        self.metadata.set_filter_enabled(filter_id, group_id, enabled)?;
        self.rebuild_snapshot()?;
        Ok(())
    }

    /// Drop everything and reinstall the shipped defaults: metadata from
    /// the bundled catalog payload, content from the bundled lists. Custom
    /// filters are gone afterwards; the custom id counter is not reset.
    pub async fn reset_to_defaults(
        &self,
        defaults: &CatalogPayload,
        bundled_content: &[(i64, &str)],
    ) -> Result<(), FilterError> {
        let _guard = self.sync_lock.lock().await;

        self.metadata.clear_all()?;
        self.content.clear_all()?;

        let tag_types: HashMap<i64, String> = defaults
            .tags
            .iter()
            .map(|t| (t.tag_id, t.keyword.clone()))
            .collect();
        for group in &defaults.groups {
            self.metadata.upsert_group(&GroupUpsert {
                group_id: group.group_id,
                name: group.group_name.clone(),
                display_number: group.display_number,
            })?;
        }
        for filter in &defaults.filters {
            if config::DENYLISTED_FILTER_IDS.contains(&filter.filter_id) {
                continue;
            }
            self.metadata
                .upsert_catalog_filter(&to_upsert(filter, &tag_types))?;
        }
        self.content.unpack_bundled_defaults(bundled_content)?;

        self.rebuild_snapshot()?;
        self.spawn_rule_count_refresh();
        Ok(())
    }

    // ---- Snapshot maintenance ----

    fn rebuild_snapshot(&self) -> Result<(), FilterError> {
        let groups = self.metadata.get_all_groups(&self.languages)?;
        self.publisher.publish(groups);
        Ok(())
    }

    /// Rule counting runs off the mutation path: a task recounts from the
    /// content store and republishes, skipping the publish if a newer
    /// snapshot appeared meanwhile.
    fn spawn_rule_count_refresh(&self) {
        let content = Arc::clone(&self.content);
        let publisher = Arc::clone(&self.publisher);
        tokio::spawn(async move {
            refresh_rule_counts(&content, &publisher);
        });
    }

    /// Synchronous rule-count pass, exposed for hosts that want counts
    /// right away.
    pub fn refresh_rule_counts(&self) {
        refresh_rule_counts(&self.content, &self.publisher);
    }
}

fn require_custom_id(filter_id: i64) -> Result<(), FilterError> {
    if filter_id < config::CUSTOM_FILTER_BASE_ID {
        return Err(FilterError::InvalidCustomFilter(format!(
            "{filter_id} is not in the custom filter id range"
        )));
    }
    Ok(())
}

fn to_upsert(filter: &CatalogFilter, tag_types: &HashMap<i64, String>) -> FilterUpsert {
    FilterUpsert {
        filter_id: filter.filter_id,
        group_id: filter.group_id,
        name: filter.name.clone(),
        description: filter.description.clone(),
        home_page: filter.home_page.clone(),
        download_page: filter.download_page.clone().unwrap_or_default(),
        version: filter.version.clone(),
        display_number: filter.display_number,
        languages: filter.languages.clone(),
        tags: filter
            .tags
            .iter()
            .map(|tag_id| FilterTag {
                id: *tag_id,
                tag_type: tag_types.get(tag_id).cloned().unwrap_or_default(),
            })
            .collect(),
    }
}

fn refresh_rule_counts(content: &FilterContentStore, publisher: &SnapshotPublisher) {
    let base = publisher.load();
    let mut groups = base.groups.clone();
    for group in &mut groups {
        for filter in &mut group.filters {
            match content.content(filter.id) {
                Ok(Some(text)) => filter.rules_count = Some(count_rules(&text)),
                Ok(None) => filter.rules_count = Some(0),
                Err(e) => tracing::warn!("Counting rules for filter {} failed: {e}", filter.id),
            }
        }
    }
    // A mutation may have republished while we counted; its rebuild wins.
    if publisher.load().generation == base.generation {
        publisher.publish(groups);
    }
}
