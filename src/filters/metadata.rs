//! SQLite metadata store for filter groups, filters, tags, languages, and
//! localizations.
//!
//! Uses `rusqlite` with bundled SQLite. The store is shared with a separate
//! process in deployment, so every operation runs under a bounded busy-retry
//! window on top of the connection's busy timeout: a transiently locked
//! store is waited out, a persistently locked one surfaces `StoreBusy`.
//! Mutations are transactional per statement; callers are expected to
//! tolerate partial application of multi-row update batches.

use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rusqlite::{params, Connection, OptionalExtension};

use crate::config;
use crate::error::FilterError;
use crate::filters::parser::FilterHeader;
use crate::filters::snapshot::{Filter, FilterTag, Group, GroupType};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS groups (
    group_id INTEGER PRIMARY KEY,
    name TEXT NOT NULL DEFAULT '',
    display_number INTEGER NOT NULL DEFAULT 0,
    is_enabled INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS filters (
    filter_id INTEGER PRIMARY KEY,
    group_id INTEGER NOT NULL,
    is_enabled INTEGER NOT NULL DEFAULT 0,
    version TEXT NOT NULL DEFAULT '',
    display_number INTEGER NOT NULL DEFAULT 0,
    name TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    home_page TEXT NOT NULL DEFAULT '',
    download_page TEXT NOT NULL DEFAULT '',
    subscription_url TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_filters_group ON filters(group_id);
CREATE TABLE IF NOT EXISTS filter_tags (
    filter_id INTEGER NOT NULL,
    tag_id INTEGER NOT NULL,
    tag_type TEXT NOT NULL DEFAULT '',
    UNIQUE(filter_id, tag_id)
);
CREATE TABLE IF NOT EXISTS filter_langs (
    filter_id INTEGER NOT NULL,
    lang TEXT NOT NULL,
    UNIQUE(filter_id, lang)
);
CREATE TABLE IF NOT EXISTS localizations (
    entity TEXT NOT NULL,
    entity_id INTEGER NOT NULL,
    lang TEXT NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    UNIQUE(entity, entity_id, lang)
);
CREATE TABLE IF NOT EXISTS store_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

const META_NEXT_CUSTOM_ID: &str = "next_custom_filter_id";
const META_LAST_CHECK_TIME: &str = "last_check_time";

/// Group fields written during a catalog update.
#[derive(Debug, Clone)]
pub struct GroupUpsert {
    pub group_id: i64,
    pub name: String,
    pub display_number: i64,
}

/// Filter fields written during a catalog update. The enabled flag is user
/// state and is never touched by an upsert.
#[derive(Debug, Clone)]
pub struct FilterUpsert {
    pub filter_id: i64,
    pub group_id: i64,
    pub name: String,
    pub description: String,
    pub home_page: String,
    pub download_page: String,
    pub version: String,
    pub display_number: i64,
    pub languages: Vec<String>,
    pub tags: Vec<FilterTag>,
}

/// Metadata supplied when subscribing to a custom filter.
#[derive(Debug, Clone, Default)]
pub struct CustomFilterMeta {
    pub name: String,
    pub description: String,
    pub home_page: String,
    pub subscription_url: String,
    pub version: String,
}

/// Which entity a localization row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalizedEntity {
    Group,
    Filter,
}

impl LocalizedEntity {
    fn as_str(&self) -> &'static str {
        match self {
            LocalizedEntity::Group => "group",
            LocalizedEntity::Filter => "filter",
        }
    }
}

/// A catalog filter eligible for a content refresh.
#[derive(Debug, Clone)]
pub struct CatalogFilterRef {
    pub filter_id: i64,
    pub download_page: String,
}

/// A custom filter eligible for a subscription refresh.
#[derive(Debug, Clone)]
pub struct CustomFilterRef {
    pub filter_id: i64,
    pub subscription_url: String,
}

/// Persistent relational store for filter metadata.
pub struct FilterMetadataStore {
    conn: Mutex<Connection>,
}

impl FilterMetadataStore {
    /// Open or create the store at the given path.
    pub fn open(path: &Path) -> Result<Self, FilterError> {
        Self::init(Connection::open(path)?)
    }

    /// In-memory store, for tests and ephemeral hosts.
    pub fn open_in_memory() -> Result<Self, FilterError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, FilterError> {
        conn.busy_timeout(Duration::from_millis(config::STORE_BUSY_RETRY_WINDOW_MS))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;
        // The reserved custom group always exists and starts enabled.
        conn.execute(
            "INSERT OR IGNORE INTO groups (group_id, name, display_number, is_enabled)
             VALUES (?1, 'Custom', ?2, 1)",
            params![config::CUSTOM_GROUP_ID, i64::MAX],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ---- Reads ----

    /// All groups with their filters, ordered for display. Localized names
    /// and descriptions are applied for the first matching language.
    pub fn get_all_groups(&self, languages: &[String]) -> Result<Vec<Group>, FilterError> {
        with_busy_retry(|| {
            let conn = self.conn.lock().unwrap();
            let mut groups = Vec::new();
            {
                let mut stmt = conn.prepare_cached(
                    "SELECT group_id, name, is_enabled FROM groups
                     ORDER BY display_number, group_id",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i32>(2)? != 0,
                    ))
                })?;
                for row in rows {
                    let (id, name, is_enabled) = row?;
                    let localized = localized_names(&conn, LocalizedEntity::Group, id, languages)?;
                    groups.push(Group {
                        id,
                        name: localized.and_then(|(n, _)| n).unwrap_or(name),
                        group_type: if id == config::CUSTOM_GROUP_ID {
                            GroupType::Custom
                        } else {
                            GroupType::Predefined
                        },
                        is_enabled,
                        filters: Vec::new(),
                    });
                }
            }
            for group in &mut groups {
                group.filters = filters_for_group(&conn, group.id, languages)?;
            }
            Ok(groups)
        })
    }

    /// Catalog filter ids currently known locally.
    pub fn known_catalog_ids(&self) -> Result<Vec<i64>, FilterError> {
        with_busy_retry(|| {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare_cached(
                "SELECT filter_id FROM filters WHERE filter_id < ?1 ORDER BY filter_id",
            )?;
            let rows = stmt.query_map(params![config::CUSTOM_FILTER_BASE_ID], |r| r.get(0))?;
            collect(rows)
        })
    }

    /// Enabled catalog filters whose group is also enabled.
    pub fn enabled_catalog_filters(&self) -> Result<Vec<CatalogFilterRef>, FilterError> {
        with_busy_retry(|| {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare_cached(
                "SELECT f.filter_id, f.download_page
                 FROM filters f JOIN groups g ON g.group_id = f.group_id
                 WHERE f.filter_id < ?1 AND f.is_enabled = 1 AND g.is_enabled = 1
                 ORDER BY f.filter_id",
            )?;
            let rows = stmt.query_map(params![config::CUSTOM_FILTER_BASE_ID], |row| {
                Ok(CatalogFilterRef {
                    filter_id: row.get(0)?,
                    download_page: row.get(1)?,
                })
            })?;
            collect(rows)
        })
    }

    /// Enabled custom filters with their subscription URLs.
    pub fn enabled_custom_filters(&self) -> Result<Vec<CustomFilterRef>, FilterError> {
        with_busy_retry(|| {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare_cached(
                "SELECT filter_id, subscription_url FROM filters
                 WHERE filter_id >= ?1 AND is_enabled = 1
                 ORDER BY filter_id",
            )?;
            let rows = stmt.query_map(params![config::CUSTOM_FILTER_BASE_ID], |row| {
                Ok(CustomFilterRef {
                    filter_id: row.get(0)?,
                    subscription_url: row.get(1)?,
                })
            })?;
            collect(rows)
        })
    }

    pub fn last_check_time(&self) -> Result<Option<i64>, FilterError> {
        with_busy_retry(|| {
            let conn = self.conn.lock().unwrap();
            let value: Option<String> = conn
                .query_row(
                    "SELECT value FROM store_meta WHERE key = ?1",
                    params![META_LAST_CHECK_TIME],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(value.and_then(|v| v.parse().ok()))
        })
    }

    pub fn set_last_check_time(&self, timestamp: i64) -> Result<(), FilterError> {
        with_busy_retry(|| {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT OR REPLACE INTO store_meta (key, value) VALUES (?1, ?2)",
                params![META_LAST_CHECK_TIME, timestamp.to_string()],
            )?;
            Ok(())
        })
    }

    // ---- Enable state ----

    pub fn set_group_enabled(&self, group_id: i64, enabled: bool) -> Result<(), FilterError> {
        with_busy_retry(|| {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE groups SET is_enabled = ?2 WHERE group_id = ?1",
                params![group_id, enabled as i32],
            )?;
            Ok(())
        })
    }

    pub fn set_filter_enabled(
        &self,
        filter_id: i64,
        group_id: i64,
        enabled: bool,
    ) -> Result<(), FilterError> {
        with_busy_retry(|| {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE filters SET is_enabled = ?3 WHERE filter_id = ?1 AND group_id = ?2",
                params![filter_id, group_id, enabled as i32],
            )?;
            Ok(())
        })
    }

    // ---- Custom filters ----

    /// Allocate the next custom filter id. Strictly increasing from the
    /// reserved base; ids are never reused, even after deletion.
    pub fn next_custom_filter_id(&self) -> Result<i64, FilterError> {
        with_busy_retry(|| {
            let mut conn = self.conn.lock().unwrap();
            let tx = conn.transaction()?;
            let id = allocate_custom_id(&tx)?;
            tx.commit()?;
            Ok(id)
        })
    }

    /// Insert a custom filter row and return its freshly allocated id.
    pub fn add_custom_filter(
        &self,
        meta: &CustomFilterMeta,
        enabled: bool,
    ) -> Result<i64, FilterError> {
        if meta.subscription_url.is_empty() {
            return Err(FilterError::InvalidCustomFilter(
                "empty subscription URL".into(),
            ));
        }
        with_busy_retry(|| {
            let mut conn = self.conn.lock().unwrap();
            let tx = conn.transaction()?;

            let duplicate: Option<i64> = tx
                .query_row(
                    "SELECT filter_id FROM filters WHERE subscription_url = ?1",
                    params![meta.subscription_url],
                    |r| r.get(0),
                )
                .optional()?;
            if duplicate.is_some() {
                return Err(FilterError::InvalidCustomFilter(format!(
                    "subscription already added: {}",
                    meta.subscription_url
                )));
            }

            let filter_id = allocate_custom_id(&tx)?;
            tx.execute(
                "INSERT INTO filters (filter_id, group_id, is_enabled, version, name,
                                      description, home_page, subscription_url)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    filter_id,
                    config::CUSTOM_GROUP_ID,
                    enabled as i32,
                    meta.version,
                    meta.name,
                    meta.description,
                    meta.home_page,
                    meta.subscription_url,
                ],
            )?;
            tx.commit()?;
            tracing::info!("Added custom filter {filter_id} ({})", meta.subscription_url);
            Ok(filter_id)
        })
    }

    /// Delete a filter and its tag/language/localization rows.
    pub fn delete_filter(&self, filter_id: i64) -> Result<(), FilterError> {
        with_busy_retry(|| {
            let conn = self.conn.lock().unwrap();
            conn.execute("DELETE FROM filters WHERE filter_id = ?1", params![filter_id])?;
            conn.execute(
                "DELETE FROM filter_tags WHERE filter_id = ?1",
                params![filter_id],
            )?;
            conn.execute(
                "DELETE FROM filter_langs WHERE filter_id = ?1",
                params![filter_id],
            )?;
            conn.execute(
                "DELETE FROM localizations WHERE entity = 'filter' AND entity_id = ?1",
                params![filter_id],
            )?;
            Ok(())
        })
    }

    pub fn rename_filter(&self, filter_id: i64, new_name: &str) -> Result<(), FilterError> {
        with_busy_retry(|| {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE filters SET name = ?2 WHERE filter_id = ?1",
                params![filter_id, new_name],
            )?;
            Ok(())
        })
    }

    /// Refresh a custom filter's metadata from its parsed header. Absent
    /// header fields leave the stored values untouched.
    pub fn update_custom_filter(
        &self,
        filter_id: i64,
        header: &FilterHeader,
    ) -> Result<(), FilterError> {
        with_busy_retry(|| {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE filters SET
                     name = COALESCE(?2, name),
                     description = COALESCE(?3, description),
                     version = COALESCE(?4, version),
                     home_page = COALESCE(?5, home_page)
                 WHERE filter_id = ?1",
                params![
                    filter_id,
                    header.title,
                    header.description,
                    header.version,
                    header.homepage,
                ],
            )?;
            Ok(())
        })
    }

    // ---- Catalog updates ----

    pub fn upsert_group(&self, group: &GroupUpsert) -> Result<(), FilterError> {
        with_busy_retry(|| {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO groups (group_id, name, display_number)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(group_id) DO UPDATE SET
                     name = excluded.name,
                     display_number = excluded.display_number",
                params![group.group_id, group.name, group.display_number],
            )?;
            Ok(())
        })
    }

    /// Write a catalog filter's metadata, tags, and languages. The enabled
    /// flag of an existing row survives the update.
    pub fn upsert_catalog_filter(&self, filter: &FilterUpsert) -> Result<(), FilterError> {
        with_busy_retry(|| {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO filters (filter_id, group_id, name, description, home_page,
                                      download_page, version, display_number)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(filter_id) DO UPDATE SET
                     group_id = excluded.group_id,
                     name = excluded.name,
                     description = excluded.description,
                     home_page = excluded.home_page,
                     download_page = excluded.download_page,
                     version = excluded.version,
                     display_number = excluded.display_number",
                params![
                    filter.filter_id,
                    filter.group_id,
                    filter.name,
                    filter.description,
                    filter.home_page,
                    filter.download_page,
                    filter.version,
                    filter.display_number,
                ],
            )?;

            conn.execute(
                "DELETE FROM filter_tags WHERE filter_id = ?1",
                params![filter.filter_id],
            )?;
            for tag in &filter.tags {
                conn.execute(
                    "INSERT OR IGNORE INTO filter_tags (filter_id, tag_id, tag_type)
                     VALUES (?1, ?2, ?3)",
                    params![filter.filter_id, tag.id, tag.tag_type],
                )?;
            }

            conn.execute(
                "DELETE FROM filter_langs WHERE filter_id = ?1",
                params![filter.filter_id],
            )?;
            for lang in &filter.languages {
                conn.execute(
                    "INSERT OR IGNORE INTO filter_langs (filter_id, lang) VALUES (?1, ?2)",
                    params![filter.filter_id, lang],
                )?;
            }
            Ok(())
        })
    }

    pub fn update_localization(
        &self,
        entity: LocalizedEntity,
        entity_id: i64,
        lang: &str,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<(), FilterError> {
        with_busy_retry(|| {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO localizations (entity, entity_id, lang, name, description)
                 VALUES (?1, ?2, ?3, COALESCE(?4, ''), COALESCE(?5, ''))
                 ON CONFLICT(entity, entity_id, lang) DO UPDATE SET
                     name = COALESCE(?4, localizations.name),
                     description = COALESCE(?5, localizations.description)",
                params![entity.as_str(), entity_id, lang, name, description],
            )?;
            Ok(())
        })
    }

    /// Drop all metadata except the custom-id counter, re-seeding the
    /// reserved custom group. The update-period clock is reset so the next
    /// refresh runs immediately.
    pub fn clear_all(&self) -> Result<(), FilterError> {
        with_busy_retry(|| {
            let conn = self.conn.lock().unwrap();
            conn.execute_batch(
                "DELETE FROM groups;
                 DELETE FROM filters;
                 DELETE FROM filter_tags;
                 DELETE FROM filter_langs;
                 DELETE FROM localizations;",
            )?;
            conn.execute(
                "DELETE FROM store_meta WHERE key = ?1",
                params![META_LAST_CHECK_TIME],
            )?;
            conn.execute(
                "INSERT OR IGNORE INTO groups (group_id, name, display_number, is_enabled)
                 VALUES (?1, 'Custom', ?2, 1)",
                params![config::CUSTOM_GROUP_ID, i64::MAX],
            )?;
            Ok(())
        })
    }
}

/// Read-increment-write the custom id counter inside the caller's
/// transaction.
fn allocate_custom_id(tx: &rusqlite::Transaction<'_>) -> Result<i64, FilterError> {
    let current: Option<String> = tx
        .query_row(
            "SELECT value FROM store_meta WHERE key = ?1",
            params![META_NEXT_CUSTOM_ID],
            |r| r.get(0),
        )
        .optional()?;
    let id = current
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(config::CUSTOM_FILTER_BASE_ID);
    tx.execute(
        "INSERT OR REPLACE INTO store_meta (key, value) VALUES (?1, ?2)",
        params![META_NEXT_CUSTOM_ID, (id + 1).to_string()],
    )?;
    Ok(id)
}

fn filters_for_group(
    conn: &Connection,
    group_id: i64,
    languages: &[String],
) -> Result<Vec<Filter>, FilterError> {
    let mut filters = Vec::new();
    let mut stmt = conn.prepare_cached(
        "SELECT filter_id, is_enabled, version, display_number, name, description,
                home_page, subscription_url
         FROM filters WHERE group_id = ?1
         ORDER BY display_number, filter_id",
    )?;
    let rows = stmt.query_map(params![group_id], |row| {
        Ok(Filter {
            id: row.get(0)?,
            group_id,
            is_enabled: row.get::<_, i32>(1)? != 0,
            version: row.get(2)?,
            display_number: row.get(3)?,
            name: row.get(4)?,
            description: row.get(5)?,
            home_page: row.get(6)?,
            subscription_url: {
                let url: String = row.get(7)?;
                (!url.is_empty()).then_some(url)
            },
            languages: Vec::new(),
            tags: Vec::new(),
            rules_count: None,
            is_custom: false,
        })
    })?;

    for row in rows {
        let mut filter = row?;
        filter.is_custom = filter.id >= config::CUSTOM_FILTER_BASE_ID;
        filter.languages = filter_langs(conn, filter.id)?;
        filter.tags = filter_tags(conn, filter.id)?;
        if let Some((name, description)) =
            localized_names(conn, LocalizedEntity::Filter, filter.id, languages)?
        {
            if let Some(name) = name {
                filter.name = name;
            }
            if let Some(description) = description {
                filter.description = description;
            }
        }
        filters.push(filter);
    }
    Ok(filters)
}

fn filter_langs(conn: &Connection, filter_id: i64) -> Result<Vec<String>, FilterError> {
    let mut stmt =
        conn.prepare_cached("SELECT lang FROM filter_langs WHERE filter_id = ?1 ORDER BY lang")?;
    let rows = stmt.query_map(params![filter_id], |r| r.get(0))?;
    collect(rows)
}

fn filter_tags(conn: &Connection, filter_id: i64) -> Result<Vec<FilterTag>, FilterError> {
    let mut stmt = conn.prepare_cached(
        "SELECT tag_id, tag_type FROM filter_tags WHERE filter_id = ?1 ORDER BY tag_id",
    )?;
    let rows = stmt.query_map(params![filter_id], |row| {
        Ok(FilterTag {
            id: row.get(0)?,
            tag_type: row.get(1)?,
        })
    })?;
    collect(rows)
}

/// First matching localization by language preference order.
fn localized_names(
    conn: &Connection,
    entity: LocalizedEntity,
    entity_id: i64,
    languages: &[String],
) -> Result<Option<(Option<String>, Option<String>)>, FilterError> {
    for lang in languages {
        let hit: Option<(String, String)> = conn
            .query_row(
                "SELECT name, description FROM localizations
                 WHERE entity = ?1 AND entity_id = ?2 AND lang = ?3",
                params![entity.as_str(), entity_id, lang],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((name, description)) = hit {
            return Ok(Some((
                (!name.is_empty()).then_some(name),
                (!description.is_empty()).then_some(description),
            )));
        }
    }
    Ok(None)
}

fn collect<T>(
    rows: impl Iterator<Item = Result<T, rusqlite::Error>>,
) -> Result<Vec<T>, FilterError> {
    let mut results = Vec::new();
    for row in rows {
        results.push(row?);
    }
    Ok(results)
}

/// Retry an operation through the bounded busy window, then surface the
/// busy condition to the caller.
fn with_busy_retry<T>(mut op: impl FnMut() -> Result<T, FilterError>) -> Result<T, FilterError> {
    let deadline = Instant::now() + Duration::from_millis(config::STORE_BUSY_RETRY_WINDOW_MS);
    loop {
        match op() {
            Err(FilterError::StoreBusy(reason)) => {
                if Instant::now() >= deadline {
                    return Err(FilterError::StoreBusy(reason));
                }
                tracing::debug!("Metadata store busy, retrying: {reason}");
                std::thread::sleep(Duration::from_millis(config::STORE_BUSY_RETRY_STEP_MS));
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn custom_meta(url: &str) -> CustomFilterMeta {
        CustomFilterMeta {
            name: "My List".into(),
            description: "handwritten rules".into(),
            home_page: "https://example.org".into(),
            subscription_url: url.into(),
            version: "1.0".into(),
        }
    }

    fn catalog_filter(filter_id: i64, group_id: i64) -> FilterUpsert {
        FilterUpsert {
            filter_id,
            group_id,
            name: format!("Filter {filter_id}"),
            description: "from the catalog".into(),
            home_page: "https://example.org".into(),
            download_page: format!("https://filters.example.org/{filter_id}.txt"),
            version: "2.0".into(),
            display_number: filter_id,
            languages: vec!["en".into()],
            tags: vec![FilterTag {
                id: 10,
                tag_type: "purpose:ads".into(),
            }],
        }
    }

    #[test]
    fn test_custom_group_exists_after_open() {
        let store = FilterMetadataStore::open_in_memory().unwrap();
        let groups = store.get_all_groups(&[]).unwrap();
        let custom = groups
            .iter()
            .find(|g| g.id == config::CUSTOM_GROUP_ID)
            .expect("custom group");
        assert_eq!(custom.group_type, GroupType::Custom);
        assert!(custom.is_enabled);
    }

    #[test]
    fn test_add_custom_filter_round_trip() {
        let store = FilterMetadataStore::open_in_memory().unwrap();
        let id = store
            .add_custom_filter(&custom_meta("https://lists.example.org/mine.txt"), true)
            .unwrap();
        assert!(id >= config::CUSTOM_FILTER_BASE_ID);

        let groups = store.get_all_groups(&[]).unwrap();
        let custom = groups
            .iter()
            .find(|g| g.id == config::CUSTOM_GROUP_ID)
            .unwrap();
        assert_eq!(custom.filters.len(), 1);
        let filter = &custom.filters[0];
        assert_eq!(filter.id, id);
        assert!(filter.is_enabled);
        assert!(filter.is_custom);
        assert_eq!(
            filter.subscription_url.as_deref(),
            Some("https://lists.example.org/mine.txt")
        );
    }

    #[test]
    fn test_custom_ids_are_monotonic_and_never_reused() {
        let store = FilterMetadataStore::open_in_memory().unwrap();
        let first = store
            .add_custom_filter(&custom_meta("https://a.example.org/1.txt"), false)
            .unwrap();
        store.delete_filter(first).unwrap();
        let second = store
            .add_custom_filter(&custom_meta("https://a.example.org/2.txt"), false)
            .unwrap();
        assert!(second > first);

        let third = store.next_custom_filter_id().unwrap();
        assert!(third > second);
    }

    #[test]
    fn test_duplicate_subscription_url_is_rejected() {
        let store = FilterMetadataStore::open_in_memory().unwrap();
        store
            .add_custom_filter(&custom_meta("https://a.example.org/list.txt"), false)
            .unwrap();
        let err = store
            .add_custom_filter(&custom_meta("https://a.example.org/list.txt"), false)
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidCustomFilter");
    }

    #[test]
    fn test_rename_filter() {
        let store = FilterMetadataStore::open_in_memory().unwrap();
        let id = store
            .add_custom_filter(&custom_meta("https://a.example.org/list.txt"), false)
            .unwrap();
        store.rename_filter(id, "Renamed").unwrap();

        let groups = store.get_all_groups(&[]).unwrap();
        let filter = groups
            .iter()
            .flat_map(|g| g.filters.iter())
            .find(|f| f.id == id)
            .unwrap();
        assert_eq!(filter.name, "Renamed");
    }

    #[test]
    fn test_enable_state_round_trip() {
        let store = FilterMetadataStore::open_in_memory().unwrap();
        store
            .upsert_group(&GroupUpsert {
                group_id: 1,
                name: "Ad Blocking".into(),
                display_number: 1,
            })
            .unwrap();
        store.upsert_catalog_filter(&catalog_filter(2, 1)).unwrap();

        store.set_group_enabled(1, true).unwrap();
        store.set_filter_enabled(2, 1, true).unwrap();

        let groups = store.get_all_groups(&[]).unwrap();
        let group = groups.iter().find(|g| g.id == 1).unwrap();
        assert!(group.is_enabled);
        assert!(group.filters[0].is_enabled);

        store.set_filter_enabled(2, 1, false).unwrap();
        let groups = store.get_all_groups(&[]).unwrap();
        assert!(!groups.iter().find(|g| g.id == 1).unwrap().filters[0].is_enabled);
    }

    #[test]
    fn test_upsert_preserves_enabled_flag() {
        let store = FilterMetadataStore::open_in_memory().unwrap();
        store
            .upsert_group(&GroupUpsert {
                group_id: 1,
                name: "Ad Blocking".into(),
                display_number: 1,
            })
            .unwrap();
        store.upsert_catalog_filter(&catalog_filter(2, 1)).unwrap();
        store.set_filter_enabled(2, 1, true).unwrap();

        let mut updated = catalog_filter(2, 1);
        updated.version = "3.0".into();
        store.upsert_catalog_filter(&updated).unwrap();

        let groups = store.get_all_groups(&[]).unwrap();
        let filter = &groups.iter().find(|g| g.id == 1).unwrap().filters[0];
        assert!(filter.is_enabled, "enabled flag is user state");
        assert_eq!(filter.version, "3.0");
        assert_eq!(filter.languages, vec!["en".to_string()]);
        assert_eq!(filter.tags.len(), 1);
    }

    #[test]
    fn test_localization_override_by_language_preference() {
        let store = FilterMetadataStore::open_in_memory().unwrap();
        store
            .upsert_group(&GroupUpsert {
                group_id: 1,
                name: "Ad Blocking".into(),
                display_number: 1,
            })
            .unwrap();
        store
            .update_localization(LocalizedEntity::Group, 1, "de", Some("Werbeblocker"), None)
            .unwrap();

        let english = store.get_all_groups(&["en".to_string()]).unwrap();
        assert_eq!(english.iter().find(|g| g.id == 1).unwrap().name, "Ad Blocking");

        let german = store
            .get_all_groups(&["de".to_string(), "en".to_string()])
            .unwrap();
        assert_eq!(german.iter().find(|g| g.id == 1).unwrap().name, "Werbeblocker");
    }

    #[test]
    fn test_enabled_filter_queries_respect_group_state() {
        let store = FilterMetadataStore::open_in_memory().unwrap();
        store
            .upsert_group(&GroupUpsert {
                group_id: 1,
                name: "Ad Blocking".into(),
                display_number: 1,
            })
            .unwrap();
        store.upsert_catalog_filter(&catalog_filter(2, 1)).unwrap();
        store.set_filter_enabled(2, 1, true).unwrap();

        // Group disabled: filter is not eligible.
        assert!(store.enabled_catalog_filters().unwrap().is_empty());

        store.set_group_enabled(1, true).unwrap();
        let eligible = store.enabled_catalog_filters().unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].filter_id, 2);
        assert!(!eligible[0].download_page.is_empty());

        let id = store
            .add_custom_filter(&custom_meta("https://a.example.org/list.txt"), true)
            .unwrap();
        let custom = store.enabled_custom_filters().unwrap();
        assert_eq!(custom.len(), 1);
        assert_eq!(custom[0].filter_id, id);
    }

    #[test]
    fn test_last_check_time_round_trip() {
        let store = FilterMetadataStore::open_in_memory().unwrap();
        assert!(store.last_check_time().unwrap().is_none());
        store.set_last_check_time(1_700_000_000).unwrap();
        assert_eq!(store.last_check_time().unwrap(), Some(1_700_000_000));
    }

    #[test]
    fn test_clear_all_keeps_custom_id_counter() {
        let store = FilterMetadataStore::open_in_memory().unwrap();
        let first = store
            .add_custom_filter(&custom_meta("https://a.example.org/list.txt"), false)
            .unwrap();
        store.set_last_check_time(1_700_000_000).unwrap();

        store.clear_all().unwrap();
        assert!(store.last_check_time().unwrap().is_none());
        let groups = store.get_all_groups(&[]).unwrap();
        assert_eq!(groups.len(), 1, "only the custom group survives");
        assert!(groups[0].filters.is_empty());

        // The id counter survived the reset.
        let next = store.next_custom_filter_id().unwrap();
        assert!(next > first);
    }

    #[test]
    fn test_busy_retry_retries_until_success() {
        let mut attempts = 0;
        let result: Result<i32, FilterError> = with_busy_retry(|| {
            attempts += 1;
            if attempts < 3 {
                Err(FilterError::StoreBusy("locked".into()))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts, 3);
    }

    #[test]
    fn test_busy_retry_gives_up_after_window() {
        let started = Instant::now();
        let result: Result<(), FilterError> =
            with_busy_retry(|| Err(FilterError::StoreBusy("locked".into())));
        assert_eq!(result.unwrap_err().kind(), "StoreBusy");
        assert!(started.elapsed() >= Duration::from_millis(config::STORE_BUSY_RETRY_WINDOW_MS));
    }

    #[test]
    fn test_durable_errors_are_not_retried() {
        let mut attempts = 0;
        let result: Result<(), FilterError> = with_busy_retry(|| {
            attempts += 1;
            Err(FilterError::Store("corrupt".into()))
        });
        assert_eq!(result.unwrap_err().kind(), "Store");
        assert_eq!(attempts, 1);
    }
}
