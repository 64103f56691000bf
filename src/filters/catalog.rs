//! Remote filter catalog client.
//!
//! Fetches the versioned metadata payload (`{groups, filters, tags}`), the
//! per-language localization payload, and raw rule-list content. All HTTP
//! goes through the `CatalogFetcher` seam so the sync engine can be driven
//! against canned responses.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::FilterError;

/// Minimal HTTP seam: fetch a URL as text.
pub trait CatalogFetcher: Send + Sync + 'static {
    fn fetch_text(&self, url: &str) -> impl Future<Output = Result<String, String>> + Send;
}

/// Production fetcher backed by `reqwest`.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, FilterError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| FilterError::NetworkFetch {
                filter_id: None,
                reason: format!("HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }
}

impl CatalogFetcher for HttpFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String, String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("server returned {}", response.status()));
        }
        response.text().await.map_err(|e| e.to_string())
    }
}

// ---- Remote payload shapes ----

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogPayload {
    #[serde(default)]
    pub groups: Vec<CatalogGroup>,
    #[serde(default)]
    pub filters: Vec<CatalogFilter>,
    #[serde(default)]
    pub tags: Vec<CatalogTag>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogGroup {
    pub group_id: i64,
    pub group_name: String,
    #[serde(default)]
    pub display_number: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogFilter {
    pub filter_id: i64,
    pub group_id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub home_page: String,
    #[serde(default)]
    pub download_page: Option<String>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub display_number: i64,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub tags: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogTag {
    pub tag_id: i64,
    pub keyword: String,
}

/// Localized display fields for one entity in one language.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocalizedNames {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// `{groups: {id: {lang: fields}}, filters: {id: {lang: fields}}}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocalizationPayload {
    #[serde(default)]
    pub groups: HashMap<String, HashMap<String, LocalizedNames>>,
    #[serde(default)]
    pub filters: HashMap<String, HashMap<String, LocalizedNames>>,
}

impl LocalizationPayload {
    fn merge(&mut self, other: LocalizationPayload) {
        for (id, langs) in other.groups {
            self.groups.entry(id).or_default().extend(langs);
        }
        for (id, langs) in other.filters {
            self.filters.entry(id).or_default().extend(langs);
        }
    }
}

/// Endpoints and identification parameters for the remote catalog.
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub metadata_url: String,
    pub localization_url: String,
    /// `version` query parameter.
    pub app_version: String,
    /// `id` query parameter.
    pub app_id: String,
    /// `cid` query parameter.
    pub client_id: String,
}

/// Typed client over the catalog endpoints.
pub struct CatalogClient<F> {
    fetcher: Arc<F>,
    config: CatalogConfig,
}

impl<F> Clone for CatalogClient<F> {
    fn clone(&self) -> Self {
        Self {
            fetcher: Arc::clone(&self.fetcher),
            config: self.config.clone(),
        }
    }
}

impl<F: CatalogFetcher> CatalogClient<F> {
    pub fn new(fetcher: Arc<F>, config: CatalogConfig) -> Self {
        Self { fetcher, config }
    }

    fn query_url(&self, base: &str) -> String {
        format!(
            "{base}?version={}&id={}&cid={}",
            self.config.app_version, self.config.app_id, self.config.client_id
        )
    }

    /// Fetch and decode the full metadata payload.
    pub async fn metadata(&self) -> Result<CatalogPayload, FilterError> {
        let url = self.query_url(&self.config.metadata_url);
        let text =
            self.fetcher
                .fetch_text(&url)
                .await
                .map_err(|reason| FilterError::NetworkFetch {
                    filter_id: None,
                    reason,
                })?;
        serde_json::from_str(&text).map_err(|e| FilterError::NetworkFetch {
            filter_id: None,
            reason: format!("malformed metadata payload: {e}"),
        })
    }

    /// Fetch localizations for each requested language and merge them.
    /// A language that fails to fetch is skipped with a warning.
    pub async fn localizations(&self, languages: &[String]) -> LocalizationPayload {
        let mut merged = LocalizationPayload::default();
        for lang in languages {
            let url = format!(
                "{}&lang={lang}",
                self.query_url(&self.config.localization_url)
            );
            match self.fetcher.fetch_text(&url).await {
                Ok(text) => match serde_json::from_str::<LocalizationPayload>(&text) {
                    Ok(payload) => merged.merge(payload),
                    Err(e) => tracing::warn!("Malformed localization payload for {lang}: {e}"),
                },
                Err(e) => tracing::warn!("Localization fetch failed for {lang}: {e}"),
            }
        }
        merged
    }

    /// Fetch the rule text for a catalog filter from its download page.
    pub async fn filter_content(
        &self,
        filter_id: i64,
        download_page: &str,
    ) -> Result<String, FilterError> {
        if download_page.is_empty() {
            return Err(FilterError::MissingDownloadPage(filter_id));
        }
        self.fetcher
            .fetch_text(download_page)
            .await
            .map_err(|reason| FilterError::NetworkFetch {
                filter_id: Some(filter_id),
                reason,
            })
    }

    /// Fetch a custom subscription's rule text from a user-supplied URL.
    pub async fn subscription(
        &self,
        filter_id: Option<i64>,
        url: &str,
    ) -> Result<String, FilterError> {
        self.fetcher
            .fetch_text(url)
            .await
            .map_err(|reason| FilterError::NetworkFetch { filter_id, reason })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::MockFetcher;
    use super::*;

    fn client(fetcher: Arc<MockFetcher>) -> CatalogClient<MockFetcher> {
        CatalogClient::new(
            fetcher,
            CatalogConfig {
                metadata_url: "https://filters.example.org/meta.json".into(),
                localization_url: "https://filters.example.org/i18n.json".into(),
                app_version: "1.0".into(),
                app_id: "dnsguard".into(),
                client_id: "cid42".into(),
            },
        )
    }

    #[test]
    fn test_metadata_payload_decodes() {
        let json = r#"{
            "groups": [{"groupId": 1, "groupName": "Ad Blocking", "displayNumber": 1}],
            "filters": [{
                "filterId": 2,
                "groupId": 1,
                "name": "Base Filter",
                "description": "Blocks ads",
                "homePage": "https://example.org",
                "downloadPage": "https://filters.example.org/2.txt",
                "version": "2.0.1",
                "displayNumber": 1,
                "languages": ["en"],
                "tags": [10]
            }],
            "tags": [{"tagId": 10, "keyword": "purpose:ads"}]
        }"#;
        let payload: CatalogPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.groups.len(), 1);
        assert_eq!(payload.filters[0].filter_id, 2);
        assert_eq!(
            payload.filters[0].download_page.as_deref(),
            Some("https://filters.example.org/2.txt")
        );
        assert_eq!(payload.tags[0].keyword, "purpose:ads");
    }

    #[tokio::test]
    async fn test_metadata_url_carries_identification_params() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond("https://filters.example.org/meta.json", "{}");
        let client = client(Arc::clone(&fetcher));

        client.metadata().await.unwrap();
        let calls = fetcher.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].contains("version=1.0"));
        assert!(calls[0].contains("id=dnsguard"));
        assert!(calls[0].contains("cid=cid42"));
    }

    #[tokio::test]
    async fn test_localizations_merge_and_soft_fail() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond(
            "https://filters.example.org/i18n.json",
            r#"{"groups": {"1": {"de": {"name": "Werbeblocker"}}}, "filters": {}}"#,
        );
        let client = client(Arc::clone(&fetcher));

        // Both languages hit the same endpoint here; a failing language
        // would simply be skipped.
        let merged = client
            .localizations(&["de".to_string(), "fr".to_string()])
            .await;
        assert_eq!(
            merged.groups["1"]["de"].name.as_deref(),
            Some("Werbeblocker")
        );
        let calls = fetcher.calls();
        assert!(calls.iter().any(|c| c.contains("lang=de")));
        assert!(calls.iter().any(|c| c.contains("lang=fr")));
    }

    #[tokio::test]
    async fn test_filter_content_requires_download_page() {
        let fetcher = Arc::new(MockFetcher::new());
        let client = client(fetcher);
        let err = client.filter_content(5, "").await.unwrap_err();
        assert_eq!(err.kind(), "MissingDownloadPage");
    }

    #[tokio::test]
    async fn test_fetch_failures_carry_filter_id() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.fail("https://filters.example.org/7.txt", "offline");
        let client = client(fetcher);

        let err = client
            .filter_content(7, "https://filters.example.org/7.txt")
            .await
            .unwrap_err();
        match err {
            FilterError::NetworkFetch { filter_id, reason } => {
                assert_eq!(filter_id, Some(7));
                assert_eq!(reason, "offline");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
