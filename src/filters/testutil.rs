//! Mock catalog fetcher shared by the filter subsystem tests.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::filters::catalog::CatalogFetcher;

/// Serves canned responses keyed by URL. A request matches its entry
/// exactly or by prefix, so tests don't have to spell out query strings.
pub struct MockFetcher {
    responses: Mutex<HashMap<String, Result<String, String>>>,
    calls: Mutex<Vec<String>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn respond(&self, url: &str, body: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), Ok(body.to_string()));
    }

    pub fn fail(&self, url: &str, reason: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), Err(reason.to_string()));
    }

    pub fn forget(&self, url: &str) {
        self.responses.lock().unwrap().remove(url);
    }

    /// Every URL fetched, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl CatalogFetcher for MockFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String, String> {
        self.calls.lock().unwrap().push(url.to_string());
        let responses = self.responses.lock().unwrap();
        if let Some(result) = responses.get(url) {
            return result.clone();
        }
        // Longest matching prefix wins, so a scripted endpoint beats a
        // scripted site root.
        responses
            .iter()
            .filter(|(key, _)| url.starts_with(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, result)| result.clone())
            .unwrap_or_else(|| Err(format!("no response scripted for {url}")))
    }
}
