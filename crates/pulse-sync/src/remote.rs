//! Remote record sources.
//!
//! The sync worker pulls authoritative records from a [`RemoteSource`].
//! `HttpRemoteSource` talks to the hosted workspace API; `MockRemoteSource`
//! serves canned collections for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value as JsonValue;
use tracing::debug;

use pulse_core::{defaults, Error, Result};

/// Authoritative source of workspace records.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Collection names the given actor may read.
    async fn accessible_collections(&self, actor: &str) -> Result<Vec<String>>;

    /// Full record set for one collection.
    async fn fetch_records(&self, collection: &str) -> Result<Vec<JsonValue>>;
}

/// HTTP implementation over the workspace API.
pub struct HttpRemoteSource {
    client: Client,
    base_url: String,
}

impl HttpRemoteSource {
    /// Create the source. `base_url` is used without its trailing slash.
    pub fn new(base_url: &str) -> Result<Self> {
        let timeout = std::env::var("REMOTE_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::REMOTE_REQUEST_TIMEOUT_SECS);

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RemoteSource for HttpRemoteSource {
    async fn accessible_collections(&self, actor: &str) -> Result<Vec<String>> {
        let url = format!("{}/api/actors/{}/collections", self.base_url, actor);
        debug!(subsystem = "sync", url = %url, "Resolving accessible collections");
        let response = self.client.get(&url).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }

    async fn fetch_records(&self, collection: &str) -> Result<Vec<JsonValue>> {
        let url = format!("{}/api/collections/{}/records", self.base_url, collection);
        debug!(subsystem = "sync", url = %url, collection, "Fetching records");
        let response = self.client.get(&url).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }
}

/// Canned remote source for tests.
#[derive(Default)]
pub struct MockRemoteSource {
    collections: Mutex<HashMap<String, Vec<JsonValue>>>,
    fail: AtomicBool,
    fetch_count: AtomicUsize,
}

impl MockRemoteSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the record set served for one collection.
    pub fn set_collection(&self, name: &str, records: Vec<JsonValue>) {
        self.collections
            .lock()
            .unwrap()
            .insert(name.to_string(), records);
    }

    /// Make every call fail with a connectivity error.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Total `fetch_records` calls served.
    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }

    fn check_fail(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Connectivity("simulated remote failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteSource for MockRemoteSource {
    async fn accessible_collections(&self, _actor: &str) -> Result<Vec<String>> {
        self.check_fail()?;
        let mut names: Vec<String> = self.collections.lock().unwrap().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn fetch_records(&self, collection: &str) -> Result<Vec<JsonValue>> {
        self.check_fail()?;
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .collections
            .lock()
            .unwrap()
            .get(collection)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_mock_serves_sorted_collections() {
        let remote = MockRemoteSource::new();
        remote.set_collection("tasks", vec![json!({"id": "t1"})]);
        remote.set_collection("projects", vec![]);

        let names = remote.accessible_collections("anyone").await.unwrap();
        assert_eq!(names, vec!["projects".to_string(), "tasks".to_string()]);

        let records = remote.fetch_records("tasks").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(remote.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_failure_mode() {
        let remote = MockRemoteSource::new();
        remote.set_fail(true);
        assert!(remote.accessible_collections("anyone").await.is_err());
        assert!(remote.fetch_records("tasks").await.is_err());
        assert_eq!(remote.fetch_count(), 0);
    }

    #[test]
    fn test_http_source_trims_trailing_slash() {
        let source = HttpRemoteSource::new("https://api.example.com/").unwrap();
        assert_eq!(source.base_url, "https://api.example.com");
    }
}
