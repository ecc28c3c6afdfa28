//! In-memory [`ContextStore`] for tests.
//!
//! Stores values as serialized JSON strings, matching the PostgreSQL
//! store's on-disk shape, so corrupt-value behavior can be exercised by
//! injecting unparseable strings. Counts writes so idempotence tests can
//! assert "zero writes", and can simulate a sibling process's write.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::warn;

use pulse_core::events::{ChangeEvent, EventPayload, EventType};
use pulse_core::{defaults, ContextStore, Error, EventBus, IntegrityReport, Result};

/// In-memory context store backed by a mutex-guarded map.
#[derive(Default)]
pub struct MemoryContextStore {
    records: Mutex<HashMap<String, String>>,
    watched: Mutex<HashSet<String>>,
    write_count: AtomicUsize,
    fail_writes: std::sync::atomic::AtomicBool,
    bus: Option<EventBus>,
}

impl MemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that publishes `context.updated` on writes, like the
    /// PostgreSQL store does.
    pub fn with_bus(bus: EventBus) -> Self {
        Self {
            bus: Some(bus),
            ..Self::default()
        }
    }

    /// Total successful writes since creation.
    pub fn write_count(&self) -> usize {
        self.write_count.load(Ordering::SeqCst)
    }

    /// Make subsequent writes fail with a store error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Plant an unparseable value under `key`.
    pub fn inject_corrupt(&self, key: &str) {
        self.records
            .lock()
            .unwrap()
            .insert(key.to_string(), "{not json".to_string());
    }

    /// Write as if a sibling process did it: the value lands in storage and
    /// an `external_sync` change event is published, but our own write
    /// counter is untouched.
    pub fn simulate_external_write(&self, key: &str, value: &JsonValue) {
        let serialized = serde_json::to_string(value).unwrap();
        self.records
            .lock()
            .unwrap()
            .insert(key.to_string(), serialized);
        if let Some(bus) = &self.bus {
            bus.emit(
                EventType::ContextUpdated,
                Some(EventPayload::ContextChange {
                    change: ChangeEvent {
                        key: key.to_string(),
                        old_value: None,
                        new_value: Some(value.clone()),
                        timestamp: Utc::now(),
                        source: defaults::EXTERNAL_SYNC_SOURCE.to_string(),
                    },
                }),
                defaults::EXTERNAL_SYNC_SOURCE,
            );
        }
    }

    /// Raw stored text, for asserting on-disk shape.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.records.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl ContextStore for MemoryContextStore {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>> {
        let raw = self.records.lock().unwrap().get(key).cloned();
        let Some(raw) = raw else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(key, error = %e, "Corrupt value in memory store, deleting");
                self.records.lock().unwrap().remove(key);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: &JsonValue, source: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Store("simulated write failure".to_string()));
        }
        let serialized = serde_json::to_string(value)?;
        let old_raw = self
            .records
            .lock()
            .unwrap()
            .insert(key.to_string(), serialized);
        self.write_count.fetch_add(1, Ordering::SeqCst);

        if let Some(bus) = &self.bus {
            let old_value = old_raw.and_then(|raw| serde_json::from_str(&raw).ok());
            bus.emit(
                EventType::ContextUpdated,
                Some(EventPayload::ContextChange {
                    change: ChangeEvent {
                        key: key.to_string(),
                        old_value,
                        new_value: Some(value.clone()),
                        timestamp: Utc::now(),
                        source: source.to_string(),
                    },
                }),
                source,
            );
        }
        Ok(())
    }

    async fn watch(&self, key: &str) {
        self.watched.lock().unwrap().insert(key.to_string());
    }

    async fn unwatch(&self, key: &str) {
        self.watched.lock().unwrap().remove(key);
    }

    async fn watched_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.watched.lock().unwrap().iter().cloned().collect();
        keys.sort();
        keys
    }

    /// The in-memory store has no schema, so unlike the PostgreSQL store
    /// there is no version marker to verify; the scan covers stored values
    /// only.
    async fn validate_integrity(&self) -> Result<IntegrityReport> {
        let records = self.records.lock().unwrap().clone();
        let mut errors = Vec::new();
        let mut estimated_bytes: u64 = 0;
        for (key, raw) in &records {
            estimated_bytes += raw.len() as u64;
            if let Err(e) = serde_json::from_str::<JsonValue>(raw) {
                errors.push(format!("{key}: {e}"));
            }
        }
        errors.sort();
        Ok(IntegrityReport {
            is_valid: errors.is_empty(),
            errors,
            records_checked: records.len(),
            estimated_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_and_get_round_trip() {
        let store = MemoryContextStore::new();
        store
            .set("projects", &json!([{"id": "p1"}]), "test")
            .await
            .unwrap();
        let value = store.get("projects").await.unwrap().unwrap();
        assert_eq!(value[0]["id"], "p1");
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_value_is_evicted_on_read() {
        let store = MemoryContextStore::new();
        store.inject_corrupt("projects");
        assert!(store.get("projects").await.unwrap().is_none());
        assert!(store.raw("projects").is_none());
    }

    #[tokio::test]
    async fn test_integrity_reports_corrupt_records() {
        let store = MemoryContextStore::new();
        store.set("tasks", &json!([]), "test").await.unwrap();
        store.inject_corrupt("projects");
        let report = store.validate_integrity().await.unwrap();
        assert!(!report.is_valid);
        assert_eq!(report.records_checked, 2);
        assert!(report.estimated_bytes > 0);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("projects:"));
    }

    #[tokio::test]
    async fn test_set_emits_context_updated() {
        let bus = EventBus::default();
        let store = MemoryContextStore::with_bus(bus.clone());
        store.set("tasks", &json!([]), "remote_sync").await.unwrap();

        let history = bus.event_history(Some(EventType::ContextUpdated), None);
        assert_eq!(history.len(), 1);
        match &history[0].payload {
            EventPayload::ContextChange { change } => {
                assert_eq!(change.key, "tasks");
                assert_eq!(change.source, "remote_sync");
                assert!(change.old_value.is_none());
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_watch_and_unwatch() {
        let store = MemoryContextStore::new();
        store.watch("projects").await;
        store.watch("tasks").await;
        store.unwatch("projects").await;
        assert_eq!(store.watched_keys().await, vec!["tasks".to_string()]);
    }
}
