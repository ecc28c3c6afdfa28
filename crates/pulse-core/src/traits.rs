//! Core traits for sync core abstractions.
//!
//! These traits define the interfaces that concrete implementations must
//! satisfy, enabling pluggable backends and testability.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::Result;

/// Result of a store integrity check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// True when every stored record parsed and the schema marker is current.
    pub is_valid: bool,
    /// Human-readable descriptions of every problem found.
    pub errors: Vec<String>,
    /// Number of records examined.
    pub records_checked: usize,
    /// Serialized size of the examined records, in bytes.
    pub estimated_bytes: u64,
}

impl IntegrityReport {
    /// A clean report over `records_checked` records.
    pub fn valid(records_checked: usize, estimated_bytes: u64) -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            records_checked,
            estimated_bytes,
        }
    }
}

/// Durable key→value store for named entity collections.
///
/// The store is the single source of truth for durable state: the bus and
/// synchronizer only hold transient, derivable state. Every successful write
/// publishes a `context.updated` event carrying the before/after
/// [`crate::ChangeEvent`].
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Read and deserialize a collection. Corrupt data is deleted and
    /// reported as absent rather than surfacing an error.
    async fn get(&self, key: &str) -> Result<Option<JsonValue>>;

    /// Serialize and durably write a collection, then publish the change.
    /// A serialization failure aborts with no side effects.
    async fn set(&self, key: &str, value: &JsonValue, source: &str) -> Result<()>;

    /// Mark a key as notify-worthy for sibling-process writes.
    async fn watch(&self, key: &str);

    /// Remove a key from the watched set. Safe to call at any time.
    async fn unwatch(&self, key: &str);

    /// Snapshot of the watched-key set.
    async fn watched_keys(&self) -> Vec<String>;

    /// Verify that every stored record parses and the schema marker is
    /// present and current.
    async fn validate_integrity(&self) -> Result<IntegrityReport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_report_valid_constructor() {
        let report = IntegrityReport::valid(4, 128);
        assert!(report.is_valid);
        assert!(report.errors.is_empty());
        assert_eq!(report.records_checked, 4);
        assert_eq!(report.estimated_bytes, 128);
    }

    #[test]
    fn test_context_store_is_object_safe() {
        fn assert_obj_safe(_: Option<&dyn ContextStore>) {}
        assert_obj_safe(None);
    }
}
