//! Context synchronizer.
//!
//! Keeps the reference lists between related collections consistent: when a
//! project lists a resource, that resource's `project_ids` must list the
//! project back. The synchronizer consumes `context.updated` events from
//! the bus, invokes callbacks registered for the changed collection, and
//! recomputes back-reference lists along a fixed dependency edge table.
//!
//! Propagation converges because back-references are written only when the
//! canonical JSON of the recomputed collection differs from what is stored.
//! Re-applying the same upstream change is therefore a no-op, and the write
//! a forward edge triggers is absorbed by the reverse edge's equality check
//! after one round trip.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pulse_core::events::{ChangeEvent, EventPayload, EventType};
use pulse_core::{ContextStore, Error, EventBus, Result, Subscription};

/// Callback invoked with the full new value of a registered collection.
pub type ContextCallback = Arc<dyn Fn(&JsonValue) + Send + Sync>;

/// Write source recorded for propagated back-reference updates.
pub const PROPAGATION_SOURCE: &str = "context_sync";

// ============================================================================
// Dependency edges
// ============================================================================

/// One directed propagation rule: when `source` changes, recompute
/// `dependent_backref_field` on every record of `dependent` from the
/// `source_ref_field` values found in `source`.
#[derive(Debug, Clone)]
pub struct DependencyEdge {
    pub source: String,
    pub dependent: String,
    /// Field on source records holding the referenced ids. Either a string
    /// scalar or an array of strings.
    pub source_ref_field: String,
    /// Back-reference list field maintained on dependent records.
    pub dependent_backref_field: String,
}

impl DependencyEdge {
    pub fn new(
        source: &str,
        dependent: &str,
        source_ref_field: &str,
        dependent_backref_field: &str,
    ) -> Self {
        Self {
            source: source.to_string(),
            dependent: dependent.to_string(),
            source_ref_field: source_ref_field.to_string(),
            dependent_backref_field: dependent_backref_field.to_string(),
        }
    }
}

/// The built-in workspace edge table. Bidirectional pairs are expressed as
/// two directed edges; tasks only propagate into projects.
pub fn default_edges() -> Vec<DependencyEdge> {
    vec![
        DependencyEdge::new("projects", "resources", "resource_ids", "project_ids"),
        DependencyEdge::new("resources", "projects", "project_ids", "resource_ids"),
        DependencyEdge::new("projects", "stakeholders", "stakeholder_ids", "project_ids"),
        DependencyEdge::new("stakeholders", "projects", "project_ids", "stakeholder_ids"),
        DependencyEdge::new("tasks", "projects", "project_id", "task_ids"),
    ]
}

/// Recompute the dependent collection's back-reference lists from the
/// source collection. Returns `None` when every list already matches, so
/// callers can skip the write entirely.
pub fn recompute_backrefs(
    edge: &DependencyEdge,
    source_records: &[JsonValue],
    dependent_records: &[JsonValue],
) -> Option<Vec<JsonValue>> {
    // dependent id -> sorted list of source ids referencing it
    let mut backrefs: HashMap<String, Vec<String>> = HashMap::new();
    for record in source_records {
        let Some(source_id) = record.get("id").and_then(JsonValue::as_str) else {
            continue;
        };
        for target in referenced_ids(record.get(&edge.source_ref_field)) {
            backrefs.entry(target).or_default().push(source_id.to_string());
        }
    }
    for ids in backrefs.values_mut() {
        ids.sort();
        ids.dedup();
    }

    let mut changed = false;
    let next: Vec<JsonValue> = dependent_records
        .iter()
        .map(|record| {
            let Some(id) = record.get("id").and_then(JsonValue::as_str) else {
                return record.clone();
            };
            let expected: Vec<String> = backrefs.remove(id).unwrap_or_default();
            let current: Vec<String> =
                referenced_ids(record.get(&edge.dependent_backref_field));
            if current == expected {
                return record.clone();
            }
            changed = true;
            let mut updated = record.clone();
            if let Some(obj) = updated.as_object_mut() {
                obj.insert(
                    edge.dependent_backref_field.clone(),
                    JsonValue::Array(expected.into_iter().map(JsonValue::String).collect()),
                );
            }
            updated
        })
        .collect();

    changed.then_some(next)
}

/// Ids held by a reference field: a string scalar yields one id, an array
/// yields its string elements, anything else yields none.
fn referenced_ids(field: Option<&JsonValue>) -> Vec<String> {
    match field {
        Some(JsonValue::String(s)) => vec![s.clone()],
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}

// ============================================================================
// Synchronizer
// ============================================================================

type CallbackMap = HashMap<String, Vec<(Uuid, ContextCallback)>>;

/// Guard for one registered context callback. Call
/// [`ContextRegistration::unregister`] to remove it.
pub struct ContextRegistration {
    callbacks: Arc<Mutex<CallbackMap>>,
    name: String,
    id: Uuid,
}

impl ContextRegistration {
    pub fn unregister(self) {
        let mut callbacks = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(entries) = callbacks.get_mut(&self.name) {
            entries.retain(|(id, _)| *id != self.id);
            if entries.is_empty() {
                callbacks.remove(&self.name);
            }
        }
    }
}

/// Handle for controlling a running synchronizer.
pub struct SynchronizerHandle {
    shutdown_tx: mpsc::Sender<()>,
    subscription: Subscription,
}

impl SynchronizerHandle {
    /// Detach from the bus and stop the propagation task.
    pub async fn shutdown(self) -> Result<()> {
        self.subscription.unsubscribe();
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }
}

/// Propagates collection changes across the dependency edge table.
#[derive(Clone)]
pub struct ContextSynchronizer {
    store: Arc<dyn ContextStore>,
    edges: Arc<Vec<DependencyEdge>>,
    callbacks: Arc<Mutex<CallbackMap>>,
}

impl ContextSynchronizer {
    pub fn new(store: Arc<dyn ContextStore>, edges: Vec<DependencyEdge>) -> Self {
        Self {
            store,
            edges: Arc::new(edges),
            callbacks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a callback invoked with the full new value whenever the
    /// named collection changes.
    pub fn register_context<F>(&self, name: &str, callback: F) -> ContextRegistration
    where
        F: Fn(&JsonValue) + Send + Sync + 'static,
    {
        let id = pulse_core::new_v7();
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        debug!(subsystem = "sync", component = "context", collection = name, "Context callback registered");
        ContextRegistration {
            callbacks: Arc::clone(&self.callbacks),
            name: name.to_string(),
            id,
        }
    }

    /// Subscribe to the bus and spawn the propagation task. The bus
    /// callback only forwards the change into a channel; the store I/O
    /// happens on the task.
    pub fn start(self, bus: &EventBus) -> SynchronizerHandle {
        let (tx, mut rx) = mpsc::unbounded_channel::<ChangeEvent>();
        let subscription = bus.subscribe_from(
            EventType::ContextUpdated,
            move |event| {
                if let EventPayload::ContextChange { change } = &event.payload {
                    // Receiver gone means the task shut down first.
                    let _ = tx.send(change.clone());
                }
                Ok(())
            },
            Some("context_sync"),
        );

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        info!(
            subsystem = "sync",
            component = "context",
            edges = self.edges.len(),
            "Context synchronizer started"
        );

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!(subsystem = "sync", component = "context", "Context synchronizer stopped");
                        break;
                    }
                    maybe = rx.recv() => {
                        match maybe {
                            Some(change) => self.apply_change(&change).await,
                            None => break,
                        }
                    }
                }
            }
        });

        SynchronizerHandle {
            shutdown_tx,
            subscription,
        }
    }

    async fn apply_change(&self, change: &ChangeEvent) {
        let value = match &change.new_value {
            Some(v) => Some(v.clone()),
            // External notifications may omit the value; re-read it.
            None => match self.store.get(&change.key).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(
                        subsystem = "sync",
                        component = "context",
                        key = %change.key,
                        error = %e,
                        "Failed to read changed collection"
                    );
                    return;
                }
            },
        };
        let Some(value) = value else {
            return;
        };

        self.invoke_callbacks(&change.key, &value);

        let Some(source_records) = value.as_array() else {
            return;
        };

        for edge in self.edges.iter().filter(|e| e.source == change.key) {
            if let Err(e) = self.propagate_edge(edge, source_records).await {
                warn!(
                    subsystem = "sync",
                    component = "context",
                    source = %edge.source,
                    dependent = %edge.dependent,
                    error = %e,
                    "Back-reference propagation failed"
                );
            }
        }
    }

    fn invoke_callbacks(&self, key: &str, value: &JsonValue) {
        // Snapshot under the lock, invoke outside it.
        let snapshot: Vec<ContextCallback> = {
            let callbacks = self
                .callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            callbacks
                .get(key)
                .map(|entries| entries.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default()
        };
        for callback in snapshot {
            callback(value);
        }
    }

    async fn propagate_edge(&self, edge: &DependencyEdge, source_records: &[JsonValue]) -> Result<()> {
        let dependent_records: Vec<JsonValue> = match self.store.get(&edge.dependent).await? {
            Some(JsonValue::Array(records)) => records,
            _ => return Ok(()),
        };

        if let Some(updated) = recompute_backrefs(edge, source_records, &dependent_records) {
            debug!(
                subsystem = "sync",
                component = "context",
                source = %edge.source,
                dependent = %edge.dependent,
                "Writing recomputed back-references"
            );
            self.store
                .set(&edge.dependent, &JsonValue::Array(updated), PROPAGATION_SOURCE)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn edge() -> DependencyEdge {
        DependencyEdge::new("projects", "resources", "resource_ids", "project_ids")
    }

    #[test]
    fn test_backref_appears_on_referenced_record() {
        let projects = vec![json!({ "id": "p1", "resource_ids": ["r1"] })];
        let resources = vec![json!({ "id": "r1", "project_ids": [] })];

        let updated = recompute_backrefs(&edge(), &projects, &resources).unwrap();
        assert_eq!(updated[0]["project_ids"], json!(["p1"]));
    }

    #[test]
    fn test_backref_removed_when_reference_dropped() {
        let projects = vec![json!({ "id": "p1", "resource_ids": [] })];
        let resources = vec![json!({ "id": "r1", "project_ids": ["p1"] })];

        let updated = recompute_backrefs(&edge(), &projects, &resources).unwrap();
        assert_eq!(updated[0]["project_ids"], json!([]));
    }

    #[test]
    fn test_consistent_state_yields_no_write() {
        let projects = vec![json!({ "id": "p1", "resource_ids": ["r1"] })];
        let resources = vec![json!({ "id": "r1", "project_ids": ["p1"] })];

        assert!(recompute_backrefs(&edge(), &projects, &resources).is_none());
    }

    #[test]
    fn test_backrefs_are_sorted_and_deduped() {
        let projects = vec![
            json!({ "id": "p2", "resource_ids": ["r1"] }),
            json!({ "id": "p1", "resource_ids": ["r1", "r1"] }),
        ];
        let resources = vec![json!({ "id": "r1" })];

        let updated = recompute_backrefs(&edge(), &projects, &resources).unwrap();
        assert_eq!(updated[0]["project_ids"], json!(["p1", "p2"]));
    }

    #[test]
    fn test_scalar_reference_field() {
        let tasks_edge = DependencyEdge::new("tasks", "projects", "project_id", "task_ids");
        let tasks = vec![
            json!({ "id": "t1", "project_id": "p1" }),
            json!({ "id": "t2", "project_id": "p1" }),
        ];
        let projects = vec![json!({ "id": "p1", "task_ids": ["t1"] })];

        let updated = recompute_backrefs(&tasks_edge, &tasks, &projects).unwrap();
        assert_eq!(updated[0]["task_ids"], json!(["t1", "t2"]));
    }

    #[test]
    fn test_records_without_id_pass_through() {
        let projects = vec![json!({ "resource_ids": ["r1"] })];
        let resources = vec![json!({ "name": "orphan" })];
        assert!(recompute_backrefs(&edge(), &projects, &resources).is_none());
    }

    #[test]
    fn test_default_edge_table_shape() {
        let edges = default_edges();
        assert_eq!(edges.len(), 5);
        // Every source and dependent is an expected collection.
        for edge in &edges {
            assert!(pulse_core::defaults::EXPECTED_COLLECTIONS.contains(&edge.source.as_str()));
            assert!(pulse_core::defaults::EXPECTED_COLLECTIONS.contains(&edge.dependent.as_str()));
        }
    }
}
