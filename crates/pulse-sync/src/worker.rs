//! Remote sync worker.
//!
//! Periodically pulls authoritative records from a [`RemoteSource`], writes
//! them into the context store, and emits per-entity update, removal, and
//! deadline events. The loop is connectivity-aware: while offline the
//! interval is paused entirely, and the Offline→Online transition triggers
//! one immediate catch-up pass before the interval resumes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use pulse_core::events::{EventPayload, EventType};
use pulse_core::{defaults, ContextStore, Error, EventBus, Result};

use crate::connectivity::ConnectivityMonitor;
use crate::remote::RemoteSource;

/// Source tag on lifecycle events emitted by the worker.
const WORKER_SOURCE: &str = "sync_worker";

// ============================================================================
// Configuration
// ============================================================================

/// Sync worker configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Interval between timed sync passes.
    pub interval: Duration,
    /// Actor whose accessible collections are synchronized.
    pub actor: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(defaults::SYNC_INTERVAL_MS),
            actor: "default".to_string(),
        }
    }
}

impl SyncConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `SYNC_INTERVAL_MS` | `30000` | Interval between sync passes (floor 5000) |
    /// | `SYNC_ACTOR` | `default` | Actor whose collections are synced |
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = std::env::var("SYNC_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.interval = Duration::from_millis(ms.max(defaults::SYNC_MIN_INTERVAL_MS));
        }
        if let Ok(actor) = std::env::var("SYNC_ACTOR") {
            config.actor = actor;
        }
        config
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_actor(mut self, actor: &str) -> Self {
        self.actor = actor.to_string();
        self
    }
}

// ============================================================================
// State machine
// ============================================================================

/// Worker state. `Offline` is reachable from anywhere on connectivity loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Offline,
    Connecting,
    Syncing,
    Idle,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncState::Offline => "offline",
            SyncState::Connecting => "connecting",
            SyncState::Syncing => "syncing",
            SyncState::Idle => "idle",
        };
        f.write_str(name)
    }
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub collections: usize,
    pub records: usize,
    pub duration_ms: u64,
}

// ============================================================================
// Worker
// ============================================================================

struct WorkerInner {
    store: Arc<dyn ContextStore>,
    bus: EventBus,
    remote: Arc<dyn RemoteSource>,
    connectivity: ConnectivityMonitor,
    actor: String,
    interval_ms: AtomicU64,
    state: Mutex<SyncState>,
    /// Per-collection ids seen in the last successful fetch, for delete
    /// detection.
    seen: Mutex<HashMap<String, HashSet<String>>>,
}

impl WorkerInner {
    fn set_state(&self, state: SyncState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn state(&self) -> SyncState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One full pass: resolve collections, pull each, write through, emit
    /// entity-level events. Leaves the worker in `Idle` (or `Offline` if
    /// connectivity dropped mid-pass).
    async fn sync_once(&self) -> Result<SyncStats> {
        let started = std::time::Instant::now();
        self.set_state(SyncState::Connecting);
        self.bus
            .emit(EventType::SyncStarted, Some(EventPayload::Empty), WORKER_SOURCE);

        let result = self.sync_pass().await;

        self.set_state(if self.connectivity.is_online() {
            SyncState::Idle
        } else {
            SyncState::Offline
        });

        let (collections, records) = result?;
        let stats = SyncStats {
            collections,
            records,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            subsystem = "sync",
            component = "worker",
            collections = stats.collections,
            record_count = stats.records,
            duration_ms = stats.duration_ms,
            "Sync pass completed"
        );
        self.bus.emit(
            EventType::SyncCompleted,
            Some(EventPayload::SyncRun {
                collections: stats.collections,
                records: stats.records,
                duration_ms: stats.duration_ms,
            }),
            WORKER_SOURCE,
        );
        Ok(stats)
    }

    async fn sync_pass(&self) -> Result<(usize, usize)> {
        let collections = self.remote.accessible_collections(&self.actor).await?;
        self.set_state(SyncState::Syncing);

        let mut records = 0;
        for collection in &collections {
            records += self.sync_collection(collection).await?;
        }
        Ok((collections.len(), records))
    }

    async fn sync_collection(&self, collection: &str) -> Result<usize> {
        let records = self.remote.fetch_records(collection).await?;
        self.store
            .set(
                collection,
                &JsonValue::Array(records.clone()),
                defaults::REMOTE_SYNC_SOURCE,
            )
            .await?;

        let update_type = EventType::update_for_collection(collection);
        let mut current_ids = HashSet::new();
        let now = Utc::now();
        for record in &records {
            let Some(id) = record.get("id").and_then(JsonValue::as_str) else {
                continue;
            };
            current_ids.insert(id.to_string());
            self.bus.emit(
                update_type,
                Some(EventPayload::Entity {
                    collection: collection.to_string(),
                    id: id.to_string(),
                    record: record.clone(),
                }),
                defaults::REMOTE_SYNC_SOURCE,
            );
            if let Some((event_type, payload)) = deadline_event(collection, record, now) {
                self.bus.emit(event_type, Some(payload), defaults::REMOTE_SYNC_SOURCE);
            }
        }

        // Ids present last time but absent now were deleted remotely.
        let previous = {
            let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
            seen.insert(collection.to_string(), current_ids.clone())
        };
        if let Some(previous) = previous {
            let removal_type = EventType::removal_for_collection(collection);
            let mut removed: Vec<&String> = previous.difference(&current_ids).collect();
            removed.sort();
            for id in removed {
                debug!(
                    subsystem = "sync",
                    component = "worker",
                    collection,
                    entity_id = %id,
                    "Entity removed remotely"
                );
                self.bus.emit(
                    removal_type,
                    Some(EventPayload::EntityRemoved {
                        collection: collection.to_string(),
                        id: id.clone(),
                    }),
                    defaults::REMOTE_SYNC_SOURCE,
                );
            }
        }

        Ok(records.len())
    }

    /// Timed-tick wrapper: failures are logged and emitted, never fatal.
    async fn tick(&self) {
        if let Err(e) = self.sync_once().await {
            warn!(
                subsystem = "sync",
                component = "worker",
                error = %e,
                "Sync pass failed"
            );
            self.bus.emit(
                EventType::SyncFailed,
                Some(EventPayload::SyncFailure {
                    message: e.to_string(),
                }),
                WORKER_SOURCE,
            );
        }
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut online_rx = self.connectivity.subscribe();

        info!(
            subsystem = "sync",
            component = "worker",
            actor = %self.actor,
            interval_ms = self.interval_ms.load(Ordering::Relaxed),
            online = *online_rx.borrow(),
            "Sync worker started"
        );

        // Catch up right away when starting online.
        if *online_rx.borrow() {
            self.tick().await;
        } else {
            self.set_state(SyncState::Offline);
        }

        loop {
            if *online_rx.borrow() {
                let interval =
                    Duration::from_millis(self.interval_ms.load(Ordering::Relaxed));
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    changed = online_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if !*online_rx.borrow() {
                            self.set_state(SyncState::Offline);
                            warn!(
                                subsystem = "sync",
                                component = "worker",
                                "Connection lost, sync paused"
                            );
                            self.bus.emit(
                                EventType::ConnectionLost,
                                Some(EventPayload::Connectivity { online: false }),
                                WORKER_SOURCE,
                            );
                        }
                    }
                    _ = tokio::time::sleep(interval) => {
                        self.tick().await;
                    }
                }
            } else {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    changed = online_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *online_rx.borrow() {
                            info!(
                                subsystem = "sync",
                                component = "worker",
                                "Connection restored, catching up"
                            );
                            self.bus.emit(
                                EventType::ConnectionRestored,
                                Some(EventPayload::Connectivity { online: true }),
                                WORKER_SOURCE,
                            );
                            self.tick().await;
                        }
                    }
                }
            }
        }

        info!(subsystem = "sync", component = "worker", "Sync worker stopped");
    }
}

/// Connectivity-aware remote sync loop.
pub struct SyncWorker {
    inner: Arc<WorkerInner>,
}

impl SyncWorker {
    pub fn new(
        store: Arc<dyn ContextStore>,
        bus: EventBus,
        remote: Arc<dyn RemoteSource>,
        connectivity: ConnectivityMonitor,
        config: SyncConfig,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                store,
                bus,
                remote,
                connectivity,
                actor: config.actor,
                interval_ms: AtomicU64::new(config.interval.as_millis() as u64),
                state: Mutex::new(SyncState::Offline),
                seen: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Spawn the loop and return a handle for control.
    pub fn start(self) -> SyncHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(inner.run(shutdown_rx));
        SyncHandle {
            shutdown_tx,
            inner: self.inner,
        }
    }
}

/// Handle for controlling a running sync worker.
pub struct SyncHandle {
    shutdown_tx: mpsc::Sender<()>,
    inner: Arc<WorkerInner>,
}

impl SyncHandle {
    /// Signal the worker to shut down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Current worker state.
    pub fn state(&self) -> SyncState {
        self.inner.state()
    }

    /// Whether the connectivity flag currently reads online.
    pub fn connection_status(&self) -> bool {
        self.inner.connectivity.is_online()
    }

    /// Run one sync pass now. Unlike timed ticks, errors propagate to the
    /// caller. Fails immediately while offline.
    pub async fn force_sync(&self) -> Result<SyncStats> {
        if !self.inner.connectivity.is_online() {
            return Err(Error::Connectivity(
                "sync requested while offline".to_string(),
            ));
        }
        self.inner.sync_once().await
    }

    /// Adjust the tick interval, clamped to the 5 second floor. Takes
    /// effect on the next loop iteration.
    pub fn set_sync_frequency(&self, interval_ms: u64) {
        let clamped = interval_ms.max(defaults::SYNC_MIN_INTERVAL_MS);
        self.inner.interval_ms.store(clamped, Ordering::Relaxed);
        debug!(
            subsystem = "sync",
            component = "worker",
            interval_ms = clamped,
            "Sync interval updated"
        );
    }
}

/// Deadline alert for one record, from its `deadline` field (RFC 3339).
/// Remaining whole calendar days in `(0, 7]` flags approaching; a negative
/// count flags overdue; exactly zero (due today) flags neither.
pub fn deadline_event(
    collection: &str,
    record: &JsonValue,
    now: DateTime<Utc>,
) -> Option<(EventType, EventPayload)> {
    let id = record.get("id")?.as_str()?;
    let raw = record.get("deadline")?.as_str()?;
    let deadline = DateTime::parse_from_rfc3339(raw).ok()?.with_timezone(&Utc);

    let days_remaining = (deadline.date_naive() - now.date_naive()).num_days();
    let event_type = if days_remaining < 0 {
        EventType::DeadlineOverdue
    } else if days_remaining > 0 && days_remaining <= defaults::DEADLINE_WARNING_DAYS {
        EventType::DeadlineApproaching
    } else {
        return None;
    };

    Some((
        event_type,
        EventPayload::Deadline {
            collection: collection.to_string(),
            id: id.to_string(),
            name: record
                .get("name")
                .and_then(JsonValue::as_str)
                .map(String::from),
            deadline,
            days_remaining,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MockRemoteSource;
    use pulse_store::MemoryContextStore;
    use serde_json::json;

    fn setup(
        online: bool,
    ) -> (
        EventBus,
        Arc<MemoryContextStore>,
        Arc<MockRemoteSource>,
        ConnectivityMonitor,
        SyncHandle,
    ) {
        let bus = EventBus::default();
        let store = Arc::new(MemoryContextStore::new());
        let remote = Arc::new(MockRemoteSource::new());
        remote.set_collection("tasks", vec![json!({ "id": "t1" }), json!({ "id": "t2" })]);
        let connectivity = ConnectivityMonitor::new(online);
        let worker = SyncWorker::new(
            store.clone(),
            bus.clone(),
            remote.clone(),
            connectivity.clone(),
            SyncConfig::default().with_interval(Duration::from_secs(30)),
        );
        let handle = worker.start();
        (bus, store, remote, connectivity, handle)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_catch_up_writes_store_and_emits_events() {
        let (bus, store, _remote, _conn, handle) = setup(true);
        settle().await;

        assert_eq!(handle.state(), SyncState::Idle);
        let stored = store.get("tasks").await.unwrap().unwrap();
        assert_eq!(stored.as_array().unwrap().len(), 2);

        assert_eq!(bus.event_history(Some(EventType::SyncStarted), None).len(), 1);
        assert_eq!(bus.event_history(Some(EventType::SyncCompleted), None).len(), 1);
        assert_eq!(bus.event_history(Some(EventType::TaskUpdated), None).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_pauses_interval_and_resume_catches_up() {
        let (bus, _store, remote, connectivity, handle) = setup(true);
        settle().await;
        let baseline = remote.fetch_count();
        assert!(baseline >= 1);

        connectivity.set_online(false);
        settle().await;
        assert_eq!(handle.state(), SyncState::Offline);
        assert!(!handle.connection_status());
        assert_eq!(
            bus.event_history(Some(EventType::ConnectionLost), None).len(),
            1
        );

        // Interval elapses repeatedly while offline: no fetches.
        tokio::time::advance(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(remote.fetch_count(), baseline);
        // One outage, one warning.
        assert_eq!(
            bus.event_history(Some(EventType::ConnectionLost), None).len(),
            1
        );

        // Restore: one immediate catch-up pass before the interval restarts.
        connectivity.set_online(true);
        settle().await;
        assert_eq!(
            bus.event_history(Some(EventType::ConnectionRestored), None).len(),
            1
        );
        assert_eq!(remote.fetch_count(), baseline + 1);
        assert_eq!(handle.state(), SyncState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_tick_failure_emits_sync_failed_and_loop_survives() {
        let (bus, _store, remote, _conn, handle) = setup(true);
        settle().await;

        remote.set_fail(true);
        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;
        assert_eq!(bus.event_history(Some(EventType::SyncFailed), None).len(), 1);
        assert_eq!(handle.state(), SyncState::Idle);

        // Loop is still alive and recovers.
        remote.set_fail(false);
        let stats = handle.force_sync().await.unwrap();
        assert_eq!(stats.collections, 1);
        assert_eq!(stats.records, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_sync_propagates_errors_and_fails_offline() {
        let (_bus, _store, remote, connectivity, handle) = setup(true);
        settle().await;

        remote.set_fail(true);
        assert!(matches!(
            handle.force_sync().await,
            Err(Error::Connectivity(_))
        ));

        connectivity.set_online(false);
        settle().await;
        assert!(matches!(
            handle.force_sync().await,
            Err(Error::Connectivity(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_detection_emits_removals() {
        let (bus, _store, remote, _conn, handle) = setup(true);
        settle().await;

        remote.set_collection("tasks", vec![json!({ "id": "t1" })]);
        handle.force_sync().await.unwrap();

        let removals = bus.event_history(Some(EventType::TaskDeleted), None);
        assert_eq!(removals.len(), 1);
        match &removals[0].payload {
            EventPayload::EntityRemoved { collection, id } => {
                assert_eq!(collection, "tasks");
                assert_eq!(id, "t2");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_sync_frequency_clamps_to_floor() {
        let (_bus, _store, _remote, _conn, handle) = setup(true);
        handle.set_sync_frequency(10);
        assert_eq!(
            handle.inner.interval_ms.load(Ordering::Relaxed),
            defaults::SYNC_MIN_INTERVAL_MS
        );
        handle.set_sync_frequency(60_000);
        assert_eq!(handle.inner.interval_ms.load(Ordering::Relaxed), 60_000);
    }

    #[test]
    fn test_deadline_event_windows() {
        let now = Utc::now();
        let record = |days: i64| {
            json!({
                "id": "p1",
                "name": "Launch",
                "deadline": (now + chrono::Duration::days(days)).to_rfc3339(),
            })
        };

        let (ty, payload) = deadline_event("projects", &record(3), now).unwrap();
        assert_eq!(ty, EventType::DeadlineApproaching);
        match payload {
            EventPayload::Deadline { days_remaining, .. } => assert_eq!(days_remaining, 3),
            other => panic!("unexpected payload: {other:?}"),
        }

        let (ty, _) = deadline_event("projects", &record(-1), now).unwrap();
        assert_eq!(ty, EventType::DeadlineOverdue);

        // Due today and far-future are both quiet.
        assert!(deadline_event("projects", &record(0), now).is_none());
        assert!(deadline_event("projects", &record(8), now).is_none());

        // Missing or malformed deadlines are ignored.
        assert!(deadline_event("projects", &json!({ "id": "p1" }), now).is_none());
        assert!(deadline_event(
            "projects",
            &json!({ "id": "p1", "deadline": "next tuesday" }),
            now
        )
        .is_none());
    }
}
