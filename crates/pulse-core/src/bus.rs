//! Typed publish/subscribe event bus.
//!
//! The bus owns the listener registry, a bounded most-recent-first event
//! history, a `(type, payload)` deduplication table, and one circuit breaker
//! per listener. Registry, history, dedup table, and breaker map sit behind a
//! single mutex; listener callbacks are invoked **outside** the lock from a
//! snapshot, so a slow or re-entrant callback never blocks other publishers.
//!
//! Failure semantics: a callback returning `Err` never aborts dispatch to
//! sibling listeners. Repeated failures open that listener's breaker, which
//! closes again purely by elapsed cooldown; there is no probe call. Callback
//! failures are re-published as `system.error` events on the next tick
//! (never when the failing type already is `system.error`).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::defaults;
use crate::error::Result;
use crate::events::{Event, EventPayload, EventType};

/// Listener callback. Return `Err` to record a failure against the
/// listener's circuit breaker.
pub type ListenerCallback = Arc<dyn Fn(&Event) -> Result<()> + Send + Sync>;

// ============================================================================
// Configuration
// ============================================================================

/// Event bus tuning knobs.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Maximum retained history entries.
    pub history_capacity: usize,
    /// Identical `(type, payload)` emissions within this window are dropped.
    pub dedup_window: Duration,
    /// Failures before a listener's breaker opens.
    pub max_failures: u32,
    /// Cooldown after the last failure before an open breaker closes.
    pub breaker_cooldown: Duration,
    /// Background sweep interval.
    pub sweep_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_capacity: defaults::EVENT_HISTORY_CAPACITY,
            dedup_window: Duration::from_millis(defaults::DEDUP_WINDOW_MS),
            max_failures: defaults::BREAKER_MAX_FAILURES,
            breaker_cooldown: Duration::from_millis(defaults::BREAKER_COOLDOWN_MS),
            sweep_interval: Duration::from_secs(defaults::BUS_SWEEP_INTERVAL_SECS),
        }
    }
}

impl BusConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `BUS_HISTORY_CAPACITY` | `256` | Retained history entries |
    /// | `BUS_DEDUP_WINDOW_MS` | `1000` | Duplicate suppression window |
    /// | `BUS_BREAKER_MAX_FAILURES` | `5` | Failures before a breaker opens |
    /// | `BUS_BREAKER_COOLDOWN_MS` | `30000` | Cooldown before reopen |
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = env_parse::<usize>("BUS_HISTORY_CAPACITY") {
            config.history_capacity = n.max(1);
        }
        if let Some(ms) = env_parse::<u64>("BUS_DEDUP_WINDOW_MS") {
            config.dedup_window = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<u32>("BUS_BREAKER_MAX_FAILURES") {
            config.max_failures = n.max(1);
        }
        if let Some(ms) = env_parse::<u64>("BUS_BREAKER_COOLDOWN_MS") {
            config.breaker_cooldown = Duration::from_millis(ms);
        }
        config
    }

    /// Set the duplicate suppression window.
    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    /// Set the failure threshold for circuit breakers.
    pub fn with_max_failures(mut self, max: u32) -> Self {
        self.max_failures = max.max(1);
        self
    }

    /// Set the breaker cooldown.
    pub fn with_breaker_cooldown(mut self, cooldown: Duration) -> Self {
        self.breaker_cooldown = cooldown;
        self
    }

    /// Set the retained history capacity.
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity.max(1);
        self
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|v| v.parse::<T>().ok())
}

// ============================================================================
// Internal state
// ============================================================================

/// Per-listener failure isolator.
#[derive(Debug, Clone, Default)]
struct CircuitBreaker {
    failures: u32,
    last_failure: Option<Instant>,
    is_open: bool,
}

impl CircuitBreaker {
    /// Close the breaker if its cooldown has elapsed. Returns whether the
    /// breaker is open afterwards.
    fn refresh(&mut self, now: Instant, cooldown: Duration) -> bool {
        if self.is_open {
            if let Some(last) = self.last_failure {
                if now.duration_since(last) > cooldown {
                    self.is_open = false;
                    self.failures = 0;
                }
            }
        }
        self.is_open
    }
}

struct ListenerEntry {
    id: Uuid,
    callback: ListenerCallback,
    source: Option<String>,
}

#[derive(Default)]
struct BusState {
    listeners: HashMap<EventType, Vec<ListenerEntry>>,
    history: VecDeque<Event>,
    dedup: HashMap<String, Instant>,
    breakers: HashMap<Uuid, CircuitBreaker>,
}

struct BusInner {
    config: BusConfig,
    state: Mutex<BusState>,
}

// ============================================================================
// Introspection snapshots
// ============================================================================

/// Listener registry snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ListenerStats {
    pub total_listeners: usize,
    /// Wire name → listener count.
    pub listeners_by_type: HashMap<String, usize>,
}

/// Circuit breaker snapshot for one listener.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerStats {
    pub listener_id: Uuid,
    pub event_type: EventType,
    /// Name of the subscribing component, when it identified itself.
    pub source: Option<String>,
    pub failures: u32,
    pub is_open: bool,
    /// Milliseconds since the last recorded failure, if any.
    pub since_last_failure_ms: Option<u64>,
}

// ============================================================================
// Subscriptions
// ============================================================================

/// Handle for one registered listener.
///
/// Dropping the handle leaves the listener registered; call
/// [`Subscription::unsubscribe`] to remove it. Removal discards the
/// listener's circuit breaker state and is safe at any time, including from
/// inside a callback that is currently executing (dispatch works on a
/// snapshot).
pub struct Subscription {
    bus: EventBus,
    id: Uuid,
    event_type: EventType,
}

impl Subscription {
    /// The listener's unique id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Remove the listener and discard its breaker state.
    pub fn unsubscribe(self) {
        self.bus.remove_listener(self.event_type, self.id);
    }
}

// ============================================================================
// Event bus
// ============================================================================

/// Cheaply cloneable handle to a shared event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl EventBus {
    /// Create a new bus with the given configuration.
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                state: Mutex::new(BusState::default()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        // A poisoned lock only means a callback-recording panic mid-update;
        // the state itself stays structurally valid.
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a listener for one event type. Listeners for a given type
    /// are invoked in registration order.
    pub fn subscribe<F>(&self, event_type: EventType, callback: F) -> Subscription
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe_from(event_type, callback, None)
    }

    /// Register a listener tagged with the subscribing component's name.
    pub fn subscribe_from<F>(
        &self,
        event_type: EventType,
        callback: F,
        source: Option<&str>,
    ) -> Subscription
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        let id = crate::uuid_utils::new_v7();
        let entry = ListenerEntry {
            id,
            callback: Arc::new(callback),
            source: source.map(String::from),
        };
        {
            let mut state = self.lock();
            state.listeners.entry(event_type).or_default().push(entry);
            state.breakers.insert(id, CircuitBreaker::default());
        }
        debug!(
            listener_id = %id,
            event_type = %event_type,
            source,
            "Listener registered"
        );
        Subscription {
            bus: self.clone(),
            id,
            event_type,
        }
    }

    fn remove_listener(&self, event_type: EventType, id: Uuid) {
        let mut state = self.lock();
        if let Some(entries) = state.listeners.get_mut(&event_type) {
            entries.retain(|e| e.id != id);
            if entries.is_empty() {
                state.listeners.remove(&event_type);
            }
        }
        state.breakers.remove(&id);
        debug!(listener_id = %id, event_type = %event_type, "Listener removed");
    }

    /// Emit an event to every registered listener of `event_type`.
    ///
    /// A `None` payload is normalized to [`EventPayload::Empty`] with a
    /// warning. Returns `false` when the emission was suppressed as a
    /// duplicate, `true` once the event has been dispatched (even if some
    /// listeners failed; their failures are isolated via breakers and
    /// re-published as `system.error` on the next tick).
    pub fn emit(
        &self,
        event_type: EventType,
        payload: Option<EventPayload>,
        source: &str,
    ) -> bool {
        let payload = payload.unwrap_or_else(|| {
            warn!(
                event_type = %event_type,
                source,
                "Event emitted without payload, normalizing to Empty"
            );
            EventPayload::Empty
        });

        let fingerprint = fingerprint(event_type, &payload);
        let now = Instant::now();

        let event;
        let targets: Vec<(Uuid, ListenerCallback)>;
        {
            let mut state = self.lock();

            if let Some(seen) = state.dedup.get(&fingerprint) {
                if now.duration_since(*seen) < self.inner.config.dedup_window {
                    trace!(event_type = %event_type, source, "Duplicate event suppressed");
                    return false;
                }
            }
            state.dedup.insert(fingerprint, now);

            event = Event::new(event_type, payload, source);
            let capacity = self.inner.config.history_capacity;
            state.history.push_front(event.clone());
            state.history.truncate(capacity);

            let cooldown = self.inner.config.breaker_cooldown;
            // Clone the registration-ordered list first so breaker refresh
            // below can borrow the state mutably.
            let registered: Vec<(Uuid, ListenerCallback)> = state
                .listeners
                .get(&event_type)
                .map(|entries| {
                    entries
                        .iter()
                        .map(|e| (e.id, Arc::clone(&e.callback)))
                        .collect()
                })
                .unwrap_or_default();
            let mut snapshot = Vec::with_capacity(registered.len());
            for (id, callback) in registered {
                let open = state
                    .breakers
                    .get_mut(&id)
                    .map(|b| b.refresh(now, cooldown))
                    .unwrap_or(false);
                if open {
                    trace!(listener_id = %id, event_type = %event_type, "Breaker open, skipping listener");
                    continue;
                }
                snapshot.push((id, callback));
            }
            targets = snapshot;
        }

        trace!(
            event_id = %event.id,
            event_type = %event_type,
            listener_count = targets.len(),
            source,
            "Dispatching event"
        );

        // Invoke outside the lock so callbacks may publish, subscribe, or
        // unsubscribe without deadlocking.
        let mut failures: Vec<(Uuid, String)> = Vec::new();
        for (id, callback) in targets {
            match callback(&event) {
                Ok(()) => self.record_success(id),
                Err(e) => {
                    let message = e.to_string();
                    self.record_failure(id, event_type, &message);
                    failures.push((id, message));
                }
            }
        }

        if !failures.is_empty() && event_type != EventType::SystemError {
            self.defer_error_reports(event_type, failures);
        }

        true
    }

    fn record_success(&self, id: Uuid) {
        let mut state = self.lock();
        if let Some(breaker) = state.breakers.get_mut(&id) {
            breaker.failures = breaker.failures.saturating_sub(1);
        }
    }

    fn record_failure(&self, id: Uuid, event_type: EventType, message: &str) {
        let max_failures = self.inner.config.max_failures;
        let mut state = self.lock();
        let Some(breaker) = state.breakers.get_mut(&id) else {
            // Listener unsubscribed while its callback was running.
            return;
        };
        breaker.failures += 1;
        breaker.last_failure = Some(Instant::now());
        if breaker.failures >= max_failures && !breaker.is_open {
            breaker.is_open = true;
            warn!(
                listener_id = %id,
                event_type = %event_type,
                failures = breaker.failures,
                error = message,
                "Circuit breaker opened for failing listener"
            );
        } else {
            warn!(
                listener_id = %id,
                event_type = %event_type,
                failures = breaker.failures,
                error = message,
                "Listener failed during dispatch"
            );
        }
    }

    /// Re-publish listener failures as `system.error` on the next tick,
    /// keeping the current dispatch stack flat.
    fn defer_error_reports(&self, failing_type: EventType, failures: Vec<(Uuid, String)>) {
        let bus = self.clone();
        let publish = move || {
            for (listener_id, message) in failures {
                bus.emit(
                    EventType::SystemError,
                    Some(EventPayload::SystemFailure {
                        component: format!("listener:{listener_id}"),
                        message,
                        failing_event: Some(failing_type.wire_name().to_string()),
                    }),
                    "event_bus",
                );
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::task::yield_now().await;
                    publish();
                });
            }
            // No runtime: deliver inline. system.error failures do not
            // re-emit, so this cannot recurse unboundedly.
            Err(_) => publish(),
        }
    }

    // ------------------------------------------------------------------
    // Introspection (no side effects on core state)
    // ------------------------------------------------------------------

    /// Retained events, newest first, optionally filtered by type and
    /// truncated to `limit`.
    pub fn event_history(&self, event_type: Option<EventType>, limit: Option<usize>) -> Vec<Event> {
        let state = self.lock();
        let iter = state
            .history
            .iter()
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .cloned();
        match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        }
    }

    /// Registry counts, total and per type.
    pub fn listener_stats(&self) -> ListenerStats {
        let state = self.lock();
        let mut by_type = HashMap::new();
        let mut total = 0;
        for (ty, entries) in &state.listeners {
            by_type.insert(ty.wire_name().to_string(), entries.len());
            total += entries.len();
        }
        ListenerStats {
            total_listeners: total,
            listeners_by_type: by_type,
        }
    }

    /// Breaker snapshot for every registered listener.
    pub fn circuit_breaker_stats(&self) -> Vec<BreakerStats> {
        let state = self.lock();
        let now = Instant::now();
        let mut stats = Vec::new();
        for (ty, entries) in &state.listeners {
            for entry in entries {
                if let Some(breaker) = state.breakers.get(&entry.id) {
                    stats.push(BreakerStats {
                        listener_id: entry.id,
                        event_type: *ty,
                        source: entry.source.clone(),
                        failures: breaker.failures,
                        is_open: breaker.is_open,
                        since_last_failure_ms: breaker
                            .last_failure
                            .map(|t| now.duration_since(t).as_millis() as u64),
                    });
                }
            }
        }
        stats
    }

    /// Drop all retained history.
    pub fn clear_history(&self) {
        self.lock().history.clear();
    }

    /// Close every breaker and zero its failure count.
    pub fn reset_circuit_breakers(&self) {
        let mut state = self.lock();
        for breaker in state.breakers.values_mut() {
            *breaker = CircuitBreaker::default();
        }
        debug!("All circuit breakers reset");
    }

    /// Spawn the background sweep: purges dedup entries older than the
    /// window and closes breakers whose cooldown elapsed. Abort the returned
    /// handle to stop it.
    pub fn start_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let bus = self.clone();
        let interval = self.inner.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick completes immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                bus.sweep();
            }
        })
    }

    /// One sweep pass. Exposed for tests; the sweeper task calls this on its
    /// interval.
    pub fn sweep(&self) {
        let window = self.inner.config.dedup_window;
        let cooldown = self.inner.config.breaker_cooldown;
        let now = Instant::now();
        let mut state = self.lock();
        let before = state.dedup.len();
        state
            .dedup
            .retain(|_, seen| now.duration_since(*seen) <= window);
        let purged = before - state.dedup.len();
        let mut closed = 0;
        for breaker in state.breakers.values_mut() {
            let was_open = breaker.is_open;
            breaker.refresh(now, cooldown);
            if was_open && !breaker.is_open {
                closed += 1;
            }
        }
        if purged > 0 || closed > 0 {
            debug!(purged, closed, "Bus sweep pass completed");
        }
    }
}

/// SHA-256 fingerprint of `(wire name, canonical payload JSON)` used for
/// duplicate suppression.
fn fingerprint(event_type: EventType, payload: &EventPayload) -> String {
    let canonical = match serde_json::to_string(payload) {
        Ok(s) => s,
        Err(_) => format!("{payload:?}"),
    };
    let mut hasher = Sha256::new();
    hasher.update(event_type.wire_name().as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

// ============================================================================
// Tests
// ============================================================================
