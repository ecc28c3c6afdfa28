//! Periodic system validation.
//!
//! The monitor runs five checks (event bus, persistence, expected data,
//! sync liveness, process memory), folds them into a 0..=100 score, and
//! publishes the result as a `health.report` event. A score below the
//! critical threshold additionally raises a `system.error`. Results live in
//! memory only; the latest one is queryable from the monitor.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use pulse_core::events::{EventPayload, EventType};
use pulse_core::health::{HealthMetric, HealthStatus, SystemValidationResult};
use pulse_core::{defaults, ContextStore, Error, EventBus, Result};
use pulse_sync::ConnectivityMonitor;

// ============================================================================
// Configuration
// ============================================================================

/// Health monitor configuration.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Interval between validations.
    pub interval: Duration,
    /// Delay before the first validation after startup.
    pub initial_delay: Duration,
    /// Timeout on the store probe.
    pub probe_timeout: Duration,
    /// Top-level keys whose presence the data check requires.
    pub expected_keys: Vec<String>,
    /// Resident-set threshold for the memory check.
    pub memory_warn_bytes: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(defaults::HEALTH_INTERVAL_SECS),
            initial_delay: Duration::from_secs(defaults::HEALTH_INITIAL_DELAY_SECS),
            probe_timeout: Duration::from_secs(defaults::HEALTH_PROBE_TIMEOUT_SECS),
            expected_keys: defaults::EXPECTED_COLLECTIONS
                .iter()
                .map(|k| k.to_string())
                .collect(),
            memory_warn_bytes: defaults::HEALTH_MEMORY_WARN_BYTES,
        }
    }
}

impl HealthConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `HEALTH_INTERVAL_SECS` | `600` | Interval between validations |
    /// | `HEALTH_INITIAL_DELAY_SECS` | `30` | Delay before the first run |
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(secs) = std::env::var("HEALTH_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = std::env::var("HEALTH_INITIAL_DELAY_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.initial_delay = Duration::from_secs(secs);
        }
        config
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_expected_keys(mut self, keys: Vec<String>) -> Self {
        self.expected_keys = keys;
        self
    }
}

// ============================================================================
// Monitor
// ============================================================================

/// Handle for controlling a running health monitor.
pub struct HealthHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl HealthHandle {
    /// Signal the monitor to shut down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }
}

/// Scored health monitor over the bus, store, and sync loop.
#[derive(Clone)]
pub struct HealthMonitor {
    bus: EventBus,
    store: Arc<dyn ContextStore>,
    connectivity: ConnectivityMonitor,
    config: HealthConfig,
    last: Arc<Mutex<Option<SystemValidationResult>>>,
}

impl HealthMonitor {
    pub fn new(
        bus: EventBus,
        store: Arc<dyn ContextStore>,
        connectivity: ConnectivityMonitor,
        config: HealthConfig,
    ) -> Self {
        Self {
            bus,
            store,
            connectivity,
            config,
            last: Arc::new(Mutex::new(None)),
        }
    }

    /// Most recent validation result, if a run has completed.
    pub fn last_validation_result(&self) -> Option<SystemValidationResult> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Spawn the periodic validation loop: one delayed initial run, then a
    /// fixed interval.
    pub fn start(&self) -> HealthHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let monitor = self.clone();

        info!(
            subsystem = "health",
            interval_secs = monitor.config.interval.as_secs(),
            initial_delay_secs = monitor.config.initial_delay.as_secs(),
            "Health monitor started"
        );

        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tokio::time::sleep(monitor.config.initial_delay) => {}
            }
            loop {
                monitor.perform_system_validation().await;
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!(subsystem = "health", "Health monitor stopped");
                        return;
                    }
                    _ = tokio::time::sleep(monitor.config.interval) => {}
                }
            }
        });

        HealthHandle { shutdown_tx }
    }

    /// Run all checks, score the result, store it, and publish it. A score
    /// below the critical threshold also raises a `system.error`.
    pub async fn perform_system_validation(&self) -> SystemValidationResult {
        let mut metrics = Vec::new();
        let mut recommendations = Vec::new();
        let mut penalty: u32 = 0;

        penalty += self.check_event_bus(&mut metrics, &mut recommendations);
        penalty += self.check_persistence(&mut metrics, &mut recommendations).await;
        penalty += self.check_expected_data(&mut metrics, &mut recommendations).await;
        penalty += self.check_sync_liveness(&mut metrics, &mut recommendations);
        penalty += check_memory(self.config.memory_warn_bytes, &mut metrics, &mut recommendations);

        let overall_score = 100u32.saturating_sub(penalty) as u8;
        let result = SystemValidationResult {
            is_healthy: overall_score >= defaults::HEALTH_HEALTHY_THRESHOLD,
            overall_score,
            metrics,
            recommendations,
            checked_at: Utc::now(),
        };

        debug!(
            subsystem = "health",
            score = result.overall_score,
            healthy = result.is_healthy,
            "System validation completed"
        );

        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(result.clone());

        if overall_score < defaults::HEALTH_CRITICAL_THRESHOLD {
            warn!(
                subsystem = "health",
                score = overall_score,
                "System health critical"
            );
            self.bus.emit(
                EventType::SystemError,
                Some(EventPayload::SystemFailure {
                    component: "health_monitor".to_string(),
                    message: format!("system health critical: score {overall_score}"),
                    failing_event: None,
                }),
                "health_monitor",
            );
        }

        self.bus.emit(
            EventType::HealthReport,
            Some(EventPayload::Health {
                result: result.clone(),
            }),
            "health_monitor",
        );

        result
    }

    fn check_event_bus(
        &self,
        metrics: &mut Vec<HealthMetric>,
        recommendations: &mut Vec<String>,
    ) -> u32 {
        let stats = self.bus.listener_stats();
        let breakers = self.bus.circuit_breaker_stats();
        let open_breakers = breakers.iter().filter(|b| b.is_open).count();

        let details = json!({
            "total_listeners": stats.total_listeners,
            "open_breakers": open_breakers,
        });

        let (status, message, penalty) = if open_breakers > 0 {
            recommendations.push(
                "Reset circuit breakers or investigate the failing listeners".to_string(),
            );
            (
                HealthStatus::Error,
                format!("{open_breakers} circuit breaker(s) open"),
                defaults::PENALTY_EVENT_BUS as u32,
            )
        } else if stats.total_listeners == 0 {
            recommendations.push("Wire event listeners before relying on the bus".to_string());
            (
                HealthStatus::Warning,
                "no listeners registered".to_string(),
                defaults::PENALTY_EVENT_BUS as u32,
            )
        } else {
            (
                HealthStatus::Healthy,
                format!("{} listener(s), all breakers closed", stats.total_listeners),
                0,
            )
        };

        metrics.push(HealthMetric {
            component: "event_bus".to_string(),
            status,
            message,
            timestamp: Utc::now(),
            details,
        });
        penalty
    }

    async fn check_persistence(
        &self,
        metrics: &mut Vec<HealthMetric>,
        recommendations: &mut Vec<String>,
    ) -> u32 {
        let probe = async {
            let stamp = json!({ "checked_at": Utc::now().to_rfc3339() });
            self.store
                .set(defaults::HEALTH_PROBE_KEY, &stamp, "health_monitor")
                .await?;
            let read_back = self.store.get(defaults::HEALTH_PROBE_KEY).await?;
            if read_back.as_ref() != Some(&stamp) {
                return Err(Error::Store("probe read back a different value".to_string()));
            }
            let report = self.store.validate_integrity().await?;
            if !report.is_valid {
                return Err(Error::Store(format!(
                    "integrity check failed: {}",
                    report.errors.join("; ")
                )));
            }
            Ok(report)
        };

        let outcome = tokio::time::timeout(self.config.probe_timeout, probe).await;
        let (status, message, details, penalty) = match outcome {
            Ok(Ok(report)) => (
                HealthStatus::Healthy,
                "store probe succeeded".to_string(),
                json!({
                    "records_checked": report.records_checked,
                    "estimated_bytes": report.estimated_bytes,
                    "integrity_errors": report.errors,
                }),
                0,
            ),
            Ok(Err(e)) => {
                recommendations.push("Check database connectivity and credentials".to_string());
                (
                    HealthStatus::Error,
                    format!("store probe failed: {e}"),
                    json!({}),
                    defaults::PENALTY_PERSISTENCE as u32,
                )
            }
            Err(_) => {
                recommendations.push("Check database responsiveness".to_string());
                (
                    HealthStatus::Error,
                    format!(
                        "store probe timed out after {}s",
                        self.config.probe_timeout.as_secs()
                    ),
                    json!({}),
                    defaults::PENALTY_PERSISTENCE as u32,
                )
            }
        };

        metrics.push(HealthMetric {
            component: "persistence".to_string(),
            status,
            message,
            timestamp: Utc::now(),
            details,
        });
        penalty
    }

    async fn check_expected_data(
        &self,
        metrics: &mut Vec<HealthMetric>,
        recommendations: &mut Vec<String>,
    ) -> u32 {
        let mut missing = Vec::new();
        for key in &self.config.expected_keys {
            match self.store.get(key).await {
                Ok(Some(_)) => {}
                Ok(None) => missing.push(key.clone()),
                // Read errors fall to the persistence check; count the key
                // as missing here.
                Err(_) => missing.push(key.clone()),
            }
        }

        let details = json!({
            "expected": self.config.expected_keys,
            "missing": missing,
        });

        let (status, message, penalty) = if missing.is_empty() {
            (
                HealthStatus::Healthy,
                "all expected collections present".to_string(),
                0,
            )
        } else {
            recommendations
                .push("Run a sync to populate the missing collections".to_string());
            (
                HealthStatus::Warning,
                format!("missing collections: {}", missing.join(", ")),
                defaults::PENALTY_MISSING_DATA as u32,
            )
        };

        metrics.push(HealthMetric {
            component: "expected_data".to_string(),
            status,
            message,
            timestamp: Utc::now(),
            details,
        });
        penalty
    }

    fn check_sync_liveness(
        &self,
        metrics: &mut Vec<HealthMetric>,
        recommendations: &mut Vec<String>,
    ) -> u32 {
        if !self.connectivity.is_online() {
            metrics.push(HealthMetric {
                component: "sync".to_string(),
                status: HealthStatus::Healthy,
                message: "offline, liveness check skipped".to_string(),
                timestamp: Utc::now(),
                details: json!({ "online": false }),
            });
            return 0;
        }

        // The persistence probe writes through the store, which publishes a
        // context.updated of its own. Events we sourced are not sync
        // activity and must not satisfy the liveness window.
        let cutoff = Utc::now() - chrono::Duration::seconds(defaults::HEALTH_SYNC_STALENESS_SECS);
        let recent = self
            .bus
            .event_history(None, None)
            .iter()
            .filter(|e| e.timestamp >= cutoff && e.source != "health_monitor")
            .count();

        let details = json!({ "online": true, "recent_events": recent });
        let (status, message, penalty) = if recent > 0 {
            (
                HealthStatus::Healthy,
                format!("{recent} event(s) in the liveness window"),
                0,
            )
        } else {
            recommendations.push("Force a sync or check the remote source".to_string());
            (
                HealthStatus::Warning,
                "no recent events while online".to_string(),
                defaults::PENALTY_STALE_SYNC as u32,
            )
        };

        metrics.push(HealthMetric {
            component: "sync".to_string(),
            status,
            message,
            timestamp: Utc::now(),
            details,
        });
        penalty
    }
}

/// Process memory check. Reads VmRSS from `/proc/self/status`; on platforms
/// without procfs the check reports healthy with a note.
fn check_memory(
    warn_bytes: u64,
    metrics: &mut Vec<HealthMetric>,
    recommendations: &mut Vec<String>,
) -> u32 {
    let rss = std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|text| parse_vm_rss(&text));

    let (status, message, details, penalty) = match rss {
        Some(bytes) if bytes > warn_bytes => {
            recommendations.push("Investigate memory growth in long-running processes".to_string());
            (
                HealthStatus::Warning,
                format!("resident set {} MiB exceeds threshold", bytes / (1024 * 1024)),
                json!({ "rss_bytes": bytes, "threshold_bytes": warn_bytes }),
                defaults::PENALTY_MEMORY as u32,
            )
        }
        Some(bytes) => (
            HealthStatus::Healthy,
            format!("resident set {} MiB", bytes / (1024 * 1024)),
            json!({ "rss_bytes": bytes, "threshold_bytes": warn_bytes }),
            0,
        ),
        None => (
            HealthStatus::Healthy,
            "memory usage unavailable on this platform".to_string(),
            json!({ "rss_bytes": null }),
            0,
        ),
    };

    metrics.push(HealthMetric {
        component: "memory".to_string(),
        status,
        message,
        timestamp: Utc::now(),
        details,
    });
    penalty
}

/// Extract the VmRSS value (in bytes) from `/proc/self/status` content.
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_store::MemoryContextStore;
    use serde_json::json;

    async fn populated_store() -> Arc<MemoryContextStore> {
        let store = Arc::new(MemoryContextStore::new());
        for key in defaults::EXPECTED_COLLECTIONS {
            store.set(key, &json!([]), "test").await.unwrap();
        }
        store
    }

    fn monitor(bus: EventBus, store: Arc<MemoryContextStore>, online: bool) -> HealthMonitor {
        HealthMonitor::new(
            bus,
            store,
            ConnectivityMonitor::new(online),
            HealthConfig::default(),
        )
    }

    fn metric<'a>(result: &'a SystemValidationResult, component: &str) -> &'a HealthMetric {
        result
            .metrics
            .iter()
            .find(|m| m.component == component)
            .unwrap_or_else(|| panic!("missing metric {component}"))
    }

    #[tokio::test]
    async fn test_healthy_system_scores_full() {
        let bus = EventBus::default();
        let _listener = bus.subscribe(EventType::TaskUpdated, |_| Ok(()));
        bus.emit(EventType::TaskUpdated, None, "test");

        let store = populated_store().await;
        let monitor = monitor(bus, store, true);

        let result = monitor.perform_system_validation().await;
        assert_eq!(result.overall_score, 100);
        assert!(result.is_healthy);
        assert!(result.recommendations.is_empty());
        assert_eq!(result.metrics.len(), 5);
        assert!(monitor.last_validation_result().is_some());

        let m = metric(&result, "persistence");
        assert!(m.details["estimated_bytes"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_missing_collections_penalized() {
        let bus = EventBus::default();
        let _listener = bus.subscribe(EventType::TaskUpdated, |_| Ok(()));
        bus.emit(EventType::TaskUpdated, None, "test");

        let store = Arc::new(MemoryContextStore::new());
        store.set("projects", &json!([]), "test").await.unwrap();
        let monitor = monitor(bus, store, true);

        let result = monitor.perform_system_validation().await;
        assert_eq!(
            result.overall_score,
            100 - defaults::PENALTY_MISSING_DATA
        );
        let m = metric(&result, "expected_data");
        assert_eq!(m.status, HealthStatus::Warning);
        assert!(m.message.contains("tasks"));
        assert!(!result.recommendations.is_empty());
    }

    #[tokio::test]
    async fn test_open_breaker_penalized_with_recommendation() {
        let config = pulse_core::BusConfig::default().with_max_failures(1);
        let bus = EventBus::new(config);
        let _bad = bus.subscribe(EventType::TaskUpdated, |_| {
            Err(Error::Listener("always fails".to_string()))
        });
        bus.emit(
            EventType::TaskUpdated,
            Some(EventPayload::Entity {
                collection: "tasks".to_string(),
                id: "t1".to_string(),
                record: json!({}),
            }),
            "test",
        );

        let store = populated_store().await;
        let monitor = monitor(bus, store, true);

        let result = monitor.perform_system_validation().await;
        let m = metric(&result, "event_bus");
        assert_eq!(m.status, HealthStatus::Error);
        assert_eq!(result.overall_score, 100 - defaults::PENALTY_EVENT_BUS);
        assert!(result
            .recommendations
            .iter()
            .any(|r| r.contains("circuit breakers")));
    }

    #[tokio::test]
    async fn test_store_failure_penalizes_persistence() {
        let bus = EventBus::default();
        let _listener = bus.subscribe(EventType::TaskUpdated, |_| Ok(()));
        bus.emit(EventType::TaskUpdated, None, "test");

        let store = populated_store().await;
        store.set_fail_writes(true);
        let monitor = monitor(bus, store, true);

        let result = monitor.perform_system_validation().await;
        let m = metric(&result, "persistence");
        assert_eq!(m.status, HealthStatus::Error);
        assert_eq!(result.overall_score, 100 - defaults::PENALTY_PERSISTENCE);
    }

    #[tokio::test]
    async fn test_integrity_errors_penalize_persistence() {
        let bus = EventBus::default();
        let _listener = bus.subscribe(EventType::TaskUpdated, |_| Ok(()));
        bus.emit(EventType::TaskUpdated, None, "test");

        let store = populated_store().await;
        store.inject_corrupt("settings");
        let monitor = monitor(bus, store, true);

        let result = monitor.perform_system_validation().await;
        let m = metric(&result, "persistence");
        assert_eq!(m.status, HealthStatus::Error);
        assert!(m.message.contains("integrity"));
        assert_eq!(result.overall_score, 100 - defaults::PENALTY_PERSISTENCE);
    }

    #[tokio::test]
    async fn test_stale_sync_only_counts_while_online() {
        // Empty bus history while online reads as stale.
        let bus = EventBus::default();
        let _listener = bus.subscribe(EventType::TaskUpdated, |_| Ok(()));
        let store = populated_store().await;

        let result = monitor(bus.clone(), store.clone(), true)
            .perform_system_validation()
            .await;
        assert_eq!(result.overall_score, 100 - defaults::PENALTY_STALE_SYNC);
        assert_eq!(metric(&result, "sync").status, HealthStatus::Warning);

        // Offline, the same silence is expected and unpenalized.
        let result = monitor(bus, store, false).perform_system_validation().await;
        assert_eq!(result.overall_score, 100);
        assert_eq!(metric(&result, "sync").status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_probe_write_does_not_count_as_sync_activity() {
        // A bus-wired store publishes context.updated for the probe write
        // itself; that event alone must still read as stale.
        let bus = EventBus::default();
        let _listener = bus.subscribe(EventType::TaskUpdated, |_| Ok(()));
        let store = Arc::new(MemoryContextStore::with_bus(bus.clone()));
        for key in defaults::EXPECTED_COLLECTIONS {
            store.set(key, &json!([]), "test").await.unwrap();
        }
        bus.clear_history();
        let monitor = monitor(bus.clone(), store, true);

        let result = monitor.perform_system_validation().await;
        assert_eq!(result.overall_score, 100 - defaults::PENALTY_STALE_SYNC);
        assert_eq!(metric(&result, "sync").status, HealthStatus::Warning);

        // An event from the sync loop restores liveness.
        bus.emit(EventType::TaskUpdated, None, defaults::REMOTE_SYNC_SOURCE);
        let result = monitor.perform_system_validation().await;
        assert_eq!(result.overall_score, 100);
        assert_eq!(metric(&result, "sync").status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_critical_score_emits_system_error() {
        // No listeners, failing store, empty data, silent while online:
        // 15 + 20 + 15 + 10 = 60 in penalties.
        let bus = EventBus::default();
        let store = Arc::new(MemoryContextStore::new());
        store.set_fail_writes(true);
        let monitor = monitor(bus.clone(), store, true);

        let result = monitor.perform_system_validation().await;
        assert_eq!(result.overall_score, 40);
        assert!(!result.is_healthy);

        let errors = bus.event_history(Some(EventType::SystemError), None);
        assert_eq!(errors.len(), 1);
        match &errors[0].payload {
            EventPayload::SystemFailure { component, .. } => {
                assert_eq!(component, "health_monitor");
            }
            other => panic!("unexpected payload: {other:?}"),
        }

        // The report itself is still published.
        assert_eq!(bus.event_history(Some(EventType::HealthReport), None).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_runs_after_initial_delay_then_interval() {
        let bus = EventBus::default();
        let _listener = bus.subscribe(EventType::TaskUpdated, |_| Ok(()));
        let store = populated_store().await;
        let config = HealthConfig::default()
            .with_initial_delay(Duration::from_secs(5))
            .with_interval(Duration::from_secs(60));
        let monitor = HealthMonitor::new(bus.clone(), store, ConnectivityMonitor::new(true), config);

        let handle = monitor.start();
        assert!(monitor.last_validation_result().is_none());

        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(6)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert!(monitor.last_validation_result().is_some());
        assert_eq!(bus.event_history(Some(EventType::HealthReport), None).len(), 1);

        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(61)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(bus.event_history(Some(EventType::HealthReport), None).len(), 2);

        handle.shutdown().await.unwrap();
    }

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tpulse\nVmPeak:\t  10000 kB\nVmRSS:\t   2048 kB\n";
        assert_eq!(parse_vm_rss(status), Some(2048 * 1024));
        assert_eq!(parse_vm_rss("Name:\tpulse\n"), None);
    }
}
