//! Health reporting data model.
//!
//! The monitor itself lives in `pulse-health`; these types sit in core so
//! health results can travel through the event bus as a typed payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Status of a single validated component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Error,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Warning => write!(f, "warning"),
            HealthStatus::Error => write!(f, "error"),
        }
    }
}

/// One component's diagnosis within a validation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMetric {
    /// Component name (e.g. `"event_bus"`, `"persistence"`).
    pub component: String,
    pub status: HealthStatus,
    /// Human-readable summary of the finding.
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Structured supporting data (counters, byte sizes).
    pub details: JsonValue,
}

/// Whole-system validation result, recomputed wholesale on each tick.
///
/// Not persisted beyond the latest result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemValidationResult {
    /// True when `overall_score` meets the healthy threshold.
    pub is_healthy: bool,
    /// 0-100; starts at 100 and loses a fixed penalty per unhealthy component.
    pub overall_score: u8,
    pub metrics: Vec<HealthMetric>,
    /// Remediation hints generated by per-metric rules.
    pub recommendations: Vec<String>,
    pub checked_at: DateTime<Utc>,
}
