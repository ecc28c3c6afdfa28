//! Centralized default constants for the Pulseboard sync core.
//!
//! **This module is the single source of truth** for all shared default
//! values. All crates reference these constants instead of defining their
//! own magic numbers.
//!
//! Organized by domain area. When adding new constants, place them in the
//! appropriate section and document the rationale for the chosen value.

// =============================================================================
// EVENT BUS
// =============================================================================

/// Maximum events retained in the bus history (most-recent-first).
pub const EVENT_HISTORY_CAPACITY: usize = 256;

/// Window during which an identical `(type, payload)` emission is dropped
/// as a duplicate.
pub const DEDUP_WINDOW_MS: u64 = 1_000;

/// Consecutive-window failures before a listener's circuit breaker opens.
pub const BREAKER_MAX_FAILURES: u32 = 5;

/// Cooldown after the last failure before an open breaker closes again.
/// Recovery is purely time-based; there is no probe call.
pub const BREAKER_COOLDOWN_MS: u64 = 30_000;

/// Interval of the background sweep that purges expired dedup entries and
/// closes cooled-down breakers.
pub const BUS_SWEEP_INTERVAL_SECS: u64 = 60;

// =============================================================================
// PERSISTENCE STORE
// =============================================================================

/// Postgres notification channel carrying cross-process change signals.
pub const CONTEXT_CHANGE_CHANNEL: &str = "pulse_context_changed";

/// Source tag attached to changes observed from a sibling process.
pub const EXTERNAL_SYNC_SOURCE: &str = "external_sync";

/// Source tag attached to writes made by the remote sync loop.
pub const REMOTE_SYNC_SOURCE: &str = "remote_sync";

/// Top-level collections every deployment is expected to hold.
pub const EXPECTED_COLLECTIONS: [&str; 4] = ["projects", "tasks", "resources", "stakeholders"];

// =============================================================================
// REMOTE SYNC
// =============================================================================

/// Default interval between remote sync ticks.
pub const SYNC_INTERVAL_MS: u64 = 30_000;

/// Floor for user-adjusted sync intervals. Anything lower would hammer the
/// remote source without improving freshness.
pub const SYNC_MIN_INTERVAL_MS: u64 = 5_000;

/// Per-request timeout for remote source fetches.
pub const REMOTE_REQUEST_TIMEOUT_SECS: u64 = 15;

/// Days-remaining upper bound (inclusive) for the deadline-approaching alert.
pub const DEADLINE_WARNING_DAYS: i64 = 7;

// =============================================================================
// HEALTH MONITOR
// =============================================================================

/// Interval between full system validations.
pub const HEALTH_INTERVAL_SECS: u64 = 600;

/// Delay before the first validation after startup, so components have a
/// chance to populate.
pub const HEALTH_INITIAL_DELAY_SECS: u64 = 30;

/// Timeout applied to the store read/write self-test.
pub const HEALTH_PROBE_TIMEOUT_SECS: u64 = 5;

/// Reserved store key used by the health self-test.
pub const HEALTH_PROBE_KEY: &str = "__health_probe";

/// Events younger than this count as evidence that sync is alive.
pub const HEALTH_SYNC_STALENESS_SECS: i64 = 120;

/// Score at or above which the system is considered healthy.
pub const HEALTH_HEALTHY_THRESHOLD: u8 = 70;

/// Score below which a critical `system.error` event is raised.
pub const HEALTH_CRITICAL_THRESHOLD: u8 = 50;

/// Resident-set-size ceiling before the memory metric degrades to a warning.
pub const HEALTH_MEMORY_WARN_BYTES: u64 = 512 * 1024 * 1024;

// ─── Fixed per-component score penalties ────────────────────────────────────

/// Penalty for event bus issues (open breakers, empty registry).
pub const PENALTY_EVENT_BUS: u8 = 15;

/// Penalty for persistence failures (probe failed or timed out, integrity).
pub const PENALTY_PERSISTENCE: u8 = 20;

/// Penalty for a stale or paused sync loop.
pub const PENALTY_STALE_SYNC: u8 = 10;

/// Penalty for missing expected top-level collections.
pub const PENALTY_MISSING_DATA: u8 = 15;

/// Penalty for elevated process memory usage.
pub const PENALTY_MEMORY: u8 = 10;
