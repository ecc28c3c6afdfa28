//! Structured logging schema and field name constants for the sync core.
//!
//! All crates use these constants for consistent structured logging fields,
//! so log aggregation tools can query by standardized names across every
//! subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events (startup, shutdown), state transitions |
//! | DEBUG | Decision points, intermediate values, config choices |
//! | TRACE | Per-event dispatch, high-volume data |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "bus", "store", "context_sync", "remote_sync", "health"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "sweeper", "listener", "worker", "migrator"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "emit", "set", "sync_once", "validate"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Event UUID being dispatched.
pub const EVENT_ID: &str = "event_id";

/// Dot-namespaced event type name.
pub const EVENT_TYPE: &str = "event_type";

/// Listener UUID a breaker or dispatch decision applies to.
pub const LISTENER_ID: &str = "listener_id";

/// Store key (collection name) being read or written.
pub const STORE_KEY: &str = "key";

/// Collection name a sync pass is working on.
pub const COLLECTION: &str = "collection";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of records fetched or rewritten.
pub const RECORD_COUNT: &str = "record_count";

/// Current circuit breaker failure count.
pub const FAILURE_COUNT: &str = "failures";

/// Health score (0-100).
pub const SCORE: &str = "score";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
