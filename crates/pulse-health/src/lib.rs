//! # pulse-health
//!
//! Scored system health monitoring for Pulseboard: periodic validation of
//! the event bus, persistence store, expected data, sync liveness, and
//! process memory, published as `health.report` events.

pub mod monitor;

pub use monitor::{HealthConfig, HealthHandle, HealthMonitor};
