//! # pulse-core
//!
//! Core types, traits, and the event bus for the Pulseboard sync engine.
//!
//! This crate provides the event model, error taxonomy, and store
//! abstractions that the other Pulseboard crates depend on.

pub mod bus;
pub mod defaults;
pub mod error;
pub mod events;
pub mod health;
pub mod logging;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use bus::{BreakerStats, BusConfig, EventBus, ListenerCallback, ListenerStats, Subscription};
pub use error::{Error, Result};
pub use events::{ChangeEvent, Event, EventPayload, EventType};
pub use health::{HealthMetric, HealthStatus, SystemValidationResult};
pub use traits::{ContextStore, IntegrityReport};
pub use uuid_utils::{is_v7, new_v7};
