//! # pulse-store
//!
//! PostgreSQL persistence layer for the Pulseboard sync engine.
//!
//! This crate provides:
//! - Connection pool management
//! - The durable key/value context store with change events
//! - Record-level schema migrations
//! - Cross-process change detection over `pg_notify`
//! - An in-memory store for tests

pub mod listen;
pub mod migration;
pub mod mock;
pub mod pool;
pub mod store;

pub use listen::{ListenerHandle, StoreChangeListener};
pub use migration::{MigrationReport, Migrator, SCHEMA_VERSION};
pub use mock::MemoryContextStore;
pub use pool::{create_pool, create_pool_with_config, PoolConfig};
pub use store::{ensure_schema, ChangeNotification, PgContextStore};
