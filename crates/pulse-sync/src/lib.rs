//! # pulse-sync
//!
//! Context propagation and remote synchronization for Pulseboard.
//!
//! This crate provides:
//! - The context synchronizer keeping cross-collection references consistent
//! - The connectivity-aware remote sync worker
//! - Remote source abstractions (HTTP and a test mock)

pub mod connectivity;
pub mod context;
pub mod remote;
pub mod worker;

pub use connectivity::ConnectivityMonitor;
pub use context::{
    default_edges, recompute_backrefs, ContextRegistration, ContextSynchronizer, DependencyEdge,
    SynchronizerHandle,
};
pub use remote::{HttpRemoteSource, MockRemoteSource, RemoteSource};
pub use worker::{SyncConfig, SyncHandle, SyncState, SyncStats, SyncWorker};
