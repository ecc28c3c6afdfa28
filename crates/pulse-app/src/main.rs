//! pulse-app - the Pulseboard sync daemon.
//!
//! Wires the event bus, context store, change listener, context
//! synchronizer, remote sync worker, and health monitor together and runs
//! until interrupted.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pulse_core::{defaults, BusConfig, ContextStore, EventBus};
use pulse_health::{HealthConfig, HealthMonitor};
use pulse_store::{create_pool, ensure_schema, Migrator, PgContextStore, StoreChangeListener};
use pulse_sync::{
    default_edges, ConnectivityMonitor, ContextSynchronizer, HttpRemoteSource, SyncConfig,
    SyncWorker,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing with configurable output
    //
    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   RUST_LOG    - standard env filter (default: "pulse=debug,info")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "pulse=debug,info".into());
    let registry = tracing_subscriber::registry().with(env_filter);
    if log_format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    info!(log_format = %log_format, "Logging initialized");

    // Get configuration from environment
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgres://localhost/pulse".to_string());
    let remote_url = std::env::var("REMOTE_SOURCE_URL")
        .unwrap_or_else(|_| "http://localhost:8080".to_string());

    // Connect to database and bring the schema up to date
    info!("Connecting to database...");
    let pool = create_pool(&database_url).await?;
    ensure_schema(&pool).await?;
    let migration = Migrator::new(pool.clone()).run().await?;
    info!(
        from_version = migration.from_version,
        to_version = migration.to_version,
        records_rewritten = migration.records_rewritten,
        "Store schema ready"
    );

    // Event bus with background sweep
    let bus = EventBus::new(BusConfig::from_env());
    let sweeper = bus.start_sweeper();

    // Context store, watching the expected collections for external changes
    let store = Arc::new(PgContextStore::new(pool.clone(), bus.clone()));
    for key in defaults::EXPECTED_COLLECTIONS {
        store.watch(key).await;
    }
    let listener = StoreChangeListener::new(pool.clone(), store.clone(), bus.clone())
        .start()
        .await?;

    // Context synchronizer over the default edge table
    let synchronizer =
        ContextSynchronizer::new(store.clone(), default_edges()).start(&bus);

    // Remote sync worker
    let connectivity = ConnectivityMonitor::new(true);
    let remote = Arc::new(HttpRemoteSource::new(&remote_url)?);
    let sync = SyncWorker::new(
        store.clone(),
        bus.clone(),
        remote,
        connectivity.clone(),
        SyncConfig::from_env(),
    )
    .start();

    // Health monitor
    let health = HealthMonitor::new(
        bus.clone(),
        store.clone(),
        connectivity.clone(),
        HealthConfig::from_env(),
    );
    let health_handle = health.start();

    info!(remote_url = %remote_url, "Pulseboard daemon running");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Stop components in reverse construction order
    health_handle.shutdown().await?;
    sync.shutdown().await?;
    synchronizer.shutdown().await?;
    listener.shutdown().await?;
    sweeper.abort();

    info!("Pulseboard daemon stopped");
    Ok(())
}
