//! Cross-process change detection.
//!
//! Every write in [`crate::store`] fires a `pg_notify` on
//! [`defaults::CONTEXT_CHANGE_CHANNEL`]. This listener subscribes to that
//! channel and, for notifications produced by *other* processes, re-reads
//! the affected key and republishes it on the local bus as an
//! `external_sync` change. Notifications carrying our own instance id are
//! skipped, mirroring how a process ignores its own writes.

use std::sync::Arc;

use chrono::Utc;
use sqlx::postgres::{PgListener, PgPool};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use pulse_core::events::{ChangeEvent, EventPayload, EventType};
use pulse_core::{defaults, ContextStore, Error, EventBus, Result};

use crate::store::{ChangeNotification, PgContextStore};

/// Handle for controlling a running change listener.
pub struct ListenerHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl ListenerHandle {
    /// Signal the listener to shut down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }
}

/// Listens on the notification channel and republishes sibling writes.
pub struct StoreChangeListener {
    pool: PgPool,
    store: Arc<PgContextStore>,
    bus: EventBus,
}

impl StoreChangeListener {
    pub fn new(pool: PgPool, store: Arc<PgContextStore>, bus: EventBus) -> Self {
        Self { pool, store, bus }
    }

    /// Connect, subscribe, and spawn the listen loop.
    pub async fn start(self) -> Result<ListenerHandle> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(defaults::CONTEXT_CHANGE_CHANNEL).await?;

        info!(
            subsystem = "store",
            component = "change_listener",
            channel = defaults::CONTEXT_CHANGE_CHANNEL,
            "Store change listener started"
        );

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!(
                            subsystem = "store",
                            component = "change_listener",
                            "Store change listener stopped"
                        );
                        break;
                    }
                    notification = listener.recv() => {
                        match notification {
                            Ok(n) => self.handle_notification(n.payload()).await,
                            // PgListener reconnects internally; recv errors
                            // surface transient connection loss.
                            Err(e) => {
                                warn!(
                                    subsystem = "store",
                                    component = "change_listener",
                                    error = %e,
                                    "Notification stream error, retrying"
                                );
                            }
                        }
                    }
                }
            }
        });

        Ok(ListenerHandle { shutdown_tx })
    }

    async fn handle_notification(&self, payload: &str) {
        let notification: ChangeNotification = match serde_json::from_str(payload) {
            Ok(n) => n,
            Err(e) => {
                warn!(
                    subsystem = "store",
                    component = "change_listener",
                    error = %e,
                    "Ignoring malformed change notification"
                );
                return;
            }
        };

        // Our own writes already went out on the local bus.
        if notification.origin == self.store.instance_id() {
            return;
        }

        let watched = self.store.watched_keys().await;
        if !watched.iter().any(|k| k == &notification.key) {
            return;
        }

        let new_value = match self.store.get(&notification.key).await {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    subsystem = "store",
                    component = "change_listener",
                    key = %notification.key,
                    error = %e,
                    "Failed to re-read externally changed key"
                );
                return;
            }
        };

        debug!(
            subsystem = "store",
            component = "change_listener",
            key = %notification.key,
            origin = %notification.origin,
            "External change detected"
        );

        self.bus.emit(
            EventType::ContextUpdated,
            Some(EventPayload::ContextChange {
                change: ChangeEvent {
                    key: notification.key,
                    old_value: None,
                    new_value,
                    timestamp: Utc::now(),
                    source: defaults::EXTERNAL_SYNC_SOURCE.to_string(),
                },
            }),
            defaults::EXTERNAL_SYNC_SOURCE,
        );
    }
}
