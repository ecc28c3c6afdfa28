//! PostgreSQL-backed context store.
//!
//! Values are stored as serialized JSON text in `context_records`, one row
//! per key. Every successful write publishes a `context.updated` event on
//! the bus and a `pg_notify` on [`defaults::CONTEXT_CHANGE_CHANNEL`] so
//! sibling processes can pick the change up (see [`crate::listen`]).
//!
//! A value that fails to parse on read is treated as corrupt: the row is
//! deleted, a warning is logged, and the read returns `Ok(None)` rather
//! than failing the caller.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPool;
use sqlx::Row;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pulse_core::events::{ChangeEvent, EventPayload, EventType};
use pulse_core::{defaults, ContextStore, EventBus, IntegrityReport, Result};

/// Notification payload sent over `pg_notify` on every write.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ChangeNotification {
    pub key: String,
    pub source: String,
    /// Instance id of the writing process, used to skip own notifications.
    pub origin: Uuid,
}

/// PostgreSQL implementation of [`ContextStore`].
pub struct PgContextStore {
    pool: PgPool,
    bus: EventBus,
    instance_id: Uuid,
    watched: RwLock<HashSet<String>>,
}

impl PgContextStore {
    /// Create a store over an existing pool. Call [`ensure_schema`] first
    /// on fresh databases.
    pub fn new(pool: PgPool, bus: EventBus) -> Self {
        Self {
            pool,
            bus,
            instance_id: pulse_core::new_v7(),
            watched: RwLock::new(HashSet::new()),
        }
    }

    /// Unique id of this process's store instance. Notifications carrying
    /// this origin are our own writes.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn read_raw(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM context_records WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    /// Drop a row whose stored value no longer parses.
    async fn evict_corrupt(&self, key: &str, parse_error: &serde_json::Error) -> Result<()> {
        warn!(
            subsystem = "store",
            key,
            error = %parse_error,
            "Corrupt value in context store, deleting row"
        );
        sqlx::query("DELETE FROM context_records WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ContextStore for PgContextStore {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>> {
        let Some(raw) = self.read_raw(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                self.evict_corrupt(key, &e).await?;
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: &JsonValue, source: &str) -> Result<()> {
        // Serialize before touching the database so a serialization failure
        // leaves the previous value intact.
        let serialized = serde_json::to_string(value)?;

        let mut tx = self.pool.begin().await?;

        let old_raw: Option<String> =
            sqlx::query_scalar("SELECT value FROM context_records WHERE key = $1 FOR UPDATE")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;

        sqlx::query(
            r#"
            INSERT INTO context_records (key, value, updated_at, updated_by)
            VALUES ($1, $2, now(), $3)
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value,
                updated_at = EXCLUDED.updated_at,
                updated_by = EXCLUDED.updated_by
            "#,
        )
        .bind(key)
        .bind(&serialized)
        .bind(source)
        .execute(&mut *tx)
        .await?;

        let notification = serde_json::to_string(&ChangeNotification {
            key: key.to_string(),
            source: source.to_string(),
            origin: self.instance_id,
        })?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(defaults::CONTEXT_CHANGE_CHANNEL)
            .bind(&notification)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        // Old value that no longer parses is reported as absent.
        let old_value = old_raw.and_then(|raw| serde_json::from_str(&raw).ok());

        debug!(subsystem = "store", key, source, "Context value written");

        self.bus.emit(
            EventType::ContextUpdated,
            Some(EventPayload::ContextChange {
                change: ChangeEvent {
                    key: key.to_string(),
                    old_value,
                    new_value: Some(value.clone()),
                    timestamp: Utc::now(),
                    source: source.to_string(),
                },
            }),
            source,
        );

        Ok(())
    }

    async fn watch(&self, key: &str) {
        self.watched.write().await.insert(key.to_string());
    }

    async fn unwatch(&self, key: &str) {
        self.watched.write().await.remove(key);
    }

    async fn watched_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.watched.read().await.iter().cloned().collect();
        keys.sort();
        keys
    }

    async fn validate_integrity(&self) -> Result<IntegrityReport> {
        let rows = sqlx::query("SELECT key, value FROM context_records ORDER BY key")
            .fetch_all(&self.pool)
            .await?;

        let mut errors = Vec::new();
        let mut estimated_bytes: u64 = 0;
        for row in &rows {
            let key: String = row.get("key");
            let raw: String = row.get("value");
            estimated_bytes += raw.len() as u64;
            if let Err(e) = serde_json::from_str::<JsonValue>(&raw) {
                errors.push(format!("{key}: {e}"));
            }
        }

        // A missing or stale version marker means migrations have not run
        // against this database.
        let marker: Option<JsonValue> =
            sqlx::query_scalar("SELECT value FROM schema_meta WHERE key = $1")
                .bind(crate::migration::VERSION_KEY)
                .fetch_optional(&self.pool)
                .await?;
        match marker.as_ref().and_then(JsonValue::as_i64) {
            Some(v) if v == crate::migration::SCHEMA_VERSION => {}
            Some(v) => errors.push(format!(
                "schema marker at version {v}, expected {}",
                crate::migration::SCHEMA_VERSION
            )),
            None => errors.push("schema marker missing".to_string()),
        }

        info!(
            subsystem = "store",
            records_checked = rows.len(),
            error_count = errors.len(),
            "Integrity scan completed"
        );

        Ok(IntegrityReport {
            is_valid: errors.is_empty(),
            errors,
            records_checked: rows.len(),
            estimated_bytes,
        })
    }
}

/// Create the store tables when they do not exist yet.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS context_records (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            updated_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_by  TEXT NOT NULL DEFAULT 'unknown'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_meta (
            key    TEXT PRIMARY KEY,
            value  JSONB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
