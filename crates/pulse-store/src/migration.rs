//! Schema versioning for stored context records.
//!
//! The store keeps a single version marker in `schema_meta`. On startup the
//! migrator compares the marker against [`SCHEMA_VERSION`] and runs every
//! pending upgrade step over all stored records, in order. Each step is a
//! pure function over one record and returns `None` when the record already
//! has the target shape, so a record is only rewritten when a step actually
//! changed it. The marker is written last: if the process dies mid-run the
//! next start repeats the steps, which is safe because every step is
//! idempotent.

use serde_json::{json, Value as JsonValue};
use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::{info, warn};

use pulse_core::Result;

/// Current schema version. Bump together with a new step in
/// [`upgrade_record`].
pub const SCHEMA_VERSION: i64 = 2;

pub(crate) const VERSION_KEY: &str = "schema_version";

/// Runs pending record upgrades against a store's database.
pub struct Migrator {
    pool: PgPool,
}

/// Outcome of one migrator run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub from_version: i64,
    pub to_version: i64,
    pub records_scanned: usize,
    pub records_rewritten: usize,
}

impl Migrator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Read the stored version marker, defaulting to 0 on a fresh database.
    pub async fn current_version(&self) -> Result<i64> {
        let row = sqlx::query("SELECT value FROM schema_meta WHERE key = $1")
            .bind(VERSION_KEY)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .and_then(|r| r.get::<JsonValue, _>("value").as_i64())
            .unwrap_or(0))
    }

    /// Bring every stored record up to [`SCHEMA_VERSION`]. A no-op (zero
    /// writes) when the marker is already current.
    pub async fn run(&self) -> Result<MigrationReport> {
        let from_version = self.current_version().await?;
        if from_version >= SCHEMA_VERSION {
            return Ok(MigrationReport {
                from_version,
                to_version: from_version,
                records_scanned: 0,
                records_rewritten: 0,
            });
        }

        info!(
            subsystem = "store",
            component = "migrator",
            from_version,
            to_version = SCHEMA_VERSION,
            "Running store migrations"
        );

        let rows = sqlx::query("SELECT key, value FROM context_records ORDER BY key")
            .fetch_all(&self.pool)
            .await?;

        let mut rewritten = 0;
        for row in &rows {
            let key: String = row.get("key");
            let raw: String = row.get("value");
            let value: JsonValue = match serde_json::from_str(&raw) {
                Ok(v) => v,
                Err(e) => {
                    // Corrupt rows are the read path's problem; skip here.
                    warn!(
                        subsystem = "store",
                        component = "migrator",
                        key,
                        error = %e,
                        "Skipping unparseable record during migration"
                    );
                    continue;
                }
            };

            if let Some(upgraded) = upgrade_record(&key, &value, from_version) {
                sqlx::query("UPDATE context_records SET value = $2, updated_at = now() WHERE key = $1")
                    .bind(&key)
                    .bind(serde_json::to_string(&upgraded)?)
                    .execute(&self.pool)
                    .await?;
                rewritten += 1;
            }
        }

        // Marker last, so an interrupted run is retried in full.
        sqlx::query(
            r#"
            INSERT INTO schema_meta (key, value) VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(VERSION_KEY)
        .bind(json!(SCHEMA_VERSION))
        .execute(&self.pool)
        .await?;

        info!(
            subsystem = "store",
            component = "migrator",
            records_scanned = rows.len(),
            records_rewritten = rewritten,
            "Store migrations complete"
        );

        Ok(MigrationReport {
            from_version,
            to_version: SCHEMA_VERSION,
            records_scanned: rows.len(),
            records_rewritten: rewritten,
        })
    }
}

/// Apply every step above `from_version` to one record. Returns `None` when
/// no step changed anything.
pub fn upgrade_record(key: &str, value: &JsonValue, from_version: i64) -> Option<JsonValue> {
    let mut current = value.clone();
    let mut changed = false;

    if from_version < 1 {
        if let Some(next) = backfill_timestamps(&current) {
            current = next;
            changed = true;
        }
    }
    if from_version < 2 {
        if let Some(next) = normalize_reference_lists(key, &current) {
            current = next;
            changed = true;
        }
    }

    changed.then_some(current)
}

/// v1: records missing `updatedAt` get it backfilled from `createdAt`.
/// Applies to every object inside a stored collection array, and to stored
/// single objects.
pub fn backfill_timestamps(value: &JsonValue) -> Option<JsonValue> {
    fn fix_object(obj: &serde_json::Map<String, JsonValue>) -> Option<JsonValue> {
        if obj.contains_key("updatedAt") {
            return None;
        }
        let created = obj.get("createdAt")?.clone();
        let mut next = obj.clone();
        next.insert("updatedAt".to_string(), created);
        Some(JsonValue::Object(next))
    }

    match value {
        JsonValue::Object(obj) => fix_object(obj),
        JsonValue::Array(items) => {
            let mut changed = false;
            let next: Vec<JsonValue> = items
                .iter()
                .map(|item| match item {
                    JsonValue::Object(obj) => match fix_object(obj) {
                        Some(fixed) => {
                            changed = true;
                            fixed
                        }
                        None => item.clone(),
                    },
                    _ => item.clone(),
                })
                .collect();
            changed.then_some(JsonValue::Array(next))
        }
        _ => None,
    }
}

/// v2: reference-list fields (`*_ids` / `*Ids`) holding a scalar become a
/// one-element array; existing arrays are deduplicated and sorted so
/// equality checks elsewhere are textual.
pub fn normalize_reference_lists(key: &str, value: &JsonValue) -> Option<JsonValue> {
    // Only collection keys carry reference lists.
    if !pulse_core::defaults::EXPECTED_COLLECTIONS.contains(&key) {
        return None;
    }

    fn is_ref_list_field(name: &str) -> bool {
        name.ends_with("_ids") || name.ends_with("Ids")
    }

    fn normalize_list(items: &[JsonValue]) -> Option<Vec<JsonValue>> {
        // A list holding non-string ids is left alone rather than losing
        // entries to the string filter.
        if !items.iter().all(JsonValue::is_string) {
            return None;
        }
        let mut ids: Vec<String> = items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect();
        ids.sort();
        ids.dedup();
        let next: Vec<JsonValue> = ids.into_iter().map(JsonValue::String).collect();
        (next != items).then_some(next)
    }

    fn fix_object(obj: &serde_json::Map<String, JsonValue>) -> Option<JsonValue> {
        let mut next = obj.clone();
        let mut changed = false;
        for (field, val) in obj {
            if !is_ref_list_field(field) {
                continue;
            }
            match val {
                JsonValue::String(s) => {
                    next.insert(field.clone(), json!([s]));
                    changed = true;
                }
                JsonValue::Array(items) => {
                    if let Some(fixed) = normalize_list(items) {
                        next.insert(field.clone(), JsonValue::Array(fixed));
                        changed = true;
                    }
                }
                _ => {}
            }
        }
        changed.then_some(JsonValue::Object(next))
    }

    match value {
        JsonValue::Object(obj) => fix_object(obj),
        JsonValue::Array(items) => {
            let mut changed = false;
            let next: Vec<JsonValue> = items
                .iter()
                .map(|item| match item {
                    JsonValue::Object(obj) => match fix_object(obj) {
                        Some(fixed) => {
                            changed = true;
                            fixed
                        }
                        None => item.clone(),
                    },
                    _ => item.clone(),
                })
                .collect();
            changed.then_some(JsonValue::Array(next))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backfill_adds_updated_at_from_created_at() {
        let record = json!({ "id": "t1", "createdAt": "2026-01-01T00:00:00Z" });
        let fixed = backfill_timestamps(&record).unwrap();
        assert_eq!(fixed["updatedAt"], fixed["createdAt"]);
    }

    #[test]
    fn test_backfill_is_idempotent() {
        let record = json!({ "id": "t1", "createdAt": "x", "updatedAt": "y" });
        assert!(backfill_timestamps(&record).is_none());
    }

    #[test]
    fn test_backfill_handles_collection_arrays() {
        let records = json!([
            { "id": "a", "createdAt": "x" },
            { "id": "b", "createdAt": "x", "updatedAt": "y" },
        ]);
        let fixed = backfill_timestamps(&records).unwrap();
        assert_eq!(fixed[0]["updatedAt"], "x");
        assert_eq!(fixed[1]["updatedAt"], "y");
    }

    #[test]
    fn test_normalize_scalar_ref_becomes_array() {
        let records = json!([{ "id": "p1", "resource_ids": "r1" }]);
        let fixed = normalize_reference_lists("projects", &records).unwrap();
        assert_eq!(fixed[0]["resource_ids"], json!(["r1"]));
    }

    #[test]
    fn test_normalize_sorts_and_dedupes() {
        let records = json!([{ "id": "p1", "resource_ids": ["r2", "r1", "r2"] }]);
        let fixed = normalize_reference_lists("projects", &records).unwrap();
        assert_eq!(fixed[0]["resource_ids"], json!(["r1", "r2"]));
    }

    #[test]
    fn test_normalize_skips_non_collection_keys() {
        let value = json!([{ "id": "p1", "resource_ids": "r1" }]);
        assert!(normalize_reference_lists("settings", &value).is_none());
    }

    #[test]
    fn test_normalize_leaves_non_string_ids_alone() {
        let records = json!([
            { "id": "p1", "resource_ids": [2, 1] },
            { "id": "p2", "resource_ids": ["r1", 3] },
        ]);
        assert!(normalize_reference_lists("projects", &records).is_none());
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let records = json!([{ "id": "p1", "resource_ids": ["r1", "r2"] }]);
        assert!(normalize_reference_lists("projects", &records).is_none());
    }

    #[test]
    fn test_upgrade_record_runs_pending_steps_only() {
        let record = json!([{ "id": "p1", "createdAt": "x", "resource_ids": "r1" }]);

        // From version 0 both steps apply.
        let fixed = upgrade_record("projects", &record, 0).unwrap();
        assert_eq!(fixed[0]["updatedAt"], "x");
        assert_eq!(fixed[0]["resource_ids"], json!(["r1"]));

        // From version 1 only the reference normalization runs.
        let fixed = upgrade_record("projects", &record, 1).unwrap();
        assert!(fixed[0].get("updatedAt").is_none());
        assert_eq!(fixed[0]["resource_ids"], json!(["r1"]));

        // A current record is untouched.
        let current = json!([{ "id": "p1", "createdAt": "x", "updatedAt": "x", "resource_ids": ["r1"] }]);
        assert!(upgrade_record("projects", &current, 0).is_none());
    }
}
