//! # Config Repository
//!
//! Persists per-unit configuration payloads with their version and
//! needs-push flag.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use pedal_core::ConfigRecord;

use super::{stored_u32, stored_unit_id};
use crate::error::DbResult;

/// Repository for per-unit configuration records.
#[derive(Debug, Clone)]
pub struct ConfigRepository {
    pool: SqlitePool,
}

impl ConfigRepository {
    /// Creates a new ConfigRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ConfigRepository { pool }
    }

    /// Inserts or updates a configuration record.
    pub async fn upsert(&self, record: &ConfigRecord) -> DbResult<()> {
        debug!(
            unit_id = %record.unit_id,
            version = record.version,
            changed = record.changed,
            "Persisting unit config"
        );

        let payload = serde_json::to_string(&record.payload)?;

        sqlx::query(
            r#"
            INSERT INTO unit_configs (unit_id, payload, version, changed, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(unit_id) DO UPDATE SET
                payload = excluded.payload,
                version = excluded.version,
                changed = excluded.changed,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(record.unit_id.as_str())
        .bind(payload)
        .bind(i64::from(record.version))
        .bind(record.changed)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Loads every configuration record, ordered by unit id.
    pub async fn load_all(&self) -> DbResult<Vec<ConfigRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT unit_id, payload, version, changed, updated_at
            FROM unit_configs
            ORDER BY unit_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_config).collect()
    }
}

fn row_to_config(row: SqliteRow) -> DbResult<ConfigRecord> {
    let payload: String = row.try_get("payload")?;

    Ok(ConfigRecord {
        unit_id: stored_unit_id(row.try_get("unit_id")?)?,
        payload: serde_json::from_str(&payload)?,
        version: stored_u32("version", row.try_get("version")?)?,
        changed: row.try_get("changed")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use pedal_core::FieldUnitId;
    use serde_json::json;

    #[tokio::test]
    async fn test_upsert_and_load() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.configs();

        let mut record = ConfigRecord {
            unit_id: FieldUnitId::parse("u-AAA").unwrap(),
            payload: json!({ "report_interval_s": 60 }),
            version: 3,
            changed: true,
            updated_at: 1_700_000_000,
        };
        repo.upsert(&record).await.unwrap();

        record.changed = false;
        repo.upsert(&record).await.unwrap();

        let loaded = repo.load_all().await.unwrap();
        assert_eq!(loaded, vec![record]);
    }
}
