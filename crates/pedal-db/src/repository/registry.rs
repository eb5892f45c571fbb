//! # Registry Repository
//!
//! Persists unit admission records.
//!
//! ## Write Paths
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Local mutation (first contact, pending visit, heartbeat)              │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  upsert(record)  → INSERT ... ON CONFLICT(id) DO UPDATE                │
//! │                                                                         │
//! │  Cloud download (authoritative overwrite)                              │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  replace_all(records)                                                  │
//! │  ┌─────────────────────────────────────────────┐                       │
//! │  │  BEGIN                                       │                       │
//! │  │  DELETE FROM units                           │                       │
//! │  │  INSERT ... (one per record)                 │                       │
//! │  │  COMMIT  ← all or nothing                    │                       │
//! │  └─────────────────────────────────────────────┘                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use pedal_core::{Heartbeat, UnitRecord, UnitStatus};

use super::{stored_u32, stored_unit_id};
use crate::error::{DbError, DbResult};

const UPSERT_SQL: &str = r#"
    INSERT INTO units (
        id, status, first_seen, last_visit, visit_count,
        hb_timestamp, hb_battery_pct, hb_free_memory
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
    ON CONFLICT(id) DO UPDATE SET
        status = excluded.status,
        first_seen = excluded.first_seen,
        last_visit = excluded.last_visit,
        visit_count = excluded.visit_count,
        hb_timestamp = excluded.hb_timestamp,
        hb_battery_pct = excluded.hb_battery_pct,
        hb_free_memory = excluded.hb_free_memory
"#;

/// Repository for unit registry records.
#[derive(Debug, Clone)]
pub struct RegistryRepository {
    pool: SqlitePool,
}

impl RegistryRepository {
    /// Creates a new RegistryRepository.
    pub fn new(pool: SqlitePool) -> Self {
        RegistryRepository { pool }
    }

    /// Inserts or updates a single record.
    pub async fn upsert(&self, record: &UnitRecord) -> DbResult<()> {
        debug!(unit_id = %record.id, status = %record.status, "Persisting unit record");

        bind_record(sqlx::query(UPSERT_SQL), record)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Replaces the whole table with `records` in one transaction.
    pub async fn replace_all(&self, records: &[UnitRecord]) -> DbResult<()> {
        debug!(count = records.len(), "Replacing unit registry");

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM units").execute(&mut *tx).await?;

        for record in records {
            bind_record(sqlx::query(UPSERT_SQL), record)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Loads every record, ordered by id.
    pub async fn load_all(&self) -> DbResult<Vec<UnitRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, status, first_seen, last_visit, visit_count,
                   hb_timestamp, hb_battery_pct, hb_free_memory
            FROM units
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_record).collect()
    }

    /// Counts stored records.
    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM units")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn bind_record<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    record: &'q UnitRecord,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    let hb = record.last_heartbeat;
    query
        .bind(record.id.as_str())
        .bind(record.status)
        .bind(record.first_seen)
        .bind(record.last_visit)
        .bind(i64::from(record.visit_count))
        .bind(hb.map(|h| h.timestamp))
        .bind(hb.map(|h| i64::from(h.battery_pct)))
        .bind(hb.map(|h| i64::from(h.free_memory)))
}

fn row_to_record(row: SqliteRow) -> DbResult<UnitRecord> {
    let id = stored_unit_id(row.try_get("id")?)?;
    let status: UnitStatus = row.try_get("status")?;
    let visit_count = stored_u32("visit_count", row.try_get("visit_count")?)?;

    let hb_timestamp: Option<i64> = row.try_get("hb_timestamp")?;
    let hb_battery: Option<i64> = row.try_get("hb_battery_pct")?;
    let hb_memory: Option<i64> = row.try_get("hb_free_memory")?;

    let last_heartbeat = match (hb_timestamp, hb_battery, hb_memory) {
        (Some(timestamp), Some(battery), Some(memory)) => Some(Heartbeat {
            timestamp,
            battery_pct: u8::try_from(battery)
                .map_err(|_| DbError::invalid(format!("battery out of range: {}", battery)))?,
            free_memory: stored_u32("hb_free_memory", memory)?,
        }),
        _ => None,
    };

    Ok(UnitRecord {
        id,
        status,
        first_seen: row.try_get("first_seen")?,
        last_visit: row.try_get("last_visit")?,
        visit_count,
        last_heartbeat,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use pedal_core::FieldUnitId;

    fn record(id: &str, status: UnitStatus) -> UnitRecord {
        let mut r = UnitRecord::first_contact(FieldUnitId::parse(id).unwrap(), 100);
        r.status = status;
        r
    }

    #[tokio::test]
    async fn test_upsert_and_load() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.registry();

        let mut r = record("u-000001", UnitStatus::Pending);
        repo.upsert(&r).await.unwrap();

        r.visit_count = 2;
        r.last_visit = 200;
        r.last_heartbeat = Some(Heartbeat {
            timestamp: 200,
            battery_pct: 87,
            free_memory: 40_000,
        });
        repo.upsert(&r).await.unwrap();

        let loaded = repo.load_all().await.unwrap();
        assert_eq!(loaded, vec![r]);
    }

    #[tokio::test]
    async fn test_replace_all_drops_missing_units() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.registry();

        repo.upsert(&record("u-AAA", UnitStatus::Pending)).await.unwrap();
        repo.upsert(&record("u-BBB", UnitStatus::Pending)).await.unwrap();

        repo.replace_all(&[record("u-BBB", UnitStatus::Allowed)])
            .await
            .unwrap();

        let loaded = repo.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id.as_str(), "u-BBB");
        assert_eq!(loaded[0].status, UnitStatus::Allowed);
        assert_eq!(repo.count().await.unwrap(), 1);
    }
}
