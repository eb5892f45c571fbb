//! # Buffer Repository
//!
//! Snapshot persistence for the offline buffer.
//!
//! ## Snapshot Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Snapshot, not journal                                │
//! │                                                                         │
//! │  OfflineBuffer (in memory, authoritative)                              │
//! │       │                                                                 │
//! │       │  every Nth insert / after confirm / on shutdown                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   SINGLE TRANSACTION                            │   │
//! │  │  1. DELETE FROM buffer_entries                                  │   │
//! │  │  2. INSERT every queued entry                                   │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  COMMIT ← the table always holds one complete snapshot                 │
//! │                                                                         │
//! │  Boot: load_all() ordered by seq restores insertion order              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use pedal_core::{BufferEntry, EntryKind};

use crate::error::{DbError, DbResult};

/// Repository for offline buffer snapshots.
#[derive(Debug, Clone)]
pub struct BufferRepository {
    pool: SqlitePool,
}

impl BufferRepository {
    /// Creates a new BufferRepository.
    pub fn new(pool: SqlitePool) -> Self {
        BufferRepository { pool }
    }

    /// Replaces the stored snapshot with `entries`.
    pub async fn save_snapshot<'a, I>(&self, entries: I) -> DbResult<usize>
    where
        I: IntoIterator<Item = &'a BufferEntry>,
    {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM buffer_entries")
            .execute(&mut *tx)
            .await?;

        let mut written = 0usize;
        for entry in entries {
            let seq = i64::try_from(entry.seq)
                .map_err(|_| DbError::invalid(format!("seq out of range: {}", entry.seq)))?;

            sqlx::query(
                r#"
                INSERT INTO buffer_entries (seq, kind, created_at, origin_id, payload, uploaded)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(seq)
            .bind(entry.kind)
            .bind(entry.created_at)
            .bind(&entry.origin_id)
            .bind(&entry.payload)
            .bind(entry.uploaded)
            .execute(&mut *tx)
            .await?;

            written += 1;
        }

        tx.commit().await?;

        debug!(entries = written, "Buffer snapshot saved");
        Ok(written)
    }

    /// Loads the stored snapshot in insertion order.
    pub async fn load_all(&self) -> DbResult<Vec<BufferEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT seq, kind, created_at, origin_id, payload, uploaded
            FROM buffer_entries
            ORDER BY seq ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_entry).collect()
    }

    /// Counts stored entries.
    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM buffer_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn row_to_entry(row: SqliteRow) -> DbResult<BufferEntry> {
    let seq: i64 = row.try_get("seq")?;
    let kind: EntryKind = row.try_get("kind")?;

    Ok(BufferEntry {
        seq: u64::try_from(seq).map_err(|_| DbError::invalid(format!("negative seq: {}", seq)))?,
        kind,
        created_at: row.try_get("created_at")?,
        origin_id: row.try_get("origin_id")?,
        payload: row.try_get("payload")?,
        uploaded: row.try_get("uploaded")?,
    })
}
