//! # Hub State Repository
//!
//! Small key/value facts the hub keeps across reboots, such as the time of
//! the last successful sync cycle.

use chrono::Utc;
use sqlx::SqlitePool;

use crate::error::DbResult;

/// Key under which the end of the last fully successful sync cycle is stored.
pub const KEY_LAST_SUCCESSFUL_SYNC: &str = "last_successful_sync";

/// Repository for hub key/value state.
#[derive(Debug, Clone)]
pub struct HubStateRepository {
    pool: SqlitePool,
}

impl HubStateRepository {
    /// Creates a new HubStateRepository.
    pub fn new(pool: SqlitePool) -> Self {
        HubStateRepository { pool }
    }

    /// Returns the stored value for `key`.
    pub async fn get(&self, key: &str) -> DbResult<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM hub_state WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub async fn set(&self, key: &str, value: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO hub_state (key, value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reads an epoch-seconds value, ignoring anything unparseable.
    pub async fn get_timestamp(&self, key: &str) -> DbResult<Option<i64>> {
        Ok(self.get(key).await?.and_then(|v| v.parse().ok()))
    }

    /// Stores an epoch-seconds value.
    pub async fn set_timestamp(&self, key: &str, value: i64) -> DbResult<()> {
        self.set(key, &value.to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    #[tokio::test]
    async fn test_get_set() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.state();

        assert_eq!(repo.get("missing").await.unwrap(), None);

        repo.set_timestamp(KEY_LAST_SUCCESSFUL_SYNC, 1_700_000_000)
            .await
            .unwrap();
        repo.set_timestamp(KEY_LAST_SUCCESSFUL_SYNC, 1_700_000_060)
            .await
            .unwrap();

        assert_eq!(
            repo.get_timestamp(KEY_LAST_SUCCESSFUL_SYNC).await.unwrap(),
            Some(1_700_000_060)
        );
    }
}
