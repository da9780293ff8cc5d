//! # Sync Status Repository
//!
//! Latest outcome per `(entity_type, entity_id, channel)`. One row per key,
//! overwritten on every outcome.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteConnection;
use sqlx::SqlitePool;

use crate::error::{DbError, DbResult};
use fieldsync_core::{Channel, SyncState, SyncStatusCounts, SyncStatusEntry};

#[derive(Debug, sqlx::FromRow)]
struct StatusRow {
    entity_type: String,
    entity_id: String,
    channel: String,
    state: SyncState,
    attempts: i64,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<StatusRow> for SyncStatusEntry {
    type Error = DbError;

    fn try_from(row: StatusRow) -> Result<Self, Self::Error> {
        Ok(SyncStatusEntry {
            channel: row
                .channel
                .parse::<Channel>()
                .map_err(|e| DbError::corrupt("sync_status", e))?,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            state: row.state,
            attempts: row.attempts,
            last_error: row.last_error,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_STATUS: &str = r#"
    SELECT entity_type, entity_id, channel, state, attempts, last_error, updated_at
    FROM sync_status
"#;

/// Repository for per-channel sync status.
#[derive(Debug, Clone)]
pub struct SyncStatusRepository {
    pool: SqlitePool,
}

impl SyncStatusRepository {
    /// Creates a new SyncStatusRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SyncStatusRepository { pool }
    }

    /// Writes the latest outcome for a key, replacing the previous one.
    pub async fn upsert(conn: &mut SqliteConnection, entry: &SyncStatusEntry) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_status (
                entity_type, entity_id, channel, state, attempts, last_error, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (entity_type, entity_id, channel) DO UPDATE SET
                state = excluded.state,
                attempts = excluded.attempts,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(entry.channel.to_string())
        .bind(entry.state)
        .bind(entry.attempts)
        .bind(&entry.last_error)
        .bind(entry.updated_at)
        .execute(conn)
        .await?;

        Ok(())
    }

    pub async fn get(
        &self,
        entity_type: &str,
        entity_id: &str,
        channel: &Channel,
    ) -> DbResult<Option<SyncStatusEntry>> {
        let mut conn = self.pool.acquire().await?;
        Self::get_in(&mut conn, entity_type, entity_id, channel).await
    }

    pub async fn get_in(
        conn: &mut SqliteConnection,
        entity_type: &str,
        entity_id: &str,
        channel: &Channel,
    ) -> DbResult<Option<SyncStatusEntry>> {
        let row: Option<StatusRow> = sqlx::query_as(&format!(
            "{SELECT_STATUS} WHERE entity_type = ?1 AND entity_id = ?2 AND channel = ?3"
        ))
        .bind(entity_type)
        .bind(entity_id)
        .bind(channel.to_string())
        .fetch_optional(conn)
        .await?;

        row.map(SyncStatusEntry::try_from).transpose()
    }

    /// All channels of one entity.
    pub async fn list_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> DbResult<Vec<SyncStatusEntry>> {
        let rows: Vec<StatusRow> = sqlx::query_as(&format!(
            "{SELECT_STATUS} WHERE entity_type = ?1 AND entity_id = ?2 ORDER BY channel"
        ))
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SyncStatusEntry::try_from).collect()
    }

    /// Entries in one state, most recently updated first.
    pub async fn list_by_state(&self, state: SyncState, limit: i64) -> DbResult<Vec<SyncStatusEntry>> {
        let rows: Vec<StatusRow> = sqlx::query_as(&format!(
            "{SELECT_STATUS} WHERE state = ?1 ORDER BY updated_at DESC LIMIT ?2"
        ))
        .bind(state)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SyncStatusEntry::try_from).collect()
    }

    /// Number of entries per state.
    pub async fn counts(&self) -> DbResult<SyncStatusCounts> {
        let rows: Vec<(SyncState, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM sync_status GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = SyncStatusCounts::default();
        for (state, n) in rows {
            match state {
                SyncState::Pending => counts.pending = n,
                SyncState::Applied => counts.applied = n,
                SyncState::Failed => counts.failed = n,
                SyncState::Conflicted => counts.conflicted = n,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::db;
    use pretty_assertions::assert_eq;

    fn entry(entity_id: &str, channel: Channel, state: SyncState) -> SyncStatusEntry {
        SyncStatusEntry {
            entity_type: "order".to_string(),
            entity_id: entity_id.to_string(),
            channel,
            state,
            attempts: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_latest_outcome_wins() {
        let db = db().await;
        let mut tx = db.begin_write().await.unwrap();
        SyncStatusRepository::upsert(tx.conn(), &entry("o-1", Channel::Crm, SyncState::Pending))
            .await
            .unwrap();
        let mut failed = entry("o-1", Channel::Crm, SyncState::Failed);
        failed.attempts = 5;
        failed.last_error = Some("HTTP 503".to_string());
        SyncStatusRepository::upsert(tx.conn(), &failed).await.unwrap();
        tx.commit().await.unwrap();

        let stored = db
            .sync_status()
            .get("order", "o-1", &Channel::Crm)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, SyncState::Failed);
        assert_eq!(stored.attempts, 5);
        assert_eq!(stored.last_error.as_deref(), Some("HTTP 503"));
    }

    #[tokio::test]
    async fn test_channels_are_independent() {
        let db = db().await;
        let mut tx = db.begin_write().await.unwrap();
        SyncStatusRepository::upsert(
            tx.conn(),
            &entry("o-1", Channel::Device("d-1".to_string()), SyncState::Applied),
        )
        .await
        .unwrap();
        SyncStatusRepository::upsert(tx.conn(), &entry("o-1", Channel::Crm, SyncState::Conflicted))
            .await
            .unwrap();
        SyncStatusRepository::upsert(tx.conn(), &entry("o-2", Channel::Crm, SyncState::Conflicted))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let all = db.sync_status().list_for_entity("order", "o-1").await.unwrap();
        assert_eq!(all.len(), 2);

        let conflicted = db
            .sync_status()
            .list_by_state(SyncState::Conflicted, 10)
            .await
            .unwrap();
        assert_eq!(conflicted.len(), 2);

        let counts = db.sync_status().counts().await.unwrap();
        assert_eq!(
            counts,
            SyncStatusCounts {
                pending: 0,
                applied: 1,
                failed: 0,
                conflicted: 2,
            }
        );
    }
}
