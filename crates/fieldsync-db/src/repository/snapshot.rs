//! # Entity Snapshot Repository
//!
//! Authoritative current state per `(entity_type, entity_id)`. Written in
//! the same transaction as the change record that produced it.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteConnection;
use sqlx::SqlitePool;

use crate::error::{DbError, DbResult};
use fieldsync_core::{EntitySnapshot, Origin};

#[derive(Debug, sqlx::FromRow)]
struct SnapshotRow {
    entity_type: String,
    entity_id: String,
    version: i64,
    state: String,
    deleted: bool,
    owner_user_id: Option<String>,
    origin_kind: String,
    origin_id: String,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SnapshotRow> for EntitySnapshot {
    type Error = DbError;

    fn try_from(row: SnapshotRow) -> Result<Self, Self::Error> {
        Ok(EntitySnapshot {
            state: serde_json::from_str(&row.state)
                .map_err(|e| DbError::corrupt("entity_snapshots", e))?,
            last_modified_by: Origin::from_parts(&row.origin_kind, row.origin_id)
                .map_err(|e| DbError::corrupt("entity_snapshots", e))?,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            version: row.version,
            deleted: row.deleted,
            owner_user_id: row.owner_user_id,
            updated_at: row.updated_at,
        })
    }
}

/// Repository for entity snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotRepository {
    pool: SqlitePool,
}

impl SnapshotRepository {
    /// Creates a new SnapshotRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SnapshotRepository { pool }
    }

    /// Current snapshot, tombstones included.
    pub async fn get(&self, entity_type: &str, entity_id: &str) -> DbResult<Option<EntitySnapshot>> {
        let mut conn = self.pool.acquire().await?;
        Self::get_in(&mut conn, entity_type, entity_id).await
    }

    /// [`Self::get`] inside a write transaction.
    pub async fn get_in(
        conn: &mut SqliteConnection,
        entity_type: &str,
        entity_id: &str,
    ) -> DbResult<Option<EntitySnapshot>> {
        let row: Option<SnapshotRow> = sqlx::query_as(
            r#"
            SELECT entity_type, entity_id, version, state, deleted, owner_user_id,
                   origin_kind, origin_id, updated_at
            FROM entity_snapshots
            WHERE entity_type = ?1 AND entity_id = ?2
            "#,
        )
        .bind(entity_type)
        .bind(entity_id)
        .fetch_optional(conn)
        .await?;

        row.map(EntitySnapshot::try_from).transpose()
    }

    /// Inserts or replaces the snapshot of an entity.
    ///
    /// The owner is set on first insert and never changed afterwards.
    pub async fn upsert(conn: &mut SqliteConnection, snapshot: &EntitySnapshot) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO entity_snapshots (
                entity_type, entity_id, version, state, deleted, owner_user_id,
                origin_kind, origin_id, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT (entity_type, entity_id) DO UPDATE SET
                version = excluded.version,
                state = excluded.state,
                deleted = excluded.deleted,
                owner_user_id = COALESCE(entity_snapshots.owner_user_id, excluded.owner_user_id),
                origin_kind = excluded.origin_kind,
                origin_id = excluded.origin_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&snapshot.entity_type)
        .bind(&snapshot.entity_id)
        .bind(snapshot.version)
        .bind(snapshot.state.to_string())
        .bind(snapshot.deleted)
        .bind(&snapshot.owner_user_id)
        .bind(snapshot.last_modified_by.kind())
        .bind(snapshot.last_modified_by.id())
        .bind(snapshot.updated_at)
        .execute(conn)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::db;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn snapshot(version: i64, owner: Option<&str>) -> EntitySnapshot {
        EntitySnapshot {
            entity_type: "contact".to_string(),
            entity_id: "c-1".to_string(),
            version,
            state: json!({ "name": "Ann" }),
            deleted: false,
            owner_user_id: owner.map(str::to_string),
            last_modified_by: Origin::device("d-1"),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let db = db().await;
        assert!(db.snapshots().get("contact", "c-1").await.unwrap().is_none());

        let mut tx = db.begin_write().await.unwrap();
        SnapshotRepository::upsert(tx.conn(), &snapshot(1, Some("u-1"))).await.unwrap();
        tx.commit().await.unwrap();

        let stored = db.snapshots().get("contact", "c-1").await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.state, json!({ "name": "Ann" }));
        assert_eq!(stored.owner_user_id.as_deref(), Some("u-1"));
    }

    #[tokio::test]
    async fn test_owner_is_sticky() {
        let db = db().await;
        let mut tx = db.begin_write().await.unwrap();
        SnapshotRepository::upsert(tx.conn(), &snapshot(1, Some("u-1"))).await.unwrap();

        let mut next = snapshot(2, Some("u-2"));
        next.deleted = true;
        next.last_modified_by = Origin::system("crm");
        SnapshotRepository::upsert(tx.conn(), &next).await.unwrap();

        let stored = SnapshotRepository::get_in(tx.conn(), "contact", "c-1")
            .await
            .unwrap()
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(stored.version, 2);
        assert!(stored.deleted);
        assert_eq!(stored.owner_user_id.as_deref(), Some("u-1"));
        assert_eq!(stored.last_modified_by, Origin::system("crm"));
    }
}
