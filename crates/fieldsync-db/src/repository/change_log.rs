//! # Change Log Repository
//!
//! The append-only, totally ordered log of accepted changes.
//!
//! ## Sequence Assignment
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Inside one WriteTx                                   │
//! │                                                                         │
//! │  1. SELECT 1 FROM change_records WHERE id = ?    → duplicate? reject   │
//! │  2. SELECT COALESCE(MAX(server_sequence), 0)     → head                │
//! │  3. requested sequence present and != head + 1?  → SequenceConflict    │
//! │  4. INSERT ... server_sequence = head + 1                              │
//! │                                                                         │
//! │  The write gate guarantees no other append runs between 2 and 4, and   │
//! │  a rolled-back transaction leaves no gap.                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteConnection;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use fieldsync_core::{ChangeRecord, NewChange, Operation, Origin};

#[derive(Debug, sqlx::FromRow)]
struct ChangeRow {
    server_sequence: i64,
    id: String,
    entity_type: String,
    entity_id: String,
    operation: Operation,
    payload: String,
    origin_kind: String,
    origin_id: String,
    client_version: Option<i64>,
    entity_version: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<ChangeRow> for ChangeRecord {
    type Error = DbError;

    fn try_from(row: ChangeRow) -> Result<Self, Self::Error> {
        let payload = serde_json::from_str(&row.payload)
            .map_err(|e| DbError::corrupt("change_records", e))?;
        let origin = Origin::from_parts(&row.origin_kind, row.origin_id)
            .map_err(|e| DbError::corrupt("change_records", e))?;

        Ok(ChangeRecord {
            id: row.id,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            operation: row.operation,
            payload,
            origin,
            server_sequence: row.server_sequence,
            client_version: row.client_version,
            entity_version: row.entity_version,
            created_at: row.created_at,
        })
    }
}

const SELECT_CHANGE: &str = r#"
    SELECT server_sequence, id, entity_type, entity_id, operation, payload,
           origin_kind, origin_id, client_version, entity_version, created_at
    FROM change_records
"#;

/// Repository for the change log.
#[derive(Debug, Clone)]
pub struct ChangeLogRepository {
    pool: SqlitePool,
}

impl ChangeLogRepository {
    /// Creates a new ChangeLogRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ChangeLogRepository { pool }
    }

    /// Highest assigned sequence, 0 for an empty log.
    pub async fn head(&self) -> DbResult<i64> {
        let mut conn = self.pool.acquire().await?;
        Self::head_in(&mut conn).await
    }

    /// [`Self::head`] inside a write transaction.
    pub async fn head_in(conn: &mut SqliteConnection) -> DbResult<i64> {
        let head: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(server_sequence), 0) FROM change_records")
                .fetch_one(conn)
                .await?;
        Ok(head)
    }

    /// Whether a change id is already in the log.
    pub async fn contains_in(conn: &mut SqliteConnection, id: &str) -> DbResult<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM change_records WHERE id = ?1")
            .bind(id)
            .fetch_optional(conn)
            .await?;
        Ok(found.is_some())
    }

    /// Appends a change at `head + 1`.
    ///
    /// ## Errors
    /// - `UniqueViolation` if the change id is already in the log
    /// - `SequenceConflict` if `requested_sequence` is set and is not `head + 1`
    pub async fn append(conn: &mut SqliteConnection, change: &NewChange) -> DbResult<ChangeRecord> {
        if Self::contains_in(&mut *conn, &change.id).await? {
            return Err(DbError::duplicate("change_records.id", change.id.clone()));
        }

        let next = Self::head_in(&mut *conn).await? + 1;
        if let Some(requested) = change.requested_sequence {
            if requested != next {
                return Err(DbError::SequenceConflict {
                    requested,
                    expected: next,
                });
            }
        }

        let record = ChangeRecord {
            id: change.id.clone(),
            entity_type: change.entity_type.clone(),
            entity_id: change.entity_id.clone(),
            operation: change.operation,
            payload: change.payload.clone(),
            origin: change.origin.clone(),
            server_sequence: next,
            client_version: change.client_version,
            entity_version: change.entity_version,
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO change_records (
                server_sequence, id, entity_type, entity_id, operation, payload,
                origin_kind, origin_id, client_version, entity_version, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(record.server_sequence)
        .bind(&record.id)
        .bind(&record.entity_type)
        .bind(&record.entity_id)
        .bind(record.operation)
        .bind(record.payload.to_string())
        .bind(record.origin.kind())
        .bind(record.origin.id())
        .bind(record.client_version)
        .bind(record.entity_version)
        .bind(record.created_at)
        .execute(conn)
        .await?;

        debug!(
            id = %record.id,
            sequence = record.server_sequence,
            entity_type = %record.entity_type,
            entity_id = %record.entity_id,
            "Change appended"
        );

        Ok(record)
    }

    /// Records with `server_sequence > since`, ascending, at most `limit`.
    pub async fn list_after(&self, since: i64, limit: i64) -> DbResult<Vec<ChangeRecord>> {
        let rows: Vec<ChangeRow> = sqlx::query_as(&format!(
            "{SELECT_CHANGE} WHERE server_sequence > ?1 ORDER BY server_sequence ASC LIMIT ?2"
        ))
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ChangeRecord::try_from).collect()
    }

    /// Looks up a change by id.
    pub async fn find(&self, id: &str) -> DbResult<Option<ChangeRecord>> {
        let row: Option<ChangeRow> = sqlx::query_as(&format!("{SELECT_CHANGE} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(ChangeRecord::try_from).transpose()
    }

    /// Full history of one entity, oldest first.
    pub async fn for_entity(&self, entity_type: &str, entity_id: &str) -> DbResult<Vec<ChangeRecord>> {
        let rows: Vec<ChangeRow> = sqlx::query_as(&format!(
            "{SELECT_CHANGE} WHERE entity_type = ?1 AND entity_id = ?2 ORDER BY server_sequence ASC"
        ))
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ChangeRecord::try_from).collect()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
