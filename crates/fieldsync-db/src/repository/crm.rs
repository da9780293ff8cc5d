//! # CRM Repository
//!
//! Delivery cursors per external system and the inbound event dedup table.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteConnection;
use sqlx::SqlitePool;

use crate::error::{DbError, DbResult};
use fieldsync_core::CrmSyncCursor;

#[derive(Debug, sqlx::FromRow)]
struct CursorRow {
    system: String,
    last_delivered_sequence: i64,
    last_inbound_event_id: Option<String>,
    in_flight_sequence: Option<i64>,
    in_flight_attempts: i64,
    halted: bool,
    updated_at: DateTime<Utc>,
}

impl From<CursorRow> for CrmSyncCursor {
    fn from(row: CursorRow) -> Self {
        CrmSyncCursor {
            system: row.system,
            last_delivered_sequence: row.last_delivered_sequence,
            last_inbound_event_id: row.last_inbound_event_id,
            in_flight_sequence: row.in_flight_sequence,
            in_flight_attempts: row.in_flight_attempts,
            halted: row.halted,
            updated_at: row.updated_at,
        }
    }
}

/// Repository for CRM cursors and inbound events.
#[derive(Debug, Clone)]
pub struct CrmRepository {
    pool: SqlitePool,
}

impl CrmRepository {
    /// Creates a new CrmRepository.
    pub fn new(pool: SqlitePool) -> Self {
        CrmRepository { pool }
    }

    /// Cursor for a system, if one was ever created.
    pub async fn cursor(&self, system: &str) -> DbResult<Option<CrmSyncCursor>> {
        let mut conn = self.pool.acquire().await?;
        Self::cursor_in(&mut conn, system).await
    }

    pub async fn cursor_in(
        conn: &mut SqliteConnection,
        system: &str,
    ) -> DbResult<Option<CrmSyncCursor>> {
        let row: Option<CursorRow> = sqlx::query_as(
            r#"
            SELECT system, last_delivered_sequence, last_inbound_event_id,
                   in_flight_sequence, in_flight_attempts, halted, updated_at
            FROM crm_sync_cursors
            WHERE system = ?1
            "#,
        )
        .bind(system)
        .fetch_optional(conn)
        .await?;

        Ok(row.map(CrmSyncCursor::from))
    }

    /// Returns the cursor for a system, creating it at sequence 0.
    pub async fn ensure_cursor(
        conn: &mut SqliteConnection,
        system: &str,
    ) -> DbResult<CrmSyncCursor> {
        sqlx::query(
            "INSERT OR IGNORE INTO crm_sync_cursors (system, updated_at) VALUES (?1, ?2)",
        )
        .bind(system)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;

        Self::cursor_in(conn, system)
            .await?
            .ok_or_else(|| DbError::not_found("CrmSyncCursor", system))
    }

    /// Writes the delivery columns of a cursor.
    ///
    /// Leaves `last_inbound_event_id` alone; inbound absorption owns it.
    pub async fn save_outbound(conn: &mut SqliteConnection, cursor: &CrmSyncCursor) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE crm_sync_cursors SET
                last_delivered_sequence = ?2,
                in_flight_sequence = ?3,
                in_flight_attempts = ?4,
                halted = ?5,
                updated_at = ?6
            WHERE system = ?1
            "#,
        )
        .bind(&cursor.system)
        .bind(cursor.last_delivered_sequence)
        .bind(cursor.in_flight_sequence)
        .bind(cursor.in_flight_attempts)
        .bind(cursor.halted)
        .bind(cursor.updated_at)
        .execute(conn)
        .await?;

        Ok(())
    }

    /// Records the latest absorbed inbound event id.
    pub async fn set_last_inbound(
        conn: &mut SqliteConnection,
        system: &str,
        event_id: &str,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE crm_sync_cursors SET
                last_inbound_event_id = ?2,
                updated_at = ?3
            WHERE system = ?1
            "#,
        )
        .bind(system)
        .bind(event_id)
        .bind(Utc::now())
        .execute(conn)
        .await?;

        Ok(())
    }

    /// Whether an inbound event id was already absorbed.
    pub async fn inbound_seen_in(
        conn: &mut SqliteConnection,
        system: &str,
        event_id: &str,
    ) -> DbResult<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM crm_inbound_events WHERE system = ?1 AND event_id = ?2",
        )
        .bind(system)
        .bind(event_id)
        .fetch_optional(conn)
        .await?;
        Ok(found.is_some())
    }

    /// Records an absorbed inbound event. `change_id` is `None` when the
    /// event produced no change (conflicted).
    pub async fn record_inbound(
        conn: &mut SqliteConnection,
        system: &str,
        event_id: &str,
        kind: &str,
        change_id: Option<&str>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO crm_inbound_events (system, event_id, kind, change_id, received_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(system)
        .bind(event_id)
        .bind(kind)
        .bind(change_id)
        .bind(Utc::now())
        .execute(conn)
        .await?;
        Ok(())
    }
}
