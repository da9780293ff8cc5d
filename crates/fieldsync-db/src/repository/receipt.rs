//! # Push Receipt Repository
//!
//! Stores the outcome of every pushed change under its client change id, so a
//! replayed push returns the original result without appending anything.

use chrono::Utc;
use sqlx::sqlite::SqliteConnection;
use sqlx::SqlitePool;

use crate::error::{DbError, DbResult};
use fieldsync_core::PushOutcome;

/// A stored push outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct PushReceipt {
    pub change_id: String,
    pub device_id: String,
    pub outcome: PushOutcome,
}

#[derive(Debug, sqlx::FromRow)]
struct ReceiptRow {
    change_id: String,
    device_id: String,
    outcome: String,
}

impl TryFrom<ReceiptRow> for PushReceipt {
    type Error = DbError;

    fn try_from(row: ReceiptRow) -> Result<Self, Self::Error> {
        Ok(PushReceipt {
            outcome: serde_json::from_str(&row.outcome)
                .map_err(|e| DbError::corrupt("push_receipts", e))?,
            change_id: row.change_id,
            device_id: row.device_id,
        })
    }
}

/// Repository for push receipts.
#[derive(Debug, Clone)]
pub struct ReceiptRepository {
    pool: SqlitePool,
}

impl ReceiptRepository {
    /// Creates a new ReceiptRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ReceiptRepository { pool }
    }

    pub async fn get(&self, change_id: &str) -> DbResult<Option<PushReceipt>> {
        let mut conn = self.pool.acquire().await?;
        Self::get_in(&mut conn, change_id).await
    }

    pub async fn get_in(
        conn: &mut SqliteConnection,
        change_id: &str,
    ) -> DbResult<Option<PushReceipt>> {
        let row: Option<ReceiptRow> = sqlx::query_as(
            "SELECT change_id, device_id, outcome FROM push_receipts WHERE change_id = ?1",
        )
        .bind(change_id)
        .fetch_optional(conn)
        .await?;

        row.map(PushReceipt::try_from).transpose()
    }

    pub async fn insert(
        conn: &mut SqliteConnection,
        device_id: &str,
        outcome: &PushOutcome,
    ) -> DbResult<()> {
        let encoded =
            serde_json::to_string(outcome).map_err(|e| DbError::corrupt("push_receipts", e))?;

        sqlx::query(
            r#"
            INSERT INTO push_receipts (change_id, device_id, outcome, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(outcome.change_id())
        .bind(device_id)
        .bind(encoded)
        .bind(Utc::now())
        .execute(conn)
        .await?;

        Ok(())
    }
}
