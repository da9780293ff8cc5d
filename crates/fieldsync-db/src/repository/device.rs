//! # Device Repository
//!
//! Rows of the device registry: ownership, ack cursor, liveness.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteConnection;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;
use fieldsync_core::{Device, DeviceStatus};

#[derive(Debug, sqlx::FromRow)]
struct DeviceRow {
    device_id: String,
    owner_user_id: String,
    last_acked_sequence: i64,
    last_seen_at: DateTime<Utc>,
    status: DeviceStatus,
    registered_at: DateTime<Utc>,
}

impl From<DeviceRow> for Device {
    fn from(row: DeviceRow) -> Self {
        Device {
            device_id: row.device_id,
            owner_user_id: row.owner_user_id,
            last_acked_sequence: row.last_acked_sequence,
            last_seen_at: row.last_seen_at,
            status: row.status,
            registered_at: row.registered_at,
        }
    }
}

const SELECT_DEVICE: &str = r#"
    SELECT device_id, owner_user_id, last_acked_sequence, last_seen_at, status, registered_at
    FROM devices
"#;

/// Repository for registered devices.
#[derive(Debug, Clone)]
pub struct DeviceRepository {
    pool: SqlitePool,
}

impl DeviceRepository {
    /// Creates a new DeviceRepository.
    pub fn new(pool: SqlitePool) -> Self {
        DeviceRepository { pool }
    }

    pub async fn get(&self, device_id: &str) -> DbResult<Option<Device>> {
        let mut conn = self.pool.acquire().await?;
        Self::get_in(&mut conn, device_id).await
    }

    pub async fn get_in(conn: &mut SqliteConnection, device_id: &str) -> DbResult<Option<Device>> {
        let row: Option<DeviceRow> =
            sqlx::query_as(&format!("{SELECT_DEVICE} WHERE device_id = ?1"))
                .bind(device_id)
                .fetch_optional(conn)
                .await?;
        Ok(row.map(Device::from))
    }

    /// All devices of one user, most recently seen first.
    pub async fn list_for_owner(&self, owner_user_id: &str) -> DbResult<Vec<Device>> {
        let rows: Vec<DeviceRow> = sqlx::query_as(&format!(
            "{SELECT_DEVICE} WHERE owner_user_id = ?1 ORDER BY last_seen_at DESC"
        ))
        .bind(owner_user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Device::from).collect())
    }

    pub async fn insert(conn: &mut SqliteConnection, device: &Device) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO devices (
                device_id, owner_user_id, last_acked_sequence, last_seen_at, status, registered_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&device.device_id)
        .bind(&device.owner_user_id)
        .bind(device.last_acked_sequence)
        .bind(device.last_seen_at)
        .bind(device.status)
        .bind(device.registered_at)
        .execute(conn)
        .await?;

        debug!(device_id = %device.device_id, "Device row inserted");
        Ok(())
    }

    /// Records activity. A stale device becomes active again; a revoked
    /// device stays revoked.
    pub async fn touch(
        conn: &mut SqliteConnection,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE devices SET
                last_seen_at = ?2,
                status = CASE WHEN status = 'stale' THEN 'active' ELSE status END
            WHERE device_id = ?1
            "#,
        )
        .bind(device_id)
        .bind(now)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_acked(
        conn: &mut SqliteConnection,
        device_id: &str,
        sequence: i64,
    ) -> DbResult<()> {
        sqlx::query("UPDATE devices SET last_acked_sequence = ?2 WHERE device_id = ?1")
            .bind(device_id)
            .bind(sequence)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn set_status(
        conn: &mut SqliteConnection,
        device_id: &str,
        status: DeviceStatus,
    ) -> DbResult<bool> {
        let result = sqlx::query("UPDATE devices SET status = ?2 WHERE device_id = ?1")
            .bind(device_id)
            .bind(status)
            .execute(conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Marks active devices not seen since `cutoff` as stale.
    ///
    /// Returns the number of devices marked.
    pub async fn mark_stale_before(
        conn: &mut SqliteConnection,
        cutoff: DateTime<Utc>,
    ) -> DbResult<u64> {
        let result = sqlx::query(
            "UPDATE devices SET status = 'stale' WHERE status = 'active' AND last_seen_at < ?1",
        )
        .bind(cutoff)
        .execute(conn)
        .await?;
        Ok(result.rows_affected())
    }
}
