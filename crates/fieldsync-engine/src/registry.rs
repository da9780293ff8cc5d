//! # Device Registry
//!
//! Known devices, the cursor each one has acknowledged, and liveness.
//!
//! ## Device Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   register ──► ACTIVE ◄──────── register / pull / push ──┐             │
//! │                  │                                        │             │
//! │                  │ silent for stale_after                 │             │
//! │                  ▼                                        │             │
//! │                STALE ─────────────────────────────────────┘             │
//! │                                                                         │
//! │   ACTIVE / STALE ── mark_revoked ──► REVOKED (sticky; wipe required)   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The cursor only moves forward, and only on acknowledgment.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fieldsync_core::validation::validate_device_id;
use fieldsync_core::{Device, DeviceStatus};
use fieldsync_db::{Database, DeviceRepository, WriteTx};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

/// Device bookkeeping.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    db: Database,
    stale_after: ChronoDuration,
}

impl DeviceRegistry {
    pub fn new(db: Database, stale_after: std::time::Duration) -> Self {
        DeviceRegistry {
            db,
            stale_after: ChronoDuration::from_std(stale_after)
                .unwrap_or_else(|_| ChronoDuration::days(7)),
        }
    }

    /// Registers a device for a user.
    ///
    /// Idempotent: re-registering refreshes liveness and keeps the cursor.
    ///
    /// ## Errors
    /// - `Unauthorized` if the device is revoked or belongs to another user
    pub async fn register(&self, device_id: &str, user_id: &str) -> SyncResult<Device> {
        validate_device_id(device_id)?;

        let now = Utc::now();
        let mut tx = self.db.begin_write().await?;

        let device = match DeviceRepository::get_in(tx.conn(), device_id).await? {
            Some(existing) => {
                check_access(&existing, user_id)?;
                DeviceRepository::touch(tx.conn(), device_id, now).await?;
                debug!(device_id, "Device re-registered");
                Device {
                    last_seen_at: now,
                    status: DeviceStatus::Active,
                    ..existing
                }
            }
            None => {
                let device = Device {
                    device_id: device_id.to_string(),
                    owner_user_id: user_id.to_string(),
                    last_acked_sequence: 0,
                    last_seen_at: now,
                    status: DeviceStatus::Active,
                    registered_at: now,
                };
                DeviceRepository::insert(tx.conn(), &device).await?;
                info!(device_id, user_id, "Device registered");
                device
            }
        };

        tx.commit().await?;
        Ok(device)
    }

    pub async fn get(&self, device_id: &str) -> SyncResult<Device> {
        self.db
            .devices()
            .get(device_id)
            .await?
            .ok_or_else(|| SyncError::not_found("Device", device_id))
    }

    pub async fn list_for_owner(&self, user_id: &str) -> SyncResult<Vec<Device>> {
        Ok(self.db.devices().list_for_owner(user_id).await?)
    }

    /// Checks that `user_id` may sync as `device_id` and records liveness.
    ///
    /// Used at the start of every pull and push.
    pub async fn authorize(&self, device_id: &str, user_id: &str) -> SyncResult<Device> {
        let mut tx = self.db.begin_write().await?;
        let device = Self::authorize_in(&mut tx, device_id, user_id).await?;
        tx.commit().await?;
        Ok(device)
    }

    pub(crate) async fn authorize_in(
        tx: &mut WriteTx,
        device_id: &str,
        user_id: &str,
    ) -> SyncResult<Device> {
        let device = DeviceRepository::get_in(tx.conn(), device_id)
            .await?
            .ok_or_else(|| SyncError::not_found("Device", device_id))?;
        check_access(&device, user_id)?;

        let now = Utc::now();
        DeviceRepository::touch(tx.conn(), device_id, now).await?;
        Ok(Device {
            last_seen_at: now,
            status: DeviceStatus::Active,
            ..device
        })
    }

    /// Records liveness without any other effect.
    pub async fn touch(&self, device_id: &str) -> SyncResult<()> {
        let mut tx = self.db.begin_write().await?;
        let found = DeviceRepository::touch(tx.conn(), device_id, Utc::now()).await?;
        tx.commit().await?;

        if found {
            Ok(())
        } else {
            Err(SyncError::not_found("Device", device_id))
        }
    }

    /// Moves a device's acknowledged cursor to `sequence`.
    ///
    /// Acknowledging the current value again succeeds without effect.
    ///
    /// ## Errors
    /// - `StaleCursor` if `sequence` is below the current cursor
    /// - `Unauthorized` if the device is revoked
    pub async fn advance_cursor(&self, device_id: &str, sequence: i64) -> SyncResult<Device> {
        let mut tx = self.db.begin_write().await?;
        let device = Self::advance_cursor_in(&mut tx, device_id, sequence).await?;
        tx.commit().await?;
        Ok(device)
    }

    pub(crate) async fn advance_cursor_in(
        tx: &mut WriteTx,
        device_id: &str,
        sequence: i64,
    ) -> SyncResult<Device> {
        let device = DeviceRepository::get_in(tx.conn(), device_id)
            .await?
            .ok_or_else(|| SyncError::not_found("Device", device_id))?;

        if device.is_revoked() {
            return Err(SyncError::Unauthorized(format!("device {device_id} is revoked")));
        }
        if sequence < device.last_acked_sequence {
            warn!(
                device_id,
                acked = device.last_acked_sequence,
                requested = sequence,
                "Cursor regression rejected"
            );
            return Err(SyncError::StaleCursor {
                device_id: device_id.to_string(),
                acked: device.last_acked_sequence,
                requested: sequence,
            });
        }

        if sequence > device.last_acked_sequence {
            DeviceRepository::set_acked(tx.conn(), device_id, sequence).await?;
            debug!(device_id, sequence, "Device cursor advanced");
        }
        let now = Utc::now();
        DeviceRepository::touch(tx.conn(), device_id, now).await?;

        Ok(Device {
            last_acked_sequence: sequence,
            last_seen_at: now,
            status: DeviceStatus::Active,
            ..device
        })
    }

    /// Revokes a device. It is excluded from every later pull and push.
    pub async fn mark_revoked(&self, device_id: &str) -> SyncResult<Device> {
        let mut tx = self.db.begin_write().await?;
        if !DeviceRepository::set_status(tx.conn(), device_id, DeviceStatus::Revoked).await? {
            return Err(SyncError::not_found("Device", device_id));
        }
        let device = DeviceRepository::get_in(tx.conn(), device_id)
            .await?
            .ok_or_else(|| SyncError::not_found("Device", device_id))?;
        tx.commit().await?;

        warn!(device_id, owner = %device.owner_user_id, "Device revoked");
        Ok(device)
    }

    /// Whether the device must purge its local replica.
    pub async fn is_wipe_required(&self, device_id: &str) -> SyncResult<bool> {
        Ok(self.get(device_id).await?.is_revoked())
    }

    /// Marks active devices silent since `now - stale_after` as stale.
    pub async fn sweep_stale(&self, now: DateTime<Utc>) -> SyncResult<u64> {
        let cutoff = now - self.stale_after;
        let mut tx = self.db.begin_write().await?;
        let marked = DeviceRepository::mark_stale_before(tx.conn(), cutoff).await?;
        tx.commit().await?;

        if marked > 0 {
            info!(marked, %cutoff, "Silent devices marked stale");
        }
        Ok(marked)
    }
}

fn check_access(device: &Device, user_id: &str) -> SyncResult<()> {
    if device.owner_user_id != user_id {
        return Err(SyncError::Unauthorized(format!(
            "device {} is registered to another user",
            device.device_id
        )));
    }
    if device.is_revoked() {
        return Err(SyncError::Unauthorized(format!(
            "device {} is revoked",
            device.device_id
        )));
    }
    Ok(())
}
