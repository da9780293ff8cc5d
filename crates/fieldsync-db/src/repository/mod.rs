//! # Repository Module
//!
//! One repository per table group of the authority store.
//!
//! ## Reads vs Writes
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Reads (no write gate needed)                                          │
//! │      db.changes().list_after(since, limit)                             │
//! │      db.snapshots().get("order", id)                                   │
//! │           │                                                             │
//! │           ▼  &self.pool                                                 │
//! │                                                                         │
//! │  Writes (and reads that a write depends on)                            │
//! │      let mut tx = db.begin_write().await?;                             │
//! │      SnapshotRepository::get_in(tx.conn(), "order", id)                │
//! │      ChangeLogRepository::append(tx.conn(), &change)                   │
//! │      tx.commit().await?;                                               │
//! │           │                                                             │
//! │           ▼  &mut SqliteConnection inside the WriteTx                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`change_log::ChangeLogRepository`] - Append-only change log
//! - [`snapshot::SnapshotRepository`] - Current entity state
//! - [`device::DeviceRepository`] - Device registry rows
//! - [`receipt::ReceiptRepository`] - Push idempotency receipts
//! - [`sync_status::SyncStatusRepository`] - Per-channel sync outcomes
//! - [`crm::CrmRepository`] - CRM cursors and inbound event dedup

pub mod change_log;
pub mod crm;
pub mod device;
pub mod receipt;
pub mod snapshot;
pub mod sync_status;

#[cfg(test)]
pub(crate) mod test_support {
    use crate::{Database, DbConfig};

    pub async fn db() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }
}
