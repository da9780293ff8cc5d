//! # fieldsync-db: Authority Store
//!
//! SQLite persistence for the sync engine: the change log, entity snapshots,
//! the device registry, push receipts, per-channel sync status and CRM
//! cursors.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        fieldsync Data Flow                              │
//! │                                                                         │
//! │  Reconciler / Registry / CRM bridge (fieldsync-engine)                 │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   fieldsync-db (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │               │    │  (embedded)  │  │   │
//! │  │   │               │    │ ChangeLog     │    │              │  │   │
//! │  │   │ SqlitePool    │◄───│ Snapshot      │    │ 001_sync_    │  │   │
//! │  │   │ Write gate    │    │ Device        │    │   core.sql   │  │   │
//! │  │   │ WriteTx       │    │ Receipt       │    │              │  │   │
//! │  │   │               │    │ SyncStatus    │    │              │  │   │
//! │  │   │               │    │ Crm           │    │              │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite database (WAL)                                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool, configuration and the write gate
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Repository implementations
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fieldsync_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("sync.db")).await?;
//! let head = db.changes().head().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig, WriteTx};

// Repository re-exports for convenience
pub use repository::change_log::ChangeLogRepository;
pub use repository::crm::CrmRepository;
pub use repository::device::DeviceRepository;
pub use repository::receipt::{PushReceipt, ReceiptRepository};
pub use repository::snapshot::SnapshotRepository;
pub use repository::sync_status::SyncStatusRepository;
