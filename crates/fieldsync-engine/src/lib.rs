//! # fieldsync-engine: Sync and CRM Engine
//!
//! Reconciles offline devices against the authoritative change log and keeps
//! an external CRM in step, in both directions.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │   devices (pull / push / ack)                 CRM webhooks (inbound)    │
//! │          │                                              │               │
//! │          ▼                                              ▼               │
//! │  ┌────────────────┐                          ┌────────────────────┐     │
//! │  │   Reconciler   │──── authorize ────┐      │     CrmInbound     │     │
//! │  │                │                   ▼      │                    │     │
//! │  │ validate batch │          ┌────────────────┐ dedup event id    │     │
//! │  │ merge (version │          │ DeviceRegistry │ merge (authority) │     │
//! │  │ check) + apply │          │ cursor, revoke │                   │     │
//! │  └───────┬────────┘          └────────────────┘└─────────┬────────┘     │
//! │          │                                               │              │
//! │          ▼                                               ▼              │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  ChangeLog (one WriteTx per change: record + snapshot + status) │   │
//! │  └────────────────────────────────┬────────────────────────────────┘   │
//! │                                   │ notify                              │
//! │                                   ▼                                     │
//! │  ┌────────────────┐      ┌────────────────┐      ┌────────────────┐    │
//! │  │ CrmDispatcher  │─────►│ WebhookSender  │─────►│      CRM       │    │
//! │  │ cursor, retry, │      │ (reqwest)      │      │                │    │
//! │  │ halt           │      └────────────────┘      └────────────────┘    │
//! │  └────────────────┘                                                     │
//! │                                                                         │
//! │  SyncStatusTracker: per entity, per channel (device:<id> / crm) state   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`change_log`] - Append-only change log and restartable scans
//! - [`registry`] - Device registry, cursors, liveness and revocation
//! - [`reconciler`] - Pull, push and acknowledgment
//! - [`crm`] - CRM bridge: outbound dispatcher, inbound absorber, sender
//! - [`status`] - Per-channel sync status for operators
//! - [`config`] - Engine configuration (defaults, TOML file, environment)
//! - [`error`] - Engine error taxonomy
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fieldsync_engine::{CrmDispatcher, Reconciler, ReqwestSender, SyncConfig};
//!
//! let config = Arc::new(SyncConfig::load(None)?);
//! let reconciler = Reconciler::new(db.clone(), config.clone());
//!
//! if let Some(sender) = ReqwestSender::from_settings(&config.crm)? {
//!     let (dispatcher, handle) = CrmDispatcher::new(db, config.crm.clone(), Arc::new(sender));
//!     tokio::spawn(dispatcher.run());
//!     let reconciler = reconciler.with_notifier(handle.notifier());
//! }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod change_log;
pub mod config;
pub mod crm;
pub mod error;
pub mod reconciler;
pub mod registry;
pub mod status;

// =============================================================================
// Re-exports
// =============================================================================

pub use change_log::{ChangeCursor, ChangeLog};
pub use config::{CrmSettings, EnvironmentSettings, SyncConfig, SyncSettings};
pub use crm::{
    CrmDispatcher, CrmInbound, CrmNotifier, DispatcherHandle, DrainReport, InboundOutcome,
    ReqwestSender, WebhookSender,
};
pub use error::{SyncError, SyncResult};
pub use reconciler::{AccessPolicy, OwnerPolicy, PullDelta, Reconciler};
pub use registry::DeviceRegistry;
pub use status::SyncStatusTracker;

// =============================================================================
// Test Support
// =============================================================================
