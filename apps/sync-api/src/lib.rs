//! # fieldsync sync-api
//!
//! HTTP surface of the sync engine.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          sync-api Routes                                │
//! │                                                                         │
//! │  ┌────────────────────┐  ┌────────────────────┐  ┌───────────────────┐ │
//! │  │  Device (bearer)   │  │  CRM (secret hdr)  │  │ Operator (bearer) │ │
//! │  │                    │  │                    │  │                   │ │
//! │  │ POST /sync/devices │  │ POST /crm/webhooks │  │ GET /status/      │ │
//! │  │ GET  /sync/pull    │  │      /{event}      │  │   conflicted      │ │
//! │  │ POST /sync/push    │  │                    │  │   failed, counts  │ │
//! │  │ POST /sync/ack     │  │                    │  │ POST /status/crm/ │ │
//! │  │ GET  /security/    │  │                    │  │   retry           │ │
//! │  │   wipe-status      │  │                    │  │                   │ │
//! │  └────────────────────┘  └────────────────────┘  └───────────────────┘ │
//! │                                                                         │
//! │  GET /healthz (open)                                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration
//! Environment variables:
//! - `FIELDSYNC_BIND` - listen address (default: 0.0.0.0:8080)
//! - `FIELDSYNC_DATABASE_PATH` - SQLite file (default: fieldsync.db)
//! - `FIELDSYNC_JWT_SECRET` - secret for caller tokens (required)
//! - `FIELDSYNC_CONFIG` - engine TOML file
//! - `RUST_LOG` - log filter (default: info)

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use fieldsync_db::Database;
use fieldsync_engine::{CrmInbound, DispatcherHandle, Reconciler, SyncConfig, SyncStatusTracker};

// Re-exports
pub use auth::JwtManager;
pub use config::ServerConfig;
pub use error::ApiError;
pub use routes::app_router;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<SyncConfig>,
    pub reconciler: Reconciler,
    pub inbound: CrmInbound,
    pub status: SyncStatusTracker,
    pub jwt: Arc<JwtManager>,
    /// Present when outbound delivery is configured.
    pub dispatcher: Option<DispatcherHandle>,
}

impl AppState {
    pub fn new(
        db: Database,
        config: Arc<SyncConfig>,
        jwt: JwtManager,
        dispatcher: Option<DispatcherHandle>,
    ) -> Self {
        let mut reconciler = Reconciler::new(db.clone(), config.clone());
        if let Some(ref handle) = dispatcher {
            reconciler = reconciler.with_notifier(handle.notifier());
        }

        AppState {
            inbound: CrmInbound::new(db.clone(), config.crm.system.clone()),
            status: SyncStatusTracker::new(db.clone()),
            reconciler,
            jwt: Arc::new(jwt),
            dispatcher,
            config,
            db,
        }
    }
}
