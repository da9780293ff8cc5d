//! # fieldsync-core: Pure Sync Domain
//!
//! The domain half of the sync engine: types exchanged with devices and the
//! CRM, the rules that decide whether a change applies, and the tables that
//! translate between sync and CRM vocabulary. Zero I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        fieldsync Architecture                           │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │            Mobile devices              CRM (webhooks)           │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ HTTP (apps/sync-api)                   │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │   fieldsync-engine: reconciler, registry, CRM bridge, status    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ fieldsync-core (THIS CRATE) ★                   │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │   merge   │  │   status  │  │    crm    │  │   │
//! │  │   │  Change   │  │  decide() │  │  graphs   │  │  mapping  │  │   │
//! │  │   │  Device   │  │           │  │           │  │  tables   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                  fieldsync-db (Authority Store)                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - ChangeRecord, Device, EntitySnapshot, SyncStatusEntry, push protocol
//! - [`merge`] - Conflict resolution against the authoritative snapshot
//! - [`status`] - Lifecycle graphs for `order.status` and `deal.stage`
//! - [`crm`] - Inbound/outbound CRM event mapping
//! - [`validation`] - Structural validation of pushed changes
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use fieldsync_core::merge::{decide, IncomingChange, VersionRule};
//! use fieldsync_core::Operation;
//! use serde_json::json;
//!
//! let payload = json!({ "title": "Replace faucet", "status": "new" });
//! let applied = decide(
//!     None,
//!     &IncomingChange {
//!         entity_type: "order",
//!         operation: Operation::Create,
//!         payload: &payload,
//!         base_version: Some(0),
//!     },
//!     VersionRule::Optimistic,
//! )
//! .unwrap();
//!
//! assert_eq!(applied.version, 1);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod crm;
pub mod error;
pub mod merge;
pub mod status;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum changes accepted in one push request.
pub const MAX_PUSH_BATCH: usize = 500;

/// Maximum length of change, entity and device ids.
pub const MAX_ID_LEN: usize = 128;

/// Maximum length of an entity type slug.
pub const MAX_ENTITY_TYPE_LEN: usize = 64;

/// Name of the CRM as a change origin (`Origin::System`).
pub const CRM_SYSTEM: &str = "crm";
