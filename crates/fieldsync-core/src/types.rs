//! # Domain Types
//!
//! Core sync types shared by the authority store, the engine and the HTTP
//! surface. Wire types serialize in camelCase because the mobile client's
//! sync layer consumes them through the generated TypeScript bindings.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Sync Types                                      │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  ChangeRecord   │   │     Device      │   │ EntitySnapshot  │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id (UUID)      │   │  device_id      │   │  entity key     │       │
//! │  │  entity key     │   │  owner_user_id  │   │  version        │       │
//! │  │  operation      │   │  last_acked_seq │   │  state (JSON)   │       │
//! │  │  origin         │   │  status         │   │  deleted        │       │
//! │  │  server_sequence│   └─────────────────┘   └─────────────────┘       │
//! │  └─────────────────┘                                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │ SyncStatusEntry │   │  CrmSyncCursor  │   │   PushChange    │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  PushOutcome    │       │
//! │  │  channel        │   │  last_delivered │   │  ConflictReason │       │
//! │  │  state          │   │  in_flight      │   │                 │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Entity Keys
//! Every synced record is addressed by `(entity_type, entity_id)`. The entity
//! type is a lowercase slug (`order`, `contact`, `deal`, ...), the id is the
//! client-generated UUID so offline devices can create records safely.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::CoreError;

// =============================================================================
// Operation
// =============================================================================

/// The kind of mutation a change applies to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(CoreError::UnknownOperation(other.to_string())),
        }
    }
}

// =============================================================================
// Origin
// =============================================================================

/// Who produced a change: a registered device or an external system.
///
/// Serialized as `{ "kind": "device", "id": "<device id>" }` or
/// `{ "kind": "system", "id": "crm" }`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Origin {
    Device(String),
    System(String),
}

impl Origin {
    pub fn device(id: impl Into<String>) -> Self {
        Origin::Device(id.into())
    }

    pub fn system(name: impl Into<String>) -> Self {
        Origin::System(name.into())
    }

    /// Storage discriminator (`device` / `system`).
    pub fn kind(&self) -> &'static str {
        match self {
            Origin::Device(_) => "device",
            Origin::System(_) => "system",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Origin::Device(id) | Origin::System(id) => id,
        }
    }

    /// Rebuilds an origin from its stored `(kind, id)` columns.
    pub fn from_parts(kind: &str, id: impl Into<String>) -> Result<Self, CoreError> {
        match kind {
            "device" => Ok(Origin::Device(id.into())),
            "system" => Ok(Origin::System(id.into())),
            other => Err(CoreError::UnknownOrigin(other.to_string())),
        }
    }

    pub fn is_device(&self, device_id: &str) -> bool {
        matches!(self, Origin::Device(id) if id == device_id)
    }

    pub fn is_system(&self, name: &str) -> bool {
        matches!(self, Origin::System(id) if id == name)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

// =============================================================================
// Change Record
// =============================================================================

/// One accepted mutation in the global change log.
///
/// Records are immutable once appended. `server_sequence` is strictly
/// increasing and gap-free per successful append, and is the only ordering
/// devices and the CRM bridge rely on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// Change id (client-generated UUID for device changes).
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    /// Fields written by this change (shallow JSON object).
    #[ts(type = "unknown")]
    pub payload: serde_json::Value,
    pub origin: Origin,
    pub server_sequence: i64,
    /// Version the device based its edit on. `None` for system changes.
    pub client_version: Option<i64>,
    /// Entity version after this change was applied.
    pub entity_version: i64,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

/// A change ready to be appended. The log assigns `server_sequence`
/// and `created_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChange {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: serde_json::Value,
    pub origin: Origin,
    pub client_version: Option<i64>,
    pub entity_version: i64,
    /// Sequence proposed by the caller. Must equal head + 1 when present.
    pub requested_sequence: Option<i64>,
}

// =============================================================================
// Device
// =============================================================================

/// Lifecycle status of a registered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Seen recently.
    Active,
    /// Not seen within the liveness window. Reactivates on next request.
    Stale,
    /// Credentials revoked. Sticky: a revoked device never becomes active again.
    Revoked,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Active => "active",
            DeviceStatus::Stale => "stale",
            DeviceStatus::Revoked => "revoked",
        }
    }
}

impl Default for DeviceStatus {
    fn default() -> Self {
        DeviceStatus::Active
    }
}

impl FromStr for DeviceStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(DeviceStatus::Active),
            "stale" => Ok(DeviceStatus::Stale),
            "revoked" => Ok(DeviceStatus::Revoked),
            other => Err(CoreError::UnknownDeviceStatus(other.to_string())),
        }
    }
}

/// A mobile client instance that replicates the change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub device_id: String,
    pub owner_user_id: String,
    /// Highest sequence the device confirmed it applied.
    pub last_acked_sequence: i64,
    #[ts(as = "String")]
    pub last_seen_at: DateTime<Utc>,
    pub status: DeviceStatus,
    #[ts(as = "String")]
    pub registered_at: DateTime<Utc>,
}

impl Device {
    pub fn is_revoked(&self) -> bool {
        self.status == DeviceStatus::Revoked
    }
}

// =============================================================================
// Entity Snapshot
// =============================================================================

/// Authoritative current state of one entity, derived from the change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct EntitySnapshot {
    pub entity_type: String,
    pub entity_id: String,
    /// Incremented on every applied change.
    pub version: i64,
    /// Current field values (JSON object). Kept as last known on tombstones.
    #[ts(type = "Record<string, unknown>")]
    pub state: serde_json::Value,
    /// Tombstone marker.
    pub deleted: bool,
    /// User that created the entity, used for pull visibility.
    pub owner_user_id: Option<String>,
    pub last_modified_by: Origin,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl EntitySnapshot {
    /// Reads a string field from the current state.
    pub fn field_str(&self, field: &str) -> Option<&str> {
        self.state.get(field).and_then(|v| v.as_str())
    }
}

// =============================================================================
// Sync Status
// =============================================================================

/// A destination a change must reach: one device or the CRM.
///
/// Textual form is `device:<id>` or `crm`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Channel {
    Device(String),
    Crm,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Device(id) => write!(f, "device:{id}"),
            Channel::Crm => f.write_str("crm"),
        }
    }
}

impl FromStr for Channel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "crm" {
            return Ok(Channel::Crm);
        }
        match s.strip_prefix("device:") {
            Some(id) if !id.is_empty() => Ok(Channel::Device(id.to_string())),
            _ => Err(CoreError::UnknownChannel(s.to_string())),
        }
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.to_string()
    }
}

impl TryFrom<String> for Channel {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Per-channel sync state of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Pending,
    Applied,
    Failed,
    Conflicted,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::Applied => "applied",
            SyncState::Failed => "failed",
            SyncState::Conflicted => "conflicted",
        }
    }
}

impl FromStr for SyncState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncState::Pending),
            "applied" => Ok(SyncState::Applied),
            "failed" => Ok(SyncState::Failed),
            "conflicted" => Ok(SyncState::Conflicted),
            other => Err(CoreError::UnknownSyncState(other.to_string())),
        }
    }
}

/// Latest known sync outcome for `(entity, channel)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusEntry {
    pub entity_type: String,
    pub entity_id: String,
    #[ts(type = "string")]
    pub channel: Channel,
    pub state: SyncState,
    pub attempts: i64,
    pub last_error: Option<String>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

/// Aggregate counts per sync state, for operator dashboards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusCounts {
    pub pending: i64,
    pub applied: i64,
    pub failed: i64,
    pub conflicted: i64,
}

// =============================================================================
// CRM Cursor
// =============================================================================

/// Delivery progress against one external system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct CrmSyncCursor {
    /// External system name (e.g. `crm`).
    pub system: String,
    /// Highest sequence successfully delivered outbound.
    pub last_delivered_sequence: i64,
    /// Last inbound webhook event absorbed.
    pub last_inbound_event_id: Option<String>,
    /// Sequence currently being retried, if any.
    pub in_flight_sequence: Option<i64>,
    /// Failed attempts for the in-flight sequence.
    pub in_flight_attempts: i64,
    /// Delivery stopped after exhausting retries. Cleared by an operator.
    pub halted: bool,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Push Protocol
// =============================================================================

/// A single locally recorded change in a device push batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct PushChange {
    /// Client change id, also the idempotency key.
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    #[serde(default)]
    #[ts(type = "unknown")]
    pub payload: serde_json::Value,
    /// Entity version the device based this change on (0 for creates).
    #[serde(default)]
    pub version: i64,
}

/// Why a pushed change was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// Status field moved along an edge the graph does not allow.
    InvalidStatusTransition,
    /// Status value is not part of the graph at all.
    InvalidStatusValue,
    /// Entity is deleted.
    Tombstoned,
    /// Create for an entity that already exists.
    AlreadyExists,
    /// Update/delete for an entity the server has never seen.
    NotFound,
    /// Device claims a version newer than the server's.
    VersionAhead,
    /// Change failed structural validation.
    InvalidChange,
}

impl ConflictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictReason::InvalidStatusTransition => "invalid_status_transition",
            ConflictReason::InvalidStatusValue => "invalid_status_value",
            ConflictReason::Tombstoned => "tombstoned",
            ConflictReason::AlreadyExists => "already_exists",
            ConflictReason::NotFound => "not_found",
            ConflictReason::VersionAhead => "version_ahead",
            ConflictReason::InvalidChange => "invalid_change",
        }
    }
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pushed change that was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedChange {
    pub id: String,
    pub server_sequence: i64,
    /// Entity version after the change.
    pub version: i64,
}

/// A pushed change that was rejected. The client must pull and reconcile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ConflictedChange {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub reason: ConflictReason,
    /// Server version of the entity, if it exists.
    pub current_version: Option<i64>,
}

/// Outcome of one pushed change. Also the stored idempotency receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PushOutcome {
    Accepted(AcceptedChange),
    Conflicted(ConflictedChange),
}

impl PushOutcome {
    pub fn change_id(&self) -> &str {
        match self {
            PushOutcome::Accepted(a) => &a.id,
            PushOutcome::Conflicted(c) => &c.id,
        }
    }
}

/// Response to a push batch, split by outcome in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct PushResult {
    pub accepted: Vec<AcceptedChange>,
    pub conflicts: Vec<ConflictedChange>,
}

impl PushResult {
    pub fn record(&mut self, outcome: PushOutcome) {
        match outcome {
            PushOutcome::Accepted(a) => self.accepted.push(a),
            PushOutcome::Conflicted(c) => self.conflicts.push(c),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_channel_text_form() {
        assert_eq!(Channel::Crm.to_string(), "crm");
        assert_eq!(Channel::Device("d-1".into()).to_string(), "device:d-1");
        assert_eq!("device:d-1".parse::<Channel>().unwrap(), Channel::Device("d-1".into()));
        assert_eq!("crm".parse::<Channel>().unwrap(), Channel::Crm);
        assert!("device:".parse::<Channel>().is_err());
        assert!("erp".parse::<Channel>().is_err());
    }

    #[test]
    fn test_origin_serializes_adjacently_tagged() {
        let json = serde_json::to_value(Origin::system("crm")).unwrap();
        assert_eq!(json, serde_json::json!({ "kind": "system", "id": "crm" }));

        let back = Origin::from_parts("device", "d-9").unwrap();
        assert!(back.is_device("d-9"));
        assert!(Origin::from_parts("robot", "x").is_err());
    }

    #[test]
    fn test_push_change_defaults() {
        let change: PushChange = serde_json::from_value(serde_json::json!({
            "id": "c1",
            "entityType": "order",
            "entityId": "o1",
            "operation": "delete"
        }))
        .unwrap();
        assert_eq!(change.version, 0);
        assert!(change.payload.is_null());
    }

    #[test]
    fn test_push_result_splits_outcomes() {
        let mut result = PushResult::default();
        result.record(PushOutcome::Accepted(AcceptedChange {
            id: "a".into(),
            server_sequence: 1,
            version: 1,
        }));
        result.record(PushOutcome::Conflicted(ConflictedChange {
            id: "b".into(),
            entity_type: "order".into(),
            entity_id: "o1".into(),
            reason: ConflictReason::Tombstoned,
            current_version: Some(3),
        }));
        assert_eq!(result.accepted.len(), 1);
        assert_eq!(result.conflicts[0].reason.as_str(), "tombstoned");
    }

    #[test]
    fn test_device_status_default() {
        assert_eq!(DeviceStatus::default(), DeviceStatus::Active);
        assert_eq!("revoked".parse::<DeviceStatus>().unwrap(), DeviceStatus::Revoked);
    }
}
