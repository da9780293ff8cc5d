//! # Merge Rules
//!
//! Pure conflict resolution: given the authoritative snapshot of an entity and
//! an incoming change, decide whether the change applies and what the entity
//! looks like afterwards. No storage, no clock.
//!
//! ## Decision Table
//! ```text
//! ┌──────────────┬───────────────────┬──────────────────────────────────────┐
//! │  snapshot    │  operation        │  device (Optimistic)  │ CRM (Authority)│
//! ├──────────────┼───────────────────┼───────────────────────┼────────────────┤
//! │  missing     │  create           │  apply, version 1     │  same          │
//! │  missing     │  update           │  not_found            │  apply as create│
//! │  missing     │  delete           │  not_found            │  not_found     │
//! │  tombstone   │  create           │  tombstoned           │  resurrect     │
//! │  tombstone   │  update / delete  │  tombstoned           │  tombstoned    │
//! │  live        │  create           │  already_exists       │  merge fields  │
//! │  live        │  update           │  version check, merge │  merge fields  │
//! │  live        │  delete           │  tombstone            │  tombstone     │
//! └──────────────┴───────────────────┴───────────────────────┴────────────────┘
//! ```
//!
//! Field merge is a shallow last-writer-wins on the top-level keys of the
//! payload. Lifecycle fields (see [`crate::status`]) are checked before the
//! merge. A rejected status rejects the whole change and leaves the snapshot
//! untouched.

use serde_json::{Map, Value};

use crate::status::graph_for;
use crate::types::{ConflictReason, EntitySnapshot, Operation};

/// How version numbers and lifecycle edges are enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionRule {
    /// Device pushes: base version may not be ahead of the server,
    /// status fields must follow their graph.
    Optimistic,
    /// The CRM is authoritative for the fields it sends: no version check,
    /// status values need only be known.
    Authority,
}

/// The change being merged.
#[derive(Debug, Clone, Copy)]
pub struct IncomingChange<'a> {
    pub entity_type: &'a str,
    pub operation: Operation,
    pub payload: &'a Value,
    /// Entity version the writer based its edit on.
    pub base_version: Option<i64>,
}

/// Result of an applied merge.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    /// Operation recorded in the change log (may differ from the request
    /// under [`VersionRule::Authority`]).
    pub operation: Operation,
    /// Entity state after the change.
    pub state: Value,
    pub deleted: bool,
    /// Entity version after the change.
    pub version: i64,
    /// Fields written, as recorded in the change log.
    pub payload: Value,
}

/// Decides the fate of one change against the current snapshot.
pub fn decide(
    snapshot: Option<&EntitySnapshot>,
    change: &IncomingChange<'_>,
    rule: VersionRule,
) -> Result<Applied, ConflictReason> {
    match (snapshot, change.operation) {
        (None, Operation::Create) => create(change, 1),
        (None, Operation::Update) if rule == VersionRule::Authority => create(change, 1),
        (None, _) => Err(ConflictReason::NotFound),

        (Some(s), Operation::Create) if s.deleted && rule == VersionRule::Authority => {
            create(change, s.version + 1)
        }
        (Some(s), _) if s.deleted => Err(ConflictReason::Tombstoned),

        (Some(_), Operation::Create) if rule == VersionRule::Optimistic => {
            Err(ConflictReason::AlreadyExists)
        }
        (Some(s), Operation::Create | Operation::Update) => update(s, change, rule),
        (Some(s), Operation::Delete) => Ok(Applied {
            operation: Operation::Delete,
            state: s.state.clone(),
            deleted: true,
            version: s.version + 1,
            payload: Value::Object(Map::new()),
        }),
    }
}

fn create(change: &IncomingChange<'_>, version: i64) -> Result<Applied, ConflictReason> {
    let fields = as_object(change.payload)?;
    check_status(change.entity_type, None, fields, false)?;

    Ok(Applied {
        operation: Operation::Create,
        state: change.payload.clone(),
        deleted: false,
        version,
        payload: change.payload.clone(),
    })
}

fn update(
    snapshot: &EntitySnapshot,
    change: &IncomingChange<'_>,
    rule: VersionRule,
) -> Result<Applied, ConflictReason> {
    if rule == VersionRule::Optimistic {
        if let Some(base) = change.base_version {
            if base > snapshot.version {
                return Err(ConflictReason::VersionAhead);
            }
        }
    }

    let fields = as_object(change.payload)?;
    check_status(
        change.entity_type,
        Some(snapshot),
        fields,
        rule == VersionRule::Optimistic,
    )?;

    let mut merged = snapshot.state.as_object().cloned().unwrap_or_default();
    for (key, value) in fields {
        merged.insert(key.clone(), value.clone());
    }

    Ok(Applied {
        operation: Operation::Update,
        state: Value::Object(merged),
        deleted: false,
        version: snapshot.version + 1,
        payload: change.payload.clone(),
    })
}

fn as_object(payload: &Value) -> Result<&Map<String, Value>, ConflictReason> {
    payload.as_object().ok_or(ConflictReason::InvalidChange)
}

fn check_status(
    entity_type: &str,
    snapshot: Option<&EntitySnapshot>,
    fields: &Map<String, Value>,
    enforce_edges: bool,
) -> Result<(), ConflictReason> {
    let Some(graph) = graph_for(entity_type) else {
        return Ok(());
    };
    let Some(proposed) = fields.get(graph.field) else {
        return Ok(());
    };
    let current = snapshot.and_then(|s| s.field_str(graph.field));
    graph.check(current, proposed, enforce_edges)
}
