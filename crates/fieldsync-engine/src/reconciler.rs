//! # Sync Reconciler
//!
//! Pull, push and acknowledge for devices, plus the apply step the CRM
//! inbound path shares.
//!
//! ## Push Flow (per change)
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       One WriteTx per change                            │
//! │                                                                         │
//! │  receipt for change id? ──yes──► replay stored outcome, append nothing │
//! │        │ no                                                             │
//! │        ▼                                                                │
//! │  load snapshot ──► merge::decide(Optimistic)                           │
//! │        │                         │                                      │
//! │        │ Ok(applied)             │ Err(reason)                          │
//! │        ▼                         ▼                                      │
//! │  append ChangeRecord        status device:<id> = conflicted            │
//! │  upsert snapshot                                                        │
//! │  status device:<id> = applied                                          │
//! │  status crm = pending (relevant types)                                 │
//! │        │                         │                                      │
//! │        └──────────┬──────────────┘                                      │
//! │                   ▼                                                     │
//! │           store receipt, commit                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Changes in one batch are applied one at a time in submitted order; no
//! lock spans more than one change. After the batch, the CRM dispatcher is
//! woken without waiting for it.
//!
//! ## Pull
//! Pull never moves the device cursor. The device acknowledges what it
//! applied, so a crash mid-apply means the same records come again.

use std::collections::HashMap;
use std::sync::Arc;

use fieldsync_core::merge::{self, IncomingChange, VersionRule};
use fieldsync_core::validation::{validate_batch, validate_device_id, validate_push_change};
use fieldsync_core::{
    AcceptedChange, Channel, ChangeRecord, ConflictReason, ConflictedChange, Device,
    EntitySnapshot, NewChange, Operation, Origin, PushChange, PushOutcome, PushResult, SyncState,
    ValidationError,
};
use fieldsync_db::{ChangeLogRepository, Database, ReceiptRepository, SnapshotRepository, WriteTx};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::change_log::ChangeLog;
use crate::config::SyncConfig;
use crate::crm::CrmNotifier;
use crate::error::{SyncError, SyncResult};
use crate::registry::DeviceRegistry;
use crate::status::SyncStatusTracker;

// =============================================================================
// Visibility
// =============================================================================

/// Decides which change records a user may pull.
pub trait AccessPolicy: Send + Sync + std::fmt::Debug {
    /// `snapshot` is the current state of the record's entity, if any.
    fn can_see(&self, user_id: &str, record: &ChangeRecord, snapshot: Option<&EntitySnapshot>)
        -> bool;
}

/// Owners see their entities; entities without an owner are shared.
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnerPolicy;

impl AccessPolicy for OwnerPolicy {
    fn can_see(
        &self,
        user_id: &str,
        _record: &ChangeRecord,
        snapshot: Option<&EntitySnapshot>,
    ) -> bool {
        match snapshot.and_then(|s| s.owner_user_id.as_deref()) {
            Some(owner) => owner == user_id,
            None => true,
        }
    }
}

// =============================================================================
// Pull Result
// =============================================================================

/// One page of changes for a device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullDelta {
    /// Visible records, strictly ascending by sequence.
    pub changes: Vec<ChangeRecord>,
    /// Last sequence scanned, visible or not. Pass as `since` next time.
    pub next_since: i64,
    /// More records exist after `next_since`.
    pub has_more: bool,
}

// =============================================================================
// Reconciler
// =============================================================================

/// Device-facing sync operations.
#[derive(Debug, Clone)]
pub struct Reconciler {
    db: Database,
    log: ChangeLog,
    registry: DeviceRegistry,
    policy: Arc<dyn AccessPolicy>,
    config: Arc<SyncConfig>,
    notifier: Option<CrmNotifier>,
}

impl Reconciler {
    pub fn new(db: Database, config: Arc<SyncConfig>) -> Self {
        Reconciler {
            log: ChangeLog::new(db.clone()),
            registry: DeviceRegistry::new(db.clone(), config.stale_after()),
            db,
            policy: Arc::new(OwnerPolicy),
            config,
            notifier: None,
        }
    }

    /// Replaces the default [`OwnerPolicy`].
    pub fn with_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Wakes the CRM dispatcher after pushes to CRM-relevant entities.
    pub fn with_notifier(mut self, notifier: CrmNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn log(&self) -> &ChangeLog {
        &self.log
    }

    // =========================================================================
    // Pull
    // =========================================================================

    /// Changes after `since` that the device's owner may see.
    ///
    /// `since` defaults to the device's acknowledged cursor.
    pub async fn pull(
        &self,
        device_id: &str,
        user_id: &str,
        since: Option<i64>,
        limit: Option<u32>,
    ) -> SyncResult<PullDelta> {
        let device = self.registry.authorize(device_id, user_id).await?;
        let since = since.unwrap_or(device.last_acked_sequence);
        let limit = self.config.pull_limit(limit);

        // One extra row tells us whether another page exists.
        let mut scanned = self.log.read_since(since, limit + 1).await?;
        let has_more = scanned.len() > limit as usize;
        scanned.truncate(limit as usize);
        let next_since = scanned.last().map_or(since, |r| r.server_sequence);

        let mut snapshots: HashMap<(String, String), Option<EntitySnapshot>> = HashMap::new();
        let mut changes = Vec::with_capacity(scanned.len());
        for record in scanned {
            let key = (record.entity_type.clone(), record.entity_id.clone());
            if !snapshots.contains_key(&key) {
                let snapshot = self
                    .db
                    .snapshots()
                    .get(&record.entity_type, &record.entity_id)
                    .await?;
                snapshots.insert(key.clone(), snapshot);
            }
            let snapshot = snapshots.get(&key).and_then(Option::as_ref);
            if self.policy.can_see(user_id, &record, snapshot) {
                changes.push(record);
            }
        }

        debug!(
            device_id,
            since,
            next_since,
            returned = changes.len(),
            has_more,
            "Pull served"
        );

        Ok(PullDelta {
            changes,
            next_since,
            has_more,
        })
    }

    // =========================================================================
    // Push
    // =========================================================================

    /// Applies a device's local changes.
    ///
    /// The whole batch is validated before anything is applied. After that,
    /// every change gets exactly one outcome; a change id seen before gets
    /// its original outcome back.
    pub async fn push(
        &self,
        device_id: &str,
        user_id: &str,
        changes: &[PushChange],
    ) -> SyncResult<PushResult> {
        validate_device_id(device_id)?;
        validate_batch(changes)?;
        for change in changes {
            validate_push_change(change)?;
        }

        self.registry.authorize(device_id, user_id).await?;

        let mut result = PushResult::default();
        let mut wake_crm = false;
        for change in changes {
            let (outcome, crm_pending) = self.push_one(device_id, user_id, change).await?;
            wake_crm |= crm_pending;
            result.record(outcome);
        }

        info!(
            device_id,
            accepted = result.accepted.len(),
            conflicts = result.conflicts.len(),
            "Push processed"
        );

        if wake_crm {
            if let Some(ref notifier) = self.notifier {
                notifier.notify();
            }
        }
        Ok(result)
    }

    async fn push_one(
        &self,
        device_id: &str,
        user_id: &str,
        change: &PushChange,
    ) -> SyncResult<(PushOutcome, bool)> {
        let mut tx = self.db.begin_write().await?;

        if let Some(receipt) = ReceiptRepository::get_in(tx.conn(), &change.id).await? {
            tx.rollback().await?;
            if receipt.device_id == device_id {
                debug!(device_id, change_id = %change.id, "Replaying push receipt");
                return Ok((receipt.outcome, false));
            }
            warn!(
                device_id,
                change_id = %change.id,
                "Change id already used by another device"
            );
            return Ok((conflicted(change, ConflictReason::InvalidChange, None), false));
        }

        // CRM-originated records share the id space.
        if ChangeLogRepository::contains_in(tx.conn(), &change.id).await? {
            tx.rollback().await?;
            return Ok((conflicted(change, ConflictReason::InvalidChange, None), false));
        }

        let origin = Origin::device(device_id);
        let mutation = Mutation {
            id: &change.id,
            entity_type: &change.entity_type,
            entity_id: &change.entity_id,
            operation: change.operation,
            payload: &change.payload,
            base_version: Some(change.version),
            origin: &origin,
            owner: Some(user_id),
        };
        let channel = Channel::Device(device_id.to_string());

        let (outcome, crm_pending) =
            match apply_in(&mut tx, &mutation, VersionRule::Optimistic).await? {
                Application::Accepted(record) => {
                    SyncStatusTracker::record_in(
                        &mut tx,
                        &record.entity_type,
                        &record.entity_id,
                        channel,
                        SyncState::Applied,
                        0,
                        None,
                    )
                    .await?;

                    let crm_pending = self.config.crm.outbound_enabled()
                        && self.config.crm.is_relevant(&record.entity_type);
                    if crm_pending {
                        SyncStatusTracker::record_in(
                            &mut tx,
                            &record.entity_type,
                            &record.entity_id,
                            Channel::Crm,
                            SyncState::Pending,
                            0,
                            None,
                        )
                        .await?;
                    }

                    let accepted = PushOutcome::Accepted(AcceptedChange {
                        id: record.id.clone(),
                        server_sequence: record.server_sequence,
                        version: record.entity_version,
                    });
                    (accepted, crm_pending)
                }
                Application::Rejected {
                    reason,
                    current_version,
                } => {
                    SyncStatusTracker::record_in(
                        &mut tx,
                        &change.entity_type,
                        &change.entity_id,
                        channel,
                        SyncState::Conflicted,
                        0,
                        Some(reason.to_string()),
                    )
                    .await?;
                    (conflicted(change, reason, current_version), false)
                }
            };

        ReceiptRepository::insert(tx.conn(), device_id, &outcome).await?;
        tx.commit().await?;
        Ok((outcome, crm_pending))
    }

    // =========================================================================
    // Acknowledge
    // =========================================================================

    /// Records that the device applied everything up to `sequence`.
    ///
    /// ## Errors
    /// - `Validation` if `sequence` is negative or above the log head
    /// - `StaleCursor` if `sequence` is below the current cursor
    pub async fn acknowledge(
        &self,
        device_id: &str,
        user_id: &str,
        sequence: i64,
    ) -> SyncResult<Device> {
        let mut tx = self.db.begin_write().await?;
        DeviceRegistry::authorize_in(&mut tx, device_id, user_id).await?;

        let head = ChangeLogRepository::head_in(tx.conn()).await?;
        if !(0..=head).contains(&sequence) {
            return Err(SyncError::Validation(ValidationError::OutOfRange {
                field: "sequence".to_string(),
                min: 0,
                max: head,
            }));
        }

        let device = DeviceRegistry::advance_cursor_in(&mut tx, device_id, sequence).await?;
        tx.commit().await?;
        Ok(device)
    }
}

fn conflicted(
    change: &PushChange,
    reason: ConflictReason,
    current_version: Option<i64>,
) -> PushOutcome {
    PushOutcome::Conflicted(ConflictedChange {
        id: change.id.clone(),
        entity_type: change.entity_type.clone(),
        entity_id: change.entity_id.clone(),
        reason,
        current_version,
    })
}

// =============================================================================
// Shared Apply Step
// =============================================================================

/// A change on its way into the authority store.
#[derive(Debug)]
pub(crate) struct Mutation<'a> {
    pub id: &'a str,
    pub entity_type: &'a str,
    pub entity_id: &'a str,
    pub operation: Operation,
    pub payload: &'a Value,
    pub base_version: Option<i64>,
    pub origin: &'a Origin,
    /// Owner recorded when this creates the entity.
    pub owner: Option<&'a str>,
}

#[derive(Debug)]
pub(crate) enum Application {
    Accepted(ChangeRecord),
    Rejected {
        reason: ConflictReason,
        current_version: Option<i64>,
    },
}

/// Merges a mutation into its entity and, if accepted, appends exactly one
/// change record and the new snapshot. Nothing is written on rejection.
pub(crate) async fn apply_in(
    tx: &mut WriteTx,
    mutation: &Mutation<'_>,
    rule: VersionRule,
) -> SyncResult<Application> {
    let snapshot =
        SnapshotRepository::get_in(tx.conn(), mutation.entity_type, mutation.entity_id).await?;

    let incoming = IncomingChange {
        entity_type: mutation.entity_type,
        operation: mutation.operation,
        payload: mutation.payload,
        base_version: mutation.base_version,
    };
    let applied = match merge::decide(snapshot.as_ref(), &incoming, rule) {
        Ok(applied) => applied,
        Err(reason) => {
            debug!(
                entity_type = mutation.entity_type,
                entity_id = mutation.entity_id,
                reason = reason.as_str(),
                "Change rejected"
            );
            return Ok(Application::Rejected {
                reason,
                current_version: snapshot.map(|s| s.version),
            });
        }
    };

    // Ownership is fixed by whoever created the entity.
    let owner = match snapshot {
        Some(existing) => existing.owner_user_id,
        None => mutation.owner.map(str::to_string),
    };

    let record = ChangeLog::append_in(
        tx,
        &NewChange {
            id: mutation.id.to_string(),
            entity_type: mutation.entity_type.to_string(),
            entity_id: mutation.entity_id.to_string(),
            operation: applied.operation,
            payload: applied.payload,
            origin: mutation.origin.clone(),
            client_version: mutation.base_version,
            entity_version: applied.version,
            requested_sequence: None,
        },
    )
    .await?;

    SnapshotRepository::upsert(
        tx.conn(),
        &EntitySnapshot {
            entity_type: record.entity_type.clone(),
            entity_id: record.entity_id.clone(),
            version: applied.version,
            state: applied.state,
            deleted: applied.deleted,
            owner_user_id: owner,
            last_modified_by: mutation.origin.clone(),
            updated_at: record.created_at,
        },
    )
    .await?;

    Ok(Application::Accepted(record))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{db, push_change, seed_snapshot};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn reconciler() -> Reconciler {
        let reconciler = Reconciler::new(db().await, Arc::new(SyncConfig::development()));
        reconciler.registry().register("tablet-a", "u-1").await.unwrap();
        reconciler.registry().register("tablet-b", "u-1").await.unwrap();
        reconciler.registry().register("tablet-x", "u-2").await.unwrap();
        reconciler
    }

    #[tokio::test]
    async fn test_create_then_update() {
        let r = reconciler().await;

        let created = r
            .push(
                "tablet-a",
                "u-1",
                &[push_change("c1", "order", "o1", Operation::Create, json!({"title": "Fix sink", "status": "new"}), 0)],
            )
            .await
            .unwrap();
        assert_eq!(created.accepted.len(), 1);
        assert_eq!(created.accepted[0].version, 1);

        let updated = r
            .push(
                "tablet-a",
                "u-1",
                &[push_change("c2", "order", "o1", Operation::Update, json!({"status": "accepted"}), 1)],
            )
            .await
            .unwrap();
        assert_eq!(updated.accepted[0].version, 2);
        assert_eq!(updated.accepted[0].server_sequence, 2);

        let snapshot = r.db.snapshots().get("order", "o1").await.unwrap().unwrap();
        assert_eq!(snapshot.state, json!({"title": "Fix sink", "status": "accepted"}));
        assert_eq!(snapshot.owner_user_id.as_deref(), Some("u-1"));
    }

    #[tokio::test]
    async fn test_retried_push_replays_outcome() {
        let r = reconciler().await;
        let batch = [push_change("c1", "contact", "p1", Operation::Create, json!({"name": "Ann"}), 0)];

        let first = r.push("tablet-a", "u-1", &batch).await.unwrap();
        let second = r.push("tablet-a", "u-1", &batch).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(r.log().head().await.unwrap(), 1);
        assert_eq!(r.db.snapshots().get("contact", "p1").await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_change_id_of_other_device_is_conflict() {
        let r = reconciler().await;
        let batch = [push_change("c1", "contact", "p1", Operation::Create, json!({"name": "Ann"}), 0)];
        r.push("tablet-a", "u-1", &batch).await.unwrap();

        let other = r.push("tablet-b", "u-1", &batch).await.unwrap();
        assert_eq!(other.conflicts[0].reason, ConflictReason::InvalidChange);
        assert_eq!(r.log().head().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stale_scalar_update_wins_by_arrival() {
        let r = reconciler().await;
        seed_snapshot(&r.db, "contact", "p1", 3, json!({"name": "Ann", "phone": "1"}), None).await;

        let result = r
            .push(
                "tablet-a",
                "u-1",
                &[push_change("c1", "contact", "p1", Operation::Update, json!({"phone": "2"}), 2)],
            )
            .await
            .unwrap();
        assert_eq!(result.accepted[0].version, 4);

        let snapshot = r.db.snapshots().get("contact", "p1").await.unwrap().unwrap();
        assert_eq!(snapshot.state, json!({"name": "Ann", "phone": "2"}));
    }

    #[tokio::test]
    async fn test_stale_status_transition_conflicts() {
        let r = reconciler().await;
        seed_snapshot(&r.db, "order", "o1", 5, json!({"status": "completed"}), None).await;

        let result = r
            .push(
                "tablet-a",
                "u-1",
                &[push_change("c1", "order", "o1", Operation::Update, json!({"status": "in_progress", "note": "x"}), 2)],
            )
            .await
            .unwrap();

        assert!(result.accepted.is_empty());
        assert_eq!(result.conflicts[0].reason, ConflictReason::InvalidStatusTransition);
        assert_eq!(result.conflicts[0].current_version, Some(5));

        let snapshot = r.db.snapshots().get("order", "o1").await.unwrap().unwrap();
        assert_eq!(snapshot.version, 5);
        assert_eq!(snapshot.state, json!({"status": "completed"}));
        assert_eq!(r.log().head().await.unwrap(), 0);

        let status = r
            .db
            .sync_status()
            .get("order", "o1", &Channel::Device("tablet-a".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.state, SyncState::Conflicted);
        assert_eq!(status.last_error.as_deref(), Some("invalid_status_transition"));
    }

    #[tokio::test]
    async fn test_delete_dominates() {
        let r = reconciler().await;
        seed_snapshot(&r.db, "order", "o1", 4, json!({"status": "new"}), None).await;

        let result = r
            .push(
                "tablet-a",
                "u-1",
                &[
                    push_change("del", "order", "o1", Operation::Delete, json!(null), 1),
                    push_change("upd", "order", "o1", Operation::Update, json!({"title": "late"}), 5),
                    push_change("re", "order", "o1", Operation::Create, json!({"title": "again"}), 0),
                ],
            )
            .await
            .unwrap();

        assert_eq!(result.accepted.len(), 1);
        assert_eq!(result.accepted[0].id, "del");
        let reasons: Vec<_> = result.conflicts.iter().map(|c| c.reason).collect();
        assert_eq!(reasons, vec![ConflictReason::Tombstoned, ConflictReason::Tombstoned]);
    }

    #[tokio::test]
    async fn test_invalid_batch_rejected_whole() {
        let r = reconciler().await;
        let batch = [
            push_change("ok", "contact", "p1", Operation::Create, json!({"name": "Ann"}), 0),
            push_change("bad", "Contact!", "p2", Operation::Create, json!({}), 0),
        ];
        assert!(matches!(
            r.push("tablet-a", "u-1", &batch).await,
            Err(SyncError::Validation(_))
        ));
        assert_eq!(r.log().head().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pull_filters_by_owner_and_pages() {
        let r = reconciler().await;
        r.push("tablet-a", "u-1", &[push_change("a1", "order", "mine", Operation::Create, json!({"status": "new"}), 0)])
            .await
            .unwrap();
        r.push("tablet-x", "u-2", &[push_change("x1", "order", "theirs", Operation::Create, json!({"status": "new"}), 0)])
            .await
            .unwrap();
        r.push("tablet-a", "u-1", &[push_change("a2", "contact", "p1", Operation::Create, json!({"name": "Ann"}), 0)])
            .await
            .unwrap();

        let delta = r.pull("tablet-b", "u-1", Some(0), None).await.unwrap();
        let ids: Vec<_> = delta.changes.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a2"]);
        assert_eq!(delta.next_since, 3);
        assert!(!delta.has_more);

        let page = r.pull("tablet-b", "u-1", Some(0), Some(2)).await.unwrap();
        assert_eq!(page.changes.len(), 1);
        assert_eq!(page.next_since, 2);
        assert!(page.has_more);
    }

    #[tokio::test]
    async fn test_shared_entities_visible_to_all() {
        let r = reconciler().await;
        seed_snapshot(&r.db, "deal", "d1", 1, json!({"stage": "lead"}), None).await;
        r.push("tablet-x", "u-2", &[push_change("x1", "deal", "d1", Operation::Update, json!({"stage": "qualified"}), 1)])
            .await
            .unwrap();

        let delta = r.pull("tablet-a", "u-1", Some(0), None).await.unwrap();
        assert_eq!(delta.changes.len(), 1);
    }

    #[tokio::test]
    async fn test_pull_defaults_to_acked_cursor_and_never_advances_it() {
        let r = reconciler().await;
        for id in ["c1", "c2"] {
            r.push("tablet-a", "u-1", &[push_change(id, "contact", id, Operation::Create, json!({"name": id}), 0)])
                .await
                .unwrap();
        }

        let delta = r.pull("tablet-b", "u-1", None, None).await.unwrap();
        assert_eq!(delta.changes.len(), 2);
        assert_eq!(r.registry().get("tablet-b").await.unwrap().last_acked_sequence, 0);

        r.acknowledge("tablet-b", "u-1", 1).await.unwrap();
        let delta = r.pull("tablet-b", "u-1", None, None).await.unwrap();
        assert_eq!(delta.changes.len(), 1);
        assert_eq!(delta.changes[0].server_sequence, 2);
    }

    #[tokio::test]
    async fn test_acknowledge_bounds() {
        let r = reconciler().await;
        r.push("tablet-a", "u-1", &[push_change("c1", "contact", "p1", Operation::Create, json!({"name": "Ann"}), 0)])
            .await
            .unwrap();

        assert!(matches!(
            r.acknowledge("tablet-b", "u-1", 2).await,
            Err(SyncError::Validation(_))
        ));
        r.acknowledge("tablet-b", "u-1", 1).await.unwrap();
        assert!(matches!(
            r.acknowledge("tablet-b", "u-1", 0).await,
            Err(SyncError::StaleCursor { .. })
        ));
        assert!(matches!(
            r.acknowledge("tablet-b", "u-2", 1).await,
            Err(SyncError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_revoked_device_excluded() {
        let r = reconciler().await;
        r.registry().mark_revoked("tablet-b").await.unwrap();

        assert!(matches!(
            r.pull("tablet-b", "u-1", Some(0), None).await,
            Err(SyncError::Unauthorized(_))
        ));
        assert!(matches!(
            r.push("tablet-b", "u-1", &[]).await,
            Err(SyncError::Unauthorized(_))
        ));
    }
}
