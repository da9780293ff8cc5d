//! # CRM Inbound
//!
//! Absorbs CRM webhooks into the change log.
//!
//! Each event id is absorbed at most once. The dedup check, the change
//! record, the snapshot, the status row and the event id all land in one
//! write transaction, so a CRM retry after a lost response can never
//! produce a second record.

use fieldsync_core::crm::{map_inbound, CrmEnvelope, CrmEventKind};
use fieldsync_core::merge::VersionRule;
use fieldsync_core::{Channel, ConflictReason, Origin, SyncState};
use fieldsync_db::{CrmRepository, Database};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::reconciler::{apply_in, Application, Mutation};
use crate::status::SyncStatusTracker;

/// Result of absorbing one inbound event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum InboundOutcome {
    #[serde(rename_all = "camelCase")]
    Applied {
        change_id: String,
        server_sequence: i64,
    },
    /// The event could not be merged. Recorded as seen all the same.
    Conflicted { reason: ConflictReason },
}

/// Inbound side of the CRM bridge for one external system.
#[derive(Debug, Clone)]
pub struct CrmInbound {
    db: Database,
    system: String,
}

impl CrmInbound {
    pub fn new(db: Database, system: impl Into<String>) -> Self {
        CrmInbound {
            db,
            system: system.into(),
        }
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    /// Absorbs one webhook.
    ///
    /// The CRM wins over device edits: the change is merged without a
    /// version check.
    ///
    /// ## Errors
    /// - `DuplicateEvent` if the event id was already absorbed
    /// - `Validation` if the payload does not fit the event kind
    pub async fn absorb(
        &self,
        kind: CrmEventKind,
        envelope: &CrmEnvelope,
    ) -> SyncResult<InboundOutcome> {
        let mapped = map_inbound(kind, envelope)?;
        let event_id = envelope.event_id.trim();

        let mut tx = self.db.begin_write().await?;

        if CrmRepository::inbound_seen_in(tx.conn(), &self.system, event_id).await? {
            debug!(system = %self.system, event_id, "Replayed CRM event ignored");
            return Err(SyncError::DuplicateEvent(event_id.to_string()));
        }

        let change_id = format!("{}-{}", self.system, Uuid::new_v4());
        let origin = Origin::system(&self.system);
        CrmRepository::ensure_cursor(tx.conn(), &self.system).await?;

        let mutation = Mutation {
            id: &change_id,
            entity_type: &mapped.entity_type,
            entity_id: &mapped.entity_id,
            operation: mapped.operation,
            payload: &mapped.payload,
            base_version: None,
            origin: &origin,
            owner: None,
        };

        let (outcome, recorded_change) =
            match apply_in(&mut tx, &mutation, VersionRule::Authority).await? {
                Application::Accepted(record) => {
                    SyncStatusTracker::record_in(
                        &mut tx,
                        &record.entity_type,
                        &record.entity_id,
                        Channel::Crm,
                        SyncState::Applied,
                        0,
                        None,
                    )
                    .await?;
                    info!(
                        system = %self.system,
                        event_id,
                        kind = kind.as_str(),
                        sequence = record.server_sequence,
                        "CRM event absorbed"
                    );
                    (
                        InboundOutcome::Applied {
                            change_id: record.id.clone(),
                            server_sequence: record.server_sequence,
                        },
                        Some(record.id),
                    )
                }
                Application::Rejected { reason, .. } => {
                    SyncStatusTracker::record_in(
                        &mut tx,
                        &mapped.entity_type,
                        &mapped.entity_id,
                        Channel::Crm,
                        SyncState::Conflicted,
                        0,
                        Some(reason.to_string()),
                    )
                    .await?;
                    warn!(
                        system = %self.system,
                        event_id,
                        kind = kind.as_str(),
                        reason = reason.as_str(),
                        "CRM event conflicted"
                    );
                    (InboundOutcome::Conflicted { reason }, None)
                }
            };

        CrmRepository::record_inbound(
            tx.conn(),
            &self.system,
            event_id,
            kind.as_str(),
            recorded_change.as_deref(),
        )
        .await?;

        CrmRepository::set_last_inbound(tx.conn(), &self.system, event_id).await?;

        tx.commit().await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{db, seed_snapshot};
    use fieldsync_core::CRM_SYSTEM;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn envelope(event_id: &str, data: serde_json::Value) -> CrmEnvelope {
        CrmEnvelope {
            event_id: event_id.into(),
            occurred_at: None,
            data,
        }
    }

    #[tokio::test]
    async fn test_absorb_overrides_device_state() {
        let db = db().await;
        seed_snapshot(&db, "order", "o-1", 3, json!({"status": "new", "title": "Fix sink"}), Some("u-1")).await;
        let inbound = CrmInbound::new(db.clone(), CRM_SYSTEM);

        let outcome = inbound
            .absorb(
                CrmEventKind::OrderStatusChanged,
                &envelope("evt-1", json!({"id": "o-1", "status": "accepted"})),
            )
            .await
            .unwrap();

        let InboundOutcome::Applied { change_id, server_sequence } = outcome else {
            panic!("expected applied, got {outcome:?}");
        };
        assert!(change_id.starts_with("crm-"));
        assert_eq!(server_sequence, 1);

        let record = db.changes().find(&change_id).await.unwrap().unwrap();
        assert!(record.origin.is_system(CRM_SYSTEM));
        assert_eq!(record.client_version, None);

        let snapshot = db.snapshots().get("order", "o-1").await.unwrap().unwrap();
        assert_eq!(snapshot.version, 4);
        assert_eq!(snapshot.state["status"], "accepted");
        assert_eq!(snapshot.state["title"], "Fix sink");
        assert_eq!(snapshot.owner_user_id.as_deref(), Some("u-1"));

        let cursor = db.crm().cursor(CRM_SYSTEM).await.unwrap().unwrap();
        assert_eq!(cursor.last_inbound_event_id.as_deref(), Some("evt-1"));
    }

    #[tokio::test]
    async fn test_replay_appends_once() {
        let db = db().await;
        let inbound = CrmInbound::new(db.clone(), CRM_SYSTEM);
        let event = envelope("evt-7", json!({"id": "c-1", "name": "Dana"}));

        inbound.absorb(CrmEventKind::ContactCreated, &event).await.unwrap();
        let err = inbound
            .absorb(CrmEventKind::ContactCreated, &event)
            .await
            .unwrap_err();

        assert!(err.is_duplicate());
        assert_eq!(db.changes().head().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_conflict_is_recorded_and_deduped() {
        let db = db().await;
        let inbound = CrmInbound::new(db.clone(), CRM_SYSTEM);
        let event = envelope("evt-9", json!({"id": "c-404"}));

        let outcome = inbound.absorb(CrmEventKind::ContactDeleted, &event).await.unwrap();
        assert_eq!(
            outcome,
            InboundOutcome::Conflicted {
                reason: ConflictReason::NotFound
            }
        );
        assert_eq!(db.changes().head().await.unwrap(), 0);

        let status = db
            .sync_status()
            .get("contact", "c-404", &Channel::Crm)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.state, SyncState::Conflicted);

        assert!(inbound
            .absorb(CrmEventKind::ContactDeleted, &event)
            .await
            .unwrap_err()
            .is_duplicate());
    }

    #[tokio::test]
    async fn test_invalid_payload_leaves_no_trace() {
        let db = db().await;
        let inbound = CrmInbound::new(db.clone(), CRM_SYSTEM);

        let err = inbound
            .absorb(
                CrmEventKind::DealStageChanged,
                &envelope("evt-3", json!({"id": "d-1"})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));

        // Not recorded as seen: a corrected retry is still absorbed.
        inbound
            .absorb(
                CrmEventKind::DealStageChanged,
                &envelope("evt-3", json!({"id": "d-1", "stage": "lead"})),
            )
            .await
            .unwrap();
        assert_eq!(db.changes().head().await.unwrap(), 1);
    }
}
