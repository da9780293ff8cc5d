//! # Sync Status Tracker
//!
//! Read-mostly projection of where each entity stands on each channel. One
//! row per `(entity_type, entity_id, channel)`, replaced on every outcome.
//! Conflicted and failed rows are the operator's work queue.

use chrono::Utc;
use fieldsync_core::{Channel, SyncState, SyncStatusCounts, SyncStatusEntry};
use fieldsync_db::{Database, SyncStatusRepository, WriteTx};
use tracing::debug;

use crate::error::{SyncError, SyncResult};

/// Default page size for operator listings.
pub const DEFAULT_LIST_LIMIT: i64 = 100;

/// Operator-facing view of per-channel sync state.
#[derive(Debug, Clone)]
pub struct SyncStatusTracker {
    db: Database,
}

impl SyncStatusTracker {
    pub fn new(db: Database) -> Self {
        SyncStatusTracker { db }
    }

    /// Overwrites the current outcome for one entity on one channel.
    ///
    /// The attempt count of the previous row is kept.
    pub async fn record_outcome(
        &self,
        entity_type: &str,
        entity_id: &str,
        channel: Channel,
        state: SyncState,
        error: Option<String>,
    ) -> SyncResult<SyncStatusEntry> {
        let mut tx = self.db.begin_write().await?;
        let attempts =
            SyncStatusRepository::get_in(tx.conn(), entity_type, entity_id, &channel)
                .await?
                .map_or(0, |previous| previous.attempts);
        let entry =
            Self::record_in(&mut tx, entity_type, entity_id, channel, state, attempts, error)
                .await?;
        tx.commit().await?;
        Ok(entry)
    }

    /// Writes an outcome inside a caller's transaction.
    pub(crate) async fn record_in(
        tx: &mut WriteTx,
        entity_type: &str,
        entity_id: &str,
        channel: Channel,
        state: SyncState,
        attempts: i64,
        error: Option<String>,
    ) -> SyncResult<SyncStatusEntry> {
        let entry = SyncStatusEntry {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            channel,
            state,
            attempts,
            last_error: error,
            updated_at: Utc::now(),
        };
        SyncStatusRepository::upsert(tx.conn(), &entry).await?;

        debug!(
            entity_type,
            entity_id,
            channel = %entry.channel,
            state = state.as_str(),
            attempts,
            "Sync status recorded"
        );
        Ok(entry)
    }

    pub async fn get(
        &self,
        entity_type: &str,
        entity_id: &str,
        channel: &Channel,
    ) -> SyncResult<SyncStatusEntry> {
        self.db
            .sync_status()
            .get(entity_type, entity_id, channel)
            .await?
            .ok_or_else(|| {
                SyncError::not_found("SyncStatus", format!("{entity_type}/{entity_id}@{channel}"))
            })
    }

    /// Every channel of one entity.
    pub async fn for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> SyncResult<Vec<SyncStatusEntry>> {
        Ok(self.db.sync_status().list_for_entity(entity_type, entity_id).await?)
    }

    /// Rows waiting for manual reconciliation, newest first.
    pub async fn list_conflicted(&self, limit: i64) -> SyncResult<Vec<SyncStatusEntry>> {
        Ok(self
            .db
            .sync_status()
            .list_by_state(SyncState::Conflicted, limit.max(1))
            .await?)
    }

    /// Rows whose delivery gave up, newest first.
    pub async fn list_failed(&self, limit: i64) -> SyncResult<Vec<SyncStatusEntry>> {
        Ok(self
            .db
            .sync_status()
            .list_by_state(SyncState::Failed, limit.max(1))
            .await?)
    }

    pub async fn counts(&self) -> SyncResult<SyncStatusCounts> {
        Ok(self.db.sync_status().counts().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::db;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_record_outcome_overwrites() {
        let tracker = SyncStatusTracker::new(db().await);

        tracker
            .record_outcome("order", "o-1", Channel::Crm, SyncState::Pending, None)
            .await
            .unwrap();
        tracker
            .record_outcome(
                "order",
                "o-1",
                Channel::Crm,
                SyncState::Failed,
                Some("HTTP 500".into()),
            )
            .await
            .unwrap();

        let entry = tracker.get("order", "o-1", &Channel::Crm).await.unwrap();
        assert_eq!(entry.state, SyncState::Failed);
        assert_eq!(entry.last_error.as_deref(), Some("HTTP 500"));
        assert_eq!(tracker.for_entity("order", "o-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_record_outcome_keeps_attempts_written_by_dispatcher() {
        let db = db().await;
        let tracker = SyncStatusTracker::new(db.clone());

        // A dispatcher write is in progress when the outcome is recorded.
        let mut tx = db.begin_write().await.unwrap();
        SyncStatusTracker::record_in(&mut tx, "order", "o-1", Channel::Crm, SyncState::Pending, 4, None)
            .await
            .unwrap();

        let pending = tokio::spawn({
            let tracker = tracker.clone();
            async move {
                tracker
                    .record_outcome("order", "o-1", Channel::Crm, SyncState::Applied, None)
                    .await
            }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tx.commit().await.unwrap();

        let entry = pending.await.unwrap().unwrap();
        assert_eq!(entry.state, SyncState::Applied);
        assert_eq!(entry.attempts, 4);
    }

    #[tokio::test]
    async fn test_operator_lists() {
        let tracker = SyncStatusTracker::new(db().await);
        let device = Channel::Device("tablet-1".into());

        tracker
            .record_outcome("order", "o-1", device.clone(), SyncState::Conflicted, Some("invalid_status_transition".into()))
            .await
            .unwrap();
        tracker
            .record_outcome("deal", "d-1", Channel::Crm, SyncState::Failed, Some("timeout".into()))
            .await
            .unwrap();
        tracker
            .record_outcome("contact", "c-1", device, SyncState::Applied, None)
            .await
            .unwrap();

        let conflicted = tracker.list_conflicted(DEFAULT_LIST_LIMIT).await.unwrap();
        assert_eq!(conflicted.len(), 1);
        assert_eq!(conflicted[0].entity_id, "o-1");

        let failed = tracker.list_failed(DEFAULT_LIST_LIMIT).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].channel, Channel::Crm);

        let counts = tracker.counts().await.unwrap();
        assert_eq!((counts.applied, counts.failed, counts.conflicted), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_missing_entry() {
        let tracker = SyncStatusTracker::new(db().await);
        assert!(matches!(
            tracker.get("order", "nope", &Channel::Crm).await,
            Err(SyncError::NotFound { .. })
        ));
    }
}
