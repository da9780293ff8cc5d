//! # Change Log Store
//!
//! The single source of ordering truth. Every accepted mutation, from a device
//! or from the CRM, becomes one immutable [`ChangeRecord`] with the next
//! `server_sequence`.
//!
//! ## Ordering Guarantees
//! - Sequences are assigned inside a [`WriteTx`], so two appends never see
//!   the same head.
//! - Writers commit in gate order, so a reader always sees a prefix of the
//!   log: `read_since` never skips a sequence that a later read would return.
//! - A rolled-back append frees its sequence for the next writer.

use fieldsync_core::{ChangeRecord, NewChange, ValidationError};
use fieldsync_db::{ChangeLogRepository, Database, WriteTx};
use tracing::debug;

use crate::error::{SyncError, SyncResult};

/// Append and scan access to the change log.
#[derive(Debug, Clone)]
pub struct ChangeLog {
    db: Database,
}

impl ChangeLog {
    pub fn new(db: Database) -> Self {
        ChangeLog { db }
    }

    /// Appends one change in its own write transaction.
    ///
    /// ## Errors
    /// - `DuplicateEvent` if the change id is already in the log
    /// - `Conflict` if `requested_sequence` is set and is not `head() + 1`
    pub async fn append(&self, change: &NewChange) -> SyncResult<ChangeRecord> {
        let mut tx = self.db.begin_write().await?;
        let record = Self::append_in(&mut tx, change).await?;
        tx.commit().await?;
        Ok(record)
    }

    /// Appends inside a caller's transaction, together with whatever else
    /// that transaction writes.
    pub async fn append_in(tx: &mut WriteTx, change: &NewChange) -> SyncResult<ChangeRecord> {
        let record = ChangeLogRepository::append(tx.conn(), change).await?;
        Ok(record)
    }

    /// Records after `since`, ascending, at most `limit`.
    pub async fn read_since(&self, since: i64, limit: u32) -> SyncResult<Vec<ChangeRecord>> {
        if since < 0 {
            return Err(SyncError::Validation(ValidationError::OutOfRange {
                field: "since".to_string(),
                min: 0,
                max: i64::MAX,
            }));
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        let records = self.db.changes().list_after(since, i64::from(limit)).await?;
        debug!(since, returned = records.len(), "Change log scanned");
        Ok(records)
    }

    /// Highest assigned sequence, 0 when empty.
    pub async fn head(&self) -> SyncResult<i64> {
        Ok(self.db.changes().head().await?)
    }

    pub async fn find(&self, change_id: &str) -> SyncResult<Option<ChangeRecord>> {
        Ok(self.db.changes().find(change_id).await?)
    }

    /// Full history of one entity.
    pub async fn history(&self, entity_type: &str, entity_id: &str) -> SyncResult<Vec<ChangeRecord>> {
        Ok(self.db.changes().for_entity(entity_type, entity_id).await?)
    }

    /// A lazy scan starting after `since`, `page` records at a time.
    pub fn cursor(&self, since: i64, page: u32) -> ChangeCursor {
        ChangeCursor {
            log: self.clone(),
            position: since,
            page: page.max(1),
            exhausted: false,
        }
    }
}

/// Page-by-page scan over the log.
///
/// Holds no transaction between pages. Dropping it and calling
/// [`ChangeLog::cursor`] with [`ChangeCursor::position`] resumes exactly
/// where it stopped.
#[derive(Debug)]
pub struct ChangeCursor {
    log: ChangeLog,
    position: i64,
    page: u32,
    exhausted: bool,
}

impl ChangeCursor {
    /// Next page, or `None` once the scan reached the head it saw last.
    pub async fn next_page(&mut self) -> SyncResult<Option<Vec<ChangeRecord>>> {
        if self.exhausted {
            return Ok(None);
        }

        let records = self.log.read_since(self.position, self.page).await?;
        if records.len() < self.page as usize {
            self.exhausted = true;
        }
        if records.is_empty() {
            return Ok(None);
        }

        if let Some(last) = records.last() {
            self.position = last.server_sequence;
        }
        Ok(Some(records))
    }

    /// Last sequence handed out; the restart point.
    pub fn position(&self) -> i64 {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{db, new_change};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_append_and_read_since() {
        let db = db().await;
        let log = ChangeLog::new(db);

        for id in ["a", "b", "c", "d"] {
            log.append(&new_change(id)).await.unwrap();
        }
        assert_eq!(log.head().await.unwrap(), 4);

        let after_two: Vec<i64> = log
            .read_since(2, 10)
            .await
            .unwrap()
            .iter()
            .map(|r| r.server_sequence)
            .collect();
        assert_eq!(after_two, vec![3, 4]);

        assert!(log.read_since(4, 10).await.unwrap().is_empty());
        assert!(log.read_since(0, 0).await.unwrap().is_empty());
        assert!(matches!(
            log.read_since(-1, 10).await,
            Err(SyncError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_and_colliding_sequence() {
        let log = ChangeLog::new(db().await);
        log.append(&new_change("a")).await.unwrap();

        let err = log.append(&new_change("a")).await.unwrap_err();
        assert!(err.is_duplicate());

        let mut colliding = new_change("b");
        colliding.requested_sequence = Some(1);
        assert!(matches!(
            log.append(&colliding).await,
            Err(SyncError::Conflict(_))
        ));

        colliding.requested_sequence = Some(2);
        assert_eq!(log.append(&colliding).await.unwrap().server_sequence, 2);
        assert!(log.find("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cursor_is_restartable() {
        let log = ChangeLog::new(db().await);
        for i in 0..5 {
            log.append(&new_change(&format!("c{i}"))).await.unwrap();
        }

        let mut cursor = log.cursor(0, 2);
        let first = cursor.next_page().await.unwrap().unwrap();
        assert_eq!(first.len(), 2);
        let resume_at = cursor.position();
        drop(cursor);

        let mut cursor = log.cursor(resume_at, 2);
        let mut seen = Vec::new();
        while let Some(page) = cursor.next_page().await.unwrap() {
            seen.extend(page.into_iter().map(|r| r.server_sequence));
        }
        assert_eq!(seen, vec![3, 4, 5]);
        assert_eq!(cursor.position(), 5);
        assert!(cursor.next_page().await.unwrap().is_none());
    }
}
