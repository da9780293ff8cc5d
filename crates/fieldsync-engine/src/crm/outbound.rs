//! # CRM Dispatcher
//!
//! Delivers change records to the CRM webhook in log order, at least once.
//!
//! ## Delivery Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  wake-up (poll tick / notify / operator retry)                          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  cursor halted? ── yes ──► idle until retry_halted()                    │
//! │       │ no                                                              │
//! │       ▼                                                                 │
//! │  list_after(last_delivered, batch_size)                                 │
//! │       │                                                                 │
//! │       ├── irrelevant type / CRM echo / unmapped ──► skip, advance        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  send ── 2xx ──► advance cursor, status crm = applied                   │
//! │    │                                                                    │
//! │    └── error ──► persist attempts, status crm = pending                 │
//! │                  attempts == max ──► halt, status crm = failed          │
//! │                  else sleep backoff, resend the same record             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A record is never skipped because it failed: the cursor stays on it until
//! it is delivered or an operator clears the halt. Attempt counts live in the
//! cursor row, so a restart resumes the same record with the same count.

use std::sync::Arc;

use backoff::backoff::Backoff;
use chrono::Utc;
use fieldsync_core::crm::OutboundWebhook;
use fieldsync_core::{Channel, ChangeRecord, CrmSyncCursor, SyncState};
use fieldsync_db::{CrmRepository, Database};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::sender::WebhookSender;
use super::CrmNotifier;
use crate::config::CrmSettings;
use crate::error::{SyncError, SyncResult};
use crate::status::SyncStatusTracker;

// =============================================================================
// Dispatcher
// =============================================================================

/// What one drain pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub skipped: usize,
    /// Delivery is halted; nothing moves until an operator retries.
    pub halted: bool,
    /// The batch was full, so more records may be waiting.
    pub has_more: bool,
}

/// Background task pushing the change log to the CRM.
pub struct CrmDispatcher<S: WebhookSender> {
    db: Database,
    settings: CrmSettings,
    sender: Arc<S>,
    notify_rx: mpsc::Receiver<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

/// Handle for waking, retrying and stopping the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    notify_tx: mpsc::Sender<()>,
    shutdown_tx: mpsc::Sender<()>,
    db: Database,
    system: String,
}

impl DispatcherHandle {
    /// A notifier for the reconciler to call after accepting relevant changes.
    pub fn notifier(&self) -> CrmNotifier {
        CrmNotifier::new(self.notify_tx.clone())
    }

    /// Triggers graceful shutdown.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Shutdown channel closed".into()))
    }

    /// Clears a halt and wakes the dispatcher.
    ///
    /// Returns `false` if delivery was not halted.
    pub async fn retry_halted(&self) -> SyncResult<bool> {
        let cleared = clear_halt(&self.db, &self.system).await?;
        if cleared {
            self.notifier().notify();
        }
        Ok(cleared)
    }
}

impl<S: WebhookSender> CrmDispatcher<S> {
    /// Creates a dispatcher and returns its handle.
    pub fn new(db: Database, settings: CrmSettings, sender: Arc<S>) -> (Self, DispatcherHandle) {
        let (notify_tx, notify_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let handle = DispatcherHandle {
            notify_tx,
            shutdown_tx,
            db: db.clone(),
            system: settings.system.clone(),
        };
        let dispatcher = CrmDispatcher {
            db,
            settings,
            sender,
            notify_rx,
            shutdown_rx,
        };

        (dispatcher, handle)
    }

    /// Runs the dispatcher loop.
    ///
    /// This should be spawned as a background task.
    pub async fn run(mut self) {
        info!(system = %self.settings.system, "CRM dispatcher starting");

        let mut interval = tokio::time::interval(self.settings.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        'outer: loop {
            tokio::select! {
                _ = interval.tick() => {}
                Some(()) = self.notify_rx.recv() => {
                    debug!("CRM dispatcher woken");
                }
                _ = self.shutdown_rx.recv() => {
                    info!("CRM dispatcher shutting down");
                    break;
                }
            }

            loop {
                match self.drain().await {
                    Ok(report) if report.has_more => continue,
                    Ok(_) => break,
                    Err(SyncError::ShuttingDown) => {
                        info!("CRM dispatcher stopped during backoff");
                        break 'outer;
                    }
                    Err(e) => {
                        error!(?e, "CRM drain failed");
                        break;
                    }
                }
            }
        }

        info!("CRM dispatcher stopped");
    }

    /// Delivers everything after the cursor, up to one batch.
    pub async fn drain(&mut self) -> SyncResult<DrainReport> {
        let mut report = DrainReport::default();
        let system = self.settings.system.clone();

        let mut cursor = {
            let mut tx = self.db.begin_write().await?;
            let cursor = CrmRepository::ensure_cursor(tx.conn(), &system).await?;
            tx.commit().await?;
            cursor
        };
        if cursor.halted {
            debug!(system = %system, "CRM delivery halted, waiting for operator");
            report.halted = true;
            return Ok(report);
        }

        let batch_size = self.settings.batch_size.max(1);
        let batch = self
            .db
            .changes()
            .list_after(cursor.last_delivered_sequence, i64::from(batch_size))
            .await?;
        report.has_more = batch.len() == batch_size as usize;

        let mut unsaved_skip = false;
        for record in &batch {
            let Some(webhook) = self.outbound_for(record) else {
                cursor.last_delivered_sequence = record.server_sequence;
                report.skipped += 1;
                unsaved_skip = true;
                continue;
            };

            if unsaved_skip {
                self.save_cursor(&mut cursor).await?;
                unsaved_skip = false;
            }

            if self.deliver(&mut cursor, record, &webhook).await? {
                report.delivered += 1;
            } else {
                report.halted = true;
                report.has_more = false;
                return Ok(report);
            }
        }

        if unsaved_skip {
            self.save_cursor(&mut cursor).await?;
        }
        if report.delivered > 0 || report.skipped > 0 {
            debug!(
                delivered = report.delivered,
                skipped = report.skipped,
                cursor = cursor.last_delivered_sequence,
                "CRM drain pass finished"
            );
        }
        Ok(report)
    }

    /// The webhook for a record, or `None` if the CRM should not see it.
    fn outbound_for(&self, record: &ChangeRecord) -> Option<OutboundWebhook> {
        if !self.settings.is_relevant(&record.entity_type) {
            return None;
        }
        // The CRM already knows about its own changes.
        if record.origin.is_system(&self.settings.system) {
            return None;
        }
        OutboundWebhook::from_change(record)
    }

    /// Sends one record until it succeeds or the attempt cap is hit.
    ///
    /// Returns `false` when delivery halted on this record.
    async fn deliver(
        &mut self,
        cursor: &mut CrmSyncCursor,
        record: &ChangeRecord,
        webhook: &OutboundWebhook,
    ) -> SyncResult<bool> {
        let sequence = record.server_sequence;
        let max_attempts = i64::from(self.settings.max_attempts.max(1));
        let mut attempts = if cursor.in_flight_sequence == Some(sequence) {
            cursor.in_flight_attempts
        } else {
            0
        };
        let mut backoff = self.settings.backoff();

        loop {
            attempts += 1;

            match self.sender.send(webhook).await {
                Ok(()) => {
                    cursor.last_delivered_sequence = sequence;
                    cursor.in_flight_sequence = None;
                    cursor.in_flight_attempts = 0;
                    self.persist(cursor, record, SyncState::Applied, attempts, None)
                        .await?;

                    info!(
                        sequence,
                        event = webhook.event.name(),
                        attempts,
                        "Delivered to CRM"
                    );
                    return Ok(true);
                }
                Err(e) => {
                    let halted = attempts >= max_attempts;
                    cursor.in_flight_sequence = Some(sequence);
                    cursor.in_flight_attempts = attempts;
                    cursor.halted = halted;

                    let state = if halted {
                        SyncState::Failed
                    } else {
                        SyncState::Pending
                    };
                    self.persist(cursor, record, state, attempts, Some(e.to_string()))
                        .await?;

                    if halted {
                        error!(
                            sequence,
                            attempts,
                            error = %e,
                            "CRM delivery halted after max attempts"
                        );
                        return Ok(false);
                    }

                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| self.settings.backoff().max_interval);
                    warn!(
                        sequence,
                        attempts,
                        retryable = e.is_retryable(),
                        ?delay,
                        error = %e,
                        "CRM delivery failed, retrying"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown_rx.recv() => {
                            return Err(SyncError::ShuttingDown);
                        }
                    }
                }
            }
        }
    }

    /// Writes the cursor and the record's CRM status together.
    async fn persist(
        &self,
        cursor: &mut CrmSyncCursor,
        record: &ChangeRecord,
        state: SyncState,
        attempts: i64,
        error: Option<String>,
    ) -> SyncResult<()> {
        cursor.updated_at = Utc::now();

        let mut tx = self.db.begin_write().await?;
        CrmRepository::save_outbound(tx.conn(), cursor).await?;
        SyncStatusTracker::record_in(
            &mut tx,
            &record.entity_type,
            &record.entity_id,
            Channel::Crm,
            state,
            attempts,
            error,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn save_cursor(&self, cursor: &mut CrmSyncCursor) -> SyncResult<()> {
        cursor.updated_at = Utc::now();

        let mut tx = self.db.begin_write().await?;
        CrmRepository::save_outbound(tx.conn(), cursor).await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Clears a halted cursor so the in-flight record is tried again from
/// zero attempts.
///
/// Returns `false` if the cursor was not halted.
pub async fn clear_halt(db: &Database, system: &str) -> SyncResult<bool> {
    let Some(cursor) = db.crm().cursor(system).await? else {
        return Ok(false);
    };
    if !cursor.halted {
        return Ok(false);
    }

    // Look up the stuck record before taking the write gate.
    let stuck = match cursor.in_flight_sequence {
        Some(sequence) => db
            .changes()
            .list_after(sequence - 1, 1)
            .await?
            .into_iter()
            .find(|r| r.server_sequence == sequence),
        None => None,
    };

    let mut tx = db.begin_write().await?;
    let Some(mut cursor) = CrmRepository::cursor_in(tx.conn(), system).await? else {
        return Ok(false);
    };
    cursor.halted = false;
    cursor.in_flight_attempts = 0;
    cursor.updated_at = Utc::now();
    CrmRepository::save_outbound(tx.conn(), &cursor).await?;

    if let Some(record) = stuck {
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
    tx.commit().await?;

    info!(
        system,
        sequence = ?cursor.in_flight_sequence,
        "CRM delivery halt cleared by operator"
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_log::ChangeLog;
    use crate::test_support::{db, new_change};
    use async_trait::async_trait;
    use fieldsync_core::Origin;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Answers from a script, then succeeds forever.
    #[derive(Default)]
    struct ScriptedSender {
        failures: Mutex<VecDeque<SyncError>>,
        sent: Mutex<Vec<i64>>,
    }

    impl ScriptedSender {
        fn failing(times: usize) -> Self {
            let failures = (0..times)
                .map(|_| SyncError::transient("HTTP 503"))
                .collect();
            ScriptedSender {
                failures: Mutex::new(failures),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> Vec<i64> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WebhookSender for ScriptedSender {
        async fn send(&self, webhook: &OutboundWebhook) -> SyncResult<()> {
            self.sent.lock().unwrap().push(webhook.sequence);
            match self.failures.lock().unwrap().pop_front() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    fn settings() -> CrmSettings {
        CrmSettings {
            webhook_url: Some("http://crm.test/hook".into()),
            initial_backoff_ms: 1,
            max_backoff_secs: 1,
            max_attempts: 3,
            ..CrmSettings::default()
        }
    }

    async fn cursor(db: &Database) -> CrmSyncCursor {
        db.crm().cursor("crm").await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_delivers_in_order_and_advances() {
        let db = db().await;
        let log = ChangeLog::new(db.clone());
        for id in ["a", "b", "c"] {
            log.append(&new_change(id)).await.unwrap();
        }

        let sender = Arc::new(ScriptedSender::default());
        let (mut dispatcher, _handle) = CrmDispatcher::new(db.clone(), settings(), sender.clone());

        let report = dispatcher.drain().await.unwrap();
        assert_eq!(report.delivered, 3);
        assert_eq!(sender.sent(), vec![1, 2, 3]);
        assert_eq!(cursor(&db).await.last_delivered_sequence, 3);

        let status = db
            .sync_status()
            .get("order", "o-1", &Channel::Crm)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.state, SyncState::Applied);

        // Nothing new: nothing resent.
        assert_eq!(dispatcher.drain().await.unwrap().delivered, 0);
        assert_eq!(sender.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_skips_echo_and_irrelevant_types() {
        let db = db().await;
        let log = ChangeLog::new(db.clone());

        let mut echo = new_change("from-crm");
        echo.origin = Origin::system("crm");
        log.append(&echo).await.unwrap();

        let mut invoice = new_change("inv");
        invoice.entity_type = "invoice".into();
        log.append(&invoice).await.unwrap();

        log.append(&new_change("real")).await.unwrap();

        let sender = Arc::new(ScriptedSender::default());
        let (mut dispatcher, _handle) = CrmDispatcher::new(db.clone(), settings(), sender.clone());

        let report = dispatcher.drain().await.unwrap();
        assert_eq!((report.delivered, report.skipped), (1, 2));
        assert_eq!(sender.sent(), vec![3]);
        assert_eq!(cursor(&db).await.last_delivered_sequence, 3);
    }

    #[tokio::test]
    async fn test_retries_then_delivers() {
        let db = db().await;
        ChangeLog::new(db.clone()).append(&new_change("a")).await.unwrap();

        let sender = Arc::new(ScriptedSender::failing(2));
        let (mut dispatcher, _handle) = CrmDispatcher::new(db.clone(), settings(), sender.clone());

        let report = dispatcher.drain().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert!(!report.halted);
        assert_eq!(sender.sent(), vec![1, 1, 1]);

        let cursor = cursor(&db).await;
        assert_eq!(cursor.last_delivered_sequence, 1);
        assert_eq!(cursor.in_flight_sequence, None);
    }

    #[tokio::test]
    async fn test_halts_and_blocks_later_records() {
        let db = db().await;
        let log = ChangeLog::new(db.clone());
        log.append(&new_change("a")).await.unwrap();
        log.append(&new_change("b")).await.unwrap();

        let sender = Arc::new(ScriptedSender::failing(3));
        let (mut dispatcher, handle) = CrmDispatcher::new(db.clone(), settings(), sender.clone());

        let report = dispatcher.drain().await.unwrap();
        assert!(report.halted);
        assert_eq!(report.delivered, 0);
        assert_eq!(sender.sent(), vec![1, 1, 1]);

        let halted = cursor(&db).await;
        assert!(halted.halted);
        assert_eq!(halted.last_delivered_sequence, 0);
        assert_eq!(halted.in_flight_sequence, Some(1));
        assert_eq!(halted.in_flight_attempts, 3);

        let status = db
            .sync_status()
            .get("order", "o-1", &Channel::Crm)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.state, SyncState::Failed);
        assert_eq!(status.attempts, 3);
        assert!(status.last_error.is_some());

        // Halted: no sends until an operator steps in.
        assert!(dispatcher.drain().await.unwrap().halted);
        assert_eq!(sender.sent().len(), 3);

        assert!(handle.retry_halted().await.unwrap());
        assert!(!handle.retry_halted().await.unwrap());

        let report = dispatcher.drain().await.unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(sender.sent(), vec![1, 1, 1, 1, 2]);
        assert_eq!(cursor(&db).await.last_delivered_sequence, 2);
    }

    #[tokio::test]
    async fn test_attempts_survive_restart() {
        let db = db().await;
        ChangeLog::new(db.clone()).append(&new_change("a")).await.unwrap();

        let mut tx = db.begin_write().await.unwrap();
        let mut seeded = CrmRepository::ensure_cursor(tx.conn(), "crm").await.unwrap();
        seeded.in_flight_sequence = Some(1);
        seeded.in_flight_attempts = 2;
        CrmRepository::save_outbound(tx.conn(), &seeded).await.unwrap();
        tx.commit().await.unwrap();

        // Two attempts were spent before the restart, one remains.
        let sender = Arc::new(ScriptedSender::failing(1));
        let (mut dispatcher, _handle) = CrmDispatcher::new(db.clone(), settings(), sender.clone());

        assert!(dispatcher.drain().await.unwrap().halted);
        assert_eq!(sender.sent(), vec![1]);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let db = db().await;
        let sender = Arc::new(ScriptedSender::default());
        let (dispatcher, handle) = CrmDispatcher::new(db, settings(), sender);

        let task = tokio::spawn(dispatcher.run());
        handle.notifier().notify();
        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    /// Fails every send after holding the request open for a while.
    struct SlowFailingSender;

    #[async_trait]
    impl WebhookSender for SlowFailingSender {
        async fn send(&self, _webhook: &OutboundWebhook) -> SyncResult<()> {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            Err(SyncError::transient("HTTP 503"))
        }
    }

    #[tokio::test]
    async fn test_failing_delivery_keeps_inbound_event_id() {
        use crate::crm::CrmInbound;
        use fieldsync_core::crm::{CrmEnvelope, CrmEventKind};
        use serde_json::json;

        let db = db().await;
        ChangeLog::new(db.clone()).append(&new_change("a")).await.unwrap();

        let settings = CrmSettings {
            max_attempts: 1,
            ..settings()
        };
        let (mut dispatcher, _handle) =
            CrmDispatcher::new(db.clone(), settings, Arc::new(SlowFailingSender));
        let inbound = CrmInbound::new(db.clone(), "crm");
        let envelope = CrmEnvelope {
            event_id: "evt-42".into(),
            occurred_at: None,
            data: json!({"id": "p-1", "name": "Ann"}),
        };

        let (report, absorbed) = tokio::join!(dispatcher.drain(), async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            inbound.absorb(CrmEventKind::ContactCreated, &envelope).await
        });
        assert!(report.unwrap().halted);
        absorbed.unwrap();

        let cursor = cursor(&db).await;
        assert_eq!(cursor.last_inbound_event_id.as_deref(), Some("evt-42"));
        assert!(cursor.halted);
        assert_eq!(cursor.in_flight_sequence, Some(1));
    }
}
