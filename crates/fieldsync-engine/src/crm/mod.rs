//! # CRM Bridge
//!
//! Both directions of the CRM integration.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  OUTBOUND                                                              │
//! │  Reconciler ── notify ──► CrmDispatcher ── WebhookSender ──► CRM       │
//! │                               │  reads log after cursor                │
//! │                               │  persists attempts, halts on cap       │
//! │                               ▼                                         │
//! │                        crm_sync_cursors / sync_status                  │
//! │                                                                         │
//! │  INBOUND                                                               │
//! │  CRM ── POST /crm/webhooks/{event} ──► CrmInbound::absorb              │
//! │            dedup by event id, map, apply with the authority rule,      │
//! │            append one ChangeRecord (origin system:crm)                 │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod inbound;
pub mod outbound;
pub mod sender;

pub use inbound::{CrmInbound, InboundOutcome};
pub use outbound::{clear_halt, CrmDispatcher, DispatcherHandle, DrainReport};
pub use sender::{ReqwestSender, WebhookSender};

use tokio::sync::mpsc;
use tracing::debug;

/// Non-blocking wake-up for the dispatcher.
///
/// Notifications coalesce: if one is already queued, another is dropped.
#[derive(Debug, Clone)]
pub struct CrmNotifier {
    tx: mpsc::Sender<()>,
}

impl CrmNotifier {
    pub(crate) fn new(tx: mpsc::Sender<()>) -> Self {
        CrmNotifier { tx }
    }

    pub fn notify(&self) {
        match self.tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => {}
            Err(mpsc::error::TrySendError::Closed(())) => {
                debug!("CRM dispatcher is not running, notification dropped");
            }
        }
    }
}
