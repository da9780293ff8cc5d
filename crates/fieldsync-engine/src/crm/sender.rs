//! # Webhook Sender
//!
//! The HTTP leg of outbound delivery, behind a trait so the dispatcher can
//! be driven by a scripted sender in tests.

use async_trait::async_trait;
use fieldsync_core::crm::OutboundWebhook;
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use crate::config::CrmSettings;
use crate::error::{SyncError, SyncResult};

/// Header carrying the shared secret, both directions.
pub const SECRET_HEADER: &str = "x-webhook-secret";
pub const SEQUENCE_HEADER: &str = "x-fieldsync-sequence";
pub const EVENT_HEADER: &str = "x-fieldsync-event";

/// Delivers one outbound webhook.
///
/// `Ok(())` means the CRM acknowledged with a 2xx. Anything else is an
/// error, retryable or not.
#[async_trait]
pub trait WebhookSender: Send + Sync + 'static {
    async fn send(&self, webhook: &OutboundWebhook) -> SyncResult<()>;
}

/// Sends webhooks with `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestSender {
    client: reqwest::Client,
    url: Url,
    secret: Option<String>,
}

impl ReqwestSender {
    pub fn new(
        url: &str,
        secret: Option<String>,
        timeout: std::time::Duration,
    ) -> SyncResult<Self> {
        let url = Url::parse(url)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("HTTP client: {e}")))?;

        Ok(ReqwestSender {
            client,
            url,
            secret,
        })
    }

    /// Builds a sender from CRM settings; `None` when outbound is disabled.
    pub fn from_settings(settings: &CrmSettings) -> SyncResult<Option<Self>> {
        settings
            .webhook_url
            .as_deref()
            .map(|url| {
                Self::new(
                    url,
                    settings.outbound_secret.clone(),
                    settings.request_timeout(),
                )
            })
            .transpose()
    }
}

#[async_trait]
impl WebhookSender for ReqwestSender {
    async fn send(&self, webhook: &OutboundWebhook) -> SyncResult<()> {
        let mut request = self
            .client
            .post(self.url.clone())
            .header(SEQUENCE_HEADER, webhook.sequence.to_string())
            .header(EVENT_HEADER, webhook.event.name())
            .json(webhook);
        if let Some(ref secret) = self.secret {
            request = request.header(SECRET_HEADER, secret);
        }

        let response = request.send().await?;
        let status = response.status();
        debug!(sequence = webhook.sequence, %status, "CRM webhook response");

        if status.is_success() {
            return Ok(());
        }

        let message = format!("CRM answered HTTP {}", status.as_u16());
        if status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
        {
            Err(SyncError::transient(message))
        } else {
            Err(SyncError::rejected(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::Utc;
    use fieldsync_core::crm::{OutboundEntity, OutboundEvent};
    use fieldsync_core::Origin;
    use serde_json::{json, Value};
    use std::time::Duration;

    async fn spawn_crm() -> String {
        async fn ok(headers: HeaderMap, Json(body): Json<Value>) -> AxumStatus {
            let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
            let secret_ok = header(SECRET_HEADER) == Some("shh");
            let event_ok = header(EVENT_HEADER) == Some("order.updated");
            let body_ok = body["event"] == "order.updated" && body["sequence"] == 7;
            if secret_ok && event_ok && body_ok {
                AxumStatus::OK
            } else {
                AxumStatus::UNAUTHORIZED
            }
        }

        let app = Router::new()
            .route("/ok", post(ok))
            .route("/busy", post(|| async { AxumStatus::SERVICE_UNAVAILABLE }))
            .route("/bad", post(|| async { AxumStatus::UNPROCESSABLE_ENTITY }));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn webhook() -> OutboundWebhook {
        OutboundWebhook {
            sequence: 7,
            change_id: "c-7".into(),
            occurred_at: Utc::now(),
            origin: Origin::device("tablet-1"),
            event: OutboundEvent::OrderUpdated(OutboundEntity {
                id: "o-1".into(),
                version: 2,
                fields: json!({"status": "accepted"}),
            }),
        }
    }

    #[tokio::test]
    async fn test_delivery_outcomes() {
        let base = spawn_crm().await;
        let timeout = Duration::from_secs(5);

        let sender = ReqwestSender::new(&format!("{base}/ok"), Some("shh".into()), timeout).unwrap();
        sender.send(&webhook()).await.unwrap();

        let sender = ReqwestSender::new(&format!("{base}/ok"), None, timeout).unwrap();
        let err = sender.send(&webhook()).await.unwrap_err();
        assert!(!err.is_retryable());

        let sender = ReqwestSender::new(&format!("{base}/busy"), None, timeout).unwrap();
        assert!(sender.send(&webhook()).await.unwrap_err().is_retryable());

        let sender = ReqwestSender::new(&format!("{base}/bad"), None, timeout).unwrap();
        assert!(!sender.send(&webhook()).await.unwrap_err().is_retryable());
    }

    #[test]
    fn test_disabled_without_url() {
        let settings = CrmSettings::default();
        assert!(ReqwestSender::from_settings(&settings).unwrap().is_none());

        let settings = CrmSettings {
            webhook_url: Some("not a url".into()),
            ..CrmSettings::default()
        };
        assert!(ReqwestSender::from_settings(&settings).is_err());
    }
}
