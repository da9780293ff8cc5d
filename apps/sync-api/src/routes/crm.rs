//! Inbound CRM webhooks.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fieldsync_core::crm::{CrmEnvelope, CrmEventKind};
use fieldsync_engine::crm::sender::SECRET_HEADER;
use fieldsync_engine::{SyncConfig, SyncError};
use serde_json::json;
use tracing::warn;

use crate::auth::secrets_match;
use crate::error::ApiError;
use crate::AppState;

/// `POST /crm/webhooks/{event}`
///
/// The secret is checked before the body is parsed. A replayed event id
/// answers success so CRM retries stay harmless.
pub async fn webhook(
    State(state): State<AppState>,
    Path(event): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    check_webhook_secret(&state.config, &headers)?;

    let kind: CrmEventKind = event
        .parse()
        .map_err(|e: fieldsync_core::CoreError| ApiError::BadRequest(e.to_string()))?;
    let envelope: CrmEnvelope = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid webhook body: {e}")))?;

    match state.inbound.absorb(kind, &envelope).await {
        Ok(outcome) => Ok(Json(outcome).into_response()),
        Err(SyncError::DuplicateEvent(event_id)) => {
            Ok(Json(json!({ "result": "duplicate", "eventId": event_id })).into_response())
        }
        Err(e) => Err(e.into()),
    }
}

fn check_webhook_secret(config: &SyncConfig, headers: &HeaderMap) -> Result<(), ApiError> {
    if !config.requires_webhook_secret() {
        return Ok(());
    }

    let Some(expected) = config.crm.inbound_secret.as_deref() else {
        warn!("CRM webhook rejected: no inbound secret configured");
        return Err(ApiError::Unauthenticated);
    };
    let provided = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if secrets_match(provided, expected) {
        Ok(())
    } else {
        warn!("CRM webhook rejected: secret mismatch");
        Err(ApiError::Unauthenticated)
    }
}
