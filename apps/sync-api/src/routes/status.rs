//! Operator status routes.

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use fieldsync_core::{ChangeRecord, SyncStatusCounts, SyncStatusEntry};
use fieldsync_engine::crm::clear_halt;
use fieldsync_engine::status::DEFAULT_LIST_LIMIT;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::OperatorCaller;
use crate::error::ApiError;
use crate::AppState;

const MAX_LIST_LIMIT: i64 = 1000;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    limit: Option<i64>,
}

impl ListQuery {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
    }
}

#[derive(Debug, Serialize)]
pub struct RetryResponse {
    cleared: bool,
}

pub async fn conflicted(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<SyncStatusEntry>>, ApiError> {
    Ok(Json(state.status.list_conflicted(query.limit()).await?))
}

pub async fn failed(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<SyncStatusEntry>>, ApiError> {
    Ok(Json(state.status.list_failed(query.limit()).await?))
}

pub async fn counts(State(state): State<AppState>) -> Result<Json<SyncStatusCounts>, ApiError> {
    Ok(Json(state.status.counts().await?))
}

/// Where one entity stands on every channel, with its full change history.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityReport {
    statuses: Vec<SyncStatusEntry>,
    history: Vec<ChangeRecord>,
}

pub async fn entity(
    State(state): State<AppState>,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> Result<Json<EntityReport>, ApiError> {
    let statuses = state.status.for_entity(&entity_type, &entity_id).await?;
    let history = state
        .reconciler
        .log()
        .history(&entity_type, &entity_id)
        .await?;
    if statuses.is_empty() && history.is_empty() {
        return Err(ApiError::NotFound(format!("{entity_type}/{entity_id}")));
    }
    Ok(Json(EntityReport { statuses, history }))
}

/// Clears a halted outbound channel and wakes the dispatcher.
pub async fn retry_crm(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorCaller>,
) -> Result<Json<RetryResponse>, ApiError> {
    let cleared = match state.dispatcher {
        Some(ref handle) => handle.retry_halted().await?,
        None => clear_halt(&state.db, &state.config.crm.system).await?,
    };

    info!(operator = %operator.user_id, cleared, "CRM retry requested");
    Ok(Json(RetryResponse { cleared }))
}
