//! Device sync routes.

use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use fieldsync_core::{Device, PushChange, PushResult};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::auth::DeviceCaller;
use crate::error::ApiError;
use crate::AppState;

pub const NEXT_SINCE_HEADER: &str = "x-sync-next-since";
pub const HAS_MORE_HEADER: &str = "x-sync-has-more";

#[derive(Debug, Deserialize)]
pub struct PullQuery {
    since: Option<i64>,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    device_id: String,
    changes: Vec<PushChange>,
}

#[derive(Debug, Deserialize)]
pub struct AckRequest {
    sequence: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WipeStatus {
    should_wipe: bool,
}

pub async fn register(
    State(state): State<AppState>,
    Extension(caller): Extension<DeviceCaller>,
) -> Result<Json<Device>, ApiError> {
    let device = state
        .reconciler
        .registry()
        .register(&caller.device_id, &caller.user_id)
        .await?;
    Ok(Json(device))
}

/// Every device registered to the caller, including revoked ones.
pub async fn list_devices(
    State(state): State<AppState>,
    Extension(caller): Extension<DeviceCaller>,
) -> Result<Json<Vec<Device>>, ApiError> {
    let devices = state
        .reconciler
        .registry()
        .list_for_owner(&caller.user_id)
        .await?;
    Ok(Json(devices))
}

/// Body is the ordered change array; the cursor travels in headers.
pub async fn pull(
    State(state): State<AppState>,
    Extension(caller): Extension<DeviceCaller>,
    Query(query): Query<PullQuery>,
) -> Result<Response, ApiError> {
    let delta = state
        .reconciler
        .pull(&caller.device_id, &caller.user_id, query.since, query.limit)
        .await?;

    let mut headers = HeaderMap::new();
    headers.insert(NEXT_SINCE_HEADER, HeaderValue::from(delta.next_since));
    headers.insert(
        HAS_MORE_HEADER,
        HeaderValue::from_static(if delta.has_more { "true" } else { "false" }),
    );
    Ok((headers, Json(delta.changes)).into_response())
}

pub async fn push(
    State(state): State<AppState>,
    Extension(caller): Extension<DeviceCaller>,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResult>, ApiError> {
    if request.device_id != caller.device_id {
        warn!(
            token_device = %caller.device_id,
            body_device = %request.device_id,
            "Push for a device other than the caller's"
        );
        return Err(ApiError::Forbidden);
    }

    let result = state
        .reconciler
        .push(&caller.device_id, &caller.user_id, &request.changes)
        .await?;
    Ok(Json(result))
}

pub async fn ack(
    State(state): State<AppState>,
    Extension(caller): Extension<DeviceCaller>,
    Json(request): Json<AckRequest>,
) -> Result<Json<Device>, ApiError> {
    let device = state
        .reconciler
        .acknowledge(&caller.device_id, &caller.user_id, request.sequence)
        .await?;
    Ok(Json(device))
}

/// Answers for revoked devices too; that is the point of asking.
pub async fn wipe_status(
    State(state): State<AppState>,
    Extension(caller): Extension<DeviceCaller>,
) -> Result<Json<WipeStatus>, ApiError> {
    let device = state.reconciler.registry().get(&caller.device_id).await?;
    if device.owner_user_id != caller.user_id {
        return Err(ApiError::Forbidden);
    }

    Ok(Json(WipeStatus {
        should_wipe: device.is_revoked(),
    }))
}
