//! Router assembly and the health endpoint.

pub mod crm;
pub mod status;
pub mod sync;

use axum::extract::State;
use axum::middleware;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use fieldsync_db::migrations::migration_status;
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::auth::{require_device, require_operator};
use crate::error::ApiError;
use crate::AppState;

pub fn app_router(state: AppState) -> Router {
    let device_routes = Router::new()
        .route("/sync/devices", get(sync::list_devices).post(sync::register))
        .route("/sync/pull", get(sync::pull))
        .route("/sync/push", post(sync::push))
        .route("/sync/ack", post(sync::ack))
        .route("/security/wipe-status", get(sync::wipe_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_device));

    let operator_routes = Router::new()
        .route("/status/conflicted", get(status::conflicted))
        .route("/status/failed", get(status::failed))
        .route("/status/counts", get(status::counts))
        .route("/status/entities/{entity_type}/{entity_id}", get(status::entity))
        .route("/status/crm/retry", post(status::retry_crm))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_operator));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/crm/webhooks/{event}", post(crm::webhook))
        .merge(device_routes)
        .merge(operator_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    head_sequence: i64,
    pending_migrations: usize,
}

async fn healthz(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let head_sequence = state
        .reconciler
        .log()
        .head()
        .await
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;
    let (total, applied) = migration_status(state.db.pool())
        .await
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;

    Ok(Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        head_sequence,
        pending_migrations: total.saturating_sub(applied),
    }))
}

// =============================================================================
// Router Tests
// =============================================================================
