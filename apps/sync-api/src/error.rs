//! Error types for the sync API.
//!
//! Authorization failures answer with a fixed body. Internal failures are
//! logged here and answered without detail.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fieldsync_engine::SyncError;
use serde::Serialize;
use tracing::error;

/// API errors.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Missing, malformed or invalid credentials.
    #[error("unauthorized")]
    Unauthenticated,

    /// Valid credentials that may not do this.
    #[error("forbidden")]
    Forbidden,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Unauthorized(_) => ApiError::Forbidden,
            SyncError::Validation(v) => ApiError::BadRequest(v.to_string()),
            SyncError::NotFound { .. } => ApiError::NotFound(e.to_string()),
            SyncError::Conflict(_) | SyncError::StaleCursor { .. } | SyncError::DuplicateEvent(_) => {
                ApiError::Conflict(e.to_string())
            }
            SyncError::ShuttingDown => ApiError::Unavailable(e.to_string()),
            SyncError::DatabaseError { retryable: true, .. } => ApiError::Unavailable(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Unauthenticated => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ApiError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };

        let message = match self {
            ApiError::BadRequest(m) | ApiError::NotFound(m) | ApiError::Conflict(m) => Some(m),
            ApiError::Unavailable(m) | ApiError::Internal(m) => {
                error!(status = status.as_u16(), error = %m, "Request failed");
                None
            }
            ApiError::Unauthenticated | ApiError::Forbidden => None,
        };

        (status, Json(ErrorBody { error: code, message })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_core::ValidationError;

    #[test]
    fn test_sync_error_mapping() {
        let e: ApiError = SyncError::Unauthorized("device d-1 is revoked".into()).into();
        assert!(matches!(e, ApiError::Forbidden));

        let e: ApiError = SyncError::StaleCursor {
            device_id: "d-1".into(),
            acked: 5,
            requested: 4,
        }
        .into();
        assert!(matches!(e, ApiError::Conflict(_)));

        let e: ApiError = SyncError::Validation(ValidationError::required("id")).into();
        assert!(matches!(e, ApiError::BadRequest(_)));

        let e: ApiError = SyncError::transient("HTTP 503").into();
        assert!(matches!(e, ApiError::Internal(_)));
    }

    #[test]
    fn test_auth_failures_leak_nothing() {
        let response = ApiError::Forbidden.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = ApiError::Unauthenticated.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
