//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │   Sync Outcome  │  │    Delivery     │  │     Configuration       │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Conflict       │  │  Delivery       │  │  InvalidConfig          │ │
//! │  │  StaleCursor    │  │  (retryable     │  │  InvalidUrl             │ │
//! │  │  DuplicateEvent │  │   or not)       │  │  ConfigLoadFailed       │ │
//! │  │  Unauthorized   │  │                 │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Request      │  │    Database     │  │      Internal           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Validation     │  │  DatabaseError  │  │  ShuttingDown           │ │
//! │  │  NotFound       │  │  (retryable     │  │  ChannelError           │ │
//! │  │                 │  │   when busy)    │  │  Internal               │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `DuplicateEvent` is not a failure at the edges: a replayed CRM event or
//! change id is answered with success.

use fieldsync_core::ValidationError;
use fieldsync_db::DbError;
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Sync Outcomes
    // =========================================================================
    /// A write collided with the authoritative order (sequence or version).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A device tried to move its cursor backwards.
    #[error("Stale cursor for device {device_id}: acknowledged {acked}, got {requested}")]
    StaleCursor {
        device_id: String,
        acked: i64,
        requested: i64,
    },

    /// Bad webhook secret, revoked device, or a device acting for another.
    ///
    /// The message is for logs only and never goes back to the caller.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// An outbound CRM webhook was not acknowledged.
    #[error("Delivery failed: {message}")]
    Delivery { message: String, retryable: bool },

    /// The CRM event id or change id was already absorbed.
    #[error("Duplicate event: {0}")]
    DuplicateEvent(String),

    // =========================================================================
    // Request Errors
    // =========================================================================
    /// Malformed input.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Referenced record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    // =========================================================================
    // Database Errors
    // =========================================================================
    /// Database query failed.
    #[error("Database error: {message}")]
    DatabaseError { message: String, retryable: bool },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Invalid CRM webhook URL.
    #[error("Invalid webhook URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Failed to serialize a payload.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// The engine is shutting down.
    #[error("Sync engine is shutting down")]
    ShuttingDown,

    /// Internal sync engine error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Creates a NotFound error for a given entity type and ID.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        SyncError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Creates a retryable Delivery error.
    pub fn transient(message: impl Into<String>) -> Self {
        SyncError::Delivery {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a Delivery error that the same request will not fix.
    pub fn rejected(message: impl Into<String>) -> Self {
        SyncError::Delivery {
            message: message.into(),
            retryable: false,
        }
    }
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<DbError> for SyncError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::SequenceConflict { .. } => SyncError::Conflict(err.to_string()),
            DbError::UniqueViolation { ref field, ref value } if field == "change_records.id" => {
                SyncError::DuplicateEvent(value.clone())
            }
            DbError::NotFound { entity, id } => SyncError::NotFound { entity, id },
            other => SyncError::DatabaseError {
                retryable: other.is_retryable(),
                message: other.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        // Connect errors and timeouts are worth another attempt; a request
        // we could not even build is not.
        if err.is_builder() {
            SyncError::rejected(err.to_string())
        } else {
            SyncError::transient(err.to_string())
        }
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the operation can be retried as-is.
    ///
    /// ## Retryable Errors
    /// - Transient webhook delivery failures
    /// - Busy / exhausted database
    ///
    /// ## Non-Retryable Errors
    /// - Conflicts, stale cursors, authorization failures
    /// - Configuration and validation errors
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Delivery {
                retryable: true,
                ..
            } | SyncError::DatabaseError {
                retryable: true,
                ..
            }
        )
    }

    /// Returns true for replays that callers should treat as success.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, SyncError::DuplicateEvent(_))
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_) | SyncError::InvalidUrl(_) | SyncError::ConfigLoadFailed(_)
        )
    }
}
