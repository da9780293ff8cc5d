//! # Error Types
//!
//! Domain-specific error types for fieldsync-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  fieldsync-core errors (this file)                                     │
//! │  ├── CoreError        - Domain rule violations                         │
//! │  └── ValidationError  - Malformed pushes / webhook payloads            │
//! │                                                                         │
//! │  fieldsync-db errors (separate crate)                                  │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  fieldsync-engine errors                                               │
//! │  └── SyncError        - Conflict, StaleCursor, Unauthorized, ...       │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → ApiError → HTTP       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A value that should name a channel does not.
    ///
    /// Channels are `crm` or `device:<id>`.
    #[error("Unknown sync channel: {0}")]
    UnknownChannel(String),

    /// Unknown change operation.
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// Unknown CRM webhook event kind.
    #[error("Unknown CRM event kind: {0}")]
    UnknownCrmEvent(String),

    /// Unknown change origin kind.
    #[error("Unknown origin kind: {0}")]
    UnknownOrigin(String),

    /// Unknown device status.
    #[error("Unknown device status: {0}")]
    UnknownDeviceStatus(String),

    /// Unknown sync state.
    #[error("Unknown sync state: {0}")]
    UnknownSyncState(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Used for early validation of pushed changes and inbound CRM payloads
/// before anything touches the authority store.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Invalid format (e.g., payload not an object, bad identifier).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Too many items in a single request.
    #[error("{field} must contain at most {max} items")]
    TooMany { field: String, max: usize },
}

impl ValidationError {
    pub fn required(field: impl Into<String>) -> Self {
        ValidationError::Required {
            field: field.into(),
        }
    }

    pub fn invalid_format(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ValidationError::InvalidFormat {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
