//! # Validation Module
//!
//! Structural checks on everything a device sends before the reconciler looks
//! at it.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Deserialization (serde)                                      │
//! │  └── Shape of the JSON body, operation names                           │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: THIS MODULE                                                  │
//! │  ├── Batch size (whole request rejected)                               │
//! │  └── Per-change identifiers and payload shape                          │
//! │      (change reported as invalid_change, batch continues)              │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Merge rules (crate::merge)                                   │
//! │  └── Versions, tombstones, status graphs                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use fieldsync_core::validation::validate_device_id;
//!
//! assert!(validate_device_id("pixel-7-a1b2").is_ok());
//! assert!(validate_device_id("").is_err());
//! ```

use crate::error::ValidationError;
use crate::types::{Operation, PushChange};
use crate::{MAX_ENTITY_TYPE_LEN, MAX_ID_LEN, MAX_PUSH_BATCH};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Identifier Validators
// =============================================================================

fn validate_id(field: &str, value: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::required(field));
    }
    if value.len() > MAX_ID_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_ID_LEN,
        });
    }
    if value.chars().any(char::is_control) {
        return Err(ValidationError::invalid_format(
            field,
            "must not contain control characters",
        ));
    }
    Ok(())
}

/// Validates a device id.
pub fn validate_device_id(device_id: &str) -> ValidationResult<()> {
    validate_id("deviceId", device_id)
}

/// Validates an entity type slug.
///
/// ## Rules
/// - Must not be empty
/// - At most 64 characters
/// - Lowercase ASCII letters and underscores only
pub fn validate_entity_type(entity_type: &str) -> ValidationResult<()> {
    if entity_type.is_empty() {
        return Err(ValidationError::required("entityType"));
    }
    if entity_type.len() > MAX_ENTITY_TYPE_LEN {
        return Err(ValidationError::TooLong {
            field: "entityType".to_string(),
            max: MAX_ENTITY_TYPE_LEN,
        });
    }
    if !entity_type
        .chars()
        .all(|c| c.is_ascii_lowercase() || c == '_')
    {
        return Err(ValidationError::invalid_format(
            "entityType",
            "must contain only lowercase letters and underscores",
        ));
    }
    Ok(())
}

// =============================================================================
// Push Validators
// =============================================================================

/// Validates the size of a push batch.
pub fn validate_batch(changes: &[PushChange]) -> ValidationResult<()> {
    if changes.len() > MAX_PUSH_BATCH {
        return Err(ValidationError::TooMany {
            field: "changes".to_string(),
            max: MAX_PUSH_BATCH,
        });
    }
    Ok(())
}

/// Validates a single pushed change.
///
/// Deletes may carry any payload (it is ignored). Creates and updates need a
/// JSON object.
pub fn validate_push_change(change: &PushChange) -> ValidationResult<()> {
    validate_id("id", &change.id)?;
    validate_entity_type(&change.entity_type)?;
    validate_id("entityId", &change.entity_id)?;

    if change.version < 0 {
        return Err(ValidationError::OutOfRange {
            field: "version".to_string(),
            min: 0,
            max: i64::MAX,
        });
    }

    if change.operation != Operation::Delete && !change.payload.is_object() {
        return Err(ValidationError::invalid_format(
            "payload",
            "must be a JSON object",
        ));
    }

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
