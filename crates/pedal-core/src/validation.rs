//! # Validation Module
//!
//! Boundary validation for identifiers and payloads.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Wire parse (pedal-hub::protocol)                             │
//! │  ├── JSON shape, known message types                                   │
//! │  └── bike_id present                                                   │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: THIS MODULE                                                  │
//! │  ├── Identifier format (prefix + bounded token)                        │
//! │  └── Battery range, payload size                                       │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Database (SQLite)                                            │
//! │  ├── PRIMARY KEY / NOT NULL constraints                                │
//! │  └── CHECK constraints on status and kind                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use pedal_core::validation::{validate_unit_id, validate_battery_pct};
//!
//! validate_unit_id("u-000001").unwrap();
//! assert_eq!(validate_battery_pct(87).unwrap(), 87);
//! ```

use crate::error::ValidationError;
use crate::{UNIT_ID_MAX_TOKEN_LEN, UNIT_ID_PREFIX};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validates a field-unit identifier.
///
/// ## Rules
/// - Must start with [`UNIT_ID_PREFIX`]
/// - The token after the prefix is 1..=[`UNIT_ID_MAX_TOKEN_LEN`] characters
/// - The token contains only ASCII letters and digits
///
/// ## Example
/// ```rust
/// use pedal_core::validation::validate_unit_id;
///
/// assert!(validate_unit_id("u-AAA").is_ok());
/// assert!(validate_unit_id("AAA").is_err());
/// assert!(validate_unit_id("u-").is_err());
/// ```
pub fn validate_unit_id(id: &str) -> ValidationResult<()> {
    if id.is_empty() {
        return Err(ValidationError::Required {
            field: "bike_id".to_string(),
        });
    }

    let token = id
        .strip_prefix(UNIT_ID_PREFIX)
        .ok_or_else(|| ValidationError::InvalidFormat {
            field: "bike_id".to_string(),
            reason: format!("must start with '{}'", UNIT_ID_PREFIX),
        })?;

    if token.is_empty() {
        return Err(ValidationError::InvalidFormat {
            field: "bike_id".to_string(),
            reason: "token after prefix is empty".to_string(),
        });
    }

    if token.len() > UNIT_ID_MAX_TOKEN_LEN {
        return Err(ValidationError::TooLong {
            field: "bike_id".to_string(),
            max: UNIT_ID_PREFIX.len() + UNIT_ID_MAX_TOKEN_LEN,
        });
    }

    if !token.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ValidationError::InvalidFormat {
            field: "bike_id".to_string(),
            reason: "must contain only ASCII letters and digits".to_string(),
        });
    }

    Ok(())
}

/// Validates a battery percentage reported by a field unit.
///
/// Units report raw integers; anything outside 0..=100 is a sensor or
/// firmware fault and is rejected rather than clamped.
pub fn validate_battery_pct(value: i64) -> ValidationResult<u8> {
    if !(0..=100).contains(&value) {
        return Err(ValidationError::OutOfRange {
            field: "battery".to_string(),
            min: 0,
            max: 100,
        });
    }
    Ok(value as u8)
}

/// Validates that a buffer payload fits the configured size bound.
pub fn validate_payload_size(payload: &str, max_bytes: usize) -> ValidationResult<()> {
    if payload.len() > max_bytes {
        return Err(ValidationError::TooLong {
            field: "payload".to_string(),
            max: max_bytes,
        });
    }
    Ok(())
}
