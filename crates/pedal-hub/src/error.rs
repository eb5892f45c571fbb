//! # Hub Error Types
//!
//! Error types for the coordination engine.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Hub Error Categories                              │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Admission     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  MalformedId    │  │  InvalidMessage         │ │
//! │  │  Missing creds  │  │  Refused        │  │  MissingBikeId          │ │
//! │  │  InvalidUrl     │  │                 │  │  UnknownMessageType     │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │ Synchronization │  │    Capacity     │  │      Storage            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Connection     │  │  BufferFull     │  │  Storage                │ │
//! │  │  Timeout        │  │  PayloadTooLarge│  │                         │ │
//! │  │  CloudStatus    │  │                 │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  None of these halt the main loop. Sync errors feed the SyncMonitor,   │
//! │  everything else is logged and dropped.                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use pedal_core::{UnitStatus, ValidationError};

/// Result type alias for hub operations.
pub type HubResult<T> = Result<T, HubError>;

/// Hub error type covering every failure the engine can observe.
#[derive(Debug, Error)]
pub enum HubError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid hub configuration.
    #[error("Invalid hub configuration: {0}")]
    InvalidConfig(String),

    /// Wide-area credentials are missing or incomplete.
    #[error("Wide-area credentials not configured")]
    MissingCredentials,

    /// Invalid cloud URL.
    #[error("Invalid cloud URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Admission Errors
    // =========================================================================
    /// Identifier does not have the field-unit format.
    #[error("Malformed unit identifier: {0}")]
    MalformedId(#[from] ValidationError),

    /// Unit is not admitted.
    #[error("Unit {unit_id} refused (status: {status})")]
    Refused { unit_id: String, status: UnitStatus },

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Payload could not be parsed.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Payload has no `bike_id`.
    #[error("Message has no bike_id")]
    MissingBikeId,

    /// Payload carries an unknown `type`.
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    /// A session already attributed to one unit received another unit's id.
    #[error("Session belongs to {expected}, message claims {actual}")]
    IdentityMismatch { expected: String, actual: String },

    /// Failed to serialize an outbound message or upload body.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Synchronization Errors
    // =========================================================================
    /// Could not reach the cloud.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A wide-area step exceeded its deadline.
    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    /// Cloud answered with a non-success status.
    #[error("Cloud returned {status} for {path}")]
    CloudStatus { status: u16, path: String },

    /// Cloud answered with a body the hub cannot use.
    #[error("Invalid cloud payload: {0}")]
    CloudPayload(String),

    // =========================================================================
    // Capacity Errors
    // =========================================================================
    /// Offline buffer is at capacity.
    #[error("Offline buffer full ({capacity} entries)")]
    BufferFull { capacity: usize },

    /// A single payload exceeds the per-entry bound.
    #[error("Payload of {size} bytes exceeds limit of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Durable write or read failed.
    #[error("Storage error: {0}")]
    Storage(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Operation not valid in the current mode.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Radio link refused an outbound operation.
    #[error("Wireless link error: {0}")]
    LinkError(String),

}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<pedal_db::DbError> for HubError {
    fn from(err: pedal_db::DbError) -> Self {
        HubError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        HubError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for HubError {
    fn from(err: url::ParseError) -> Self {
        HubError::InvalidUrl(err.to_string())
    }
}

impl From<reqwest::Error> for HubError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            HubError::CloudStatus {
                status: status.as_u16(),
                path: err
                    .url()
                    .map(|u| u.path().to_string())
                    .unwrap_or_default(),
            }
        } else if err.is_decode() {
            HubError::CloudPayload(err.to_string())
        } else {
            HubError::ConnectionFailed(err.to_string())
        }
    }
}

impl From<std::io::Error> for HubError {
    fn from(err: std::io::Error) -> Self {
        HubError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for HubError {
    fn from(err: toml::de::Error) -> Self {
        HubError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for HubError {
    fn from(err: toml::ser::Error) -> Self {
        HubError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl HubError {
    /// Returns true if the next sync cycle may succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            HubError::ConnectionFailed(_) | HubError::Timeout(_) => true,
            HubError::CloudStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            HubError::InvalidConfig(_)
                | HubError::MissingCredentials
                | HubError::InvalidUrl(_)
                | HubError::ConfigLoadFailed(_)
                | HubError::ConfigSaveFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(HubError::ConnectionFailed("dns".into()).is_retryable());
        assert!(HubError::Timeout(10).is_retryable());
        assert!(HubError::CloudStatus {
            status: 503,
            path: "/buffer".into()
        }
        .is_retryable());

        assert!(!HubError::CloudStatus {
            status: 401,
            path: "/registry".into()
        }
        .is_retryable());
        assert!(!HubError::MissingCredentials.is_retryable());
    }

    #[test]
    fn test_config_errors() {
        assert!(HubError::InvalidUrl("x".into()).is_config_error());
        assert!(HubError::MissingCredentials.is_config_error());
        assert!(!HubError::Timeout(5).is_config_error());
    }

    #[test]
    fn test_admission_messages() {
        let refused = HubError::Refused {
            unit_id: "u-AAA".into(),
            status: UnitStatus::Blocked,
        };
        assert_eq!(refused.to_string(), "Unit u-AAA refused (status: blocked)");

        let malformed: HubError = pedal_core::FieldUnitId::parse("AAA").unwrap_err().into();
        assert!(matches!(malformed, HubError::MalformedId(_)));
    }

    #[test]
    fn test_db_error_becomes_storage() {
        let err: HubError = pedal_db::DbError::PoolExhausted.into();
        assert!(matches!(err, HubError::Storage(_)));
    }
}
