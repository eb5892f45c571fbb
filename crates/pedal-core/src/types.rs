//! # Domain Types
//!
//! Core domain types used throughout Pedal Hub.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │   UnitRecord    │   │  ConfigRecord   │   │  BufferEntry    │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id             │   │  unit_id        │   │  seq            │       │
//! │  │  status         │   │  payload (JSON) │   │  kind           │       │
//! │  │  visit_count    │   │  version (u32)  │   │  origin_id      │       │
//! │  │  last_heartbeat │   │  changed        │   │  payload        │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  FieldUnitId    │   │   UnitStatus    │   │   EntryKind     │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  "u-" + token   │   │  Pending        │   │  Telemetry      │       │
//! │  │  validated once │   │  Allowed        │   │  Heartbeat      │       │
//! │  └─────────────────┘   │  Blocked        │   │  Log / Alert    │       │
//! │                        └─────────────────┘   └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Timestamps
//! All timestamps are epoch seconds ([`Timestamp`]). Before the hub has
//! synchronised its clock they are seconds since boot; see the hub's
//! time base for how peer timestamps are corrected.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, ValidationError};
use crate::validation::validate_unit_id;

/// Epoch seconds.
pub type Timestamp = i64;

// =============================================================================
// Field Unit Identity
// =============================================================================

/// Validated identifier of a field unit.
///
/// Construction goes through [`FieldUnitId::parse`], so holding one is proof
/// the identifier is well-formed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldUnitId(String);

impl FieldUnitId {
    /// Parses and validates an identifier.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        validate_unit_id(raw)?;
        Ok(FieldUnitId(raw.to_string()))
    }

    /// Returns the identifier as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for FieldUnitId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_unit_id(&value)?;
        Ok(FieldUnitId(value))
    }
}

impl From<FieldUnitId> for String {
    fn from(id: FieldUnitId) -> Self {
        id.0
    }
}

impl Borrow<str> for FieldUnitId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for FieldUnitId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FieldUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Unit Status
// =============================================================================

/// Admission status of a field unit.
///
/// ## Transitions
/// ```text
///   first contact ──► Pending ──(cloud)──► Allowed
///                        │                    ▲ │
///                        └──────(cloud)──► Blocked
/// ```
/// Only a cloud download moves a unit out of `Allowed` or `Blocked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    /// Seen but not yet approved. May connect, data is not trusted.
    #[default]
    Pending,
    /// Approved by an administrator. Data is accepted.
    Allowed,
    /// Rejected by an administrator. Connections are refused.
    Blocked,
}

impl UnitStatus {
    /// Returns the lowercase wire/database name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Pending => "pending",
            UnitStatus::Allowed => "allowed",
            UnitStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(UnitStatus::Pending),
            "allowed" => Ok(UnitStatus::Allowed),
            "blocked" => Ok(UnitStatus::Blocked),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

// =============================================================================
// Registry Records
// =============================================================================

/// Last heartbeat reported by a field unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub timestamp: Timestamp,
    pub battery_pct: u8,
    pub free_memory: u32,
}

/// Registry entry for one field unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub id: FieldUnitId,
    pub status: UnitStatus,
    pub first_seen: Timestamp,
    pub last_visit: Timestamp,
    /// Visits observed while still `Pending`.
    pub visit_count: u32,
    pub last_heartbeat: Option<Heartbeat>,
}

impl UnitRecord {
    /// Record created the first time an unknown unit makes contact.
    pub fn first_contact(id: FieldUnitId, now: Timestamp) -> Self {
        UnitRecord {
            id,
            status: UnitStatus::Pending,
            first_seen: now,
            last_visit: now,
            visit_count: 1,
            last_heartbeat: None,
        }
    }

    /// Returns true if the unit may hold a wireless session.
    #[inline]
    pub fn can_connect(&self) -> bool {
        self.status != UnitStatus::Blocked
    }

    /// Returns true if the unit's data may be accepted.
    #[inline]
    pub fn is_allowed(&self) -> bool {
        self.status == UnitStatus::Allowed
    }
}

// =============================================================================
// Configuration Records
// =============================================================================

/// Per-unit configuration blob with its distribution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigRecord {
    pub unit_id: FieldUnitId,
    /// Configuration object as downloaded from the cloud.
    pub payload: serde_json::Value,
    pub version: u32,
    /// Set by a detected version increase, cleared by a push attempt.
    pub changed: bool,
    pub updated_at: Timestamp,
}

// =============================================================================
// Offline Buffer
// =============================================================================

/// Kind of record waiting in the offline buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Data-channel payload from an allowed unit.
    Telemetry,
    /// Hub or unit heartbeat summary.
    Heartbeat,
    /// Hub log event.
    Log,
    /// Safety alert raised by a unit.
    Alert,
}

impl EntryKind {
    /// Returns the snake_case wire/database name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Telemetry => "telemetry",
            EntryKind::Heartbeat => "heartbeat",
            EntryKind::Log => "log",
            EntryKind::Alert => "alert",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "telemetry" => Ok(EntryKind::Telemetry),
            "heartbeat" => Ok(EntryKind::Heartbeat),
            "log" => Ok(EntryKind::Log),
            "alert" => Ok(EntryKind::Alert),
            other => Err(CoreError::UnknownEntryKind(other.to_string())),
        }
    }
}

/// An outbound record awaiting upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferEntry {
    /// Monotonic insertion sequence, unique within one hub.
    pub seq: u64,
    pub kind: EntryKind,
    pub created_at: Timestamp,
    /// Unit (or hub) that produced the record.
    pub origin_id: String,
    /// JSON document, size-bounded at insertion.
    pub payload: String,
    pub uploaded: bool,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_unit_id_parse() {
        let id = FieldUnitId::parse("u-000001").unwrap();
        assert_eq!(id.as_str(), "u-000001");
        assert_eq!(id.to_string(), "u-000001");
        assert!(FieldUnitId::parse("bike-1").is_err());
    }

    #[test]
    fn test_field_unit_id_serde_validates() {
        let id: FieldUnitId = serde_json::from_str("\"u-AAA\"").unwrap();
        assert_eq!(id.as_str(), "u-AAA");
        assert!(serde_json::from_str::<FieldUnitId>("\"nope\"").is_err());
    }

    #[test]
    fn test_field_unit_id_borrows_as_str() {
        let mut map = std::collections::HashMap::new();
        map.insert(FieldUnitId::parse("u-BBB").unwrap(), 7);
        assert_eq!(map.get("u-BBB"), Some(&7));
    }

    #[test]
    fn test_unit_status_parsing() {
        assert_eq!("allowed".parse::<UnitStatus>().unwrap(), UnitStatus::Allowed);
        assert_eq!("BLOCKED".parse::<UnitStatus>().unwrap(), UnitStatus::Blocked);
        assert!("banned".parse::<UnitStatus>().is_err());
        assert_eq!(UnitStatus::default(), UnitStatus::Pending);
    }

    #[test]
    fn test_first_contact_record() {
        let id = FieldUnitId::parse("u-000001").unwrap();
        let record = UnitRecord::first_contact(id, 42);
        assert_eq!(record.status, UnitStatus::Pending);
        assert_eq!(record.visit_count, 1);
        assert_eq!(record.first_seen, 42);
        assert!(record.can_connect());
        assert!(!record.is_allowed());
    }

    #[test]
    fn test_entry_kind_names() {
        for kind in [
            EntryKind::Telemetry,
            EntryKind::Heartbeat,
            EntryKind::Log,
            EntryKind::Alert,
        ] {
            assert_eq!(kind.as_str().parse::<EntryKind>().unwrap(), kind);
        }
        assert_eq!(
            serde_json::to_string(&EntryKind::Telemetry).unwrap(),
            "\"telemetry\""
        );
    }
}
