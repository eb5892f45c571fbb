//! # pedal-core: Pure Domain Types for Pedal Hub
//!
//! This crate holds the vocabulary every other crate speaks: field-unit
//! identities, admission status, registry records, configuration records
//! and offline-buffer entries. It performs no I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Pedal Hub Architecture                           │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 Radio glue (separate process)                   │   │
//! │  │        connect / disconnect / characteristic writes             │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ stdio bridge                           │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    pedal-hub (engine)                           │   │
//! │  │   Multiplexer ─► Registry / ConfigStore ─► OfflineBuffer        │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ pedal-core (THIS CRATE) ★                       │   │
//! │  │   FieldUnitId • UnitStatus • UnitRecord • ConfigRecord          │   │
//! │  │   BufferEntry • validation                                      │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS            │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (identities, records, buffer entries)
//! - [`error`] - Domain error types
//! - [`validation`] - Identifier and payload rules
//!
//! ## Example Usage
//!
//! ```rust
//! use pedal_core::{FieldUnitId, UnitRecord, UnitStatus};
//!
//! let id = FieldUnitId::parse("u-000001").unwrap();
//! let record = UnitRecord::first_contact(id, 1_700_000_000);
//!
//! assert_eq!(record.status, UnitStatus::Pending);
//! assert_eq!(record.visit_count, 1);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Prefix every field-unit identifier carries.
pub const UNIT_ID_PREFIX: &str = "u-";

/// Maximum length of the token that follows [`UNIT_ID_PREFIX`].
pub const UNIT_ID_MAX_TOKEN_LEN: usize = 16;
