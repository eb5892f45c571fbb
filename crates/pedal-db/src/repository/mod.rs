//! # Repository Module
//!
//! Repository implementations for the hub's durable state.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repository Pattern                                   │
//! │                                                                         │
//! │  Registry::update_heartbeat(id, 87, 40_000)   (pedal-hub, in memory)   │
//! │       │                                                                 │
//! │       │  db.registry().upsert(&record)                                 │
//! │       ▼                                                                 │
//! │  RegistryRepository                                                    │
//! │  ├── upsert(&self, record)                                             │
//! │  ├── replace_all(&self, records)   (one transaction)                   │
//! │  └── load_all(&self)                                                   │
//! │       │                                                                 │
//! │       │  SQL Query                                                      │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! │                                                                         │
//! │  The in-memory component is authoritative; repositories only mirror    │
//! │  it so the next boot can reload it.                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`RegistryRepository`](registry::RegistryRepository) - Unit admission records
//! - [`ConfigRepository`](config::ConfigRepository) - Per-unit configuration
//! - [`BufferRepository`](buffer::BufferRepository) - Offline buffer snapshots
//! - [`HubStateRepository`](state::HubStateRepository) - Key/value hub facts

pub mod buffer;
pub mod config;
pub mod registry;
pub mod state;

use pedal_core::FieldUnitId;

use crate::error::{DbError, DbResult};

/// Parses a stored unit id back into a validated identifier.
pub(crate) fn stored_unit_id(raw: String) -> DbResult<FieldUnitId> {
    FieldUnitId::try_from(raw).map_err(|e| DbError::invalid(e.to_string()))
}

/// Narrows a stored INTEGER into a `u32` column value.
pub(crate) fn stored_u32(column: &str, value: i64) -> DbResult<u32> {
    u32::try_from(value).map_err(|_| DbError::invalid(format!("{} out of range: {}", column, value)))
}
