//! # pedal-db: Persistence Layer for Pedal Hub
//!
//! Durable storage for everything the hub must survive a power cycle with:
//! the unit registry, per-unit configuration and the offline buffer.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Pedal Hub Data Flow                              │
//! │                                                                         │
//! │  Registry / ConfigStore / OfflineBuffer mutation (pedal-hub)           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     pedal-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────┐   ┌──────────────┐   │   │
//! │  │   │   Database    │    │  Repositories  │   │  Migrations  │   │   │
//! │  │   │   (pool.rs)   │    │                │   │  (embedded)  │   │   │
//! │  │   │               │    │ RegistryRepo   │   │              │   │   │
//! │  │   │ SqlitePool    │◄───│ ConfigRepo     │   │ 001_init.sql │   │   │
//! │  │   │               │    │ BufferRepo     │   │              │   │   │
//! │  │   │               │    │ HubStateRepo   │   │              │   │   │
//! │  │   └───────────────┘    └────────────────┘   └──────────────┘   │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database                             │   │
//! │  │   ~/.local/share/pedal-hub/hub.db                               │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Repository implementations
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pedal_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("hub.db")).await?;
//! let units = db.registry().load_all().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::buffer::BufferRepository;
pub use repository::config::ConfigRepository;
pub use repository::registry::RegistryRepository;
pub use repository::state::HubStateRepository;
