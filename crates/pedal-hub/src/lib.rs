//! # pedal-hub: Coordination Engine for Pedal Hub
//!
//! The hub sits between a fleet of battery-powered bike trackers and the
//! cloud. Units connect over a short-range radio link, hand over their
//! readings and pick up configuration. The hub buffers everything it
//! accepts and uploads it whenever the wide-area link is up.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Hub Engine Architecture                          │
//! │                                                                         │
//! │  radio stack callbacks                        HubHandle (commands)      │
//! │        │                                            │                   │
//! │        ▼                                            ▼                   │
//! │  ┌─────────────┐  mpsc<WirelessEvent>  ┌──────────────────────────┐    │
//! │  │ EventBridge │──────────────────────►│      Orchestrator        │    │
//! │  └─────────────┘                       │  Boot / Configuration /  │    │
//! │                                        │  Serving / CloudSync /   │    │
//! │        ▲ WirelessLink                  │  Shutdown                │    │
//! │        │ (send, disconnect,            └────────────┬─────────────┘    │
//! │        │  advertising)                              │                  │
//! │        │        ┌───────────────────┬───────────────┼──────────────┐   │
//! │        │        ▼                   ▼               ▼              ▼   │
//! │  ┌─────┴────────────┐  ┌────────────────┐  ┌──────────────┐ ┌────────┐ │
//! │  │SessionMultiplexer│  │ Registry       │  │ OfflineBuffer│ │CloudApi│ │
//! │  │ one active unit, │─►│ ConfigStore    │  │ EventHistory │ │SyncMon.│ │
//! │  │ FIFO queue       │  │ TimeBase       │  │              │ │        │ │
//! │  └──────────────────┘  └────────────────┘  └──────────────┘ └────────┘ │
//! │                                 │                   │                  │
//! │                                 └─────────┬─────────┘                  │
//! │                                           ▼                            │
//! │                                   pedal-db (SQLite)                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Engine
//! - [`orchestrator`] - Mode state machine, main loop, sync cycle
//! - [`multiplexer`] - Connection attribution and the single active slot
//! - [`registry`] - Admission list with local statistics
//! - [`config_store`] - Versioned per-unit configuration
//! - [`offline_buffer`] - Bounded upload queue and event history
//! - [`sync_monitor`] - Failure streak and fallback decision
//! - [`time_base`] - Epoch tracking and timestamp correction
//!
//! ### Edges
//! - [`protocol`] - Unit messages on the radio channels
//! - [`wireless`] - Radio stack seam
//! - [`cloud`] - Wide-area REST client
//! - [`config`] - Hub configuration (TOML + environment)
//! - [`error`] - Engine error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use pedal_db::{Database, DbConfig};
//! use pedal_hub::{EventBridge, HttpCloudClient, HubConfig, Orchestrator};
//!
//! let config = HubConfig::load_or_default(None);
//! let db = Database::new(DbConfig::new("hub.db")).await?;
//! let cloud = HttpCloudClient::new(&config.cloud, config.hub_id())?;
//!
//! let (bridge, events) = EventBridge::channel(config.session.event_channel_capacity);
//! let mut hub = Orchestrator::boot(config, None, &db, Box::new(cloud), Arc::new(radio)).await?;
//! let (handle, commands) = hub.handle();
//! hub.run(events, commands).await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod cloud;
pub mod config;
pub mod config_store;
pub mod error;
pub mod multiplexer;
pub mod offline_buffer;
pub mod orchestrator;
pub mod protocol;
pub mod registry;
pub mod sync_monitor;
pub mod time_base;
pub mod wireless;

#[cfg(test)]
pub(crate) mod test_support;

// =============================================================================
// Re-exports
// =============================================================================

pub use cloud::{CloudApi, CloudConfigEntry, CloudUnitEntry, HttpCloudClient, HubHeartbeat};
pub use config::{ConfigurationUpdate, HubConfig};
pub use config_store::ConfigStore;
pub use error::{HubError, HubResult};
pub use multiplexer::{ServingContext, SessionMultiplexer, WriteOutcome};
pub use offline_buffer::{EventHistory, HistoryEvent, HistoryKind, OfflineBuffer, UploadBatch};
pub use orchestrator::{HubCommand, HubHandle, HubMode, HubStatus, Orchestrator};
pub use protocol::{Channel, HubMessage, UnitMessage};
pub use registry::Registry;
pub use sync_monitor::{SyncMonitor, SyncTrigger};
pub use time_base::{CorrectedTimestamp, TimeBase};
pub use wireless::{ConnHandle, EventBridge, WirelessCallbacks, WirelessEvent, WirelessLink};
