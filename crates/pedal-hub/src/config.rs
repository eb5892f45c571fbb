//! # Hub Configuration
//!
//! Configuration management for the hub.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     PEDAL_HUB_ID=hub-garage                                            │
//! │     PEDAL_CLOUD_URL=https://cloud.example/api/                         │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/pedal-hub/hub.toml (Linux)                               │
//! │     written back by the local configuration surface                    │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     generated hub id, no credentials → boots into configuration mode   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [hub]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Garage hub"
//!
//! [network]
//! ssid = "barn-wifi"
//! passphrase = "hunter22"
//!
//! [cloud]
//! base_url = "https://cloud.example/api/"
//! api_key = "k-123"
//!
//! [buffer]
//! capacity = 200
//! sync_threshold_pct = 80
//!
//! [sync]
//! max_failures = 5
//! fallback_timeout_mins = 60
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{HubError, HubResult};

// =============================================================================
// Hub Identity
// =============================================================================

/// Identity of this hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubIdentity {
    /// Unique hub identifier (UUID v4), generated on first run.
    pub id: String,

    /// Human-readable hub name.
    #[serde(default = "default_hub_name")]
    pub name: String,

    /// Database file; defaults to the platform data directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

fn default_hub_name() -> String {
    "Pedal Hub".to_string()
}

impl Default for HubIdentity {
    fn default() -> Self {
        HubIdentity {
            id: Uuid::new_v4().to_string(),
            name: default_hub_name(),
            database_path: None,
        }
    }
}

// =============================================================================
// Wide-Area Credentials
// =============================================================================

/// Base network credentials for the wide-area link.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSettings {
    #[serde(default)]
    pub ssid: String,

    #[serde(default)]
    pub passphrase: String,
}

/// Cloud endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudSettings {
    /// Base URL every REST path is resolved against.
    #[serde(default)]
    pub base_url: String,

    /// API key sent as a bearer token.
    #[serde(default)]
    pub api_key: String,

    /// Deadline for the connect probe (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Deadline for every other request (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    15
}

impl Default for CloudSettings {
    fn default() -> Self {
        CloudSettings {
            base_url: String::new(),
            api_key: String::new(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl CloudSettings {
    /// Returns the parsed base URL, always ending in `/` so relative paths
    /// resolve beneath it.
    pub fn parsed_base_url(&self) -> HubResult<Url> {
        if self.base_url.trim().is_empty() {
            return Err(HubError::MissingCredentials);
        }
        let mut raw = self.base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let url = Url::parse(&raw)?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(HubError::InvalidUrl(format!(
                "Cloud URL must use http or https, got: {}",
                other
            ))),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// =============================================================================
// Engine Settings
// =============================================================================

/// Session multiplexer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// How long one unit may hold the active slot (seconds).
    #[serde(default = "default_active_timeout")]
    pub active_timeout_secs: u64,

    /// Capacity of the radio event channel.
    #[serde(default = "default_event_capacity")]
    pub event_channel_capacity: usize,
}

fn default_active_timeout() -> u64 {
    30
}

fn default_event_capacity() -> usize {
    64
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            active_timeout_secs: default_active_timeout(),
            event_channel_capacity: default_event_capacity(),
        }
    }
}

/// Offline buffer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferSettings {
    /// Maximum number of unconfirmed entries.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Occupancy (percent) at which a sync is requested.
    #[serde(default = "default_threshold")]
    pub sync_threshold_pct: u8,

    /// Maximum time between successful syncs (seconds).
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    /// Write a snapshot every N inserts.
    #[serde(default = "default_persist_every")]
    pub persist_every: u32,

    /// Per-entry payload bound (bytes).
    #[serde(default = "default_max_payload")]
    pub max_payload_bytes: usize,

    /// Entries kept in the rolling diagnostic history.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

fn default_capacity() -> usize {
    200
}
fn default_threshold() -> u8 {
    80
}
fn default_sync_interval() -> u64 {
    30 * 60
}
fn default_persist_every() -> u32 {
    10
}
fn default_max_payload() -> usize {
    512
}
fn default_history_capacity() -> usize {
    50
}

impl Default for BufferSettings {
    fn default() -> Self {
        BufferSettings {
            capacity: default_capacity(),
            sync_threshold_pct: default_threshold(),
            sync_interval_secs: default_sync_interval(),
            persist_every: default_persist_every(),
            max_payload_bytes: default_max_payload(),
            history_capacity: default_history_capacity(),
        }
    }
}

/// Cloud sync and fallback settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Consecutive failures before falling back to configuration mode.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// Length of a failure streak before falling back (minutes).
    #[serde(default = "default_fallback_timeout")]
    pub fallback_timeout_mins: u64,

    /// How long downloaded configs stay valid (seconds).
    #[serde(default = "default_config_validity")]
    pub config_validity_secs: u64,

    /// Main loop tick (milliseconds).
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Minimum wait after a failed cycle before a triggered retry (seconds).
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
}

fn default_max_failures() -> u32 {
    5
}
fn default_fallback_timeout() -> u64 {
    60
}
fn default_config_validity() -> u64 {
    3600
}
fn default_tick_interval() -> u64 {
    1000
}
fn default_retry_interval() -> u64 {
    60
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            max_failures: default_max_failures(),
            fallback_timeout_mins: default_fallback_timeout(),
            config_validity_secs: default_config_validity(),
            tick_interval_ms: default_tick_interval(),
            retry_interval_secs: default_retry_interval(),
        }
    }
}

/// Low-power cycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerSettings {
    #[serde(default)]
    pub low_power_enabled: bool,

    /// Idle time (no sessions, no writes) before sleeping (seconds).
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_secs: u64,

    /// Length of one sleep (seconds).
    #[serde(default = "default_sleep")]
    pub sleep_secs: u64,
}

fn default_idle_threshold() -> u64 {
    300
}
fn default_sleep() -> u64 {
    600
}

impl Default for PowerSettings {
    fn default() -> Self {
        PowerSettings {
            low_power_enabled: false,
            idle_threshold_secs: default_idle_threshold(),
            sleep_secs: default_sleep(),
        }
    }
}

/// Timestamp correction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSettings {
    /// Peer timestamps below this epoch second are treated as unsynced.
    #[serde(default = "default_plausibility_floor")]
    pub plausibility_floor: i64,
}

/// 2020-09-13, well before any unit shipped.
fn default_plausibility_floor() -> i64 {
    1_600_000_000
}

impl Default for TimeSettings {
    fn default() -> Self {
        TimeSettings {
            plausibility_floor: default_plausibility_floor(),
        }
    }
}

// =============================================================================
// Main Hub Configuration
// =============================================================================

/// Complete hub configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub hub: HubIdentity,

    #[serde(default)]
    pub network: NetworkSettings,

    #[serde(default)]
    pub cloud: CloudSettings,

    #[serde(default)]
    pub session: SessionSettings,

    #[serde(default)]
    pub buffer: BufferSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub power: PowerSettings,

    #[serde(default)]
    pub time: TimeSettings,
}

/// Submission from the local configuration surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationUpdate {
    pub ssid: String,
    #[serde(default)]
    pub passphrase: String,
    pub base_url: String,
    pub api_key: String,
}

impl HubConfig {
    /// Creates a new config with defaults and a generated hub ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (hub.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> HubResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading hub config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load hub config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> HubResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| HubError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| HubError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| HubError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Hub config saved");
        Ok(())
    }

    /// Validates the configuration.
    ///
    /// Missing credentials are not an error here; they send the hub into
    /// configuration mode instead.
    pub fn validate(&self) -> HubResult<()> {
        if self.hub.id.trim().is_empty() {
            return Err(HubError::InvalidConfig("hub.id must not be empty".into()));
        }

        if !self.cloud.base_url.trim().is_empty() {
            self.cloud.parsed_base_url()?;
        }

        if self.buffer.capacity == 0 {
            return Err(HubError::InvalidConfig(
                "buffer.capacity must be greater than 0".into(),
            ));
        }

        if !(1..=100).contains(&self.buffer.sync_threshold_pct) {
            return Err(HubError::InvalidConfig(
                "buffer.sync_threshold_pct must be between 1 and 100".into(),
            ));
        }

        if self.buffer.persist_every == 0 {
            return Err(HubError::InvalidConfig(
                "buffer.persist_every must be greater than 0".into(),
            ));
        }

        if self.sync.max_failures == 0 {
            return Err(HubError::InvalidConfig(
                "sync.max_failures must be greater than 0".into(),
            ));
        }

        if self.sync.tick_interval_ms == 0 || self.session.active_timeout_secs == 0 {
            return Err(HubError::InvalidConfig(
                "tick and session timeouts must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Returns true when the hub can attempt a wide-area sync.
    pub fn has_credentials(&self) -> bool {
        !self.network.ssid.trim().is_empty()
            && !self.cloud.api_key.trim().is_empty()
            && self.cloud.parsed_base_url().is_ok()
    }

    /// Returns a copy of this config with a configuration-surface
    /// submission applied. Fails unless the result has usable credentials.
    pub fn with_update(&self, update: &ConfigurationUpdate) -> HubResult<Self> {
        let mut next = self.clone();
        next.network.ssid = update.ssid.trim().to_string();
        next.network.passphrase = update.passphrase.clone();
        next.cloud.base_url = update.base_url.trim().to_string();
        next.cloud.api_key = update.api_key.trim().to_string();

        next.validate()?;
        if !next.has_credentials() {
            return Err(HubError::MissingCredentials);
        }
        Ok(next)
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("PEDAL_HUB_ID") {
            debug!(hub_id = %id, "Overriding hub ID from environment");
            self.hub.id = id;
        }

        if let Ok(name) = std::env::var("PEDAL_HUB_NAME") {
            self.hub.name = name;
        }

        if let Ok(path) = std::env::var("PEDAL_DATABASE") {
            self.hub.database_path = Some(PathBuf::from(path));
        }

        if let Ok(ssid) = std::env::var("PEDAL_WIFI_SSID") {
            self.network.ssid = ssid;
        }

        if let Ok(pass) = std::env::var("PEDAL_WIFI_PASSPHRASE") {
            self.network.passphrase = pass;
        }

        if let Ok(url) = std::env::var("PEDAL_CLOUD_URL") {
            debug!(url = %url, "Overriding cloud URL from environment");
            self.cloud.base_url = url;
        }

        if let Ok(key) = std::env::var("PEDAL_CLOUD_API_KEY") {
            self.cloud.api_key = key;
        }

        if let Ok(capacity) = std::env::var("PEDAL_BUFFER_CAPACITY") {
            match capacity.parse::<usize>() {
                Ok(c) => self.buffer.capacity = c,
                Err(_) => warn!(value = %capacity, "Ignoring invalid PEDAL_BUFFER_CAPACITY"),
            }
        }

        if let Ok(failures) = std::env::var("PEDAL_MAX_FAILURES") {
            match failures.parse::<u32>() {
                Ok(f) => self.sync.max_failures = f,
                Err(_) => warn!(value = %failures, "Ignoring invalid PEDAL_MAX_FAILURES"),
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "pedal", "pedal-hub")
            .map(|dirs| dirs.config_dir().join("hub.toml"))
    }

    /// Returns the database path: configured, or the platform data directory.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.hub.database_path.clone().or_else(|| {
            directories::ProjectDirs::from("io", "pedal", "pedal-hub")
                .map(|dirs| dirs.data_dir().join("hub.db"))
        })
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn hub_id(&self) -> &str {
        &self.hub.id
    }

    pub fn active_timeout(&self) -> Duration {
        Duration::from_secs(self.session.active_timeout_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.buffer.sync_interval_secs)
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.fallback_timeout_mins * 60)
    }

    pub fn config_validity(&self) -> Duration {
        Duration::from_secs(self.sync.config_validity_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.sync.tick_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.sync.retry_interval_secs)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.power.idle_threshold_secs)
    }

    pub fn sleep_duration(&self) -> Duration {
        Duration::from_secs(self.power.sleep_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentialed() -> HubConfig {
        let mut config = HubConfig::default();
        config.network.ssid = "barn".into();
        config.cloud.base_url = "https://cloud.example/api".into();
        config.cloud.api_key = "k-1".into();
        config
    }

    #[test]
    fn test_default_config() {
        let config = HubConfig::default();
        assert!(!config.hub.id.is_empty());
        assert_eq!(config.session.active_timeout_secs, 30);
        assert_eq!(config.buffer.sync_threshold_pct, 80);
        assert_eq!(config.sync.max_failures, 5);
        assert_eq!(config.sync.config_validity_secs, 3600);
        assert_eq!(config.time.plausibility_floor, 1_600_000_000);
        assert!(config.validate().is_ok());
        assert!(!config.has_credentials());
    }

    #[test]
    fn test_has_credentials() {
        let mut config = credentialed();
        assert!(config.has_credentials());

        config.cloud.base_url = "ftp://cloud.example".into();
        assert!(!config.has_credentials());

        config = credentialed();
        config.network.ssid = "  ".into();
        assert!(!config.has_credentials());
    }

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let config = credentialed();
        let url = config.cloud.parsed_base_url().unwrap();
        assert_eq!(url.as_str(), "https://cloud.example/api/");
        assert_eq!(
            url.join("registry").unwrap().as_str(),
            "https://cloud.example/api/registry"
        );
    }

    #[test]
    fn test_config_validation() {
        let mut config = HubConfig::default();
        config.buffer.capacity = 0;
        assert!(config.validate().is_err());

        let mut config = HubConfig::default();
        config.buffer.sync_threshold_pct = 0;
        assert!(config.validate().is_err());

        let mut config = HubConfig::default();
        config.cloud.base_url = "not a url".into();
        assert!(config.validate().is_err());

        let mut config = HubConfig::default();
        config.hub.id = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_with_update() {
        let config = HubConfig::default();
        let update = ConfigurationUpdate {
            ssid: "barn".into(),
            passphrase: "secret".into(),
            base_url: "https://cloud.example".into(),
            api_key: "k".into(),
        };
        let next = config.with_update(&update).unwrap();
        assert!(next.has_credentials());
        assert_eq!(next.hub.id, config.hub.id);

        let bad = ConfigurationUpdate {
            api_key: String::new(),
            ..update
        };
        assert!(matches!(
            config.with_update(&bad),
            Err(HubError::MissingCredentials)
        ));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("hub.toml");

        let mut config = credentialed();
        config.buffer.capacity = 42;
        config.save(Some(path.clone())).unwrap();

        let loaded = HubConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.hub.id, config.hub.id);
        assert_eq!(loaded.buffer.capacity, 42);
        assert!(loaded.has_credentials());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: HubConfig = toml::from_str(
            r#"
            [hub]
            id = "hub-1"

            [buffer]
            capacity = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.hub.name, "Pedal Hub");
        assert_eq!(config.buffer.capacity, 10);
        assert_eq!(config.buffer.sync_threshold_pct, 80);
        assert_eq!(config.sync.max_failures, 5);
    }
}
