//! # Config Store
//!
//! Versioned per-unit configuration and its push state.
//!
//! ## Version Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   GET /configs  {u-AAA: {version: 4, config: {...}}}                    │
//! │        │                                                                │
//! │        ▼                                                                │
//! │   ingest_cloud_configs   4 > cached 3 ? ──yes──► store, changed = true  │
//! │                                         └─no───► ignore (stale)        │
//! │                                                                         │
//! │   u-AAA attributes ──► has_update? ──► push ──► mark_sent               │
//! │                                                 changed = false         │
//! │                                                                         │
//! │   config_received ──► record_confirmation (log only)                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Delivery is at-least-once: `changed` is cleared on the push attempt, not
//! on confirmation, and units key on `version` to ignore duplicates.

use std::collections::HashMap;

use serde_json::{json, Value};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use pedal_core::{ConfigRecord, FieldUnitId, Timestamp};
use pedal_db::ConfigRepository;

use crate::cloud::CloudConfigEntry;
use crate::error::HubResult;

/// Defaults handed to units that have never been configured.
pub const DEFAULT_REPORT_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_SLEEP_INTERVAL_SECS: u64 = 900;
pub const DEFAULT_WIRELESS_WINDOW_SECS: u64 = 20;

#[derive(Debug)]
pub struct ConfigStore {
    records: HashMap<FieldUnitId, ConfigRecord>,
    last_download: Option<Instant>,
    validity: Duration,
    store: Option<ConfigRepository>,
}

impl ConfigStore {
    pub fn in_memory(validity: Duration) -> Self {
        ConfigStore {
            records: HashMap::new(),
            last_download: None,
            validity,
            store: None,
        }
    }

    /// Restores persisted records. The validity window starts expired so
    /// the first sync downloads fresh configs.
    pub async fn load(store: ConfigRepository, validity: Duration) -> HubResult<Self> {
        let records = store.load_all().await?;
        let pending = records.iter().filter(|r| r.changed).count();
        info!(configs = records.len(), pending, "Config store loaded");

        Ok(ConfigStore {
            records: records
                .into_iter()
                .map(|record| (record.unit_id.clone(), record))
                .collect(),
            last_download: None,
            validity,
            store: Some(store),
        })
    }

    /// Applies a downloaded config map. Returns how many units got a newer
    /// version.
    pub async fn ingest_cloud_configs(
        &mut self,
        configs: HashMap<String, CloudConfigEntry>,
        now: Timestamp,
    ) -> usize {
        let mut changed = Vec::new();

        for (raw_id, entry) in configs {
            let Ok(unit_id) = FieldUnitId::parse(&raw_id) else {
                warn!(unit_id = %raw_id, "Skipping config for malformed unit identifier");
                continue;
            };
            if !entry.config.is_object() {
                warn!(unit_id = %unit_id, "Skipping config that is not a JSON object");
                continue;
            }

            let cached = self.records.get(&unit_id).map(|r| r.version);
            if cached.is_some_and(|version| entry.version <= version) {
                continue;
            }

            info!(unit_id = %unit_id, from = ?cached, to = entry.version, "New config version");
            let record = ConfigRecord {
                unit_id: unit_id.clone(),
                payload: entry.config,
                version: entry.version,
                changed: true,
                updated_at: now,
            };
            self.records.insert(unit_id, record.clone());
            changed.push(record);
        }

        for record in &changed {
            self.persist(record).await;
        }

        self.last_download = Some(Instant::now());
        changed.len()
    }

    pub fn has_update(&self, id: &FieldUnitId) -> bool {
        self.records.get(id).is_some_and(|r| r.changed)
    }

    /// Configuration to send to `id`, with `version` and `bike_id` included.
    pub fn get_config(&self, id: &FieldUnitId) -> Value {
        match self.records.get(id) {
            Some(record) => {
                let mut payload = record.payload.clone();
                if let Some(object) = payload.as_object_mut() {
                    object.insert("version".into(), Value::from(record.version));
                    object
                        .entry("bike_id")
                        .or_insert_with(|| Value::from(id.as_str()));
                }
                payload
            }
            None => default_config(id),
        }
    }

    /// Clears the pending flag right after a push attempt.
    pub async fn mark_sent(&mut self, id: &FieldUnitId) {
        let Some(record) = self.records.get_mut(id) else {
            return;
        };
        if !record.changed {
            return;
        }
        record.changed = false;
        let record = record.clone();
        self.persist(&record).await;
    }

    pub fn record_confirmation(&self, id: &FieldUnitId, status: &str, version: Option<u32>) {
        let current = self.records.get(id).map_or(0, |r| r.version);
        match version {
            Some(v) if v != current => {
                info!(unit_id = %id, status, confirmed = v, current, "Unit confirmed an older config")
            }
            _ => debug!(unit_id = %id, status, version = current, "Config confirmed"),
        }
    }

    /// True when the downloaded configuration has outlived its validity
    /// window or was never downloaded.
    pub fn needs_refresh(&self, now: Instant) -> bool {
        match self.last_download {
            Some(at) => now.saturating_duration_since(at) > self.validity,
            None => true,
        }
    }

    pub fn get(&self, id: &FieldUnitId) -> Option<&ConfigRecord> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    async fn persist(&self, record: &ConfigRecord) {
        if let Some(store) = &self.store {
            if let Err(e) = store.upsert(record).await {
                warn!(unit_id = %record.unit_id, error = %e, "Failed to persist unit config");
            }
        }
    }
}

/// Configuration for a unit the cloud has not configured yet.
pub fn default_config(id: &FieldUnitId) -> Value {
    json!({
        "version": 0,
        "bike_id": id.as_str(),
        "report_interval_s": DEFAULT_REPORT_INTERVAL_SECS,
        "sleep_interval_s": DEFAULT_SLEEP_INTERVAL_SECS,
        "wireless_window_s": DEFAULT_WIRELESS_WINDOW_SECS,
        "theft_alarm": true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pedal_db::{Database, DbConfig};

    const NOW: Timestamp = 1_700_000_000;

    fn unit(id: &str) -> FieldUnitId {
        FieldUnitId::parse(id).unwrap()
    }

    fn configs(id: &str, version: u32, config: Value) -> HashMap<String, CloudConfigEntry> {
        HashMap::from([(id.to_string(), CloudConfigEntry { version, config })])
    }

    #[tokio::test]
    async fn test_newer_version_flags_update_until_sent() {
        let mut store = ConfigStore::in_memory(Duration::from_secs(3600));
        let aaa = unit("u-AAA");

        assert_eq!(
            store
                .ingest_cloud_configs(configs("u-AAA", 3, json!({"report_interval_s": 60})), NOW)
                .await,
            1
        );
        assert!(store.has_update(&aaa));

        store.mark_sent(&aaa).await;
        assert!(!store.has_update(&aaa));

        // Same version again is stale, not a new update.
        store
            .ingest_cloud_configs(configs("u-AAA", 3, json!({"report_interval_s": 60})), NOW)
            .await;
        assert!(!store.has_update(&aaa));

        store
            .ingest_cloud_configs(configs("u-AAA", 4, json!({"report_interval_s": 30})), NOW)
            .await;
        assert!(store.has_update(&aaa));
        assert_eq!(store.get_config(&aaa)["version"], 4);
        assert_eq!(store.get_config(&aaa)["report_interval_s"], 30);
    }

    #[tokio::test]
    async fn test_lower_version_is_ignored() {
        let mut store = ConfigStore::in_memory(Duration::from_secs(3600));
        store
            .ingest_cloud_configs(configs("u-AAA", 5, json!({"a": 1})), NOW)
            .await;
        assert_eq!(
            store
                .ingest_cloud_configs(configs("u-AAA", 2, json!({"a": 2})), NOW)
                .await,
            0
        );
        assert_eq!(store.get(&unit("u-AAA")).unwrap().version, 5);
    }

    #[tokio::test]
    async fn test_first_config_is_stored_at_version_zero() {
        let mut store = ConfigStore::in_memory(Duration::from_secs(3600));
        let aaa = unit("u-AAA");

        assert_eq!(
            store
                .ingest_cloud_configs(configs("u-AAA", 0, json!({"report_interval_s": 15})), NOW)
                .await,
            1
        );
        assert!(store.has_update(&aaa));
        assert_eq!(store.get_config(&aaa)["report_interval_s"], 15);
        assert_eq!(store.get_config(&aaa)["version"], 0);

        store.mark_sent(&aaa).await;
        store
            .ingest_cloud_configs(configs("u-AAA", 0, json!({"report_interval_s": 15})), NOW)
            .await;
        assert!(!store.has_update(&aaa));
    }

    #[tokio::test]
    async fn test_rejects_malformed_entries() {
        let mut store = ConfigStore::in_memory(Duration::from_secs(3600));
        assert_eq!(
            store
                .ingest_cloud_configs(configs("u-AAA", 1, json!("not an object")), NOW)
                .await,
            0
        );
        assert_eq!(
            store
                .ingest_cloud_configs(configs("AAA", 1, json!({})), NOW)
                .await,
            0
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_default_config_for_unconfigured_unit() {
        let store = ConfigStore::in_memory(Duration::from_secs(3600));
        let config = store.get_config(&unit("u-NEW"));
        assert_eq!(config["version"], 0);
        assert_eq!(config["bike_id"], "u-NEW");
        assert_eq!(config["theft_alarm"], true);
        assert!(!store.has_update(&unit("u-NEW")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_window() {
        let mut store = ConfigStore::in_memory(Duration::from_secs(3600));
        assert!(store.needs_refresh(Instant::now()));

        store.ingest_cloud_configs(HashMap::new(), NOW).await;
        assert!(!store.needs_refresh(Instant::now()));

        tokio::time::advance(Duration::from_secs(3601)).await;
        assert!(store.needs_refresh(Instant::now()));
    }

    #[tokio::test]
    async fn test_pending_push_survives_reload() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut store = ConfigStore::load(db.configs(), Duration::from_secs(3600))
            .await
            .unwrap();
        store
            .ingest_cloud_configs(configs("u-AAA", 7, json!({"theft_alarm": false})), NOW)
            .await;

        let reloaded = ConfigStore::load(db.configs(), Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(reloaded.has_update(&unit("u-AAA")));
        assert!(reloaded.needs_refresh(Instant::now()));
        assert_eq!(reloaded.get_config(&unit("u-AAA"))["theft_alarm"], false);
    }
}
