//! # Unit Registry
//!
//! Admission records for every field unit the hub has ever seen.
//!
//! ## Admission
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   can_connect("u-XYZ")                                                  │
//! │        │                                                                │
//! │        ├── malformed id ─────────────────────────────► false            │
//! │        ├── unknown id ──► create Pending (visits = 1) ► true            │
//! │        ├── Blocked ──────────────────────────────────► false            │
//! │        └── Pending / Allowed ────────────────────────► true             │
//! │                                                                         │
//! │   is_allowed("u-XYZ")  ⇔  record exists && status == Allowed           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Status only changes through [`Registry::merge_from_cloud`]; the hub never
//! promotes or blocks a unit on its own.
//!
//! ## Dirty Records
//! Records touched locally (first contact, pending visits, heartbeats) are
//! remembered until a partial `PUT /registry` succeeds, so admins see new
//! units and fresh battery levels without a full upload.
//!
//! ## Persistence
//! Every mutation is mirrored through [`RegistryRepository`]. A storage
//! failure is logged and the in-memory map stays authoritative.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use pedal_core::{FieldUnitId, Heartbeat, Timestamp, UnitRecord, UnitStatus};
use pedal_db::RegistryRepository;

use crate::cloud::CloudUnitEntry;
use crate::error::HubResult;

#[derive(Debug, Default)]
pub struct Registry {
    units: HashMap<FieldUnitId, UnitRecord>,
    dirty: HashSet<FieldUnitId>,
    store: Option<RegistryRepository>,
}

impl Registry {
    /// Registry without durable storage.
    pub fn in_memory() -> Self {
        Registry::default()
    }

    /// Empty registry mirrored to `store`.
    pub fn new(store: RegistryRepository) -> Self {
        Registry {
            store: Some(store),
            ..Registry::default()
        }
    }

    /// Restores the registry persisted by a previous run.
    pub async fn load(store: RegistryRepository) -> HubResult<Self> {
        let records = store.load_all().await?;
        info!(units = records.len(), "Registry loaded");

        let units = records
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();

        Ok(Registry {
            units,
            dirty: HashSet::new(),
            store: Some(store),
        })
    }

    // =========================================================================
    // Admission
    // =========================================================================

    /// Admission check run when a session is attributed.
    ///
    /// Unknown but well-formed identities are registered as `Pending`.
    pub async fn can_connect(&mut self, id: &str, now: Timestamp) -> bool {
        let unit_id = match FieldUnitId::parse(id) {
            Ok(unit_id) => unit_id,
            Err(e) => {
                warn!(unit_id = %id, error = %e, "Rejecting malformed unit identifier");
                return false;
            }
        };

        if let Some(record) = self.units.get(&unit_id) {
            return record.can_connect();
        }

        info!(unit_id = %unit_id, "First contact, registering as pending");
        let record = UnitRecord::first_contact(unit_id.clone(), now);
        self.persist(&record).await;
        self.dirty.insert(unit_id.clone());
        self.units.insert(unit_id, record);
        true
    }

    pub fn is_allowed(&self, id: &str) -> bool {
        self.units.get(id).is_some_and(UnitRecord::is_allowed)
    }

    /// Counts another visit from a unit still awaiting approval.
    pub async fn record_pending_visit(&mut self, id: &str, now: Timestamp) {
        let Some(record) = self.units.get_mut(id) else {
            return;
        };
        if record.status != UnitStatus::Pending {
            return;
        }

        record.visit_count = record.visit_count.saturating_add(1);
        record.last_visit = now;
        debug!(unit_id = %id, visits = record.visit_count, "Pending unit visit");

        let record = record.clone();
        self.persist(&record).await;
        self.dirty.insert(record.id);
    }

    /// Stores the latest battery and memory report. Unknown units are ignored.
    pub async fn update_heartbeat(
        &mut self,
        id: &str,
        battery_pct: u8,
        free_memory: u32,
        now: Timestamp,
    ) {
        let Some(record) = self.units.get_mut(id) else {
            debug!(unit_id = %id, "Heartbeat for unknown unit ignored");
            return;
        };

        record.last_heartbeat = Some(Heartbeat {
            timestamp: now,
            battery_pct,
            free_memory,
        });

        let record = record.clone();
        self.persist(&record).await;
        self.dirty.insert(record.id);
    }

    // =========================================================================
    // Cloud Merge
    // =========================================================================

    /// Replaces the local map with the cloud's view.
    ///
    /// The cloud decides `status`. Visit statistics and heartbeats it omits
    /// are carried over from the local record. Dirty local records the
    /// cloud does not know yet are kept so they can still be uploaded.
    /// Returns the number of records after the merge.
    pub async fn merge_from_cloud(
        &mut self,
        cloud: HashMap<String, CloudUnitEntry>,
        now: Timestamp,
    ) -> usize {
        let mut merged: HashMap<FieldUnitId, UnitRecord> = HashMap::with_capacity(cloud.len());

        for (raw_id, entry) in cloud {
            let unit_id = match FieldUnitId::parse(&raw_id) {
                Ok(unit_id) => unit_id,
                Err(e) => {
                    warn!(unit_id = %raw_id, error = %e, "Skipping malformed cloud registry entry");
                    continue;
                }
            };

            let local = self.units.get(&unit_id);
            let record = UnitRecord {
                status: entry.status,
                first_seen: entry
                    .first_seen
                    .or(local.map(|r| r.first_seen))
                    .unwrap_or(now),
                last_visit: entry
                    .last_visit
                    .or(local.map(|r| r.last_visit))
                    .unwrap_or(now),
                visit_count: entry
                    .visit_count
                    .or(local.map(|r| r.visit_count))
                    .unwrap_or(0),
                last_heartbeat: entry
                    .last_heartbeat
                    .or(local.and_then(|r| r.last_heartbeat)),
                id: unit_id.clone(),
            };

            if local.map(|r| r.status) != Some(record.status) {
                info!(unit_id = %unit_id, status = %record.status, "Unit status set by cloud");
            }
            merged.insert(unit_id, record);
        }

        for id in &self.dirty {
            if !merged.contains_key(id) {
                if let Some(record) = self.units.get(id) {
                    merged.insert(id.clone(), record.clone());
                }
            }
        }

        let removed = self.units.keys().filter(|id| !merged.contains_key(*id)).count();
        self.units = merged;

        if let Some(store) = &self.store {
            let records: Vec<UnitRecord> = self.units.values().cloned().collect();
            if let Err(e) = store.replace_all(&records).await {
                warn!(error = %e, "Failed to persist merged registry");
            }
        }

        info!(units = self.units.len(), removed, "Registry merged from cloud");
        self.units.len()
    }

    // =========================================================================
    // Partial Upload
    // =========================================================================

    /// Records touched locally since the last successful upload.
    pub fn dirty_records(&self) -> Vec<UnitRecord> {
        let mut records: Vec<UnitRecord> = self
            .dirty
            .iter()
            .filter_map(|id| self.units.get(id).cloned())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Clears the given identities after the cloud accepted them.
    pub fn clear_dirty<'a, I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = &'a FieldUnitId>,
    {
        for id in ids {
            self.dirty.remove(id);
        }
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    pub fn get(&self, id: &str) -> Option<&UnitRecord> {
        self.units.get(id)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &UnitRecord> {
        self.units.values()
    }

    async fn persist(&self, record: &UnitRecord) {
        if let Some(store) = &self.store {
            if let Err(e) = store.upsert(record).await {
                warn!(unit_id = %record.id, error = %e, "Failed to persist unit record");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pedal_db::{Database, DbConfig};

    const NOW: Timestamp = 1_700_000_000;

    fn entry(status: UnitStatus) -> CloudUnitEntry {
        CloudUnitEntry {
            status,
            first_seen: None,
            last_visit: None,
            visit_count: None,
            last_heartbeat: None,
        }
    }

    #[tokio::test]
    async fn test_first_contact_creates_pending() {
        let mut registry = Registry::in_memory();

        assert!(!registry.is_allowed("u-000001"));
        assert!(registry.can_connect("u-000001", NOW).await);

        let record = registry.get("u-000001").unwrap();
        assert_eq!(record.status, UnitStatus::Pending);
        assert_eq!(record.visit_count, 1);
        assert_eq!(record.first_seen, NOW);
        assert!(!registry.is_allowed("u-000001"));
    }

    #[tokio::test]
    async fn test_malformed_ids_are_rejected() {
        let mut registry = Registry::in_memory();
        assert!(!registry.can_connect("", NOW).await);
        assert!(!registry.can_connect("bike-1", NOW).await);
        assert!(!registry.can_connect("u-has space", NOW).await);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_only_blocked_units_are_refused() {
        let mut registry = Registry::in_memory();
        let cloud = HashMap::from([
            ("u-AAA".to_string(), entry(UnitStatus::Allowed)),
            ("u-BBB".to_string(), entry(UnitStatus::Blocked)),
            ("u-CCC".to_string(), entry(UnitStatus::Pending)),
        ]);
        registry.merge_from_cloud(cloud, NOW).await;

        assert!(registry.can_connect("u-AAA", NOW).await);
        assert!(!registry.can_connect("u-BBB", NOW).await);
        assert!(registry.can_connect("u-CCC", NOW).await);
        assert!(registry.is_allowed("u-AAA"));
        assert!(!registry.is_allowed("u-CCC"));
    }

    #[tokio::test]
    async fn test_pending_visit_only_counts_pending_units() {
        let mut registry = Registry::in_memory();
        registry.can_connect("u-000001", NOW).await;
        registry.record_pending_visit("u-000001", NOW + 10).await;

        let record = registry.get("u-000001").unwrap();
        assert_eq!(record.visit_count, 2);
        assert_eq!(record.last_visit, NOW + 10);

        registry
            .merge_from_cloud(
                HashMap::from([("u-000001".to_string(), entry(UnitStatus::Allowed))]),
                NOW,
            )
            .await;
        registry.record_pending_visit("u-000001", NOW + 20).await;
        assert_eq!(registry.get("u-000001").unwrap().visit_count, 2);

        registry.record_pending_visit("u-UNKNOWN", NOW).await;
        assert!(registry.get("u-UNKNOWN").is_none());
    }

    #[tokio::test]
    async fn test_merge_carries_local_heartbeat_and_keeps_dirty_units() {
        let mut registry = Registry::in_memory();
        registry.can_connect("u-AAA", NOW).await;
        registry.update_heartbeat("u-AAA", 87, 40_000, NOW + 5).await;
        registry.can_connect("u-NEW", NOW).await;
        registry.clear_dirty(&[FieldUnitId::parse("u-NEW").unwrap()]);
        registry.can_connect("u-LOCAL", NOW).await;

        let cloud = HashMap::from([
            ("u-AAA".to_string(), entry(UnitStatus::Allowed)),
            ("not-an-id".to_string(), entry(UnitStatus::Allowed)),
        ]);
        let count = registry.merge_from_cloud(cloud, NOW + 100).await;

        // u-NEW was already uploaded and the cloud dropped it.
        assert_eq!(count, 2);
        assert!(registry.get("u-NEW").is_none());
        assert!(registry.get("u-LOCAL").is_some());

        let aaa = registry.get("u-AAA").unwrap();
        assert_eq!(aaa.status, UnitStatus::Allowed);
        assert_eq!(aaa.last_heartbeat.unwrap().battery_pct, 87);
        assert_eq!(aaa.visit_count, 1);
    }

    #[tokio::test]
    async fn test_dirty_records_track_heartbeats_until_cleared() {
        let mut registry = Registry::in_memory();
        registry.can_connect("u-AAA", NOW).await;
        registry.can_connect("u-BBB", NOW).await;

        let ids: Vec<FieldUnitId> = registry.dirty_records().into_iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), 2);
        registry.clear_dirty(&ids);
        assert!(registry.dirty_records().is_empty());

        registry.update_heartbeat("u-BBB", 50, 1_000, NOW).await;
        registry.update_heartbeat("u-ZZZ", 50, 1_000, NOW).await;
        let dirty = registry.dirty_records();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].id.as_str(), "u-BBB");
    }

    #[tokio::test]
    async fn test_registry_survives_reload() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();

        let mut registry = Registry::new(db.registry());
        registry.can_connect("u-AAA", NOW).await;
        registry.update_heartbeat("u-AAA", 42, 9_000, NOW + 1).await;
        registry
            .merge_from_cloud(
                HashMap::from([("u-BBB".to_string(), entry(UnitStatus::Blocked))]),
                NOW,
            )
            .await;

        let reloaded = Registry::load(db.registry()).await.unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(
            reloaded.get("u-AAA").unwrap().last_heartbeat.unwrap().battery_pct,
            42
        );
        assert_eq!(reloaded.get("u-BBB").unwrap().status, UnitStatus::Blocked);
        assert!(reloaded.dirty_records().is_empty());
    }
}
