//! # Offline Buffer
//!
//! Bounded store-and-forward queue for everything the hub uploads.
//!
//! ## Upload Discipline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   enqueue ──► [ #1 #2 #3 #4 ]                                           │
//! │                                                                         │
//! │   drain_for_upload() ──► batch {#1 #2 #3 #4}   (snapshot, no mutation) │
//! │                                                                         │
//! │   enqueue ──► [ #1 #2 #3 #4 #5 ]               (arrives mid-upload)    │
//! │                                                                         │
//! │   PATCH /buffer  ──2xx──► confirm(batch)  ──► [ #5 ]                    │
//! │                  └─err──► rollback(batch) ──► [ #1 #2 #3 #4 #5 ]        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing leaves the buffer except through [`OfflineBuffer::confirm`].
//! At capacity the buffer fails closed: new entries are refused and the
//! caller is expected to force a sync.
//!
//! ## Persistence
//! A snapshot is written every `persist_every` inserts, after each confirm
//! and on shutdown, then reloaded at boot. Storage failures are logged and
//! the in-memory queue stays authoritative.

use std::collections::{HashSet, VecDeque};

use serde::Serialize;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use pedal_core::{BufferEntry, EntryKind, FieldUnitId, Timestamp};
use pedal_db::BufferRepository;

use crate::config::BufferSettings;
use crate::error::{HubError, HubResult};

// =============================================================================
// Upload Batch
// =============================================================================

/// Immutable snapshot handed to the cloud uploader.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadBatch {
    entries: Vec<BufferEntry>,
}

impl UploadBatch {
    pub fn entries(&self) -> &[BufferEntry] {
        &self.entries
    }

    pub fn seqs(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().map(|e| e.seq)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Offline Buffer
// =============================================================================

#[derive(Debug)]
pub struct OfflineBuffer {
    entries: VecDeque<BufferEntry>,
    capacity: usize,
    threshold_pct: u8,
    sync_interval: Duration,
    max_payload: usize,
    persist_every: u32,
    inserts_since_persist: u32,
    next_seq: u64,
    last_sync: Instant,
    store: Option<BufferRepository>,
}

impl OfflineBuffer {
    /// Empty buffer without durable storage.
    pub fn new(settings: &BufferSettings) -> Self {
        OfflineBuffer {
            entries: VecDeque::with_capacity(settings.capacity),
            capacity: settings.capacity,
            threshold_pct: settings.sync_threshold_pct,
            sync_interval: Duration::from_secs(settings.sync_interval_secs),
            max_payload: settings.max_payload_bytes,
            persist_every: settings.persist_every.max(1),
            inserts_since_persist: 0,
            next_seq: 1,
            last_sync: Instant::now(),
            store: None,
        }
    }

    /// Restores the snapshot written by a previous run.
    pub async fn load(settings: &BufferSettings, store: BufferRepository) -> HubResult<Self> {
        let stored = store.load_all().await?;
        let mut buffer = OfflineBuffer::new(settings);

        buffer.next_seq = stored.iter().map(|e| e.seq).max().map_or(1, |max| max + 1);

        let overflow = stored.len().saturating_sub(buffer.capacity);
        if overflow > 0 {
            warn!(
                stored = stored.len(),
                capacity = buffer.capacity,
                "Stored buffer exceeds capacity, keeping the oldest entries"
            );
        }
        buffer.entries = stored.into_iter().take(buffer.capacity).collect();
        buffer.store = Some(store);

        info!(entries = buffer.entries.len(), next_seq = buffer.next_seq, "Offline buffer loaded");
        Ok(buffer)
    }

    // =========================================================================
    // Insertion
    // =========================================================================

    /// Appends an entry. Returns false when the buffer refused it.
    pub async fn enqueue(
        &mut self,
        kind: EntryKind,
        origin: &str,
        payload: String,
        created_at: Timestamp,
    ) -> bool {
        match self.try_enqueue(kind, origin, payload, created_at).await {
            Ok(seq) => {
                debug!(seq, kind = %kind, origin, "Buffered entry");
                true
            }
            Err(e) => {
                warn!(kind = %kind, origin, error = %e, "Buffer refused entry");
                false
            }
        }
    }

    /// Appends an entry and returns its sequence number.
    ///
    /// ## Errors
    /// - [`HubError::PayloadTooLarge`] above the per-entry bound
    /// - [`HubError::BufferFull`] at capacity
    pub async fn try_enqueue(
        &mut self,
        kind: EntryKind,
        origin: &str,
        payload: String,
        created_at: Timestamp,
    ) -> HubResult<u64> {
        if payload.len() > self.max_payload {
            return Err(HubError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload,
            });
        }
        if self.entries.len() >= self.capacity {
            return Err(HubError::BufferFull {
                capacity: self.capacity,
            });
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(BufferEntry {
            seq,
            kind,
            created_at,
            origin_id: origin.to_string(),
            payload,
            uploaded: false,
        });

        self.inserts_since_persist += 1;
        if self.inserts_since_persist >= self.persist_every {
            self.persist().await;
        }

        Ok(seq)
    }

    // =========================================================================
    // Sync Signals
    // =========================================================================

    /// Occupancy at or above the threshold, or the periodic interval has
    /// elapsed since the last successful upload.
    pub fn needs_sync(&self, now: Instant) -> bool {
        let over_threshold =
            self.entries.len() * 100 >= self.capacity * usize::from(self.threshold_pct);
        over_threshold || now.saturating_duration_since(self.last_sync) > self.sync_interval
    }

    pub fn is_critically_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Fraction of capacity in use, 0.0 to 1.0.
    pub fn occupancy(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.entries.len() as f64 / self.capacity as f64
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_slots(&self) -> usize {
        self.capacity.saturating_sub(self.entries.len())
    }

    // =========================================================================
    // Upload Discipline
    // =========================================================================

    pub fn drain_for_upload(&self) -> UploadBatch {
        UploadBatch {
            entries: self.entries.iter().cloned().collect(),
        }
    }

    /// Removes exactly the batch's entries after the cloud accepted them.
    pub async fn confirm(&mut self, batch: &UploadBatch) {
        let seqs: HashSet<u64> = batch.seqs().collect();
        let before = self.entries.len();
        self.entries.retain(|e| !seqs.contains(&e.seq));
        self.last_sync = Instant::now();

        info!(
            removed = before - self.entries.len(),
            remaining = self.entries.len(),
            "Buffer batch confirmed"
        );
        self.persist().await;
    }

    /// Leaves everything queued for the next attempt.
    pub fn rollback(&self, batch: &UploadBatch) {
        debug!(entries = batch.len(), "Buffer batch rolled back");
    }

    /// Writes the current snapshot. Returns false on storage failure.
    pub async fn persist(&mut self) -> bool {
        self.inserts_since_persist = 0;
        let Some(store) = &self.store else {
            return true;
        };
        match store.save_snapshot(self.entries.iter()).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Failed to persist offline buffer");
                false
            }
        }
    }
}

// =============================================================================
// Event History
// =============================================================================

/// What happened in a [`HistoryEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HistoryKind {
    Connected,
    Disconnected,
    Rejected,
    Battery { pct: u8 },
    PendingVisit,
    ConfigPushed { version: u32 },
    Alert { kind: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEvent {
    pub at: Timestamp,
    pub unit: Option<FieldUnitId>,
    #[serde(flatten)]
    pub kind: HistoryKind,
}

/// Small rolling log of session events, oldest evicted first. Advisory and
/// never persisted.
#[derive(Debug, Clone)]
pub struct EventHistory {
    events: VecDeque<HistoryEvent>,
    capacity: usize,
}

impl EventHistory {
    pub fn new(capacity: usize) -> Self {
        EventHistory {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, at: Timestamp, unit: Option<&FieldUnitId>, kind: HistoryKind) {
        if self.capacity == 0 {
            return;
        }
        while self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(HistoryEvent {
            at,
            unit: unit.cloned(),
            kind,
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pedal_db::{Database, DbConfig};

    fn settings(capacity: usize) -> BufferSettings {
        BufferSettings {
            capacity,
            persist_every: 1000,
            ..BufferSettings::default()
        }
    }

    async fn fill(buffer: &mut OfflineBuffer, n: usize) {
        for i in 0..n {
            assert!(
                buffer
                    .enqueue(EntryKind::Telemetry, "u-AAA", format!("{{\"i\":{}}}", i), 0)
                    .await
            );
        }
    }

    #[tokio::test]
    async fn test_fails_closed_at_capacity() {
        let mut buffer = OfflineBuffer::new(&settings(3));
        fill(&mut buffer, 3).await;

        assert!(buffer.is_critically_full());
        assert!(!buffer.enqueue(EntryKind::Log, "hub", "{}".into(), 0).await);
        assert!(matches!(
            buffer.try_enqueue(EntryKind::Log, "hub", "{}".into(), 0).await,
            Err(HubError::BufferFull { capacity: 3 })
        ));
        assert_eq!(buffer.len(), 3);
    }

    #[tokio::test]
    async fn test_rejects_oversized_payload() {
        let mut buffer = OfflineBuffer::new(&BufferSettings {
            max_payload_bytes: 8,
            ..settings(10)
        });
        assert!(matches!(
            buffer
                .try_enqueue(EntryKind::Telemetry, "u-AAA", "x".repeat(9), 0)
                .await,
            Err(HubError::PayloadTooLarge { size: 9, max: 8 })
        ));
        assert!(buffer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_triggers_sync_before_interval() {
        let mut buffer = OfflineBuffer::new(&BufferSettings {
            sync_interval_secs: 1800,
            ..settings(10)
        });

        // 20 minutes in, 10 remaining on the periodic timer.
        tokio::time::advance(Duration::from_secs(1200)).await;
        fill(&mut buffer, 7).await;
        assert!(!buffer.needs_sync(Instant::now()));

        fill(&mut buffer, 1).await;
        assert!(buffer.needs_sync(Instant::now()));
        assert!((buffer.occupancy() - 0.8).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_triggers_sync() {
        let buffer = OfflineBuffer::new(&BufferSettings {
            sync_interval_secs: 60,
            ..settings(10)
        });
        assert!(!buffer.needs_sync(Instant::now()));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(buffer.needs_sync(Instant::now()));
    }

    #[tokio::test]
    async fn test_confirm_removes_only_the_batch() {
        let mut buffer = OfflineBuffer::new(&settings(10));
        fill(&mut buffer, 3).await;

        let batch = buffer.drain_for_upload();
        assert_eq!(batch.len(), 3);
        assert_eq!(buffer.len(), 3);

        buffer
            .enqueue(EntryKind::Alert, "u-BBB", "{}".into(), 0)
            .await;
        buffer.confirm(&batch).await;

        assert_eq!(buffer.len(), 1);
        let left = buffer.drain_for_upload();
        assert_eq!(left.entries()[0].kind, EntryKind::Alert);
        assert_eq!(left.entries()[0].seq, 4);
    }

    #[tokio::test]
    async fn test_rollback_keeps_everything() {
        let mut buffer = OfflineBuffer::new(&settings(10));
        fill(&mut buffer, 2).await;
        let batch = buffer.drain_for_upload();
        buffer.rollback(&batch);
        assert_eq!(buffer.drain_for_upload(), batch);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_keeps_sequence() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut buffer = OfflineBuffer::load(&settings(10), db.buffer()).await.unwrap();
        fill(&mut buffer, 3).await;
        let batch = UploadBatch {
            entries: buffer.drain_for_upload().entries()[..1].to_vec(),
        };
        buffer.confirm(&batch).await;

        let mut reloaded = OfflineBuffer::load(&settings(10), db.buffer()).await.unwrap();
        assert_eq!(reloaded.len(), 2);
        let seq = reloaded
            .try_enqueue(EntryKind::Log, "hub", "{}".into(), 0)
            .await
            .unwrap();
        assert_eq!(seq, 4);
    }

    #[tokio::test]
    async fn test_periodic_persist() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut buffer = OfflineBuffer::load(
            &BufferSettings {
                persist_every: 2,
                ..settings(10)
            },
            db.buffer(),
        )
        .await
        .unwrap();

        fill(&mut buffer, 1).await;
        assert_eq!(db.buffer().count().await.unwrap(), 0);
        fill(&mut buffer, 1).await;
        assert_eq!(db.buffer().count().await.unwrap(), 2);
    }

    #[test]
    fn test_history_evicts_oldest_first() {
        let mut history = EventHistory::new(2);
        let unit = FieldUnitId::parse("u-AAA").unwrap();

        history.record(1, Some(&unit), HistoryKind::Connected);
        history.record(2, Some(&unit), HistoryKind::Battery { pct: 80 });
        history.record(3, None, HistoryKind::Rejected);

        let at: Vec<Timestamp> = history.iter().map(|e| e.at).collect();
        assert_eq!(at, vec![2, 3]);
    }
}
