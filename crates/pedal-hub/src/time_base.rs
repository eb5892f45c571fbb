//! # Time Base
//!
//! Wall-clock estimate shared by everything that timestamps data.
//!
//! ## How `now()` Is Derived
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   boot            sync(epoch=E)                      now()              │
//! │    │                   │                               │                │
//! │    ▼                   ▼                               ▼                │
//! │  ──●───────────────────●───────────────────────────────●──► monotonic   │
//! │                        │◄──────── elapsed ────────────►│                │
//! │                                                                         │
//! │   before sync: now() = seconds since boot (not wall-clock comparable)  │
//! │   after sync:  now() = E + elapsed                                     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Peer Correction
//! Field units without their own clock sync report small numbers (seconds
//! since their boot). Anything below the plausibility floor is replaced
//! with the hub's estimate and flagged; anything above it is kept verbatim.

use tokio::time::{Duration, Instant};
use tracing::info;

use pedal_core::Timestamp;

/// A peer timestamp after correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrectedTimestamp {
    pub value: Timestamp,
    /// True when `value` was substituted by the hub.
    pub corrected: bool,
}

/// Corrected wall-clock estimate.
#[derive(Debug, Clone)]
pub struct TimeBase {
    boot: Instant,
    epoch_at_last_sync: Option<Timestamp>,
    monotonic_at_last_sync: Instant,
    plausibility_floor: Timestamp,
}

impl TimeBase {
    pub fn new(plausibility_floor: Timestamp) -> Self {
        let boot = Instant::now();
        TimeBase {
            boot,
            epoch_at_last_sync: None,
            monotonic_at_last_sync: boot,
            plausibility_floor,
        }
    }

    /// Anchors the estimate to a network-provided epoch.
    pub fn sync(&mut self, remote_epoch: Timestamp) {
        let previous = self.is_synced().then(|| self.now());
        self.epoch_at_last_sync = Some(remote_epoch);
        self.monotonic_at_last_sync = Instant::now();

        match previous {
            Some(estimate) => info!(
                epoch = remote_epoch,
                drift_secs = remote_epoch - estimate,
                "Time base resynchronised"
            ),
            None => info!(epoch = remote_epoch, "Time base synchronised"),
        }
    }

    pub fn is_synced(&self) -> bool {
        self.epoch_at_last_sync.is_some()
    }

    /// Current estimate in epoch seconds, or seconds since boot when
    /// never synced.
    pub fn now(&self) -> Timestamp {
        match self.epoch_at_last_sync {
            Some(epoch) => epoch + secs(self.monotonic_at_last_sync.elapsed()),
            None => secs(self.boot.elapsed()),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.boot.elapsed()
    }

    /// Corrects a peer timestamp. A missing one counts as implausible.
    pub fn correct(&self, peer: Option<Timestamp>) -> CorrectedTimestamp {
        match peer {
            Some(ts) if ts >= self.plausibility_floor => CorrectedTimestamp {
                value: ts,
                corrected: false,
            },
            _ => CorrectedTimestamp {
                value: self.now(),
                corrected: true,
            },
        }
    }
}

fn secs(d: Duration) -> Timestamp {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLOOR: i64 = 1_600_000_000;

    #[tokio::test(start_paused = true)]
    async fn test_unsynced_counts_from_boot() {
        let tb = TimeBase::new(FLOOR);
        assert!(!tb.is_synced());
        assert_eq!(tb.now(), 0);

        tokio::time::advance(Duration::from_secs(42)).await;
        assert_eq!(tb.now(), 42);
        assert_eq!(tb.uptime(), Duration::from_secs(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_synced_extrapolates() {
        let mut tb = TimeBase::new(FLOOR);
        tokio::time::advance(Duration::from_secs(5)).await;

        tb.sync(1_700_000_000);
        assert!(tb.is_synced());
        assert_eq!(tb.now(), 1_700_000_000);

        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(tb.now(), 1_700_000_090);
    }

    #[tokio::test(start_paused = true)]
    async fn test_correct_keeps_plausible_peer_values() {
        let mut tb = TimeBase::new(FLOOR);
        tb.sync(1_700_000_500);

        let kept = tb.correct(Some(1_700_000_000));
        assert_eq!(kept.value, 1_700_000_000);
        assert!(!kept.corrected);

        let fixed = tb.correct(Some(1234));
        assert_eq!(fixed.value, 1_700_000_500);
        assert!(fixed.corrected);

        let missing = tb.correct(None);
        assert!(missing.corrected);
    }
}
