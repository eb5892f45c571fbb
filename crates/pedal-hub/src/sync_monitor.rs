//! # Sync Monitor
//!
//! Tracks consecutive wide-area failures and decides when the hub gives up
//! and falls back to configuration mode.
//!
//! Fallback happens when either `count >= max_failures` or the first
//! failure of the current streak is older than the timeout. One success
//! clears the streak.

use serde::Serialize;
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

/// Why a sync cycle was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// Occupancy threshold or periodic interval reached.
    BufferThreshold,
    /// No free buffer slot left, or an insert was refused for lack of room.
    BufferFull,
    /// Cached cloud configuration outlived its validity window.
    ConfigExpired,
    /// A unit raised an alert.
    Critical,
    /// Requested through the hub handle.
    Forced,
}

impl std::fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncTrigger::BufferThreshold => "buffer_threshold",
            SyncTrigger::BufferFull => "buffer_full",
            SyncTrigger::ConfigExpired => "config_expired",
            SyncTrigger::Critical => "critical",
            SyncTrigger::Forced => "forced",
        };
        f.write_str(name)
    }
}

/// Current failure streak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncFailureWindow {
    pub count: u32,
    pub first_failure_at: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct SyncMonitor {
    window: SyncFailureWindow,
    max_failures: u32,
    timeout: Duration,
}

impl SyncMonitor {
    pub fn new(max_failures: u32, timeout: Duration) -> Self {
        SyncMonitor {
            window: SyncFailureWindow::default(),
            max_failures,
            timeout,
        }
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.window.count = self.window.count.saturating_add(1);
        if self.window.first_failure_at.is_none() {
            self.window.first_failure_at = Some(now);
        }
        warn!(
            failures = self.window.count,
            max_failures = self.max_failures,
            "Sync cycle failed"
        );
    }

    pub fn record_success(&mut self) {
        if self.window.count > 0 {
            info!(previous_failures = self.window.count, "Sync recovered");
        }
        self.window = SyncFailureWindow::default();
    }

    /// Forgets the streak without counting it as a recovery.
    pub fn reset(&mut self) {
        self.window = SyncFailureWindow::default();
    }

    pub fn should_fallback(&self, now: Instant) -> bool {
        if self.window.count >= self.max_failures {
            return true;
        }
        match self.window.first_failure_at {
            Some(first) => now.saturating_duration_since(first) > self.timeout,
            None => false,
        }
    }

    pub fn window(&self) -> SyncFailureWindow {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fallback_on_failure_count() {
        let mut monitor = SyncMonitor::new(5, Duration::from_secs(3600));
        let now = Instant::now();

        for _ in 0..4 {
            monitor.record_failure(now);
            assert!(!monitor.should_fallback(now));
        }
        monitor.record_failure(now);
        assert!(monitor.should_fallback(now));
        assert_eq!(monitor.window().count, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_on_elapsed_window() {
        let mut monitor = SyncMonitor::new(5, Duration::from_secs(60));
        let start = Instant::now();
        monitor.record_failure(start);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!monitor.should_fallback(Instant::now()));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(monitor.should_fallback(Instant::now()));

        // The window is anchored on the first failure only.
        monitor.record_failure(Instant::now());
        assert_eq!(monitor.window().first_failure_at, Some(start));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_window() {
        let mut monitor = SyncMonitor::new(2, Duration::from_secs(60));
        let now = Instant::now();
        monitor.record_failure(now);
        monitor.record_failure(now);
        assert!(monitor.should_fallback(now));

        monitor.record_success();
        assert_eq!(monitor.window(), SyncFailureWindow::default());
        assert!(!monitor.should_fallback(now + Duration::from_secs(3600)));
    }
}
