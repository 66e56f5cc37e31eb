//! Per-session counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters shared by a session's subscriptions and episodes
#[derive(Debug, Default)]
pub struct SessionStats {
    subscriptions_opened: AtomicU64,
    subscriptions_failed: AtomicU64,
    frames_processed: AtomicU64,
    frames_dropped: AtomicU64,
    detections: AtomicU64,
    detections_ignored: AtomicU64,
    episodes_started: AtomicU64,
    episodes_dispatched: AtomicU64,
    episodes_failed: AtomicU64,
}

impl SessionStats {
    pub(crate) fn record_subscription(&self) {
        self.subscriptions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_subscription_failure(&self) {
        self.subscriptions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame(&self) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a dropped frame and return the running total
    pub(crate) fn record_dropped(&self) -> u64 {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn record_detection(&self) {
        self.detections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ignored(&self) {
        self.detections_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_episode_start(&self) {
        self.episodes_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_episode_end(&self, dispatched: bool) {
        if dispatched {
            self.episodes_dispatched.fetch_add(1, Ordering::Relaxed);
        } else {
            self.episodes_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Point-in-time copy of every counter
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            subscriptions_opened: self.subscriptions_opened.load(Ordering::Relaxed),
            subscriptions_failed: self.subscriptions_failed.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            detections: self.detections.load(Ordering::Relaxed),
            detections_ignored: self.detections_ignored.load(Ordering::Relaxed),
            episodes_started: self.episodes_started.load(Ordering::Relaxed),
            episodes_dispatched: self.episodes_dispatched.load(Ordering::Relaxed),
            episodes_failed: self.episodes_failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`SessionStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Keyword subscriptions opened
    pub subscriptions_opened: u64,
    /// Subscriptions that could not be opened
    pub subscriptions_failed: u64,
    /// Frames handed to a keyword engine
    pub frames_processed: u64,
    /// Frames dropped for having the wrong length
    pub frames_dropped: u64,
    /// Keyword matches reported by engines
    pub detections: u64,
    /// Matches ignored (refractory window or episode in flight)
    pub detections_ignored: u64,
    /// Wake-word episodes started
    pub episodes_started: u64,
    /// Episodes that reached a handler reply
    pub episodes_dispatched: u64,
    /// Episodes that ended in a failure
    pub episodes_failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = SessionStats::default();
        stats.record_frame();
        stats.record_frame();
        assert_eq!(stats.record_dropped(), 1);
        assert_eq!(stats.record_dropped(), 2);
        stats.record_episode_end(true);
        stats.record_episode_end(false);

        let snap = stats.snapshot();
        assert_eq!(snap.frames_processed, 2);
        assert_eq!(snap.frames_dropped, 2);
        assert_eq!(snap.episodes_dispatched, 1);
        assert_eq!(snap.episodes_failed, 1);
    }
}
