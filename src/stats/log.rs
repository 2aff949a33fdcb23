//! Atomic session counters with JSON persistence.

use crate::pipeline::queue::ShutdownReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Statistics for the current session.
#[derive(Debug)]
pub struct SessionStats {
    /// ECG frames dequeued
    ecg_frames: AtomicU64,
    /// Heart-rate frames dequeued
    hr_frames: AtomicU64,
    /// Window pairs whose analysis was applied
    windows_analysed: AtomicU64,
    /// Analysed windows without a single R peak
    empty_windows: AtomicU64,
    /// QRS complexes measured
    qrs_complexes: AtomicU64,
    /// Playback events handed to the scheduler
    events_scheduled: AtomicU64,
    /// Analysis results superseded by a newer window
    stale_results: AtomicU64,
    /// Background analysis tasks that panicked
    failed_tasks: AtomicU64,
    session_start: DateTime<Utc>,
    persist_path: Option<PathBuf>,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            ecg_frames: AtomicU64::new(0),
            hr_frames: AtomicU64::new(0),
            windows_analysed: AtomicU64::new(0),
            empty_windows: AtomicU64::new(0),
            qrs_complexes: AtomicU64::new(0),
            events_scheduled: AtomicU64::new(0),
            stale_results: AtomicU64::new(0),
            failed_tasks: AtomicU64::new(0),
            session_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create stats that [`save`](SessionStats::save) writes to `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut stats = Self::new();
        stats.persist_path = Some(path);
        stats
    }

    pub fn record_ecg_frame(&self) {
        self.ecg_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hr_frame(&self) {
        self.hr_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an applied window analysis.
    pub fn record_window(&self, qrs_complexes: u64, empty: bool) {
        self.windows_analysed.fetch_add(1, Ordering::Relaxed);
        self.qrs_complexes.fetch_add(qrs_complexes, Ordering::Relaxed);
        if empty {
            self.empty_windows.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_events_scheduled(&self, count: u64) {
        self.events_scheduled.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_stale_result(&self) {
        self.stale_results.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_task(&self) {
        self.failed_tasks.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current statistics.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ecg_frames: self.ecg_frames.load(Ordering::Relaxed),
            hr_frames: self.hr_frames.load(Ordering::Relaxed),
            windows_analysed: self.windows_analysed.load(Ordering::Relaxed),
            empty_windows: self.empty_windows.load(Ordering::Relaxed),
            qrs_complexes: self.qrs_complexes.load(Ordering::Relaxed),
            events_scheduled: self.events_scheduled.load(Ordering::Relaxed),
            stale_results: self.stale_results.load(Ordering::Relaxed),
            failed_tasks: self.failed_tasks.load(Ordering::Relaxed),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        self.snapshot().summary()
    }

    /// Persist the current counters, tagged with the session and how it
    /// ended. Does nothing without a persistence path.
    pub fn save(&self, session_id: &str, reason: Option<ShutdownReason>) -> std::io::Result<()> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let persisted = PersistedStats {
            session_id: session_id.to_string(),
            ended_by: reason,
            stats: self.snapshot(),
            last_updated: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub ecg_frames: u64,
    pub hr_frames: u64,
    pub windows_analysed: u64,
    pub empty_windows: u64,
    pub qrs_complexes: u64,
    pub events_scheduled: u64,
    pub stale_results: u64,
    pub failed_tasks: u64,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

impl StatsSnapshot {
    pub fn summary(&self) -> String {
        format!(
            "Session Statistics:\n\
             - ECG frames received: {}\n\
             - HR frames received: {}\n\
             - Windows analysed: {} ({} without a heartbeat)\n\
             - QRS complexes measured: {}\n\
             - Playback events scheduled: {}\n\
             - Stale results discarded: {}\n\
             - Failed analysis tasks: {}\n\
             - Session duration: {} seconds",
            self.ecg_frames,
            self.hr_frames,
            self.windows_analysed,
            self.empty_windows,
            self.qrs_complexes,
            self.events_scheduled,
            self.stale_results,
            self.failed_tasks,
            self.session_duration_secs
        )
    }
}

/// Stats format for persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedStats {
    pub session_id: String,
    pub ended_by: Option<ShutdownReason>,
    pub stats: StatsSnapshot,
    pub last_updated: DateTime<Utc>,
}

impl PersistedStats {
    /// Load the stats of the last saved session, if any.
    pub fn load(path: &Path) -> std::io::Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(std::io::Error::other)
    }
}

/// Thread-safe shared session stats.
pub type SharedSessionStats = Arc<SessionStats>;

pub fn create_shared_stats() -> SharedSessionStats {
    Arc::new(SessionStats::new())
}

pub fn create_shared_stats_with_persistence(path: PathBuf) -> SharedSessionStats {
    Arc::new(SessionStats::with_persistence(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_session_stats_counting() {
        let stats = SessionStats::new();

        stats.record_ecg_frame();
        stats.record_ecg_frame();
        stats.record_hr_frame();
        stats.record_window(3, false);
        stats.record_window(0, true);
        stats.record_events_scheduled(5);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.ecg_frames, 2);
        assert_eq!(snapshot.hr_frames, 1);
        assert_eq!(snapshot.windows_analysed, 2);
        assert_eq!(snapshot.empty_windows, 1);
        assert_eq!(snapshot.qrs_complexes, 3);
        assert_eq!(snapshot.events_scheduled, 5);
    }

    #[test]
    fn test_summary_mentions_counters() {
        let stats = SessionStats::new();
        stats.record_failed_task();
        let summary = stats.summary();
        assert!(summary.contains("Session Statistics"));
        assert!(summary.contains("Failed analysis tasks: 1"));
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stats").join("last_session.json");

        let stats = SessionStats::with_persistence(path.clone());
        stats.record_window(2, false);
        stats
            .save("abc", Some(ShutdownReason::SensorDisconnected))
            .unwrap();

        let loaded = PersistedStats::load(&path).unwrap().unwrap();
        assert_eq!(loaded.session_id, "abc");
        assert_eq!(loaded.ended_by, Some(ShutdownReason::SensorDisconnected));
        assert_eq!(loaded.stats.qrs_complexes, 2);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(PersistedStats::load(&dir.path().join("none.json"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_save_without_path_is_noop() {
        assert!(SessionStats::new().save("x", None).is_ok());
    }
}
