//! Session statistics.
//!
//! Counters describing what a session processed, shown on shutdown and by
//! the `status` command.

pub mod log;

// Re-export commonly used types
pub use log::{
    create_shared_stats, create_shared_stats_with_persistence, PersistedStats, SessionStats,
    SharedSessionStats, StatsSnapshot,
};
