//! Playback of mapped events.
//!
//! This module contains:
//! - The audio engine seam plus log and in-memory engines
//! - Per-layer periodic triggers
//! - The scheduler that owns triggers and the engine lifetime
//! - A cpal output engine (feature `playback`)

#[cfg(feature = "playback")]
pub mod cpal_engine;
pub mod engine;
pub mod scheduler;
pub mod trigger;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

// Re-export commonly used types
pub use engine::{AudioEngine, AudioError, EngineCall, LogEngine, MemoryEngine, SharedEngine};
pub use scheduler::PlaybackScheduler;
pub use trigger::{Step, TerminationPolicy, Trigger, TriggerState, TriggerStatus};

/// Two sine tones a few hertz apart, one per ear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DroneConfig {
    pub enabled: bool,
    /// Left ear frequency in Hz
    pub base_hz: f64,
    /// Right ear is offset by this many Hz
    pub beat_hz: f64,
    pub left_amplitude: f64,
    pub right_amplitude: f64,
}

impl Default for DroneConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_hz: 40.0,
            beat_hz: 8.0,
            left_amplitude: 0.3,
            right_amplitude: 0.4,
        }
    }
}

/// Which engine renders events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Log every event through `tracing`
    #[default]
    Log,
    /// Record calls in memory without output
    Memory,
    /// Default audio output device
    Cpal,
}

impl std::str::FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "log" => Ok(EngineKind::Log),
            "memory" => Ok(EngineKind::Memory),
            "cpal" | "audio" => Ok(EngineKind::Cpal),
            other => Err(format!("unknown engine '{other}' (expected log, memory or cpal)")),
        }
    }
}

/// Playback settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub engine: EngineKind,
    /// End-of-sequence behaviour for every layer
    pub policy: TerminationPolicy,
    /// Speed factor applied to every interval
    pub tempo: f64,
    pub drone: DroneConfig,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::default(),
            policy: TerminationPolicy::default(),
            tempo: 1.0,
            drone: DroneConfig::default(),
        }
    }
}

/// Build the configured engine.
pub fn create_engine(kind: EngineKind) -> Result<SharedEngine, AudioError> {
    match kind {
        EngineKind::Log => Ok(Arc::new(LogEngine::new())),
        EngineKind::Memory => Ok(Arc::new(MemoryEngine::new())),
        #[cfg(feature = "playback")]
        EngineKind::Cpal => Ok(Arc::new(cpal_engine::CpalEngine::new())),
        #[cfg(not(feature = "playback"))]
        EngineKind::Cpal => Err(AudioError::Unavailable("cpal".to_string())),
    }
}
