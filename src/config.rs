//! Configuration for the sonification pipeline.

use crate::core::features::{
    AnalysisConfig, PeakConfig, RrSource, DEFAULT_R_THRESHOLD_UV, DEFAULT_SAMPLING_RATE_HZ,
    DEFAULT_SEARCH_WINDOW,
};
use crate::core::mapping::MappingConfig;
use crate::core::windowing::DEFAULT_BATCH_SIZE;
use crate::playback::PlaybackConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Windowing and feature extraction
    pub analysis: AnalysisSettings,
    /// Feature to sound mapping
    pub mapping: MappingConfig,
    /// Trigger behaviour and drone
    pub playback: PlaybackConfig,
    /// Session recording
    pub export: ExportSettings,
}

/// Windowing and feature extraction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    /// ECG sampling rate in Hz
    pub sampling_rate_hz: f64,
    /// Frames per channel in one analysis window
    pub batch_size: usize,
    /// R peaks must exceed this amplitude (µV)
    pub r_threshold_uv: f64,
    /// Q/S search distance from an R peak, in samples
    pub search_window: usize,
    /// Channel RR intervals are read from
    pub rr_source: RrSource,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            sampling_rate_hz: DEFAULT_SAMPLING_RATE_HZ,
            batch_size: DEFAULT_BATCH_SIZE,
            r_threshold_uv: DEFAULT_R_THRESHOLD_UV,
            search_window: DEFAULT_SEARCH_WINDOW,
            rr_source: RrSource::default(),
        }
    }
}

impl AnalysisSettings {
    pub fn analysis_config(&self) -> AnalysisConfig {
        AnalysisConfig {
            sampling_rate_hz: self.sampling_rate_hz,
            peaks: PeakConfig {
                r_threshold_uv: self.r_threshold_uv,
                search_window: self.search_window,
            },
            rr_source: self.rr_source,
        }
    }
}

/// Session recording settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    /// Record incoming frames to CSV
    pub enabled: bool,
    /// Write one JSON report per analysed window
    pub window_reports: bool,
    /// Path for CSV recordings and window reports
    pub export_path: PathBuf,
    /// Path for session statistics
    pub data_path: PathBuf,
}

impl Default for ExportSettings {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ecg-sonify");

        Self {
            enabled: false,
            window_reports: true,
            export_path: data_dir.join("exports"),
            data_path: data_dir,
        }
    }
}

impl ExportSettings {
    /// Where the last session's statistics are kept.
    pub fn stats_path(&self) -> PathBuf {
        self.data_path.join("last_session.json")
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from a file, falling back to defaults if it does
    /// not exist.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ecg-sonify")
            .join("config.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.export.export_path)
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        std::fs::create_dir_all(&self.export.data_path)
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        Ok(())
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let analysis = &self.analysis;
        if !(analysis.sampling_rate_hz.is_finite() && analysis.sampling_rate_hz > 0.0) {
            return Err(ConfigError::Invalid(
                "sampling_rate_hz must be positive".to_string(),
            ));
        }
        if analysis.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".to_string()));
        }
        if analysis.search_window == 0 {
            return Err(ConfigError::Invalid(
                "search_window must be at least 1".to_string(),
            ));
        }

        let mapping = &self.mapping;
        if mapping.scale.len() != 8 {
            return Err(ConfigError::Invalid(format!(
                "scale must have exactly 8 codes, got {}",
                mapping.scale.len()
            )));
        }
        if mapping.scale.iter().any(|&code| code > 127) {
            return Err(ConfigError::Invalid(
                "scale codes must be MIDI notes (0-127)".to_string(),
            ));
        }
        let (lower, upper) = mapping.calibration.range();
        if lower >= upper {
            return Err(ConfigError::Invalid("calibration range is empty".to_string()));
        }
        for (name, value) in [
            ("tonal_interval_secs", mapping.tonal_interval_secs),
            ("chime_interval_secs", mapping.chime_interval_secs),
            ("bowl_interval_secs", mapping.bowl_interval_secs),
            ("amplitude_reference_uv", mapping.amplitude_reference_uv),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        if !(mapping.gong_offset_secs.is_finite() && mapping.gong_offset_secs >= 0.0) {
            return Err(ConfigError::Invalid(
                "gong_offset_secs must not be negative".to_string(),
            ));
        }

        if !TEMPO_RANGE.contains(&self.playback.tempo) {
            return Err(ConfigError::Invalid(format!(
                "tempo must be between {} and {}",
                TEMPO_RANGE.start(),
                TEMPO_RANGE.end()
            )));
        }

        let drone = &self.playback.drone;
        if drone.enabled && !(drone.base_hz > 0.0 && drone.beat_hz >= 0.0) {
            return Err(ConfigError::Invalid(
                "drone frequencies must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Accepted playback tempo factors.
pub const TEMPO_RANGE: std::ops::RangeInclusive<f64> = 0.01..=100.0;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Serialize error: {0}")]
    Serialize(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
