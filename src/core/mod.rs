//! Core analysis for the sonification pipeline.
//!
//! This module contains:
//! - Window management for batching frames into (ECG, HR) window pairs
//! - Feature extraction (R/Q/S peaks, QRS durations, RR intervals)
//! - Mapping of features to per-layer playback events
//! - Per-window reports for export

pub mod features;
pub mod mapping;
pub mod report;
pub mod windowing;

// Re-export commonly used types
pub use features::{
    analyze_window, detect_peaks, AnalysisConfig, FeatureSet, Peak, PeakConfig, PeakSet,
    RrSource, WindowAnalysis,
};
pub use mapping::{
    midi_to_frequency, Calibration, Layer, LayerSequences, Mapper, MappingConfig, MappingTable,
    OutOfRange, PlaybackEvent,
};
pub use report::{ReportBuilder, SeriesSummary, WindowReport, PRODUCER_NAME};
pub use windowing::{FrameWindow, WindowManager, WindowPair};
