//! ECG sonification - turn a live heart sensor stream into sound.
//!
//! Frames from a chest-strap style sensor (raw ECG plus heart rate with RR
//! intervals) are batched into windows, reduced to cardiac features and
//! mapped onto four sound layers that play on their own clocks.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         ecg-sonify                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐         │
//! │  │   Sensor    │──▶│  Windowing  │──▶│  Features   │         │
//! │  │ (sim/replay)│   │ (N frames)  │   │ (R/Q/S, RR) │         │
//! │  └─────────────┘   └─────────────┘   └─────────────┘         │
//! │         │                                    │               │
//! │         ▼                                    ▼               │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐         │
//! │  │ CSV export  │   │  Triggers   │◀──│   Mapper    │         │
//! │  │   + stats   │   │ (per layer) │   │ (4 layers)  │         │
//! │  └─────────────┘   └─────────────┘   └─────────────┘         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use ecg_sonify::{pipeline, playback, sensor, stats};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), pipeline::SessionError> {
//! let engine = Arc::new(playback::LogEngine::new());
//! let mut scheduler =
//!     playback::PlaybackScheduler::new(engine, playback::PlaybackConfig::default());
//! let mut sensor = sensor::SimulatedSensor::new(sensor::SimulatedConfig::default());
//!
//! let session = pipeline::Session::new(
//!     pipeline::SessionOptions::default(),
//!     stats::create_shared_stats(),
//!     pipeline::Shutdown::new(),
//! );
//! let summary = session.run(&mut sensor, &mut scheduler).await?;
//! println!("{}", summary.stats.summary());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod export;
pub mod pipeline;
pub mod playback;
pub mod sensor;
pub mod stats;

// Re-export key types at crate root for convenience
pub use config::{Config, ConfigError};
pub use crate::core::{analyze_window, FeatureSet, Layer, Mapper, PlaybackEvent, WindowManager};
pub use pipeline::{Session, SessionError, SessionOptions, SessionSummary, Shutdown, ShutdownReason};
pub use playback::{AudioEngine, PlaybackScheduler};
pub use sensor::{Channel, Frame, SensorError, SensorSource};
pub use stats::{SessionStats, SharedSessionStats};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
