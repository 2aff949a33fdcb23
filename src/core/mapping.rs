//! Mapping from cardiac features to playback events.
//!
//! QRS durations become pitches on an eight-note scale, RR intervals become
//! gong onset intervals, and R/S amplitudes become chime and bowl loudness.
//! Everything here is a pure function of the feature set and the mapping
//! configuration.

use crate::core::features::FeatureSet;
use serde::{Deserialize, Serialize};

/// Default scale codes (C major, MIDI note numbers).
pub const DEFAULT_SCALE: [u8; 8] = [60, 62, 64, 65, 67, 69, 71, 72];

/// Reference pitch: MIDI code 69 is A4.
const A4_CODE: f64 = 69.0;
const A4_HZ: f64 = 440.0;

/// Convert a MIDI note code to a frequency in Hz.
pub fn midi_to_frequency(code: u8) -> f64 {
    A4_HZ * 2f64.powf((code as f64 - A4_CODE) / 12.0)
}

/// Range QRS durations are bucketed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Calibration {
    /// 0.005 s to 0.1 s, physiological QRS widths
    Narrow,
    /// 0 s to 1 s
    #[default]
    Wide,
}

impl Calibration {
    /// `(lower, upper)` bounds in seconds.
    pub fn range(self) -> (f64, f64) {
        match self {
            Calibration::Narrow => (0.005, 0.1),
            Calibration::Wide => (0.0, 1.0),
        }
    }

    /// What to do with durations outside the range unless configured
    /// otherwise.
    pub fn default_out_of_range(self) -> OutOfRange {
        match self {
            Calibration::Narrow => OutOfRange::Drop,
            Calibration::Wide => OutOfRange::Median,
        }
    }
}

/// Handling of values that fall outside every bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutOfRange {
    /// Use the middle bin's code
    Median,
    /// Emit nothing for the value
    Drop,
}

/// Ordered `(upper_bound, code)` bins over `(lower, upper]`.
#[derive(Debug, Clone, PartialEq)]
pub struct MappingTable {
    lower: f64,
    bins: Vec<(f64, u8)>,
    out_of_range: OutOfRange,
}

impl MappingTable {
    /// Split `(lower, upper]` into one equal-width bin per code.
    pub fn new(lower: f64, upper: f64, codes: &[u8], out_of_range: OutOfRange) -> Self {
        let width = (upper - lower) / codes.len().max(1) as f64;
        let last = codes.len().saturating_sub(1);
        let bins = codes
            .iter()
            .enumerate()
            .map(|(i, &code)| {
                // The last bound is exactly `upper` regardless of rounding.
                let bound = if i == last {
                    upper
                } else {
                    lower + width * (i + 1) as f64
                };
                (bound, code)
            })
            .collect();
        Self {
            lower,
            bins,
            out_of_range,
        }
    }

    pub fn for_calibration(calibration: Calibration, codes: &[u8], out_of_range: OutOfRange) -> Self {
        let (lower, upper) = calibration.range();
        Self::new(lower, upper, codes, out_of_range)
    }

    /// Bin index for a value, or `None` if it lies outside `(lower, upper]`.
    pub fn bin_index(&self, value: f64) -> Option<usize> {
        if value.is_nan() || value <= self.lower {
            return None;
        }
        self.bins.iter().position(|&(upper, _)| value <= upper)
    }

    /// Code for a value after applying the out-of-range policy.
    pub fn code_for(&self, value: f64) -> Option<u8> {
        match self.bin_index(value) {
            Some(i) => Some(self.bins[i].1),
            None => match self.out_of_range {
                OutOfRange::Median => self.bins.get(self.bins.len() / 2).map(|&(_, code)| code),
                OutOfRange::Drop => None,
            },
        }
    }

    pub fn bins(&self) -> &[(f64, u8)] {
        &self.bins
    }
}

/// Sonic layer an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    /// Pitched line driven by QRS durations
    Tonal,
    /// Percussion paced by RR intervals
    Gong,
    /// Percussion with loudness from R amplitudes
    Chime,
    /// Percussion with loudness from S amplitudes
    Bowl,
}

impl Layer {
    pub const ALL: [Layer; 4] = [Layer::Tonal, Layer::Gong, Layer::Chime, Layer::Bowl];

    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Tonal => "tonal",
            Layer::Gong => "gong",
            Layer::Chime => "chime",
            Layer::Bowl => "bowl",
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scheduled sound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackEvent {
    pub layer: Layer,
    /// Time until the next event of the same layer
    pub interval_secs: f64,
    /// Output gain in `[0, 1]`
    pub amplitude: f64,
    /// Scale code, for pitched layers
    pub symbol: Option<u8>,
    /// Oscillator frequency, for pitched layers
    pub frequency_hz: Option<f64>,
}

/// Which layers are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerToggles {
    pub tonal: bool,
    pub gong: bool,
    pub chime: bool,
    pub bowl: bool,
}

impl Default for LayerToggles {
    fn default() -> Self {
        Self {
            tonal: true,
            gong: true,
            chime: true,
            bowl: true,
        }
    }
}

impl LayerToggles {
    pub fn is_enabled(&self, layer: Layer) -> bool {
        match layer {
            Layer::Tonal => self.tonal,
            Layer::Gong => self.gong,
            Layer::Chime => self.chime,
            Layer::Bowl => self.bowl,
        }
    }
}

/// Parameters of the feature-to-sound mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    pub calibration: Calibration,
    /// Overrides the calibration's default out-of-range handling
    pub out_of_range: Option<OutOfRange>,
    /// Eight MIDI codes, lowest bin first
    pub scale: Vec<u8>,
    /// Seconds added to each RR interval to get the gong interval
    pub gong_offset_secs: f64,
    pub gong_amplitude: f64,
    pub tonal_interval_secs: f64,
    pub tonal_amplitude: f64,
    pub chime_interval_secs: f64,
    pub bowl_interval_secs: f64,
    /// Peak amplitude (µV) that maps to full chime/bowl loudness
    pub amplitude_reference_uv: f64,
    pub layers: LayerToggles,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            calibration: Calibration::default(),
            out_of_range: None,
            scale: DEFAULT_SCALE.to_vec(),
            gong_offset_secs: 3.5,
            gong_amplitude: 0.5,
            tonal_interval_secs: 0.5,
            tonal_amplitude: 0.2,
            chime_interval_secs: 1.75,
            bowl_interval_secs: 1.0,
            amplitude_reference_uv: 2000.0,
            layers: LayerToggles::default(),
        }
    }
}

impl MappingConfig {
    /// Effective out-of-range policy.
    pub fn out_of_range_policy(&self) -> OutOfRange {
        self.out_of_range
            .unwrap_or_else(|| self.calibration.default_out_of_range())
    }

    pub fn table(&self) -> MappingTable {
        MappingTable::for_calibration(self.calibration, &self.scale, self.out_of_range_policy())
    }
}

/// Event sequences for every enabled layer, in layer order.
pub type LayerSequences = Vec<(Layer, Vec<PlaybackEvent>)>;

/// Maps feature sets to playback events.
#[derive(Debug, Clone)]
pub struct Mapper {
    config: MappingConfig,
    table: MappingTable,
}

impl Mapper {
    pub fn new(config: MappingConfig) -> Self {
        let table = config.table();
        Self { config, table }
    }

    pub fn config(&self) -> &MappingConfig {
        &self.config
    }

    pub fn table(&self) -> &MappingTable {
        &self.table
    }

    /// Pitched events, one per QRS duration that maps to a code.
    pub fn tonal_events(&self, qrs_durations: &[f64]) -> Vec<PlaybackEvent> {
        qrs_durations
            .iter()
            .filter_map(|&d| self.table.code_for(d))
            .map(|code| PlaybackEvent {
                layer: Layer::Tonal,
                interval_secs: self.config.tonal_interval_secs,
                amplitude: self.config.tonal_amplitude,
                symbol: Some(code),
                frequency_hz: Some(midi_to_frequency(code)),
            })
            .collect()
    }

    /// Gong events, one per RR interval.
    pub fn gong_events(&self, rr_intervals: &[f64]) -> Vec<PlaybackEvent> {
        rr_intervals
            .iter()
            .filter(|rr| rr.is_finite() && **rr > 0.0)
            .map(|rr| PlaybackEvent {
                layer: Layer::Gong,
                interval_secs: rr + self.config.gong_offset_secs,
                amplitude: self.config.gong_amplitude,
                symbol: None,
                frequency_hz: None,
            })
            .collect()
    }

    fn amplitude_events(&self, layer: Layer, amplitudes: &[f64], interval: f64) -> Vec<PlaybackEvent> {
        amplitudes
            .iter()
            .map(|a| PlaybackEvent {
                layer,
                interval_secs: interval,
                amplitude: self.normalize(*a),
                symbol: None,
                frequency_hz: None,
            })
            .collect()
    }

    /// Scale a peak amplitude into `[0, 1]`.
    pub fn normalize(&self, amplitude_uv: f64) -> f64 {
        if self.config.amplitude_reference_uv <= 0.0 || !amplitude_uv.is_finite() {
            return 0.0;
        }
        (amplitude_uv.abs() / self.config.amplitude_reference_uv).clamp(0.0, 1.0)
    }

    pub fn chime_events(&self, r_amplitudes: &[f64]) -> Vec<PlaybackEvent> {
        self.amplitude_events(Layer::Chime, r_amplitudes, self.config.chime_interval_secs)
    }

    pub fn bowl_events(&self, s_amplitudes: &[f64]) -> Vec<PlaybackEvent> {
        self.amplitude_events(Layer::Bowl, s_amplitudes, self.config.bowl_interval_secs)
    }

    /// Map one feature set to per-layer sequences. Disabled layers are left
    /// out; enabled layers are present even when their sequence is empty.
    pub fn map(&self, features: &FeatureSet) -> LayerSequences {
        Layer::ALL
            .iter()
            .filter(|layer| self.config.layers.is_enabled(**layer))
            .map(|&layer| {
                let events = match layer {
                    Layer::Tonal => self.tonal_events(&features.qrs_durations),
                    Layer::Gong => self.gong_events(&features.rr_intervals),
                    Layer::Chime => self.chime_events(&features.r_amplitudes),
                    Layer::Bowl => self.bowl_events(&features.s_amplitudes),
                };
                (layer, events)
            })
            .collect()
    }
}
