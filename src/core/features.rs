//! Feature extraction from ECG windows.
//!
//! R peaks are detected as local maxima above a fixed amplitude threshold; the
//! nearest local minima before and after each R are taken as its Q and S
//! waves. From these the QRS durations and RR intervals of a window are
//! derived. A window without a full cardiac cycle simply yields empty
//! feature lists.

use crate::core::windowing::{FrameWindow, WindowPair};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Default ECG sampling rate in Hz.
pub const DEFAULT_SAMPLING_RATE_HZ: f64 = 50.0;

/// Default R-peak amplitude threshold in microvolts.
pub const DEFAULT_R_THRESHOLD_UV: f64 = 1500.0;

/// Default Q/S search distance from an R peak, in samples.
pub const DEFAULT_SEARCH_WINDOW: usize = 50;

/// A detected peak.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    /// Sample index within the window
    pub index: usize,
    /// Sample value in microvolts
    pub amplitude: f64,
}

/// Peaks found in one window, each list sorted by index without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeakSet {
    pub r_peaks: Vec<Peak>,
    pub q_peaks: Vec<Peak>,
    pub s_peaks: Vec<Peak>,
}

/// Peak detection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeakConfig {
    /// R peaks must be strictly above this amplitude (µV)
    pub r_threshold_uv: f64,
    /// How far (in samples) to look for Q before and S after an R peak
    pub search_window: usize,
}

impl Default for PeakConfig {
    fn default() -> Self {
        Self {
            r_threshold_uv: DEFAULT_R_THRESHOLD_UV,
            search_window: DEFAULT_SEARCH_WINDOW,
        }
    }
}

/// Which channel RR intervals are taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RrSource {
    /// Intervals reported by the heart-rate channel
    #[default]
    HeartRate,
    /// Distances between successive R peaks on the ECG time axis
    Ecg,
}

/// Parameters for analysing a window pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub sampling_rate_hz: f64,
    pub peaks: PeakConfig,
    pub rr_source: RrSource,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            sampling_rate_hz: DEFAULT_SAMPLING_RATE_HZ,
            peaks: PeakConfig::default(),
            rr_source: RrSource::default(),
        }
    }
}

/// Features of one window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    /// QRS complex durations in seconds
    pub qrs_durations: Vec<f64>,
    /// RR intervals in seconds
    pub rr_intervals: Vec<f64>,
    /// Amplitudes of the detected R peaks (µV)
    pub r_amplitudes: Vec<f64>,
    /// Amplitudes of the detected S waves (µV)
    pub s_amplitudes: Vec<f64>,
}

impl FeatureSet {
    /// True when nothing usable was extracted.
    pub fn is_empty(&self) -> bool {
        self.qrs_durations.is_empty()
            && self.rr_intervals.is_empty()
            && self.r_amplitudes.is_empty()
            && self.s_amplitudes.is_empty()
    }
}

/// Result of analysing one window pair.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowAnalysis {
    pub sequence: u64,
    pub peaks: PeakSet,
    pub features: FeatureSet,
}

/// Indices of strict local extrema, excluding the first and last sample.
///
/// `dir` is `Greater` for maxima and `Less` for minima. A flat run of equal
/// samples counts as one extremum when both of its neighbours lie on the same
/// side; it resolves to the middle of the run.
fn local_extrema(samples: &[f64], dir: Ordering) -> Vec<usize> {
    let mut found = Vec::new();
    let n = samples.len();
    let mut i = 1;

    while i + 1 < n {
        if samples[i].partial_cmp(&samples[i - 1]) != Some(dir) {
            i += 1;
            continue;
        }
        let mut end = i;
        while end + 1 < n && samples[end + 1] == samples[i] {
            end += 1;
        }
        if end + 1 < n && samples[i].partial_cmp(&samples[end + 1]) == Some(dir) {
            found.push((i + end) / 2);
        }
        i = end + 1;
    }

    found
}

/// Find R, Q and S peaks in a flat sample array.
pub fn detect_peaks(samples: &[f64], config: &PeakConfig) -> PeakSet {
    let maxima = local_extrema(samples, Ordering::Greater);
    let minima = local_extrema(samples, Ordering::Less);
    let w = config.search_window;

    let peak = |index: usize| Peak {
        index,
        amplitude: samples[index],
    };

    let r_peaks: Vec<Peak> = maxima
        .into_iter()
        .filter(|&i| samples[i] > config.r_threshold_uv)
        .map(peak)
        .collect();

    let mut q_peaks = Vec::new();
    let mut s_peaks = Vec::new();
    for r in &r_peaks {
        if let Some(q) = nearest_before(&minima, r.index, w) {
            q_peaks.push(peak(q));
        }
        if let Some(s) = nearest_after(&minima, r.index, w) {
            s_peaks.push(peak(s));
        }
    }
    q_peaks.dedup_by_key(|p| p.index);
    s_peaks.dedup_by_key(|p| p.index);

    PeakSet {
        r_peaks,
        q_peaks,
        s_peaks,
    }
}

/// Last minimum in `[r - w, r - 1]`.
fn nearest_before(minima: &[usize], r: usize, w: usize) -> Option<usize> {
    let lo = r.saturating_sub(w);
    minima.iter().rev().copied().find(|&m| m < r && m >= lo)
}

/// First minimum in `[r + 1, r + w]`.
fn nearest_after(minima: &[usize], r: usize, w: usize) -> Option<usize> {
    minima.iter().copied().find(|&m| m > r && m <= r.saturating_add(w))
}

/// QRS durations in seconds, one per R peak with both a Q and an S inside
/// its search windows.
pub fn qrs_durations(peaks: &PeakSet, sampling_rate_hz: f64, search_window: usize) -> Vec<f64> {
    let q_idx: Vec<usize> = peaks.q_peaks.iter().map(|p| p.index).collect();
    let s_idx: Vec<usize> = peaks.s_peaks.iter().map(|p| p.index).collect();

    peaks
        .r_peaks
        .iter()
        .filter_map(|r| {
            let q = nearest_before(&q_idx, r.index, search_window)?;
            let s = nearest_after(&s_idx, r.index, search_window)?;
            Some((s - q) as f64 / sampling_rate_hz)
        })
        .collect()
}

/// RR intervals in seconds between successive R peaks, using the window's
/// sample time axis (nanoseconds).
pub fn ecg_rr_intervals(r_peaks: &[Peak], time_axis: &[f64]) -> Vec<f64> {
    r_peaks
        .windows(2)
        .filter_map(|pair| {
            let a = *time_axis.get(pair[0].index)?;
            let b = *time_axis.get(pair[1].index)?;
            let rr = (b - a) / 1e9;
            (rr > 0.0).then_some(rr)
        })
        .collect()
}

/// RR intervals in seconds reported on the heart-rate channel.
pub fn hr_rr_intervals(window: &FrameWindow) -> Vec<f64> {
    window.frames.iter().flat_map(|f| f.rr_secs()).collect()
}

/// Compute features from already-detected peaks.
pub fn compute_features(
    peaks: &PeakSet,
    rr_intervals: Vec<f64>,
    config: &AnalysisConfig,
) -> FeatureSet {
    FeatureSet {
        qrs_durations: qrs_durations(peaks, config.sampling_rate_hz, config.peaks.search_window),
        rr_intervals,
        r_amplitudes: peaks.r_peaks.iter().map(|p| p.amplitude).collect(),
        s_amplitudes: peaks.s_peaks.iter().map(|p| p.amplitude).collect(),
    }
}

/// Analyse one window pair.
pub fn analyze_window(pair: &WindowPair, config: &AnalysisConfig) -> WindowAnalysis {
    let samples = pair.ecg.samples();
    let peaks = detect_peaks(&samples, &config.peaks);

    let rr_intervals = match config.rr_source {
        RrSource::HeartRate => hr_rr_intervals(&pair.hr),
        RrSource::Ecg => {
            let axis = pair.ecg.time_axis(config.sampling_rate_hz);
            ecg_rr_intervals(&peaks.r_peaks, &axis)
        }
    };

    let features = compute_features(&peaks, rr_intervals, config);
    WindowAnalysis {
        sequence: pair.sequence,
        peaks,
        features,
    }
}
