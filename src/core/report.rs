//! Per-window analysis reports.
//!
//! Each analysed window yields a small JSON record with its time span, how
//! many peaks were found and summary statistics of the extracted QRS
//! durations and RR intervals. Reports are collected per session and written
//! out on shutdown.

use crate::core::features::WindowAnalysis;
use crate::core::windowing::WindowPair;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Median, Statistics};
use uuid::Uuid;

/// The name of this producer.
pub const PRODUCER_NAME: &str = "ecg-sonify";

/// Summary statistics of one feature series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesSummary {
    pub count: usize,
    pub mean: f64,
    /// Sample standard deviation; absent for fewer than two values
    #[serde(skip_serializing_if = "Option::is_none")]
    pub std_dev: Option<f64>,
    pub median: f64,
    pub min: f64,
    pub max: f64,
}

impl SeriesSummary {
    /// Summarise a series; `None` when it is empty.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let std_dev = Statistics::std_dev(values.iter());
        Some(Self {
            count: values.len(),
            mean: Statistics::mean(values.iter()),
            std_dev: (!std_dev.is_nan()).then_some(std_dev),
            median: Data::new(values.to_vec()).median(),
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }
}

/// Peak counts of a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeakCounts {
    pub r: usize,
    pub q: usize,
    pub s: usize,
}

/// One analysed window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowReport {
    pub producer: String,
    pub session_id: String,
    pub sequence: u64,
    /// When the analysis finished (RFC3339)
    pub computed_at_utc: String,
    /// Sensor timestamp of the first ECG frame (ns)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_ns: Option<u64>,
    /// Sensor timestamp of the last ECG frame (ns)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_ns: Option<u64>,
    pub ecg_frames: usize,
    pub hr_frames: usize,
    pub ecg_samples: usize,
    pub peaks: PeakCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qrs_secs: Option<SeriesSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rr_secs: Option<SeriesSummary>,
    /// Mean heart rate implied by the RR intervals
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heart_rate_bpm: Option<f64>,
}

impl WindowReport {
    /// True when no cardiac cycle was found in the window.
    pub fn is_empty(&self) -> bool {
        self.peaks.r == 0
    }
}

/// Builds reports for one session.
#[derive(Debug, Clone)]
pub struct ReportBuilder {
    session_id: Uuid,
}

impl ReportBuilder {
    /// Create a builder with a fresh session ID.
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Build a report from a window pair and its analysis.
    pub fn build(&self, pair: &WindowPair, analysis: &WindowAnalysis) -> WindowReport {
        let rr = SeriesSummary::from_values(&analysis.features.rr_intervals);
        let heart_rate_bpm = rr
            .as_ref()
            .filter(|s| s.mean > 0.0)
            .map(|s| 60.0 / s.mean);

        WindowReport {
            producer: PRODUCER_NAME.to_string(),
            session_id: self.session_id.to_string(),
            sequence: analysis.sequence,
            computed_at_utc: Utc::now().to_rfc3339(),
            start_ns: pair.ecg.start(),
            end_ns: pair.ecg.end(),
            ecg_frames: pair.ecg.frame_count(),
            hr_frames: pair.hr.frame_count(),
            ecg_samples: pair.ecg.frames.iter().map(|f| f.len()).sum(),
            peaks: PeakCounts {
                r: analysis.peaks.r_peaks.len(),
                q: analysis.peaks.q_peaks.len(),
                s: analysis.peaks.s_peaks.len(),
            },
            qrs_secs: SeriesSummary::from_values(&analysis.features.qrs_durations),
            rr_secs: rr,
            heart_rate_bpm,
        }
    }
}

impl Default for ReportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::features::{analyze_window, AnalysisConfig};
    use crate::core::windowing::FrameWindow;
    use crate::sensor::types::Frame;

    #[test]
    fn test_builder_session_ids_differ() {
        assert_ne!(ReportBuilder::new().session_id(), ReportBuilder::new().session_id());
    }

    #[test]
    fn test_series_summary() {
        assert!(SeriesSummary::from_values(&[]).is_none());

        let single = SeriesSummary::from_values(&[0.8]).unwrap();
        assert_eq!(single.count, 1);
        assert!((single.median - 0.8).abs() < 1e-12);
        assert!(single.std_dev.is_none());

        let summary = SeriesSummary::from_values(&[0.9, 0.8, 1.2]).unwrap();
        assert!((summary.mean - (2.9 / 3.0)).abs() < 1e-12);
        assert!((summary.median - 0.9).abs() < 1e-12);
        assert_eq!(summary.min, 0.8);
        assert_eq!(summary.max, 1.2);
        assert!(summary.std_dev.unwrap() > 0.0);
    }

    #[test]
    fn test_report_from_analysis() {
        let pair = WindowPair {
            sequence: 3,
            ecg: FrameWindow {
                frames: vec![
                    Frame::ecg(10, crate::core::features::tests::single_cycle()),
                    Frame::ecg(20, vec![0.0; 10]),
                ],
            },
            hr: FrameWindow {
                frames: vec![Frame::heart_rate(10, 60.0, &[1000.0])],
            },
        };
        let analysis = analyze_window(&pair, &AnalysisConfig::default());

        let builder = ReportBuilder::new();
        let report = builder.build(&pair, &analysis);

        assert_eq!(report.sequence, 3);
        assert_eq!(report.session_id, builder.session_id().to_string());
        assert_eq!(report.start_ns, Some(10));
        assert_eq!(report.end_ns, Some(20));
        assert_eq!(report.ecg_samples, 110);
        assert_eq!(report.peaks, PeakCounts { r: 1, q: 1, s: 1 });
        assert_eq!(report.qrs_secs.as_ref().map(|s| s.mean), Some(0.5));
        assert_eq!(report.heart_rate_bpm, Some(60.0));
        assert!(!report.is_empty());
    }

    #[test]
    fn test_report_serializes_without_empty_series() {
        let pair = WindowPair {
            sequence: 0,
            ecg: FrameWindow::default(),
            hr: FrameWindow::default(),
        };
        let analysis = analyze_window(&pair, &AnalysisConfig::default());
        let report = ReportBuilder::new().build(&pair, &analysis);

        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("qrs_secs").is_none());
        assert!(json.get("start_ns").is_none());
        assert_eq!(json["producer"], PRODUCER_NAME);
        assert!(report.is_empty());
    }
}
