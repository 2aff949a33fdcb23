//! Frame types delivered by a heart sensor.
//!
//! A frame is one sensor notification: a batch of ECG samples or one
//! heart-rate reading. Frames are immutable once enqueued.

use serde::{Deserialize, Serialize};

/// Nanoseconds per second, for converting sensor timestamps.
pub const NANOS_PER_SECOND: f64 = 1_000_000_000.0;

/// The measurement stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Raw electrocardiogram samples in microvolts
    Ecg,
    /// Heart rate with optional RR intervals
    HeartRate,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Ecg => write!(f, "ECG"),
            Channel::HeartRate => write!(f, "HR"),
        }
    }
}

/// One sensor notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Stream this frame was received on
    pub channel: Channel,
    /// Monotonic timestamp in nanoseconds; for ECG it refers to the last sample
    pub timestamp: u64,
    /// Numeric payload (see [`Frame::ecg`] and [`Frame::heart_rate`])
    pub payload: Vec<f64>,
}

impl Frame {
    /// Create an ECG frame from a batch of samples.
    pub fn ecg(timestamp: u64, samples: Vec<f64>) -> Self {
        Self {
            channel: Channel::Ecg,
            timestamp,
            payload: samples,
        }
    }

    /// Create a heart-rate frame.
    ///
    /// The payload layout is `[bpm, rr_ms...]`; the RR list may be empty when
    /// the device only reports an instantaneous rate.
    pub fn heart_rate(timestamp: u64, bpm: f64, rr_ms: &[f64]) -> Self {
        let mut payload = Vec::with_capacity(rr_ms.len() + 1);
        payload.push(bpm);
        payload.extend_from_slice(rr_ms);
        Self {
            channel: Channel::HeartRate,
            timestamp,
            payload,
        }
    }

    /// Instantaneous heart rate in beats per minute (HR frames only).
    pub fn bpm(&self) -> Option<f64> {
        match self.channel {
            Channel::HeartRate => self.payload.first().copied(),
            Channel::Ecg => None,
        }
    }

    /// Reported RR intervals in milliseconds (HR frames only).
    pub fn rr_ms(&self) -> &[f64] {
        match self.channel {
            Channel::HeartRate if !self.payload.is_empty() => &self.payload[1..],
            _ => &[],
        }
    }

    /// RR intervals in seconds carried by this HR frame.
    ///
    /// Uses the reported RR list when present, otherwise the reciprocal of the
    /// instantaneous rate. A zero or missing rate yields nothing.
    pub fn rr_secs(&self) -> Vec<f64> {
        let reported = self.rr_ms();
        if !reported.is_empty() {
            return reported.iter().map(|ms| ms / 1000.0).collect();
        }
        match self.bpm() {
            Some(bpm) if bpm > 0.0 => vec![60.0 / bpm],
            _ => Vec::new(),
        }
    }

    /// Number of samples in the payload.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Item carried by a frame queue: a frame, or the shutdown sentinel.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueItem {
    Frame(Frame),
    Quit,
}
