//! Window management for batching sensor frames.
//!
//! Frames of each channel are collected into fixed-count windows (default 10
//! frames). Once both channels have a full window, the (ECG, HR) pair is
//! released for analysis and new windows are started.

use crate::sensor::types::{Channel, Frame};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default number of frames per window.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// A batch of frames from one channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameWindow {
    /// Frames in arrival order
    pub frames: Vec<Frame>,
}

impl FrameWindow {
    /// Concatenated payloads of all frames.
    pub fn samples(&self) -> Vec<f64> {
        self.frames
            .iter()
            .flat_map(|f| f.payload.iter().copied())
            .collect()
    }

    /// Timestamp in nanoseconds of every sample returned by [`samples`].
    ///
    /// A frame's timestamp refers to its last sample, so sample `k` of an
    /// `n`-sample frame is stamped `timestamp - (n - 1 - k) * period`.
    ///
    /// [`samples`]: FrameWindow::samples
    pub fn time_axis(&self, sampling_rate_hz: f64) -> Vec<f64> {
        let period_ns = 1e9 / sampling_rate_hz;
        self.frames
            .iter()
            .flat_map(|f| {
                let n = f.payload.len();
                (0..n).map(move |k| f.timestamp as f64 - (n - 1 - k) as f64 * period_ns)
            })
            .collect()
    }

    /// Timestamp of the first frame.
    pub fn start(&self) -> Option<u64> {
        self.frames.first().map(|f| f.timestamp)
    }

    /// Timestamp of the last frame.
    pub fn end(&self) -> Option<u64> {
        self.frames.last().map(|f| f.timestamp)
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// A released (ECG, HR) window pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowPair {
    /// Position of this pair in the session, starting at 0
    pub sequence: u64,
    pub ecg: FrameWindow,
    pub hr: FrameWindow,
}

/// Collects frames into window pairs.
pub struct WindowManager {
    /// Frames per window
    batch_size: usize,
    /// Windows currently being filled
    open_ecg: Vec<Frame>,
    open_hr: Vec<Frame>,
    /// Full windows waiting for their partner channel
    full_ecg: VecDeque<FrameWindow>,
    full_hr: VecDeque<FrameWindow>,
    /// Pairs ready for analysis
    completed: Vec<WindowPair>,
    next_sequence: u64,
    /// Wait for an HR window before releasing an ECG window
    pair_hr: bool,
}

impl WindowManager {
    /// Create a manager releasing pairs of `batch_size` frames per channel.
    /// A batch size of zero is treated as one.
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            open_ecg: Vec::with_capacity(batch_size),
            open_hr: Vec::with_capacity(batch_size),
            full_ecg: VecDeque::new(),
            full_hr: VecDeque::new(),
            completed: Vec::new(),
            next_sequence: 0,
            pair_hr: true,
        }
    }

    /// Create a manager for a source without an HR channel. ECG windows are
    /// released on their own, paired with an empty HR window.
    pub fn ecg_only(batch_size: usize) -> Self {
        Self {
            pair_hr: false,
            ..Self::new(batch_size)
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Process an incoming frame.
    ///
    /// Appends it to its channel's open window; a window that reaches the batch
    /// size is closed, and closed windows are paired in order across channels.
    pub fn process_frame(&mut self, frame: Frame) {
        let (open, full) = match frame.channel {
            Channel::Ecg => (&mut self.open_ecg, &mut self.full_ecg),
            Channel::HeartRate => (&mut self.open_hr, &mut self.full_hr),
        };

        open.push(frame);
        if open.len() >= self.batch_size {
            let frames = std::mem::replace(open, Vec::with_capacity(self.batch_size));
            full.push_back(FrameWindow { frames });
        }

        self.pair_full_windows();
    }

    fn pair_full_windows(&mut self) {
        if !self.pair_hr {
            while let Some(ecg) = self.full_ecg.pop_front() {
                self.push_pair(ecg, FrameWindow::default());
            }
            return;
        }
        while !self.full_ecg.is_empty() && !self.full_hr.is_empty() {
            if let (Some(ecg), Some(hr)) = (self.full_ecg.pop_front(), self.full_hr.pop_front()) {
                self.push_pair(ecg, hr);
            }
        }
    }

    fn push_pair(&mut self, ecg: FrameWindow, hr: FrameWindow) {
        self.completed.push(WindowPair {
            sequence: self.next_sequence,
            ecg,
            hr,
        });
        self.next_sequence += 1;
    }

    /// Force completion of everything still buffered, pairing windows even if
    /// one side is short or empty. Used at the end of a finite recording.
    pub fn flush(&mut self) {
        if !self.open_ecg.is_empty() {
            let frames = std::mem::take(&mut self.open_ecg);
            self.full_ecg.push_back(FrameWindow { frames });
        }
        if !self.open_hr.is_empty() {
            let frames = std::mem::take(&mut self.open_hr);
            self.full_hr.push_back(FrameWindow { frames });
        }

        loop {
            let ecg = self.full_ecg.pop_front();
            let hr = self.full_hr.pop_front();
            if ecg.is_none() && hr.is_none() {
                break;
            }
            self.push_pair(ecg.unwrap_or_default(), hr.unwrap_or_default());
        }
    }

    /// Get and remove completed pairs.
    pub fn take_completed_windows(&mut self) -> Vec<WindowPair> {
        std::mem::take(&mut self.completed)
    }

    /// Frames buffered per channel, not yet released as `(ecg, hr)`.
    pub fn pending_frames(&self) -> (usize, usize) {
        let ecg = self.open_ecg.len() + self.full_ecg.iter().map(|w| w.frame_count()).sum::<usize>();
        let hr = self.open_hr.len() + self.full_hr.iter().map(|w| w.frame_count()).sum::<usize>();
        (ecg, hr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ecg(ts: u64) -> Frame {
        Frame::ecg(ts, vec![ts as f64])
    }

    fn hr(ts: u64) -> Frame {
        Frame::heart_rate(ts, 60.0, &[1000.0])
    }

    #[test]
    fn test_pair_released_when_both_full() {
        let mut manager = WindowManager::new(3);

        for ts in 0..3 {
            manager.process_frame(ecg(ts));
        }
        assert!(manager.take_completed_windows().is_empty());

        for ts in 0..2 {
            manager.process_frame(hr(ts));
        }
        assert!(manager.take_completed_windows().is_empty());

        manager.process_frame(hr(2));
        let pairs = manager.take_completed_windows();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].sequence, 0);
        assert_eq!(pairs[0].ecg.frame_count(), 3);
        assert_eq!(pairs[0].hr.frame_count(), 3);
        assert_eq!(pairs[0].ecg.samples(), vec![0.0, 1.0, 2.0]);
        assert_eq!(manager.pending_frames(), (0, 0));
    }

    #[test]
    fn test_lagging_channel_pairs_in_order() {
        let mut manager = WindowManager::new(2);

        for ts in 0..4 {
            manager.process_frame(ecg(ts));
        }
        assert_eq!(manager.pending_frames(), (4, 0));

        for ts in 0..4 {
            manager.process_frame(hr(ts));
        }
        let pairs = manager.take_completed_windows();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].ecg.start(), Some(0));
        assert_eq!(pairs[1].ecg.start(), Some(2));
        assert_eq!(pairs[1].sequence, 1);
    }

    #[test]
    fn test_flush_releases_partial_windows() {
        let mut manager = WindowManager::new(10);
        manager.process_frame(ecg(1));
        manager.process_frame(ecg(2));

        manager.flush();
        let pairs = manager.take_completed_windows();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].ecg.frame_count(), 2);
        assert!(pairs[0].hr.is_empty());

        manager.flush();
        assert!(manager.take_completed_windows().is_empty());
    }

    #[test]
    fn test_time_axis_stamps_last_sample() {
        let window = FrameWindow {
            frames: vec![Frame::ecg(1_000_000_000, vec![0.0, 0.0, 0.0])],
        };
        // 50 Hz: 20 ms per sample.
        assert_eq!(
            window.time_axis(50.0),
            vec![960_000_000.0, 980_000_000.0, 1_000_000_000.0]
        );
    }

    #[test]
    fn test_ecg_only_releases_without_hr() {
        let mut manager = WindowManager::ecg_only(2);
        manager.process_frame(ecg(0));
        assert!(manager.take_completed_windows().is_empty());
        manager.process_frame(ecg(1));

        let pairs = manager.take_completed_windows();
        assert_eq!(pairs.len(), 1);
        assert!(pairs[0].hr.is_empty());
    }

    #[test]
    fn test_zero_batch_size_treated_as_one() {
        let mut manager = WindowManager::new(0);
        manager.process_frame(ecg(0));
        manager.process_frame(hr(0));
        assert_eq!(manager.take_completed_windows().len(), 1);
    }
}
