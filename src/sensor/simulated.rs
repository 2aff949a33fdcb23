//! Synthetic heart sensor.
//!
//! Generates an ECG trace with P-QRS-T morphology and a gently varying RR
//! interval, plus one heart-rate notification per ECG frame. Useful for
//! running the pipeline without hardware and for tests.

use crate::pipeline::queue::FrameSender;
use crate::sensor::types::{Channel, Frame, NANOS_PER_SECOND};
use crate::sensor::{
    lock_subscribers, DisconnectCallback, Link, SensorError, SensorSource, SharedSubscribers,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::f64::consts::PI;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Configuration for the synthetic sensor.
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    /// ECG sampling rate in Hz
    pub sampling_rate_hz: f64,
    /// Samples delivered per ECG notification
    pub samples_per_frame: usize,
    /// Mean heart rate in beats per minute
    pub base_bpm: f64,
    /// Beat-to-beat variation as a fraction of the mean RR interval
    pub hrv_fraction: f64,
    /// R-wave amplitude in microvolts
    pub r_amplitude_uv: f64,
    /// Pace frames at the sensor's real rate instead of as fast as possible
    pub realtime: bool,
    /// Drop the link after this many ECG frames
    pub frame_limit: Option<u64>,
    /// Reject ECG streaming with this error code
    pub reject_code: Option<i32>,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            sampling_rate_hz: 50.0,
            samples_per_frame: 50,
            base_bpm: 66.0,
            hrv_fraction: 0.05,
            r_amplitude_uv: 2000.0,
            realtime: true,
            frame_limit: None,
            reject_code: None,
        }
    }
}

/// One Gaussian component of a heartbeat, relative to the R peak.
struct Wave {
    /// Amplitude as a fraction of the R amplitude
    scale: f64,
    /// Offset from the R peak in seconds
    center: f64,
    /// Width in seconds
    sigma: f64,
}

const WAVES: [Wave; 5] = [
    Wave { scale: 0.08, center: -0.16, sigma: 0.025 },
    Wave { scale: -0.14, center: -0.06, sigma: 0.02 },
    Wave { scale: 1.0, center: 0.0, sigma: 0.02 },
    Wave { scale: -0.22, center: 0.06, sigma: 0.02 },
    Wave { scale: 0.2, center: 0.26, sigma: 0.05 },
];

/// Beats further than this from a sample do not contribute to it.
const BEAT_REACH_SECS: f64 = 0.5;

/// Deterministic ECG trace generator.
pub struct SyntheticEcg {
    config: SimulatedConfig,
    next_sample: u64,
    /// R-peak times still close enough to shape upcoming samples, each with
    /// the RR interval that ends at it
    beats: VecDeque<(f64, Option<f64>)>,
    next_beat_at: f64,
    last_beat_at: Option<f64>,
    beat_index: u64,
}

/// One generated notification pair.
pub struct SyntheticFrame {
    pub ecg: Frame,
    pub heart_rate: Frame,
}

impl SyntheticEcg {
    pub fn new(config: SimulatedConfig) -> Self {
        Self {
            config,
            next_sample: 0,
            beats: VecDeque::new(),
            next_beat_at: 0.5,
            last_beat_at: None,
            beat_index: 0,
        }
    }

    fn rr_secs(&self, beat: u64) -> f64 {
        let mean = 60.0 / self.config.base_bpm;
        mean * (1.0 + self.config.hrv_fraction * (2.0 * PI * beat as f64 / 7.0).sin())
    }

    fn value_at(&self, t: f64) -> f64 {
        let r = self.config.r_amplitude_uv;
        let wander = 0.015 * r * (2.0 * PI * 0.3 * t).sin();
        let beats: f64 = self
            .beats
            .iter()
            .map(|&(beat, _)| {
                WAVES
                    .iter()
                    .map(|w| {
                        let d = t - beat - w.center;
                        w.scale * r * (-(d * d) / (2.0 * w.sigma * w.sigma)).exp()
                    })
                    .sum::<f64>()
            })
            .sum();
        beats + wander
    }

    /// Produce the next ECG frame and the heart-rate frame covering the same
    /// span.
    pub fn next_frame(&mut self) -> SyntheticFrame {
        let fs = self.config.sampling_rate_hz;
        let mut samples = Vec::with_capacity(self.config.samples_per_frame);
        let mut rr_ms = Vec::new();
        let mut last_t = 0.0;

        for _ in 0..self.config.samples_per_frame {
            let t = self.next_sample as f64 / fs;
            while self.next_beat_at <= t + BEAT_REACH_SECS {
                let at = self.next_beat_at;
                let preceding = self.last_beat_at.map(|last| at - last);
                self.beats.push_back((at, preceding));
                self.last_beat_at = Some(at);
                self.next_beat_at += self.rr_secs(self.beat_index);
                self.beat_index += 1;
            }
            while self.beats.front().is_some_and(|&(b, _)| b < t - BEAT_REACH_SECS) {
                self.beats.pop_front();
            }

            // A beat whose R lands on this sample completes its RR interval.
            let r_hits = self
                .beats
                .iter()
                .filter(|(at, _)| *at >= t && *at < t + 1.0 / fs)
                .filter_map(|(_, rr)| rr.map(|rr| rr * 1000.0));
            rr_ms.extend(r_hits);

            samples.push(self.value_at(t));
            last_t = t;
            self.next_sample += 1;
        }

        let timestamp = (last_t * NANOS_PER_SECOND).round() as u64;
        let bpm = if rr_ms.is_empty() {
            self.config.base_bpm
        } else {
            60_000.0 / (rr_ms.iter().sum::<f64>() / rr_ms.len() as f64)
        };

        SyntheticFrame {
            ecg: Frame::ecg(timestamp, samples),
            heart_rate: Frame::heart_rate(timestamp, bpm.round(), &rr_ms),
        }
    }
}

/// Sensor source backed by [`SyntheticEcg`].
pub struct SimulatedSensor {
    config: SimulatedConfig,
    subscribers: SharedSubscribers,
    link: Link,
    task: Option<JoinHandle<()>>,
}

impl SimulatedSensor {
    pub fn new(config: SimulatedConfig) -> Self {
        Self {
            config,
            subscribers: SharedSubscribers::default(),
            link: Link::new(),
            task: None,
        }
    }

    fn spawn_generator(&mut self) {
        let config = self.config.clone();
        let subscribers = self.subscribers.clone();
        let link = self.link.clone();

        self.task = Some(tokio::spawn(async move {
            let frame_secs = config.samples_per_frame as f64 / config.sampling_rate_hz;
            let mut ticker = tokio::time::interval(Duration::from_secs_f64(frame_secs));
            let mut generator = SyntheticEcg::new(config.clone());
            let mut sent: u64 = 0;

            loop {
                if config.realtime {
                    ticker.tick().await;
                } else {
                    tokio::task::yield_now().await;
                }

                let frame = generator.next_frame();
                {
                    let subs = lock_subscribers(&subscribers);
                    subs.deliver(frame.ecg);
                    subs.deliver(frame.heart_rate);
                }
                sent += 1;

                if config.frame_limit.is_some_and(|limit| sent >= limit) {
                    tracing::info!(frames = sent, "simulated sensor dropping the link");
                    link.drop_link();
                    break;
                }
            }
        }));
    }
}

impl Drop for SimulatedSensor {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl SensorSource for SimulatedSensor {
    fn name(&self) -> &str {
        "simulated"
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    fn on_disconnect(&mut self, callback: DisconnectCallback) {
        self.link.set_callback(callback);
    }

    async fn subscribe(&mut self, channel: Channel, queue: FrameSender) -> Result<(), SensorError> {
        if !self.is_connected() {
            return Err(SensorError::NotConnected);
        }
        if let (Channel::Ecg, Some(code)) = (channel, self.config.reject_code) {
            return Err(SensorError::StartRejected {
                channel,
                code,
                message: "requested ECG setting not supported".to_string(),
            });
        }

        lock_subscribers(&self.subscribers).set(channel, queue);
        if self.task.is_none() {
            self.spawn_generator();
        }
        tracing::debug!(%channel, "simulated sensor streaming");
        Ok(())
    }

    async fn unsubscribe(&mut self, channel: Channel) -> Result<(), SensorError> {
        let now_empty = {
            let mut subs = lock_subscribers(&self.subscribers);
            if !subs.remove(channel) {
                return Err(SensorError::NotSubscribed(channel));
            }
            subs.is_empty()
        };

        if now_empty {
            if let Some(task) = self.task.take() {
                task.abort();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::features::{detect_peaks, PeakConfig};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn offline_config() -> SimulatedConfig {
        SimulatedConfig {
            realtime: false,
            hrv_fraction: 0.0,
            ..SimulatedConfig::default()
        }
    }

    #[test]
    fn test_frame_timestamps_advance() {
        let mut generator = SyntheticEcg::new(offline_config());
        let first = generator.next_frame();
        let second = generator.next_frame();

        assert_eq!(first.ecg.len(), 50);
        // Last sample of the first one-second frame sits at 0.98 s.
        assert_eq!(first.ecg.timestamp, 980_000_000);
        assert_eq!(second.ecg.timestamp, 1_980_000_000);
    }

    #[test]
    fn test_generated_trace_has_detectable_beats() {
        let mut generator = SyntheticEcg::new(offline_config());
        let samples: Vec<f64> = (0..10)
            .flat_map(|_| generator.next_frame().ecg.payload)
            .collect();

        let peaks = detect_peaks(&samples, &PeakConfig::default());
        // 66 bpm over ten seconds, first beat at 0.5 s.
        assert!(peaks.r_peaks.len() >= 10 && peaks.r_peaks.len() <= 11);
        assert!(!peaks.q_peaks.is_empty());
        assert!(!peaks.s_peaks.is_empty());
    }

    #[test]
    fn test_heart_rate_frames_report_rr() {
        let mut generator = SyntheticEcg::new(offline_config());
        let rr: Vec<f64> = (0..5)
            .flat_map(|_| generator.next_frame().heart_rate.rr_secs())
            .collect();

        assert!(!rr.is_empty());
        for value in rr {
            assert!((value - 60.0 / 66.0).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn test_rejected_start() {
        let mut sensor = SimulatedSensor::new(SimulatedConfig {
            reject_code: Some(3),
            ..offline_config()
        });
        let (tx, _rx) = crate::pipeline::queue::frame_queue();

        let err = sensor.subscribe(Channel::Ecg, tx).await.unwrap_err();
        assert!(matches!(err, SensorError::StartRejected { code: 3, .. }));
    }

    #[tokio::test]
    async fn test_frame_limit_disconnects() {
        let mut sensor = SimulatedSensor::new(SimulatedConfig {
            frame_limit: Some(3),
            ..offline_config()
        });
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        sensor.on_disconnect(Box::new(move || flag.store(true, Ordering::SeqCst)));

        let (tx, mut rx) = crate::pipeline::queue::frame_queue();
        sensor.subscribe(Channel::Ecg, tx).await.unwrap();

        for _ in 0..3 {
            assert!(matches!(rx.dequeue().await, crate::sensor::QueueItem::Frame(_)));
        }
        for _ in 0..10 {
            if fired.load(Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(fired.load(Ordering::SeqCst));
        assert!(!sensor.is_connected());
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_channel() {
        let mut sensor = SimulatedSensor::new(offline_config());
        let err = sensor.unsubscribe(Channel::HeartRate).await.unwrap_err();
        assert!(matches!(err, SensorError::NotSubscribed(Channel::HeartRate)));
    }
}
