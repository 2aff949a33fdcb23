//! Replay of a recorded session export.
//!
//! Streams the frames of an `ecg_*.csv` / `rr_*.csv` pair in timestamp order,
//! either paced by the recorded timestamps or as fast as the consumer takes
//! them. When the recording runs out the link drops, which ends the session
//! the same way a real sensor disconnect would.

use crate::export::{read_ecg_frames, read_rr_frames, ExportError};
use crate::pipeline::queue::FrameSender;
use crate::sensor::types::{Channel, Frame};
use crate::sensor::{
    lock_subscribers, DisconnectCallback, Link, SensorError, SensorSource, SharedSubscribers,
};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Where to read a recording from.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub ecg_path: PathBuf,
    /// RR export; without it the replay only streams ECG
    pub rr_path: Option<PathBuf>,
    /// Sleep between frames according to their recorded timestamps
    pub realtime: bool,
}

impl From<ExportError> for SensorError {
    fn from(err: ExportError) -> Self {
        match err {
            ExportError::Io { path, source } if source.kind() == std::io::ErrorKind::NotFound => {
                SensorError::NotFound(path.display().to_string())
            }
            ExportError::Io { source, .. } => SensorError::Io(source),
            ExportError::Malformed {
                path,
                line,
                message,
            } => SensorError::Malformed {
                path: path.display().to_string(),
                line,
                message,
            },
            ExportError::Serialize(e) => SensorError::Io(std::io::Error::other(e)),
        }
    }
}

/// Sensor source that plays back a recording.
pub struct ReplaySensor {
    name: String,
    config: ReplayConfig,
    /// All frames of both channels ordered by timestamp
    frames: Vec<Frame>,
    subscribers: SharedSubscribers,
    link: Link,
    task: Option<JoinHandle<()>>,
}

impl ReplaySensor {
    /// Load the recording. A missing file reports the sensor as not found.
    pub fn open(config: ReplayConfig) -> Result<Self, SensorError> {
        let mut frames = read_ecg_frames(&config.ecg_path)?;
        if let Some(ref rr_path) = config.rr_path {
            frames.extend(read_rr_frames(rr_path)?);
        }
        // Stable sort keeps ECG ahead of HR for equal timestamps.
        frames.sort_by_key(|f| f.timestamp);

        let name = config
            .ecg_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "replay".to_string());

        tracing::info!(
            recording = %config.ecg_path.display(),
            frames = frames.len(),
            "loaded recording"
        );

        Ok(Self {
            name,
            config,
            frames,
            subscribers: SharedSubscribers::default(),
            link: Link::new(),
            task: None,
        })
    }

    /// Frames in the recording.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    fn spawn_player(&mut self) {
        let frames = self.frames.clone();
        let realtime = self.config.realtime;
        let subscribers = self.subscribers.clone();
        let link = self.link.clone();

        self.task = Some(tokio::spawn(async move {
            let mut previous: Option<u64> = None;
            for frame in frames {
                match previous {
                    Some(prev) if realtime && frame.timestamp > prev => {
                        tokio::time::sleep(Duration::from_nanos(frame.timestamp - prev)).await;
                    }
                    _ => tokio::task::yield_now().await,
                }
                previous = Some(frame.timestamp);
                lock_subscribers(&subscribers).deliver(frame);
            }
            tracing::info!("recording finished");
            link.drop_link();
        }));
    }
}

impl Drop for ReplaySensor {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl SensorSource for ReplaySensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    fn channels(&self) -> Vec<Channel> {
        if self.config.rr_path.is_some() {
            vec![Channel::Ecg, Channel::HeartRate]
        } else {
            vec![Channel::Ecg]
        }
    }

    fn on_disconnect(&mut self, callback: DisconnectCallback) {
        self.link.set_callback(callback);
    }

    async fn subscribe(&mut self, channel: Channel, queue: FrameSender) -> Result<(), SensorError> {
        if !self.is_connected() {
            return Err(SensorError::NotConnected);
        }
        lock_subscribers(&self.subscribers).set(channel, queue);
        if self.task.is_none() {
            self.spawn_player();
        }
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
    use crate::pipeline::queue::FrameQueues;
    use crate::sensor::QueueItem;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn write_recording(dir: &TempDir) -> ReplayConfig {
        let ecg_path = dir.path().join("ecg_test.csv");
        let rr_path = dir.path().join("rr_test.csv");
        std::fs::write(&ecg_path, "time,ecg_samples\n100,1 2 3\n300,4 5 6\n").unwrap();
        std::fs::write(&rr_path, "time,rr_value\n200,0.9\n").unwrap();
        ReplayConfig {
            ecg_path,
            rr_path: Some(rr_path),
            realtime: false,
        }
    }

    #[test]
    fn test_missing_recording_is_not_found() {
        let err = ReplaySensor::open(ReplayConfig {
            ecg_path: PathBuf::from("/nonexistent/ecg.csv"),
            rr_path: None,
            realtime: false,
        })
        .err()
        .unwrap();
        assert!(matches!(err, SensorError::NotFound(_)));
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_frames_merged_in_time_order() {
        let dir = TempDir::new().unwrap();
        let sensor = ReplaySensor::open(write_recording(&dir)).unwrap();
        let stamps: Vec<u64> = sensor.frames().iter().map(|f| f.timestamp).collect();
        assert_eq!(stamps, vec![100, 200, 300]);
        assert_eq!(
            sensor.frames().iter().filter(|f| f.channel == Channel::Ecg).count(),
            2
        );
    }

    #[tokio::test]
    async fn test_replay_streams_then_disconnects() {
        let dir = TempDir::new().unwrap();
        let mut sensor = ReplaySensor::open(write_recording(&dir)).unwrap();
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = dropped.clone();
        sensor.on_disconnect(Box::new(move || flag.store(true, Ordering::SeqCst)));

        let (queues, mut ecg_rx, mut hr_rx) = FrameQueues::new();
        sensor.subscribe(Channel::Ecg, queues.ecg.clone()).await.unwrap();
        sensor.subscribe(Channel::HeartRate, queues.hr.clone()).await.unwrap();

        for expected in [100, 300] {
            match ecg_rx.dequeue().await {
                QueueItem::Frame(frame) => assert_eq!(frame.timestamp, expected),
                QueueItem::Quit => panic!("unexpected quit"),
            }
        }
        match hr_rx.dequeue().await {
            QueueItem::Frame(frame) => assert_eq!(frame.rr_secs(), vec![0.9]),
            QueueItem::Quit => panic!("unexpected quit"),
        }

        for _ in 0..10 {
            if dropped.load(Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(dropped.load(Ordering::SeqCst));
        assert!(!sensor.is_connected());
    }
}
