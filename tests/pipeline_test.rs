//! Integration tests for the streaming session

use async_trait::async_trait;
use ecg_sonify::core::Layer;
use ecg_sonify::pipeline::{FrameSender, Session, SessionOptions, Shutdown, ShutdownReason};
use ecg_sonify::playback::{
    EngineCall, MemoryEngine, PlaybackConfig, PlaybackScheduler, TerminationPolicy,
};
use ecg_sonify::sensor::{
    Channel, DisconnectCallback, Frame, ReplayConfig, ReplaySensor, SensorError, SensorSource,
    SimulatedConfig, SimulatedSensor,
};
use ecg_sonify::stats::create_shared_stats;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn playback(policy: TerminationPolicy) -> PlaybackConfig {
    let mut config = PlaybackConfig {
        policy,
        ..PlaybackConfig::default()
    };
    config.drone.enabled = false;
    config
}

fn memory_scheduler(policy: TerminationPolicy) -> (Arc<MemoryEngine>, PlaybackScheduler) {
    let engine = Arc::new(MemoryEngine::new());
    let scheduler = PlaybackScheduler::new(engine.clone(), playback(policy));
    (engine, scheduler)
}

fn finishing_options() -> SessionOptions {
    SessionOptions {
        finish_pending: true,
        ..SessionOptions::default()
    }
}

fn simulated(frames: Option<u64>) -> SimulatedSensor {
    SimulatedSensor::new(SimulatedConfig {
        realtime: false,
        frame_limit: frames,
        ..SimulatedConfig::default()
    })
}

#[tokio::test]
async fn test_simulated_session_plays_every_layer() {
    let session = Session::new(finishing_options(), create_shared_stats(), Shutdown::new());
    let (engine, mut scheduler) = memory_scheduler(TerminationPolicy::Wrap);
    let mut sensor = simulated(Some(40));

    let summary = tokio::time::timeout(
        Duration::from_secs(10),
        session.run(&mut sensor, &mut scheduler),
    )
    .await
    .expect("session did not finish")
    .expect("session failed");

    assert_eq!(summary.ended_by, Some(ShutdownReason::SensorDisconnected));
    assert_eq!(summary.stats.ecg_frames, 40);
    assert_eq!(summary.stats.windows_analysed, 4);
    assert!(summary.stats.qrs_complexes > 0);

    let sequences: Vec<u64> = summary.reports.iter().map(|r| r.sequence).collect();
    assert_eq!(sequences, vec![0, 1, 2, 3]);
    assert!(summary.reports.iter().all(|r| !r.is_empty()));

    for layer in Layer::ALL {
        assert!(engine.plays(layer) >= 1, "{layer} never played");
    }
    assert_eq!(engine.count(&EngineCall::Stop), 1);
}

#[tokio::test]
async fn test_operator_quit_unsubscribes_and_stops() {
    let shutdown = Shutdown::new();
    let session = Session::new(SessionOptions::default(), create_shared_stats(), shutdown.clone());
    let (engine, mut scheduler) = memory_scheduler(TerminationPolicy::HaltAtEnd);
    let mut sensor = simulated(None);

    let quit = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        quit.trigger(ShutdownReason::UserQuit);
    });

    let summary = tokio::time::timeout(
        Duration::from_secs(10),
        session.run(&mut sensor, &mut scheduler),
    )
    .await
    .expect("session did not finish")
    .expect("session failed");

    assert_eq!(summary.ended_by, Some(ShutdownReason::UserQuit));
    assert!(summary.stats.ecg_frames > 0);
    // Analyses cut short by the quit are cancelled, not failed.
    assert_eq!(summary.stats.failed_tasks, 0);
    assert!(sensor.is_connected());
    // Both channels were released on the way out.
    assert!(matches!(
        sensor.unsubscribe(Channel::Ecg).await,
        Err(SensorError::NotSubscribed(Channel::Ecg))
    ));
    assert_eq!(engine.count(&EngineCall::Stop), 1);
}

#[tokio::test]
async fn test_recorded_session_replays() {
    let dir = TempDir::new().unwrap();
    let options = SessionOptions {
        record_dir: Some(dir.path().to_path_buf()),
        ..finishing_options()
    };
    let session = Session::new(options, create_shared_stats(), Shutdown::new());
    let (_engine, mut scheduler) = memory_scheduler(TerminationPolicy::Wrap);
    let mut sensor = simulated(Some(20));

    let recorded = session.run(&mut sensor, &mut scheduler).await.unwrap();
    let (ecg_path, rr_path) = recorded.recording.clone().expect("no recording made");
    assert!(ecg_path.exists());
    assert!(rr_path.exists());

    let mut replay = ReplaySensor::open(ReplayConfig {
        ecg_path,
        rr_path: Some(rr_path),
        realtime: false,
    })
    .unwrap();
    assert_eq!(
        replay.frames().iter().filter(|f| f.channel == Channel::Ecg).count(),
        20
    );

    let replay_session = Session::new(finishing_options(), create_shared_stats(), Shutdown::new());
    let (engine, mut scheduler) = memory_scheduler(TerminationPolicy::Wrap);
    let replayed = tokio::time::timeout(
        Duration::from_secs(10),
        replay_session.run(&mut replay, &mut scheduler),
    )
    .await
    .expect("replay did not finish")
    .unwrap();

    assert_eq!(replayed.ended_by, Some(ShutdownReason::SensorDisconnected));
    assert_eq!(replayed.stats.ecg_frames, 20);
    assert_eq!(replayed.reports.len(), 2);
    assert_eq!(
        replayed.stats.qrs_complexes,
        recorded.stats.qrs_complexes
    );
    assert!(engine.plays(Layer::Tonal) >= 1);
}

#[tokio::test]
async fn test_ecg_only_replay_derives_rr_from_peaks() {
    let dir = TempDir::new().unwrap();
    let options = SessionOptions {
        record_dir: Some(dir.path().to_path_buf()),
        ..finishing_options()
    };
    let session = Session::new(options, create_shared_stats(), Shutdown::new());
    let (_engine, mut scheduler) = memory_scheduler(TerminationPolicy::Wrap);
    let recorded = session.run(&mut simulated(Some(10)), &mut scheduler).await.unwrap();
    let (ecg_path, _) = recorded.recording.unwrap();

    let mut replay = ReplaySensor::open(ReplayConfig {
        ecg_path,
        rr_path: None,
        realtime: false,
    })
    .unwrap();
    assert_eq!(replay.channels(), vec![Channel::Ecg]);

    let replay_session = Session::new(finishing_options(), create_shared_stats(), Shutdown::new());
    let (engine, mut scheduler) = memory_scheduler(TerminationPolicy::Wrap);
    let summary = replay_session.run(&mut replay, &mut scheduler).await.unwrap();

    assert_eq!(summary.stats.hr_frames, 0);
    assert_eq!(summary.reports.len(), 1);
    let rr = summary.reports[0].rr_secs.as_ref().expect("no RR from ECG");
    assert!(rr.mean > 0.7 && rr.mean < 1.1);
    assert!(engine.plays(Layer::Gong) >= 1);
}

#[tokio::test]
async fn test_offline_playback_loops_until_deadline() {
    let dir = TempDir::new().unwrap();
    let options = SessionOptions {
        record_dir: Some(dir.path().to_path_buf()),
        ..finishing_options()
    };
    let session = Session::new(options, create_shared_stats(), Shutdown::new());
    let (_engine, mut scheduler) = memory_scheduler(TerminationPolicy::Wrap);
    let recorded = session.run(&mut simulated(Some(20)), &mut scheduler).await.unwrap();
    let (ecg_path, rr_path) = recorded.recording.unwrap();

    let replay = ReplaySensor::open(ReplayConfig {
        ecg_path,
        rr_path: Some(rr_path),
        realtime: false,
    })
    .unwrap();

    let shutdown = Shutdown::new();
    let offline = Session::new(SessionOptions::default(), create_shared_stats(), shutdown.clone());
    let mut playback_config = playback(TerminationPolicy::Wrap);
    playback_config.tempo = 100.0;
    let engine = Arc::new(MemoryEngine::new());
    let mut scheduler = PlaybackScheduler::new(engine.clone(), playback_config);

    let deadline = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        deadline.trigger(ShutdownReason::DurationElapsed);
    });

    let summary = offline
        .run_offline(replay.frames(), true, &mut scheduler)
        .await
        .unwrap();

    assert_eq!(summary.ended_by, Some(ShutdownReason::DurationElapsed));
    assert_eq!(summary.reports.len(), 2);
    assert!(summary.stats.events_scheduled > 0);
    // At tempo 100 a chime fires every 17.5 ms, so the wrapped sequence
    // comes round more than once before the deadline.
    assert!(engine.plays(Layer::Chime) > summary.reports.len() * 2);
    assert_eq!(engine.count(&EngineCall::Stop), 1);
}

/// Sensor that queues a burst of HR frames and a single ECG frame, then
/// drops the link straight away.
struct BurstSensor {
    connected: bool,
    callback: Option<DisconnectCallback>,
    hr: Option<FrameSender>,
    ecg: Option<FrameSender>,
}

impl BurstSensor {
    fn new() -> Self {
        Self {
            connected: true,
            callback: None,
            hr: None,
            ecg: None,
        }
    }
}

#[async_trait]
impl SensorSource for BurstSensor {
    fn name(&self) -> &str {
        "burst"
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn on_disconnect(&mut self, callback: DisconnectCallback) {
        self.callback = Some(callback);
    }

    async fn subscribe(&mut self, channel: Channel, queue: FrameSender) -> Result<(), SensorError> {
        match channel {
            Channel::Ecg => self.ecg = Some(queue),
            Channel::HeartRate => self.hr = Some(queue),
        }
        if let (Some(ecg), Some(hr)) = (&self.ecg, &self.hr) {
            ecg.enqueue(Frame::ecg(1, vec![0.0; 50]));
            for ts in 0..500 {
                hr.enqueue(Frame::heart_rate(ts, 60.0, &[1000.0]));
            }
            self.connected = false;
            if let Some(callback) = self.callback.take() {
                callback();
            }
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, channel: Channel) -> Result<(), SensorError> {
        Err(SensorError::NotSubscribed(channel))
    }
}

#[tokio::test]
async fn test_ecg_quit_ends_session_with_hr_pending() {
    let session = Session::new(SessionOptions::default(), create_shared_stats(), Shutdown::new());
    let (_engine, mut scheduler) = memory_scheduler(TerminationPolicy::HaltAtEnd);
    let mut sensor = BurstSensor::new();

    let summary = tokio::time::timeout(
        Duration::from_secs(5),
        session.run(&mut sensor, &mut scheduler),
    )
    .await
    .expect("consumer waited on the HR queue")
    .unwrap();

    assert_eq!(summary.ended_by, Some(ShutdownReason::SensorDisconnected));
    assert_eq!(summary.stats.ecg_frames, 1);
    assert!(summary.reports.is_empty());
}
