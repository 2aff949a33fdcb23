//! Session lifecycle.
//!
//! A live session runs two futures on the current-thread runtime:
//!
//! - the producer subscribes the sensor's channels to the frame queues, then
//!   waits on the shutdown flag and pushes QUIT onto both queues
//! - the consumer drains the queues into the window manager and hands every
//!   completed window pair to a supervised blocking task, applying finished
//!   analyses to the playback scheduler as they come back
//!
//! The consumer stops as soon as it reads QUIT from the ECG queue. Analyses
//! still in flight at that point are cancelled unless the session was asked
//! to finish them (replay of a finite recording).

use crate::config::Config;
use crate::core::features::{analyze_window, AnalysisConfig, FeatureSet, RrSource};
use crate::core::mapping::{LayerSequences, Mapper, MappingConfig};
use crate::core::report::{ReportBuilder, WindowReport};
use crate::core::windowing::{WindowManager, WindowPair};
use crate::export::{save_json, ExportError, SessionRecorder};
use crate::pipeline::queue::{FrameQueues, FrameReceiver, Shutdown, ShutdownReason};
use crate::playback::{AudioError, PlaybackScheduler};
use crate::sensor::{Channel, Frame, QueueItem, SensorError, SensorSource};
use crate::stats::{SharedSessionStats, StatsSnapshot};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Errors that end a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Sensor(#[from] SensorError),

    #[error("audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("export error: {0}")]
    Export(#[from] ExportError),
}

impl SessionError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            SessionError::Sensor(e) => e.exit_code(),
            SessionError::Audio(_) | SessionError::Export(_) => 1,
        }
    }
}

/// Per-session settings, usually taken from [`Config`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub analysis: AnalysisConfig,
    /// Frames per channel in one window
    pub batch_size: usize,
    pub mapping: MappingConfig,
    /// Record incoming frames as CSV into this directory
    pub record_dir: Option<PathBuf>,
    /// Keep a report for every analysed window
    pub keep_reports: bool,
    /// On QUIT, analyse buffered frames and wait for running analyses
    /// instead of cancelling them
    pub finish_pending: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            analysis: config.analysis.analysis_config(),
            batch_size: config.analysis.batch_size,
            mapping: config.mapping.clone(),
            record_dir: config
                .export
                .enabled
                .then(|| config.export.export_path.clone()),
            keep_reports: config.export.window_reports,
            finish_pending: false,
        }
    }

    /// Analysis settings for a source that does or does not stream HR. Without
    /// an HR channel the RR intervals have to come from the ECG.
    fn analysis_for(&self, with_hr: bool) -> AnalysisConfig {
        let mut analysis = self.analysis;
        if !with_hr && analysis.rr_source == RrSource::HeartRate {
            analysis.rr_source = RrSource::Ecg;
        }
        analysis
    }

    fn window_manager(&self, with_hr: bool) -> WindowManager {
        if with_hr {
            WindowManager::new(self.batch_size)
        } else {
            WindowManager::ecg_only(self.batch_size)
        }
    }
}

/// What a finished session produced.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub ended_by: Option<ShutdownReason>,
    pub stats: StatsSnapshot,
    /// Window reports in sequence order
    pub reports: Vec<WindowReport>,
    /// ECG and RR files of the CSV recording, if one was made
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording: Option<(PathBuf, PathBuf)>,
}

impl SessionSummary {
    /// Write the window reports to `windows_<session>.json` in `dir`.
    /// Returns `None` when there is nothing to write.
    pub fn save_reports(&self, dir: &Path) -> Result<Option<PathBuf>, ExportError> {
        if self.reports.is_empty() {
            return Ok(None);
        }
        let path = dir.join(format!("windows_{}.json", self.session_id));
        save_json(&path, &self.reports)?;
        Ok(Some(path))
    }
}

/// A whole recording analysed as one batch.
#[derive(Debug, Clone, Default)]
pub struct RecordingAnalysis {
    /// Features of every window, concatenated in window order
    pub features: FeatureSet,
    pub reports: Vec<WindowReport>,
    pub windows: usize,
}

/// Drives one session from sensor to scheduler.
pub struct Session {
    options: SessionOptions,
    stats: SharedSessionStats,
    shutdown: Shutdown,
    reports: ReportBuilder,
}

impl Session {
    pub fn new(options: SessionOptions, stats: SharedSessionStats, shutdown: Shutdown) -> Self {
        Self {
            options,
            stats,
            shutdown,
            reports: ReportBuilder::new(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.reports.session_id()
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn stats(&self) -> &SharedSessionStats {
        &self.stats
    }

    /// Stream from `sensor` until the shutdown flag is set.
    ///
    /// A sensor that refuses to start ends the session with an error; a
    /// disconnect ends it like an operator quit. The scheduler is stopped on
    /// every path out of this function.
    pub async fn run<S>(
        &self,
        sensor: &mut S,
        scheduler: &mut PlaybackScheduler,
    ) -> Result<SessionSummary, SessionError>
    where
        S: SensorSource + ?Sized,
    {
        let result = self.stream(sensor, scheduler).await;
        scheduler.stop();
        result
    }

    async fn stream<S>(
        &self,
        sensor: &mut S,
        scheduler: &mut PlaybackScheduler,
    ) -> Result<SessionSummary, SessionError>
    where
        S: SensorSource + ?Sized,
    {
        scheduler.start()?;

        let recorder = match self.options.record_dir {
            Some(ref dir) => {
                let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string();
                Some(SessionRecorder::create(dir, &stamp)?)
            }
            None => None,
        };

        let channels = sensor.channels();
        let with_hr = channels.contains(&Channel::HeartRate);

        let shutdown = self.shutdown.clone();
        sensor.on_disconnect(Box::new(move || {
            if shutdown.trigger(ShutdownReason::SensorDisconnected) {
                info!("sensor disconnected");
            }
        }));

        info!(
            session = %self.session_id(),
            sensor = sensor.name(),
            with_hr,
            "session starting"
        );

        let (queues, ecg_rx, hr_rx) = FrameQueues::new();
        let consumer = Consumer {
            analysis: self.options.analysis_for(with_hr),
            windows: self.options.window_manager(with_hr),
            mapper: Arc::new(Mapper::new(self.options.mapping.clone())),
            reports: self.reports.clone(),
            keep_reports: self.options.keep_reports,
            finish_pending: self.options.finish_pending,
            stats: self.stats.clone(),
            scheduler,
            recorder,
            tasks: JoinSet::new(),
            latest_applied: None,
            collected: Vec::new(),
        };

        let (produced, outcome) = tokio::join!(
            produce(sensor, &queues, &channels, &self.shutdown),
            consumer.run(ecg_rx, hr_rx),
        );
        produced?;

        let ended_by = self.shutdown.reason();
        info!(
            session = %self.session_id(),
            reason = ?ended_by,
            windows = outcome.reports.len(),
            "session finished"
        );

        Ok(SessionSummary {
            session_id: self.session_id(),
            ended_by,
            stats: self.stats.snapshot(),
            reports: outcome.reports,
            recording: outcome.recording,
        })
    }

    /// Analyse a finite recording window by window and merge the features.
    ///
    /// Trailing frames that do not fill a window are analysed as a short
    /// final window.
    pub fn analyze_recording(&self, frames: &[Frame], with_hr: bool) -> RecordingAnalysis {
        let analysis_config = self.options.analysis_for(with_hr);
        let mut windows = self.options.window_manager(with_hr);

        for frame in frames {
            match frame.channel {
                Channel::Ecg => self.stats.record_ecg_frame(),
                Channel::HeartRate => self.stats.record_hr_frame(),
            }
            windows.process_frame(frame.clone());
        }
        windows.flush();

        let mut result = RecordingAnalysis::default();
        for pair in windows.take_completed_windows() {
            let analysis = analyze_window(&pair, &analysis_config);
            let features = &analysis.features;
            self.stats.record_window(
                features.qrs_durations.len() as u64,
                analysis.peaks.r_peaks.is_empty(),
            );

            result.features.qrs_durations.extend_from_slice(&features.qrs_durations);
            result.features.rr_intervals.extend_from_slice(&features.rr_intervals);
            result.features.r_amplitudes.extend_from_slice(&features.r_amplitudes);
            result.features.s_amplitudes.extend_from_slice(&features.s_amplitudes);
            if self.options.keep_reports {
                result.reports.push(self.reports.build(&pair, &analysis));
            }
            result.windows += 1;
        }
        result
    }

    /// Play a whole recording as one batch until the shutdown flag is set.
    pub async fn run_offline(
        &self,
        frames: &[Frame],
        with_hr: bool,
        scheduler: &mut PlaybackScheduler,
    ) -> Result<SessionSummary, SessionError> {
        let result = self.play_recording(frames, with_hr, scheduler).await;
        scheduler.stop();
        result
    }

    async fn play_recording(
        &self,
        frames: &[Frame],
        with_hr: bool,
        scheduler: &mut PlaybackScheduler,
    ) -> Result<SessionSummary, SessionError> {
        let recording = self.analyze_recording(frames, with_hr);
        if recording.features.is_empty() {
            warn!("no cardiac cycles found in recording");
        }

        scheduler.start()?;
        let sequences = Mapper::new(self.options.mapping.clone()).map(&recording.features);
        let scheduled = scheduler.schedule(sequences);
        self.stats.record_events_scheduled(scheduled as u64);
        info!(
            session = %self.session_id(),
            windows = recording.windows,
            events = scheduled,
            "offline playback started"
        );

        let reason = self.shutdown.wait().await;
        info!(%reason, "offline playback finished");

        Ok(SessionSummary {
            session_id: self.session_id(),
            ended_by: Some(reason),
            stats: self.stats.snapshot(),
            reports: recording.reports,
            recording: None,
        })
    }
}

/// Subscribe, wait for shutdown, then release the consumer. QUIT is queued
/// on both channels whatever the outcome.
async fn produce<S>(
    sensor: &mut S,
    queues: &FrameQueues,
    channels: &[Channel],
    shutdown: &Shutdown,
) -> Result<(), SensorError>
where
    S: SensorSource + ?Sized,
{
    let result = stream_until_shutdown(sensor, queues, channels, shutdown).await;
    queues.quit_all();
    result
}

async fn stream_until_shutdown<S>(
    sensor: &mut S,
    queues: &FrameQueues,
    channels: &[Channel],
    shutdown: &Shutdown,
) -> Result<(), SensorError>
where
    S: SensorSource + ?Sized,
{
    let mut subscribed = Vec::with_capacity(channels.len());
    for &channel in channels {
        if let Err(e) = sensor.subscribe(channel, queues.sender(channel).clone()).await {
            error!(%channel, "failed to start streaming: {e}");
            unsubscribe_all(sensor, &subscribed).await;
            return Err(e);
        }
        debug!(%channel, "subscribed");
        subscribed.push(channel);
    }

    let reason = shutdown.wait().await;
    info!(%reason, "stopping stream");

    if sensor.is_connected() {
        unsubscribe_all(sensor, &subscribed).await;
    }
    Ok(())
}

async fn unsubscribe_all<S>(sensor: &mut S, channels: &[Channel])
where
    S: SensorSource + ?Sized,
{
    for &channel in channels {
        if let Err(e) = sensor.unsubscribe(channel).await {
            warn!(%channel, "failed to unsubscribe: {e}");
        }
    }
}

/// Output of one background analysis.
struct WindowResult {
    sequence: u64,
    qrs_complexes: usize,
    empty: bool,
    sequences: LayerSequences,
    report: WindowReport,
}

fn analyse(
    pair: WindowPair,
    config: AnalysisConfig,
    mapper: &Mapper,
    reports: &ReportBuilder,
) -> WindowResult {
    let analysis = analyze_window(&pair, &config);
    let report = reports.build(&pair, &analysis);
    WindowResult {
        sequence: analysis.sequence,
        qrs_complexes: analysis.features.qrs_durations.len(),
        empty: analysis.peaks.r_peaks.is_empty(),
        sequences: mapper.map(&analysis.features),
        report,
    }
}

struct ConsumerOutcome {
    reports: Vec<WindowReport>,
    recording: Option<(PathBuf, PathBuf)>,
}

struct Consumer<'a> {
    analysis: AnalysisConfig,
    windows: WindowManager,
    mapper: Arc<Mapper>,
    reports: ReportBuilder,
    keep_reports: bool,
    finish_pending: bool,
    stats: SharedSessionStats,
    scheduler: &'a mut PlaybackScheduler,
    recorder: Option<SessionRecorder>,
    tasks: JoinSet<WindowResult>,
    /// Sequence of the newest analysis handed to the scheduler
    latest_applied: Option<u64>,
    collected: Vec<WindowReport>,
}

impl Consumer<'_> {
    async fn run(mut self, mut ecg_rx: FrameReceiver, mut hr_rx: FrameReceiver) -> ConsumerOutcome {
        let mut hr_open = true;

        loop {
            tokio::select! {
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.apply(joined);
                }
                item = ecg_rx.dequeue() => match item {
                    QueueItem::Frame(frame) => self.accept(frame),
                    QueueItem::Quit => {
                        debug!("QUIT on ECG queue");
                        break;
                    }
                },
                item = hr_rx.dequeue(), if hr_open => match item {
                    QueueItem::Frame(frame) => self.accept(frame),
                    QueueItem::Quit => hr_open = false,
                },
            }
        }

        self.finish().await
    }

    fn accept(&mut self, frame: Frame) {
        match frame.channel {
            Channel::Ecg => self.stats.record_ecg_frame(),
            Channel::HeartRate => self.stats.record_hr_frame(),
        }

        let failed = match self.recorder.as_mut() {
            Some(recorder) => recorder.record(&frame).err(),
            None => None,
        };
        if let Some(e) = failed {
            warn!("stopping CSV recording: {e}");
            self.recorder = None;
        }

        self.windows.process_frame(frame);
        self.spawn_completed();
    }

    fn spawn_completed(&mut self) {
        for pair in self.windows.take_completed_windows() {
            debug!(
                sequence = pair.sequence,
                ecg_frames = pair.ecg.frame_count(),
                hr_frames = pair.hr.frame_count(),
                "window complete"
            );
            let config = self.analysis;
            let mapper = self.mapper.clone();
            let reports = self.reports.clone();
            self.tasks
                .spawn_blocking(move || analyse(pair, config, &mapper, &reports));
        }
    }

    fn apply(&mut self, joined: Result<WindowResult, JoinError>) {
        let result = match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => return,
            Err(e) => {
                error!("window analysis failed: {e}");
                self.stats.record_failed_task();
                return;
            }
        };

        self.stats
            .record_window(result.qrs_complexes as u64, result.empty);
        if self.keep_reports {
            self.collected.push(result.report);
        }

        if self
            .latest_applied
            .is_some_and(|latest| result.sequence <= latest)
        {
            debug!(sequence = result.sequence, "discarding stale analysis");
            self.stats.record_stale_result();
            return;
        }
        self.latest_applied = Some(result.sequence);

        let scheduled = self.scheduler.schedule(result.sequences);
        self.stats.record_events_scheduled(scheduled as u64);
        debug!(
            sequence = result.sequence,
            qrs = result.qrs_complexes,
            events = scheduled,
            "window applied"
        );
    }

    async fn finish(mut self) -> ConsumerOutcome {
        if self.finish_pending {
            self.windows.flush();
            self.spawn_completed();
            while let Some(joined) = self.tasks.join_next().await {
                self.apply(joined);
            }
        } else {
            let in_flight = self.tasks.len();
            self.tasks.shutdown().await;
            if in_flight > 0 {
                debug!(in_flight, "cancelled pending analyses");
            }
        }

        let recording = self.recorder.take().map(|mut recorder| {
            if let Err(e) = recorder.flush() {
                warn!("failed to flush CSV recording: {e}");
            }
            let (ecg_rows, rr_rows) = recorder.rows();
            info!(ecg_rows, rr_rows, "recording saved");
            (recorder.ecg_path().to_path_buf(), recorder.rr_path().to_path_buf())
        });

        self.collected.sort_by_key(|r| r.sequence);
        ConsumerOutcome {
            reports: self.collected,
            recording,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::features::tests::single_cycle;
    use crate::core::mapping::Layer;
    use crate::playback::{MemoryEngine, PlaybackConfig, TerminationPolicy};
    use crate::sensor::simulated::{SimulatedConfig, SimulatedSensor};
    use crate::stats::create_shared_stats;
    use std::time::Duration;

    fn quiet_playback() -> PlaybackConfig {
        let mut config = PlaybackConfig {
            policy: TerminationPolicy::Wrap,
            ..PlaybackConfig::default()
        };
        config.drone.enabled = false;
        config
    }

    fn session(options: SessionOptions) -> Session {
        Session::new(options, create_shared_stats(), Shutdown::new())
    }

    fn fast_sensor(frames: u64) -> SimulatedSensor {
        SimulatedSensor::new(SimulatedConfig {
            realtime: false,
            frame_limit: Some(frames),
            ..SimulatedConfig::default()
        })
    }

    #[test]
    fn test_session_error_exit_codes() {
        assert_eq!(
            SessionError::from(SensorError::NotFound("strap".into())).exit_code(),
            4
        );
        let rejected = SensorError::StartRejected {
            channel: Channel::Ecg,
            code: 7,
            message: "busy".into(),
        };
        assert_eq!(SessionError::from(rejected).exit_code(), 7);
        assert_eq!(SessionError::from(AudioError::NoDevice).exit_code(), 1);
    }

    #[test]
    fn test_missing_hr_switches_rr_to_ecg() {
        let options = SessionOptions::default();
        assert_eq!(options.analysis_for(true).rr_source, RrSource::HeartRate);
        assert_eq!(options.analysis_for(false).rr_source, RrSource::Ecg);
    }

    #[test]
    fn test_analyze_recording_merges_windows() {
        let session = session(SessionOptions {
            batch_size: 1,
            ..SessionOptions::default()
        });
        let frames = vec![
            Frame::ecg(1_000_000_000, single_cycle()),
            Frame::heart_rate(1_000_000_000, 60.0, &[900.0]),
            Frame::ecg(3_000_000_000, single_cycle()),
            Frame::heart_rate(3_000_000_000, 60.0, &[800.0]),
        ];

        let result = session.analyze_recording(&frames, true);
        assert_eq!(result.windows, 2);
        assert_eq!(result.features.qrs_durations.len(), 2);
        assert_eq!(result.features.rr_intervals, vec![0.9, 0.8]);
        assert_eq!(result.reports.len(), 2);
        assert_eq!(session.stats().snapshot().windows_analysed, 2);
    }

    #[tokio::test]
    async fn test_rejected_start_is_fatal() {
        let session = session(SessionOptions::default());
        let engine = Arc::new(MemoryEngine::new());
        let mut scheduler = PlaybackScheduler::new(engine.clone(), quiet_playback());
        let mut sensor = SimulatedSensor::new(SimulatedConfig {
            reject_code: Some(3),
            ..SimulatedConfig::default()
        });

        let err = session.run(&mut sensor, &mut scheduler).await.unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert_eq!(engine.count(&crate::playback::EngineCall::Stop), 1);
    }

    #[tokio::test]
    async fn test_disconnect_ends_session_and_schedules_events() {
        let session = session(SessionOptions {
            finish_pending: true,
            ..SessionOptions::default()
        });
        let engine = Arc::new(MemoryEngine::new());
        let mut scheduler = PlaybackScheduler::new(engine.clone(), quiet_playback());
        let mut sensor = fast_sensor(30);

        let summary = tokio::time::timeout(
            Duration::from_secs(10),
            session.run(&mut sensor, &mut scheduler),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(summary.ended_by, Some(ShutdownReason::SensorDisconnected));
        assert_eq!(summary.stats.ecg_frames, 30);
        assert_eq!(summary.reports.len(), 3);
        assert!(summary.stats.events_scheduled > 0);
        assert!(engine.plays(Layer::Gong) >= 1);
        assert!(scheduler.active_layers().is_empty());
    }
}
