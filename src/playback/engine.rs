//! Audio engine seam.
//!
//! Triggers run on their own threads and only talk to the engine through the
//! `&self` setters below, so every engine must be `Send + Sync`.

use crate::core::mapping::Layer;
use crate::playback::DroneConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Audio engine errors.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("no audio output device available")]
    NoDevice,

    #[error("audio stream error: {0}")]
    Stream(String),

    #[error("engine '{0}' is not available in this build")]
    Unavailable(String),
}

/// Output side of the pipeline.
pub trait AudioEngine: Send + Sync {
    /// Engine identifier for logs.
    fn name(&self) -> &str;

    /// Acquire the output and begin rendering.
    fn start(&self) -> Result<(), AudioError>;

    /// Release the output. Safe to call more than once.
    fn stop(&self);

    fn set_frequency(&self, layer: Layer, hz: f64);

    fn set_amplitude(&self, layer: Layer, amplitude: f64);

    fn set_interval(&self, layer: Layer, secs: f64);

    /// Render one event on a layer with its current settings.
    fn play(&self, layer: Layer);

    /// Silence a layer's voice.
    fn release(&self, layer: Layer);

    /// Start the binaural drone.
    fn start_drone(&self, drone: &DroneConfig);
}

/// Engine shared between the scheduler and its trigger threads.
pub type SharedEngine = Arc<dyn AudioEngine>;

/// Engine that renders events as log lines.
#[derive(Debug, Default)]
pub struct LogEngine {
    running: AtomicBool,
}

impl LogEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl AudioEngine for LogEngine {
    fn name(&self) -> &str {
        "log"
    }

    fn start(&self) -> Result<(), AudioError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("log audio engine started");
        Ok(())
    }

    fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::info!("log audio engine stopped");
        }
    }

    fn set_frequency(&self, layer: Layer, hz: f64) {
        tracing::trace!(%layer, hz, "frequency");
    }

    fn set_amplitude(&self, layer: Layer, amplitude: f64) {
        tracing::trace!(%layer, amplitude, "amplitude");
    }

    fn set_interval(&self, layer: Layer, secs: f64) {
        tracing::trace!(%layer, secs, "interval");
    }

    fn play(&self, layer: Layer) {
        tracing::debug!(%layer, "play");
    }

    fn release(&self, layer: Layer) {
        tracing::debug!(%layer, "release");
    }

    fn start_drone(&self, drone: &DroneConfig) {
        tracing::info!(
            left_hz = drone.base_hz,
            right_hz = drone.base_hz + drone.beat_hz,
            "binaural drone started"
        );
    }
}

/// A call received by [`MemoryEngine`].
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Start,
    Stop,
    Frequency(Layer, f64),
    Amplitude(Layer, f64),
    Interval(Layer, f64),
    Play(Layer),
    Release(Layer),
    Drone { base_hz: f64, beat_hz: f64 },
}

/// Engine that records every call, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    calls: Mutex<Vec<EngineCall>>,
    changed: Condvar,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<EngineCall>> {
        match self.calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn push(&self, call: EngineCall) {
        self.lock().push(call);
        self.changed.notify_all();
    }

    /// All calls so far, in order.
    pub fn calls(&self) -> Vec<EngineCall> {
        self.lock().clone()
    }

    pub fn count(&self, call: &EngineCall) -> usize {
        self.lock().iter().filter(|c| *c == call).count()
    }

    pub fn plays(&self, layer: Layer) -> usize {
        self.count(&EngineCall::Play(layer))
    }

    pub fn releases(&self, layer: Layer) -> usize {
        self.count(&EngineCall::Release(layer))
    }

    /// Intervals programmed on a layer, in order.
    pub fn intervals(&self, layer: Layer) -> Vec<f64> {
        self.lock()
            .iter()
            .filter_map(|c| match c {
                EngineCall::Interval(l, secs) if *l == layer => Some(*secs),
                _ => None,
            })
            .collect()
    }

    /// Frequencies programmed on a layer, in order.
    pub fn frequencies(&self, layer: Layer) -> Vec<f64> {
        self.lock()
            .iter()
            .filter_map(|c| match c {
                EngineCall::Frequency(l, hz) if *l == layer => Some(*hz),
                _ => None,
            })
            .collect()
    }

    /// Block until `predicate` holds for the recorded calls or `timeout`
    /// passes. Returns whether the predicate held.
    pub fn wait_until<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&[EngineCall]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut calls = self.lock();
        loop {
            if predicate(&calls) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            calls = match self.changed.wait_timeout(calls, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

impl AudioEngine for MemoryEngine {
    fn name(&self) -> &str {
        "memory"
    }

    fn start(&self) -> Result<(), AudioError> {
        self.push(EngineCall::Start);
        Ok(())
    }

    fn stop(&self) {
        self.push(EngineCall::Stop);
    }

    fn set_frequency(&self, layer: Layer, hz: f64) {
        self.push(EngineCall::Frequency(layer, hz));
    }

    fn set_amplitude(&self, layer: Layer, amplitude: f64) {
        self.push(EngineCall::Amplitude(layer, amplitude));
    }

    fn set_interval(&self, layer: Layer, secs: f64) {
        self.push(EngineCall::Interval(layer, secs));
    }

    fn play(&self, layer: Layer) {
        self.push(EngineCall::Play(layer));
    }

    fn release(&self, layer: Layer) {
        self.push(EngineCall::Release(layer));
    }

    fn start_drone(&self, drone: &DroneConfig) {
        self.push(EngineCall::Drone {
            base_hz: drone.base_hz,
            beat_hz: drone.beat_hz,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_engine_records_calls() {
        let engine = MemoryEngine::new();
        engine.start().unwrap();
        engine.set_interval(Layer::Gong, 4.4);
        engine.play(Layer::Gong);
        engine.release(Layer::Gong);

        assert_eq!(engine.plays(Layer::Gong), 1);
        assert_eq!(engine.releases(Layer::Gong), 1);
        assert_eq!(engine.intervals(Layer::Gong), vec![4.4]);
        assert_eq!(engine.calls()[0], EngineCall::Start);
    }

    #[test]
    fn test_wait_until_wakes_on_call() {
        let engine = Arc::new(MemoryEngine::new());
        let writer = engine.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            writer.play(Layer::Chime);
        });

        assert!(engine.wait_until(Duration::from_secs(2), |calls| calls.len() == 1));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_until_times_out() {
        let engine = MemoryEngine::new();
        assert!(!engine.wait_until(Duration::from_millis(10), |calls| !calls.is_empty()));
    }

    #[test]
    fn test_log_engine_stop_is_idempotent() {
        let engine = LogEngine::new();
        engine.start().unwrap();
        assert!(engine.is_running());
        engine.stop();
        engine.stop();
        assert!(!engine.is_running());
    }
}
