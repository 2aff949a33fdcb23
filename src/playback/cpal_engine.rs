//! Audio output through the default cpal device.
//!
//! A small additive synth: the tonal layer is a sustained sine whose pitch
//! follows each event, the percussive layers are decaying sine strikes, and
//! the drone is a pair of sines split across the left and right channels.
//! The cpal stream lives on its own thread since it is not `Send` on every
//! platform; the engine only shares the synth state with it.

use crate::core::mapping::Layer;
use crate::playback::engine::{AudioEngine, AudioError};
use crate::playback::DroneConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Sender};
use std::f32::consts::TAU;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

/// Base pitch and decay time (seconds) of a percussive layer.
fn strike_profile(layer: Layer) -> (f32, f32) {
    match layer {
        Layer::Gong => (98.0, 2.5),
        Layer::Chime => (1568.0, 0.8),
        Layer::Bowl => (392.0, 3.0),
        Layer::Tonal => (440.0, 0.5),
    }
}

fn layer_slot(layer: Layer) -> usize {
    match layer {
        Layer::Tonal => 0,
        Layer::Gong => 1,
        Layer::Chime => 2,
        Layer::Bowl => 3,
    }
}

struct Sine {
    hz: f32,
    amp: f32,
    phase: f32,
}

impl Sine {
    fn next(&mut self, sample_rate: f32) -> f32 {
        let value = self.phase.sin() * self.amp;
        self.phase = (self.phase + TAU * self.hz / sample_rate) % TAU;
        value
    }
}

struct Strike {
    tone: Sine,
    /// Per-sample gain multiplier
    decay: f32,
}

struct SynthState {
    sample_rate: f32,
    amplitude: [f32; 4],
    frequency: [Option<f32>; 4],
    tonal: Option<Sine>,
    strikes: Vec<Strike>,
    drone: Option<(Sine, Sine)>,
}

impl SynthState {
    fn new() -> Self {
        Self {
            sample_rate: 48_000.0,
            amplitude: [0.0; 4],
            frequency: [None; 4],
            tonal: None,
            strikes: Vec::new(),
            drone: None,
        }
    }

    /// Next stereo frame.
    fn next_frame(&mut self) -> (f32, f32) {
        let sr = self.sample_rate;
        let mut mono = 0.0;

        if let Some(ref mut tone) = self.tonal {
            mono += tone.next(sr);
        }
        self.strikes.retain_mut(|strike| {
            mono += strike.tone.next(sr);
            strike.tone.amp *= strike.decay;
            strike.tone.amp > 1e-4
        });

        let (left, right) = match self.drone {
            Some((ref mut l, ref mut r)) => (l.next(sr), r.next(sr)),
            None => (0.0, 0.0),
        };
        ((mono + left).tanh(), (mono + right).tanh())
    }
}

fn lock(state: &Mutex<SynthState>) -> MutexGuard<'_, SynthState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn fill<T: Copy>(data: &mut [T], channels: usize, state: &Mutex<SynthState>, convert: fn(f32) -> T) {
    let mut synth = lock(state);
    for frame in data.chunks_mut(channels.max(1)) {
        let (left, right) = synth.next_frame();
        for (ch, sample) in frame.iter_mut().enumerate() {
            *sample = convert(if ch % 2 == 0 { left } else { right });
        }
    }
}

fn build_stream(state: Arc<Mutex<SynthState>>) -> Result<cpal::Stream, AudioError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(AudioError::NoDevice)?;
    let supported = device
        .default_output_config()
        .map_err(|e| AudioError::Stream(e.to_string()))?;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let channels = config.channels as usize;
    lock(&state).sample_rate = config.sample_rate.0 as f32;

    let err_fn = |err: cpal::StreamError| tracing::warn!("audio stream error: {err}");

    let stream = match sample_format {
        cpal::SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                fill(data, channels, &state, |s| s)
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_output_stream(
            &config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                fill(data, channels, &state, |s| (s * i16::MAX as f32) as i16)
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::U16 => device.build_output_stream(
            &config,
            move |data: &mut [u16], _: &cpal::OutputCallbackInfo| {
                fill(data, channels, &state, |s| {
                    ((s * 0.5 + 0.5).clamp(0.0, 1.0) * u16::MAX as f32) as u16
                })
            },
            err_fn,
            None,
        ),
        other => {
            return Err(AudioError::Stream(format!(
                "unsupported sample format {other:?}"
            )))
        }
    }
    .map_err(|e| AudioError::Stream(e.to_string()))?;

    stream.play().map_err(|e| AudioError::Stream(e.to_string()))?;
    Ok(stream)
}

/// Engine writing to the default output device.
pub struct CpalEngine {
    state: Arc<Mutex<SynthState>>,
    stop_tx: Mutex<Option<Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CpalEngine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SynthState::new())),
            stop_tx: Mutex::new(None),
            thread: Mutex::new(None),
        }
    }
}

impl Default for CpalEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioEngine for CpalEngine {
    fn name(&self) -> &str {
        "cpal"
    }

    fn start(&self) -> Result<(), AudioError> {
        let mut thread = self.thread.lock().map_err(|e| AudioError::Stream(e.to_string()))?;
        if thread.is_some() {
            return Ok(());
        }

        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let state = self.state.clone();

        let handle = std::thread::Builder::new()
            .name("audio-output".into())
            .spawn(move || match build_stream(state) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // Runs until the engine drops its sender.
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| AudioError::Stream(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                *thread = Some(handle);
                if let Ok(mut slot) = self.stop_tx.lock() {
                    *slot = Some(stop_tx);
                }
                tracing::info!("audio output started");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => Err(AudioError::Stream("audio thread exited".to_string())),
        }
    }

    fn stop(&self) {
        if let Ok(mut slot) = self.stop_tx.lock() {
            drop(slot.take());
        }
        let handle = self.thread.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = handle {
            let _ = handle.join();
            tracing::info!("audio output stopped");
        }
        let mut synth = lock(&self.state);
        synth.tonal = None;
        synth.strikes.clear();
        synth.drone = None;
    }

    fn set_frequency(&self, layer: Layer, hz: f64) {
        let mut synth = lock(&self.state);
        synth.frequency[layer_slot(layer)] = Some(hz as f32);
        if layer == Layer::Tonal {
            if let Some(ref mut tone) = synth.tonal {
                tone.hz = hz as f32;
            }
        }
    }

    fn set_amplitude(&self, layer: Layer, amplitude: f64) {
        lock(&self.state).amplitude[layer_slot(layer)] = amplitude.clamp(0.0, 1.0) as f32;
    }

    fn set_interval(&self, _layer: Layer, _secs: f64) {
        // Timing is kept by the trigger threads.
    }

    fn play(&self, layer: Layer) {
        let mut synth = lock(&self.state);
        let slot = layer_slot(layer);
        let (base_hz, decay_secs) = strike_profile(layer);
        let hz = synth.frequency[slot].unwrap_or(base_hz);
        let amp = synth.amplitude[slot];

        if layer == Layer::Tonal {
            let phase = synth.tonal.as_ref().map(|t| t.phase).unwrap_or(0.0);
            synth.tonal = Some(Sine { hz, amp, phase });
        } else {
            let decay = (-1.0 / (decay_secs * synth.sample_rate)).exp();
            synth.strikes.push(Strike {
                tone: Sine { hz, amp, phase: 0.0 },
                decay,
            });
        }
    }

    fn release(&self, layer: Layer) {
        if layer == Layer::Tonal {
            lock(&self.state).tonal = None;
        }
    }

    fn start_drone(&self, drone: &DroneConfig) {
        let left = Sine {
            hz: drone.base_hz as f32,
            amp: drone.left_amplitude as f32,
            phase: 0.0,
        };
        let right = Sine {
            hz: (drone.base_hz + drone.beat_hz) as f32,
            amp: drone.right_amplitude as f32,
            phase: 0.0,
        };
        lock(&self.state).drone = Some((left, right));
    }
}

impl Drop for CpalEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strikes_decay_out() {
        let mut synth = SynthState::new();
        synth.sample_rate = 1000.0;
        synth.strikes.push(Strike {
            tone: Sine {
                hz: 100.0,
                amp: 1.0,
                phase: 0.0,
            },
            decay: 0.9,
        });

        for _ in 0..200 {
            synth.next_frame();
        }
        assert!(synth.strikes.is_empty());
    }

    #[test]
    fn test_drone_is_split_across_channels() {
        let engine = CpalEngine::new();
        engine.start_drone(&DroneConfig {
            left_amplitude: 0.3,
            right_amplitude: 0.0,
            ..DroneConfig::default()
        });

        let mut synth = lock(&engine.state);
        synth.sample_rate = 1000.0;
        synth.next_frame();
        let (left, right) = synth.next_frame();
        assert!(left.abs() > 0.0);
        assert_eq!(right, 0.0);
    }

    #[test]
    fn test_release_silences_tonal() {
        let engine = CpalEngine::new();
        engine.set_amplitude(Layer::Tonal, 0.2);
        engine.set_frequency(Layer::Tonal, 440.0);
        engine.play(Layer::Tonal);
        assert!(lock(&engine.state).tonal.is_some());

        engine.release(Layer::Tonal);
        assert!(lock(&engine.state).tonal.is_none());
    }
}
