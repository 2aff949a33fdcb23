//! Periodic per-layer triggers.
//!
//! A trigger walks one layer's event sequence. Each fire advances an explicit
//! [`TriggerState`], programs the engine with the event's settings and
//! renders it, then waits for the event's interval on its own clock. The
//! sequence can be swapped while the trigger runs.

use crate::core::mapping::{Layer, PlaybackEvent};
use crate::playback::engine::SharedEngine;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// What happens when a trigger reaches the end of its sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationPolicy {
    /// Start over from the first event
    Wrap,
    /// Render the last event, then stop and release the voice
    #[default]
    HaltAtEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerStatus {
    Active,
    Exhausted,
}

/// Outcome of one fire.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Render the event, then wait its interval
    Fire(PlaybackEvent),
    /// Render the event; nothing follows it
    Last(PlaybackEvent),
    /// Nothing to render
    Exhausted,
}

/// Per-layer trigger state.
#[derive(Debug, Clone)]
pub struct TriggerState {
    counter: usize,
    sequence: Vec<PlaybackEvent>,
    policy: TerminationPolicy,
    status: TriggerStatus,
}

impl TriggerState {
    pub fn new(sequence: Vec<PlaybackEvent>, policy: TerminationPolicy) -> Self {
        Self {
            counter: 0,
            sequence,
            policy,
            status: TriggerStatus::Active,
        }
    }

    pub fn counter(&self) -> usize {
        self.counter
    }

    pub fn status(&self) -> TriggerStatus {
        self.status
    }

    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    /// Advance by one fire.
    pub fn update(&mut self) -> Step {
        if self.status == TriggerStatus::Exhausted || self.sequence.is_empty() {
            self.status = TriggerStatus::Exhausted;
            return Step::Exhausted;
        }

        let len = self.sequence.len();
        let idx = self.counter.min(len - 1);
        let event = self.sequence[idx].clone();

        match self.policy {
            TerminationPolicy::Wrap => {
                self.counter = (idx + 1) % len;
                Step::Fire(event)
            }
            TerminationPolicy::HaltAtEnd if idx == len - 1 => {
                self.status = TriggerStatus::Exhausted;
                Step::Last(event)
            }
            TerminationPolicy::HaltAtEnd => {
                self.counter = idx + 1;
                Step::Fire(event)
            }
        }
    }

    /// Swap in a new sequence, keeping the position clamped to its length.
    /// An exhausted state with fresh events starts over from the first one.
    pub fn replace(&mut self, sequence: Vec<PlaybackEvent>) {
        if self.status == TriggerStatus::Exhausted && !sequence.is_empty() {
            self.status = TriggerStatus::Active;
            self.counter = 0;
        } else {
            self.counter = self.counter.min(sequence.len().saturating_sub(1));
        }
        self.sequence = sequence;
    }
}

/// Longest single wait between fires.
const MAX_WAIT: Duration = Duration::from_secs(3600);

/// Wait after an event, with `tempo` dividing its interval.
fn wait_for(interval_secs: f64, tempo: f64) -> Duration {
    Duration::try_from_secs_f64((interval_secs / tempo).max(0.0))
        .unwrap_or(MAX_WAIT)
        .min(MAX_WAIT)
}

/// Program the engine with an event and render it.
fn render(engine: &SharedEngine, event: &PlaybackEvent) {
    engine.set_interval(event.layer, event.interval_secs);
    engine.set_amplitude(event.layer, event.amplitude);
    if let Some(hz) = event.frequency_hz {
        engine.set_frequency(event.layer, hz);
    }
    engine.play(event.layer);
}

/// State shared by a trigger and its thread.
#[derive(Debug)]
struct Slot {
    state: TriggerState,
    /// Stop requested; no more sequences are taken
    halted: bool,
    /// Thread has released the voice and returned
    exited: bool,
}

fn lock_slot(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A running trigger thread.
pub struct Trigger {
    layer: Layer,
    slot: Arc<Mutex<Slot>>,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Trigger {
    /// Start firing `state` on its own thread. The first event renders
    /// immediately. `tempo` divides every interval.
    pub fn spawn(
        layer: Layer,
        state: TriggerState,
        engine: SharedEngine,
        tempo: f64,
    ) -> std::io::Result<Self> {
        let slot = Arc::new(Mutex::new(Slot {
            state,
            halted: false,
            exited: false,
        }));
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let tempo = if tempo.is_finite() && tempo > 0.0 { tempo } else { 1.0 };

        let thread_slot = slot.clone();
        let handle = std::thread::Builder::new()
            .name(format!("trigger-{layer}"))
            .spawn(move || {
                // The guard that ends the loop is held until the voice is
                // released, so a replace either revives the state or sees
                // the thread gone.
                let mut last_guard = loop {
                    let mut guard = lock_slot(&thread_slot);
                    let step = guard.state.update();
                    let (event, last) = match step {
                        Step::Fire(event) => (event, false),
                        Step::Last(event) => (event, true),
                        Step::Exhausted => break guard,
                    };
                    drop(guard);

                    render(&engine, &event);
                    if last {
                        let guard = lock_slot(&thread_slot);
                        if guard.state.status() == TriggerStatus::Exhausted {
                            tracing::debug!(%layer, "sequence finished");
                            break guard;
                        }
                        tracing::debug!(%layer, "fresh sequence after the last event");
                    }

                    let wait = wait_for(event.interval_secs, tempo);
                    let outcome = match Instant::now().checked_add(wait) {
                        Some(deadline) => stop_rx.recv_deadline(deadline),
                        None => stop_rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                    };
                    match outcome {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                            break lock_slot(&thread_slot)
                        }
                    }
                };
                engine.release(layer);
                last_guard.exited = true;
            })?;

        Ok(Self {
            layer,
            slot,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn layer(&self) -> Layer {
        self.layer
    }

    /// Whether the thread has released its voice and exited.
    pub fn is_finished(&self) -> bool {
        lock_slot(&self.slot).exited
    }

    /// Whether the OS thread has returned, so joining it cannot block.
    pub(crate) fn thread_exited(&self) -> bool {
        self.handle.as_ref().map_or(true, |handle| handle.is_finished())
    }

    /// Swap the running sequence without interrupting the current wait.
    /// Hands the sequence back when the thread is stopping or gone.
    pub fn replace(&self, sequence: Vec<PlaybackEvent>) -> Result<(), Vec<PlaybackEvent>> {
        let mut slot = lock_slot(&self.slot);
        if slot.halted || slot.exited {
            return Err(sequence);
        }
        slot.state.replace(sequence);
        Ok(())
    }

    /// Ask the thread to stop without waiting for it. The voice is released
    /// by the thread on its way out.
    pub fn halt(&mut self) {
        lock_slot(&self.slot).halted = true;
        drop(self.stop_tx.take());
    }

    /// Stop the thread and wait for it. Only the first call does anything.
    pub fn stop(&mut self) {
        self.halt();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!(layer = %self.layer, "trigger thread panicked");
            }
        }
    }
}

impl Drop for Trigger {
    fn drop(&mut self) {
        self.stop();
    }
}
