//! Playback scheduler.
//!
//! Owns one trigger per active layer and the audio engine's lifetime. New
//! event sequences replace running ones in place; finished layers are
//! restarted when fresh data arrives and an empty sequence stops its layer.
//! Dropping the scheduler stops every trigger and the engine.

use crate::core::mapping::{Layer, LayerSequences, PlaybackEvent};
use crate::playback::engine::{AudioError, SharedEngine};
use crate::playback::trigger::{Trigger, TriggerState};
use crate::playback::PlaybackConfig;
use std::collections::BTreeMap;

pub struct PlaybackScheduler {
    engine: SharedEngine,
    config: PlaybackConfig,
    triggers: BTreeMap<Layer, Trigger>,
    /// Halted triggers whose threads may still be on their way out
    retired: Vec<Trigger>,
    started: bool,
    stopped: bool,
}

impl PlaybackScheduler {
    pub fn new(engine: SharedEngine, config: PlaybackConfig) -> Self {
        Self {
            engine,
            config,
            triggers: BTreeMap::new(),
            retired: Vec::new(),
            started: false,
            stopped: false,
        }
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    /// Start the engine and, if enabled, the binaural drone. Only the first
    /// call has any effect.
    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.started {
            return Ok(());
        }
        self.engine.start()?;
        self.started = true;
        tracing::info!(engine = self.engine.name(), "playback started");

        if self.config.drone.enabled {
            self.engine.start_drone(&self.config.drone);
        }
        Ok(())
    }

    /// Hand over the latest sequences. Returns the number of events
    /// scheduled.
    pub fn schedule(&mut self, sequences: LayerSequences) -> usize {
        if self.stopped {
            return 0;
        }
        sequences
            .into_iter()
            .map(|(layer, events)| self.schedule_layer(layer, events))
            .sum()
    }

    /// Replace, restart or stop one layer's trigger. Never waits on a
    /// trigger thread.
    pub fn schedule_layer(&mut self, layer: Layer, events: Vec<PlaybackEvent>) -> usize {
        if self.stopped {
            return 0;
        }
        // Only threads that have returned are joined here.
        self.retired.retain(|trigger| !trigger.thread_exited());

        if events.is_empty() {
            if self.triggers.contains_key(&layer) {
                tracing::debug!(%layer, "no events, stopping layer");
                self.retire_layer(layer);
            }
            return 0;
        }

        let count = events.len();
        let events = match self.triggers.get(&layer) {
            Some(trigger) => match trigger.replace(events) {
                Ok(()) => {
                    tracing::debug!(%layer, events = count, "sequence replaced");
                    return count;
                }
                Err(events) => events,
            },
            None => events,
        };

        // Not running, or ran to the end: start afresh.
        self.retire_layer(layer);
        let state = TriggerState::new(events, self.config.policy);
        match Trigger::spawn(layer, state, self.engine.clone(), self.config.tempo) {
            Ok(trigger) => {
                tracing::debug!(%layer, events = count, "trigger started");
                self.triggers.insert(layer, trigger);
                count
            }
            Err(e) => {
                tracing::warn!(%layer, "failed to start trigger thread: {e}");
                0
            }
        }
    }

    /// Halt one layer's trigger and let its thread finish on its own.
    fn retire_layer(&mut self, layer: Layer) {
        if let Some(mut trigger) = self.triggers.remove(&layer) {
            trigger.halt();
            self.retired.push(trigger);
        }
    }

    /// Layers whose triggers are still firing.
    pub fn active_layers(&self) -> Vec<Layer> {
        self.triggers
            .iter()
            .filter(|(_, t)| !t.is_finished())
            .map(|(layer, _)| *layer)
            .collect()
    }

    /// Stop every trigger, wait for their threads and release the engine.
    /// Safe to call more than once.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        for (_, mut trigger) in std::mem::take(&mut self.triggers) {
            trigger.stop();
        }
        for mut trigger in self.retired.drain(..) {
            trigger.stop();
        }
        if self.started {
            self.engine.stop();
        }
        tracing::info!("playback stopped");
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
