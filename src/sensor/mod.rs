//! Heart sensor sources.
//!
//! A source delivers ECG and heart-rate frames into the pipeline's queues
//! once subscribed, and reports a lost link through a disconnect callback.
//! Two sources ship with the crate: a synthetic sensor and a replay of a
//! recorded session export.

pub mod replay;
pub mod simulated;
pub mod types;

use crate::pipeline::queue::FrameSender;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

// Re-export commonly used types
pub use replay::{ReplayConfig, ReplaySensor};
pub use simulated::{SimulatedConfig, SimulatedSensor};
pub use types::{Channel, Frame, QueueItem};

/// Callback invoked once when the sensor link goes away.
pub type DisconnectCallback = Box<dyn Fn() + Send + Sync>;

/// Errors reported by a sensor source.
#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("sensor not found: {0}")]
    NotFound(String),

    #[error("sensor rejected {channel} streaming (code {code}): {message}")]
    StartRejected {
        channel: Channel,
        code: i32,
        message: String,
    },

    #[error("{0} is not subscribed")]
    NotSubscribed(Channel),

    #[error("sensor is not connected")]
    NotConnected,

    #[error("malformed recording {path}:{line}: {message}")]
    Malformed {
        path: String,
        line: usize,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SensorError {
    /// Process exit code for a fatal sensor error.
    pub fn exit_code(&self) -> u8 {
        match self {
            SensorError::NotFound(_) => 4,
            SensorError::StartRejected { code, .. } => match u8::try_from(*code) {
                Ok(0) | Err(_) => 1,
                Ok(code) => code,
            },
            _ => 1,
        }
    }
}

/// A connected heart sensor.
#[async_trait]
pub trait SensorSource: Send {
    /// Human readable device name.
    fn name(&self) -> &str;

    /// Whether the link is still up.
    fn is_connected(&self) -> bool;

    /// Channels this source can stream.
    fn channels(&self) -> Vec<Channel> {
        vec![Channel::Ecg, Channel::HeartRate]
    }

    /// Register the callback fired when the link drops.
    fn on_disconnect(&mut self, callback: DisconnectCallback);

    /// Start streaming a channel into `queue`.
    async fn subscribe(&mut self, channel: Channel, queue: FrameSender) -> Result<(), SensorError>;

    /// Stop streaming a channel.
    async fn unsubscribe(&mut self, channel: Channel) -> Result<(), SensorError>;
}

/// Queues a source is currently streaming into, one slot per channel.
#[derive(Debug, Default)]
pub(crate) struct Subscribers {
    ecg: Option<FrameSender>,
    hr: Option<FrameSender>,
}

impl Subscribers {
    fn slot(&mut self, channel: Channel) -> &mut Option<FrameSender> {
        match channel {
            Channel::Ecg => &mut self.ecg,
            Channel::HeartRate => &mut self.hr,
        }
    }

    pub(crate) fn set(&mut self, channel: Channel, queue: FrameSender) {
        *self.slot(channel) = Some(queue);
    }

    /// Remove a subscription; returns false if the channel was not streaming.
    pub(crate) fn remove(&mut self, channel: Channel) -> bool {
        self.slot(channel).take().is_some()
    }

    /// Deliver a frame to its channel's queue, if subscribed.
    pub(crate) fn deliver(&self, frame: Frame) {
        let queue = match frame.channel {
            Channel::Ecg => &self.ecg,
            Channel::HeartRate => &self.hr,
        };
        if let Some(queue) = queue {
            queue.enqueue(frame);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ecg.is_none() && self.hr.is_none()
    }
}

/// Subscribers shared between a source and its streaming task.
pub(crate) type SharedSubscribers = Arc<Mutex<Subscribers>>;

pub(crate) fn lock_subscribers(subscribers: &SharedSubscribers) -> MutexGuard<'_, Subscribers> {
    match subscribers.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Connection flag plus the one-shot disconnect callback.
#[derive(Clone)]
pub(crate) struct Link {
    connected: Arc<AtomicBool>,
    callback: Arc<Mutex<Option<DisconnectCallback>>>,
}

impl Link {
    pub(crate) fn new() -> Self {
        Self {
            connected: Arc::new(AtomicBool::new(true)),
            callback: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn set_callback(&self, callback: DisconnectCallback) {
        if let Ok(mut slot) = self.callback.lock() {
            *slot = Some(callback);
        }
    }

    /// Mark the link as down and fire the callback. Only the first call has
    /// any effect.
    pub(crate) fn drop_link(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let callback = self.callback.lock().ok().and_then(|mut slot| slot.take());
        if let Some(callback) = callback {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(SensorError::NotFound("polar".into()).exit_code(), 4);

        let rejected = SensorError::StartRejected {
            channel: Channel::Ecg,
            code: 6,
            message: "invalid setting".into(),
        };
        assert_eq!(rejected.exit_code(), 6);

        let negative = SensorError::StartRejected {
            channel: Channel::Ecg,
            code: -2,
            message: String::new(),
        };
        assert_eq!(negative.exit_code(), 1);
    }

    #[test]
    fn test_link_drops_once() {
        let link = Link::new();
        let count = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = count.clone();
        link.set_callback(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        link.drop_link();
        link.drop_link();
        assert!(!link.is_connected());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscribers_deliver_by_channel() {
        let (tx, mut rx) = crate::pipeline::queue::frame_queue();
        let mut subscribers = Subscribers::default();
        subscribers.set(Channel::HeartRate, tx);

        subscribers.deliver(Frame::ecg(1, vec![0.0]));
        subscribers.deliver(Frame::heart_rate(2, 60.0, &[]));

        assert!(matches!(rx.dequeue().await, QueueItem::Frame(f) if f.timestamp == 2));
        assert!(subscribers.remove(Channel::HeartRate));
        assert!(!subscribers.remove(Channel::HeartRate));
        assert!(subscribers.is_empty());
        // The ECG frame never reached this queue.
        assert_eq!(rx.dequeue().await, QueueItem::Quit);
    }
}
