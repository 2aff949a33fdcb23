//! Frame queues and the shared shutdown flag.
//!
//! Each channel gets its own unbounded FIFO so the sensor side can always
//! enqueue without waiting, while the consumer suspends until a frame (or the
//! QUIT sentinel) arrives.

use crate::sensor::types::{Channel, Frame, QueueItem};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;

/// Producer half of a frame queue.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: UnboundedSender<QueueItem>,
}

impl FrameSender {
    /// Enqueue a frame. Never blocks; a frame sent after the consumer is gone
    /// is dropped.
    pub fn enqueue(&self, frame: Frame) {
        let _ = self.tx.send(QueueItem::Frame(frame));
    }

    /// Enqueue the QUIT sentinel.
    pub fn quit(&self) {
        let _ = self.tx.send(QueueItem::Quit);
    }
}

/// Consumer half of a frame queue.
#[derive(Debug)]
pub struct FrameReceiver {
    rx: UnboundedReceiver<QueueItem>,
}

impl FrameReceiver {
    /// Wait for the next item. A queue whose producers are all gone reads as
    /// QUIT.
    pub async fn dequeue(&mut self) -> QueueItem {
        self.rx.recv().await.unwrap_or(QueueItem::Quit)
    }
}

/// Create one unbounded frame queue.
pub fn frame_queue() -> (FrameSender, FrameReceiver) {
    let (tx, rx) = unbounded_channel();
    (FrameSender { tx }, FrameReceiver { rx })
}

/// Producer handles for both channels.
#[derive(Debug, Clone)]
pub struct FrameQueues {
    pub ecg: FrameSender,
    pub hr: FrameSender,
}

impl FrameQueues {
    /// Create both queues, returning the producer handles and the ECG and HR
    /// receivers.
    pub fn new() -> (Self, FrameReceiver, FrameReceiver) {
        let (ecg, ecg_rx) = frame_queue();
        let (hr, hr_rx) = frame_queue();
        (Self { ecg, hr }, ecg_rx, hr_rx)
    }

    /// Producer handle for a channel.
    pub fn sender(&self, channel: Channel) -> &FrameSender {
        match channel {
            Channel::Ecg => &self.ecg,
            Channel::HeartRate => &self.hr,
        }
    }

    /// Route a frame to the queue of its channel.
    pub fn enqueue(&self, frame: Frame) {
        self.sender(frame.channel).enqueue(frame);
    }

    /// Push the QUIT sentinel onto both queues.
    pub fn quit_all(&self) {
        self.ecg.quit();
        self.hr.quit();
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownReason {
    /// Operator pressed Enter
    UserQuit,
    /// Ctrl+C
    Interrupted,
    /// The sensor dropped the link or a replay ran out of data
    SensorDisconnected,
    /// A configured run duration elapsed
    DurationElapsed,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::UserQuit => write!(f, "quit on user command"),
            ShutdownReason::Interrupted => write!(f, "interrupted"),
            ShutdownReason::SensorDisconnected => write!(f, "sensor disconnected"),
            ShutdownReason::DurationElapsed => write!(f, "run duration elapsed"),
        }
    }
}

/// Shared cancellation flag.
///
/// The first reason to be triggered wins; later triggers are ignored. Safe to
/// trigger from any thread (stdin reader, Ctrl+C handler, sensor callback).
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Set the flag. Returns true if this call was the one that set it.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    /// The reason the flag was set with, if any.
    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.tx.borrow()
    }

    pub fn is_triggered(&self) -> bool {
        self.reason().is_some()
    }

    /// Suspend until the flag is set.
    pub async fn wait(&self) -> ShutdownReason {
        let mut rx = self.tx.subscribe();
        let result = rx.wait_for(Option::is_some).await.map(|reason| *reason);
        match result {
            Ok(Some(reason)) => reason,
            _ => ShutdownReason::Interrupted,
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let (tx, mut rx) = frame_queue();
        tx.enqueue(Frame::ecg(1, vec![1.0]));
        tx.enqueue(Frame::ecg(2, vec![2.0]));
        tx.quit();

        match rx.dequeue().await {
            QueueItem::Frame(frame) => assert_eq!(frame.timestamp, 1),
            QueueItem::Quit => panic!("expected frame"),
        }
        match rx.dequeue().await {
            QueueItem::Frame(frame) => assert_eq!(frame.timestamp, 2),
            QueueItem::Quit => panic!("expected frame"),
        }
        assert_eq!(rx.dequeue().await, QueueItem::Quit);
    }

    #[tokio::test]
    async fn test_closed_queue_reads_as_quit() {
        let (tx, mut rx) = frame_queue();
        drop(tx);
        assert_eq!(rx.dequeue().await, QueueItem::Quit);
    }

    #[tokio::test]
    async fn test_frames_routed_by_channel() {
        let (queues, mut ecg_rx, mut hr_rx) = FrameQueues::new();
        queues.enqueue(Frame::heart_rate(7, 60.0, &[]));
        queues.enqueue(Frame::ecg(8, vec![0.0]));

        assert!(matches!(ecg_rx.dequeue().await, QueueItem::Frame(f) if f.timestamp == 8));
        assert!(matches!(hr_rx.dequeue().await, QueueItem::Frame(f) if f.timestamp == 7));
    }

    #[test]
    fn test_first_shutdown_reason_wins() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());

        assert!(shutdown.trigger(ShutdownReason::SensorDisconnected));
        assert!(!shutdown.trigger(ShutdownReason::UserQuit));
        assert_eq!(shutdown.reason(), Some(ShutdownReason::SensorDisconnected));
    }

    #[tokio::test]
    async fn test_wait_wakes_on_trigger() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        tokio::task::yield_now().await;
        shutdown.trigger(ShutdownReason::UserQuit);

        assert_eq!(handle.await.unwrap(), ShutdownReason::UserQuit);
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_already_set() {
        let shutdown = Shutdown::new();
        shutdown.trigger(ShutdownReason::DurationElapsed);
        assert_eq!(shutdown.wait().await, ShutdownReason::DurationElapsed);
    }
}
