//! Acquisition pipeline.
//!
//! This module contains:
//! - Per-channel frame queues with the QUIT sentinel
//! - The shared shutdown flag
//! - The session lifecycle tying sensor, analysis and playback together

pub mod queue;
pub mod session;

// Re-export commonly used types
pub use queue::{frame_queue, FrameQueues, FrameReceiver, FrameSender, Shutdown, ShutdownReason};
pub use session::{RecordingAnalysis, Session, SessionError, SessionOptions, SessionSummary};
