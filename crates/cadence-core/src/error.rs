//! Engine error types

use thiserror::Error;

use crate::types::StreamId;

/// Errors that can occur during engine operations
///
/// None of these are fatal to the process: a failed load or a full queue
/// leaves the engine in its last valid playing state.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Submitted loop has no frames
    #[error("Loop buffer for {0:?} stream is empty")]
    EmptyLoop(StreamId),

    /// Metadata could not be interpreted (e.g. non-positive beat count)
    #[error("Bad loop metadata: {0}")]
    BadMetadata(String),

    /// BPM can only change while the transport is stopped
    #[error("Cannot change BPM while playing (current {current} bpm)")]
    BpmWhilePlaying { current: f64 },

    /// The render side is gone (output stream dropped)
    #[error("Engine render path disconnected")]
    Disconnected,

    /// The command ring had no space this occurrence; the operation was dropped
    #[error("Engine command queue full")]
    CommandQueueFull,

    /// Operation requires a running transport
    #[error("Transport is not running")]
    NotPlaying,

    /// Operation requires loaded content
    #[error("No loop loaded on {0:?} stream")]
    NoLoop(StreamId),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
