//! Audio backend error types

use thiserror::Error;

/// Errors that can occur bringing up or running the output device
#[derive(Error, Debug)]
pub enum AudioError {
    /// No audio devices available
    #[error("No audio output devices found")]
    NoDevices,

    /// Failed to get device configuration
    #[error("Failed to get device config: {0}")]
    ConfigError(String),

    /// Failed to build audio stream
    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    /// Failed to start/play stream
    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    /// Unsupported sample format
    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),

    /// Output device has fewer than two channels
    #[error("Output device is not stereo ({0} channels)")]
    NotStereo(u16),
}

/// Result type for audio operations
pub type AudioResult<T> = Result<T, AudioError>;
