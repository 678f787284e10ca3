//! Error types for the merrycam voice pipeline

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while running a voice session
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Resampling error: {0}")]
    Resample(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Failed to open remote channel: {0}")]
    ChannelOpen(String),

    #[error("Remote channel closed")]
    ChannelClosed,

    #[error("Audio decode error: {0}")]
    Decode(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("A voice session is already active")]
    AlreadyActive,

    #[error("Session start cancelled by stop")]
    StartCancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::SupportedStreamConfigsError> for VoiceError {
    fn from(err: cpal::SupportedStreamConfigsError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        match err {
            // unplugged or claimed by another process
            cpal::BuildStreamError::DeviceNotAvailable => VoiceError::AudioDevice(err.to_string()),
            other => VoiceError::AudioStream(other.to_string()),
        }
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<base64::DecodeError> for VoiceError {
    fn from(err: base64::DecodeError) -> Self {
        VoiceError::Decode(err.to_string())
    }
}

impl From<serde_json::Error> for VoiceError {
    fn from(err: serde_json::Error) -> Self {
        VoiceError::Protocol(err.to_string())
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}
