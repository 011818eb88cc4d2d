//! Error types for the companion call subsystem

use thiserror::Error;

/// Result type alias for call operations
pub type CallResult<T> = Result<T, SessionError>;

/// Errors surfaced by the call session machine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Please choose a companion before starting a call")]
    NoCompanionSelected,

    /// `start_call` while a previous call is still live or tearing down.
    #[error("A call is already in progress")]
    CallInProgress,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors on the message channel to the call service.
///
/// Both connectivity variants end the call; the user sees the same generic message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Could not connect to the call service, please try again: {0}")]
    ConnectFailed(String),

    #[error("Connection to the call service was lost")]
    Disconnected,

    #[error("Invalid call message: {0}")]
    InvalidMessage(String),
}

/// Errors from the speech capture facility, already classified
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// Microphone permission refused. Fatal to capture only.
    #[error("Microphone permission denied")]
    PermissionDenied,

    /// Nothing heard before the recognizer gave up. Recovered silently.
    #[error("No speech detected")]
    Transient,

    /// Any other recognizer failure; surfaced, but capture keeps restarting.
    #[error("Speech recognition error: {code}")]
    Recognizer { code: String },
}

/// The response clip could not be decoded to PCM
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Audio decode failed: {0}")]
pub struct DecodeError(pub String);

/// Speaker output failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("Audio output device error: {0}")]
    Device(String),

    #[error("Audio playback error: {0}")]
    Playback(String),
}

/// Configuration loading failures
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Load(#[from] config::ConfigError),
}

impl From<rodio::decoder::DecoderError> for DecodeError {
    fn from(err: rodio::decoder::DecoderError) -> Self {
        DecodeError(err.to_string())
    }
}

impl From<rodio::StreamError> for PlaybackError {
    fn from(err: rodio::StreamError) -> Self {
        PlaybackError::Device(err.to_string())
    }
}

impl From<rodio::PlayError> for PlaybackError {
    fn from(err: rodio::PlayError) -> Self {
        PlaybackError::Playback(err.to_string())
    }
}
