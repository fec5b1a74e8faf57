//! Error types for the voice engine.
//!
//! Expected transients (`NoSpeech`, `Aborted`) are absorbed by the session
//! loop; every other error halts the owning subsystem and is surfaced through
//! a notification.

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Error kinds reported by a speech-recognition backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognitionErrorKind {
    /// Microphone permission was revoked mid-session. Fatal.
    NotAllowed,
    /// The engine heard nothing.
    NoSpeech,
    /// The engine aborted its own session.
    Aborted,
    /// Any kind the backend reports that we do not classify.
    Other,
}

impl RecognitionErrorKind {
    /// Expected conditions that must not interrupt the conversational loop.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::NoSpeech | Self::Aborted)
    }

    /// Fatal for the whole session (permission gone).
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::NotAllowed)
    }
}

impl std::fmt::Display for RecognitionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotAllowed => "not-allowed",
            Self::NoSpeech => "no-speech",
            Self::Aborted => "aborted",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// Failure taxonomy for synthesis requests. None of these is retried by the
/// engine; the conversation handler decides whether to retry with shorter
/// input.
#[derive(Error, Debug)]
pub enum SynthesisError {
    #[error("Text exceeds the synthesis service limit")]
    TooLong,

    #[error("Synthesis service is unavailable or rate-limited")]
    ServiceUnavailable,

    #[error("Network error reaching the synthesis service: {0}")]
    Network(String),

    #[error("Synthesis failed: {0}")]
    Unknown(String),
}

/// Errors that can occur in the voice engine
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("Platform cannot run the voice engine: {0}")]
    UnsupportedPlatform(String),

    #[error("Recognition error: {0}")]
    Recognition(RecognitionErrorKind),

    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        match err {
            cpal::DefaultStreamConfigError::DeviceNotAvailable => {
                VoiceError::PermissionDenied("input device is not available".to_string())
            }
            other => VoiceError::AudioDevice(other.to_string()),
        }
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        match err {
            cpal::BuildStreamError::DeviceNotAvailable => {
                VoiceError::PermissionDenied("input device is not available".to_string())
            }
            other => VoiceError::AudioStream(other.to_string()),
        }
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}
