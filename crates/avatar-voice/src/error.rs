//! Error types for the avatar session

use thiserror::Error;

/// Result type alias for avatar and capture operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while driving the avatar or the capture session
#[derive(Error, Debug)]
pub enum VoiceError {
    /// Microphone access denied or unsupported. Non-fatal: continue without capture.
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Network failure: {0}")]
    Network(String),

    /// Malformed audio or payload data. Fatal to the current playback run only.
    #[error("Decode failure: {0}")]
    Decode(String),

    /// The server refused further attempts. Never retried.
    #[error("Rate limited while fetching {0}")]
    RateLimited(String),

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// Malformed animation payload. Aborts the animation, audio may continue.
    #[error("Invalid animation sequence: {0}")]
    InvalidSequence(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Avatar run cancelled")]
    Cancelled,

    #[error("Capture session has shut down")]
    ShutDown,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Recognizer error: {0}")]
    Recognizer(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Terminal outcomes the caller should surface as "end the session".
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VoiceError::RateLimited(_) | VoiceError::RetriesExhausted { .. }
        )
    }

    /// Whether a retry policy may attempt the operation again.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            VoiceError::RateLimited(_)
                | VoiceError::InvalidInput(_)
                | VoiceError::ShutDown
                | VoiceError::Cancelled
                | VoiceError::RetriesExhausted { .. }
        )
    }
}

impl From<reqwest::Error> for VoiceError {
    fn from(err: reqwest::Error) -> Self {
        VoiceError::Network(err.to_string())
    }
}

impl From<hound::Error> for VoiceError {
    fn from(err: hound::Error) -> Self {
        VoiceError::Decode(err.to_string())
    }
}

impl From<base64::DecodeError> for VoiceError {
    fn from(err: base64::DecodeError) -> Self {
        VoiceError::Decode(format!("audio payload is not valid base64: {}", err))
    }
}

impl From<serde_json::Error> for VoiceError {
    fn from(err: serde_json::Error) -> Self {
        VoiceError::InvalidSequence(err.to_string())
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

#[cfg(feature = "native-audio")]
impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::PermissionDenied(err.to_string())
    }
}

#[cfg(feature = "native-audio")]
impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::PermissionDenied(err.to_string())
    }
}

#[cfg(feature = "native-audio")]
impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::PermissionDenied(err.to_string())
    }
}
