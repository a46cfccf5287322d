//! Error types for the PAGI conversation engine

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while capturing, transcribing, or speaking
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("voice mode is disabled")]
    Disabled,

    #[error("no supported recorder found: install one of {0}")]
    NoRecorder(String),

    #[error("recorder already running")]
    RecorderBusy,

    #[error("recorder exited with {code}: {stderr}")]
    RecorderFailed { code: String, stderr: String },

    #[error("{provider} requires {env_var} to be set")]
    MissingCredential {
        provider: &'static str,
        env_var: &'static str,
    },

    #[error("{provider} API error {status}: {body}")]
    Provider {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("STT error: {0}")]
    Stt(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Errors that cannot be fixed by retrying the turn (bad setup, not a transient blip).
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            VoiceError::Disabled
                | VoiceError::NoRecorder(_)
                | VoiceError::MissingCredential { .. }
                | VoiceError::Config(_)
        )
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for VoiceError {
    fn from(err: reqwest::Error) -> Self {
        VoiceError::Connection(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for VoiceError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        VoiceError::Connection(err.to_string())
    }
}

impl From<hound::Error> for VoiceError {
    fn from(err: hound::Error) -> Self {
        VoiceError::Stt(format!("WAV encoding failed: {}", err))
    }
}
