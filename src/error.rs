//! Error types for the hark voice engine

use serde::Serialize;
use thiserror::Error;

/// Result type alias for hark operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice engine
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Microphone access was refused by the OS or the user
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    /// Audio device or stream error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text service error
    #[error("STT error: {0}")]
    Stt(String),

    /// Transcription failed or timed out
    #[error("transcription failed: {reason}")]
    Transcription {
        /// Human-readable cause
        reason: String,
        /// What went wrong, for deciding whether the user hears about it
        cause: TranscriptionFailure,
    },

    /// Text-to-speech service error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Audio playback failed
    #[error("playback error: {0}")]
    Playback(String),

    /// Response pipeline failed
    #[error("response error: {0}")]
    Response(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// The session task is no longer running
    #[error("voice session has shut down")]
    SessionClosed,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Classify this error for the session taxonomy
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::Stt(_) | Self::Transcription { .. } => ErrorKind::Transcription,
            Self::Tts(_) | Self::Playback(_) => ErrorKind::Playback,
            Self::Response(_) => ErrorKind::Response,
            _ => ErrorKind::Capture,
        }
    }

    /// Whether the error stems from a deadline rather than a failure
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout(),
            Self::Transcription { cause, .. } => *cause == TranscriptionFailure::Timeout,
            _ => false,
        }
    }

    /// Whether the service was never reached or never answered
    #[must_use]
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Http(e) => e.is_connect() || e.is_request() || e.is_timeout() || e.is_body(),
            Self::Transcription { cause, .. } => *cause == TranscriptionFailure::Transport,
            _ => false,
        }
    }
}

/// Why a transcription produced no utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptionFailure {
    /// No answer within the deadline
    Timeout,
    /// The service could not be reached
    Transport,
    /// The service answered and refused the audio
    Rejected,
}

impl TranscriptionFailure {
    /// Only a refusal is worth telling the user about
    #[must_use]
    pub const fn is_user_facing(self) -> bool {
        matches!(self, Self::Rejected)
    }
}

/// Session-level error taxonomy
///
/// Empty utterances and rejected wake words are normal outcomes and have no
/// variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Fatal until access is re-granted; never retried automatically
    PermissionDenied,
    /// Recorder failed after its single retry
    Capture,
    /// Speech-to-text failed or timed out
    Transcription,
    /// Response pipeline failed or timed out
    Response,
    /// Synthesis or playback failed
    Playback,
}
