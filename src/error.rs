//! Error types for the interview session engine

use thiserror::Error;

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors that can occur while orchestrating an interview session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Microphone (or sibling capture device) could not be opened within the
    /// bounded start-up retry window, or disappeared mid-recording.
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The platform has no working speech output. The session degrades by
    /// skipping straight to the think phase.
    #[error("speech output unsupported: {0}")]
    SpeechUnsupported(String),

    /// The duplex connection closed after being established. Fatal for the
    /// session; there is no automatic reconnect.
    #[error("duplex channel lost")]
    ChannelLost,

    /// The transcription service returned its known "unusable" placeholder.
    /// Recovered locally via manual text entry.
    #[error("transcription unusable: {0}")]
    TranscriptionUnusable(String),

    /// Finalizing the capture buffer into the WAV contract failed. Recovered
    /// by submitting the raw captured bytes instead.
    #[error("answer encoding failed: {0}")]
    EncodingFailure(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal event or command channel closed while the session was
    /// still running.
    #[error("channel closed")]
    ChannelClosed,

    #[error("timeout")]
    Timeout,

    #[error("{0}")]
    Other(String),
}
