//! Error types for the voice session client

use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice session client
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation not valid in the current session state
    #[error("invalid session state: {0}")]
    InvalidState(String),

    /// Session handshake failed
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Streaming transport failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Microphone capture failed
    #[error(transparent)]
    Capture(#[from] CaptureError),

    /// Audio playback failed
    #[error(transparent)]
    Playback(#[from] PlaybackError),

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
}

/// Failure of the `POST /start-session` exchange (and the other REST calls)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// Server answered with a status other than 200
    #[error("handshake rejected with HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// Response body could not be understood
    #[error("malformed handshake response: {0}")]
    Malformed(String),

    /// Server could not be reached
    #[error("server unreachable: {0}")]
    NetworkUnreachable(String),
}

/// Failure of the streaming connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection could not be established
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Connection dropped without a clean close handshake
    #[error("connection closed abnormally: {0}")]
    AbnormalClose(String),

    /// Peer sent something outside the protocol
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

/// Failure to acquire the microphone
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// Access to the input device was refused
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    /// No usable input device
    #[error("input device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Failure to play an inbound audio frame
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaybackError {
    /// Frame could not be decoded or scheduled
    #[error("audio decode failed: {0}")]
    DecodeFailed(String),

    /// Output device could not be opened for the playback context
    #[error("output device unavailable: {0}")]
    OutputUnavailable(String),
}
