//! Error types for the live voice pipeline

use thiserror::Error;

use crate::state::Phase;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the live voice pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// The user declined access to a capture device
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// No usable capture device exists
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The backend relay could not issue a session credential
    #[error("session creation failed: {0}")]
    SessionCreationFailed(String),

    /// The realtime channel could not be opened or was lost
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Transient protocol error reported by the remote service (rate limits, hiccups)
    #[error("recoverable protocol error: {0}")]
    RecoverableProtocol(String),

    /// Protocol error that ends the session (malformed session, auth failure)
    #[error("fatal protocol error: {0}")]
    FatalProtocol(String),

    /// Conversation phase change not permitted by the state machine
    #[error("invalid phase transition: {from} -> {to}")]
    InvalidTransition {
        /// Phase held when the transition was attempted
        from: Phase,
        /// Requested phase
        to: Phase,
    },

    /// A voice swap is already running
    #[error("voice swap already in progress")]
    SwapInProgress,

    /// Voice swap exhausted its retries and the fallback failed
    #[error("voice swap failed: {0}")]
    VoiceSwapFailed(String),

    /// Operation requires an open realtime session
    #[error("not connected")]
    NotConnected,

    /// A connect attempt was abandoned because the connection was closed meanwhile
    #[error("connect cancelled")]
    Cancelled,

    /// Audio processing error
    #[error("audio error: {0}")]
    Audio(String),

    /// Camera processing error
    #[error("camera error: {0}")]
    Camera(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

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

    /// Image encoding error
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl Error {
    /// Whether retrying the failed operation can succeed without user action
    ///
    /// Network-layer failures are retryable; device and permission failures are
    /// not, since retrying without new consent changes nothing.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SessionCreationFailed(_) | Self::ConnectionFailed(_) | Self::RecoverableProtocol(_)
        )
    }
}
