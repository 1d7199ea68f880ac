use thiserror::Error;

use crate::capture::CaptureError;
use crate::config::ConfigError;
use crate::playback::PlaybackError;
use crate::tools::ToolError;

pub type Result<T> = std::result::Result<T, LiveError>;

#[derive(Error, Debug)]
pub enum LiveError {
    /// Transport-level failure; fatal to the current connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Inbound message that does not fit the current state. Logged and discarded.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Microphone or speaker could not be acquired.
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Tool dispatch error: {0}")]
    ToolDispatch(#[from] ToolError),

    #[error("Not connected (state: {0})")]
    NotConnected(String),

    #[error("Invalid state: cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<tokio_tungstenite::tungstenite::Error> for LiveError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        LiveError::Connection(err.to_string())
    }
}

impl From<PlaybackError> for LiveError {
    fn from(err: PlaybackError) -> Self {
        match err {
            PlaybackError::DeviceUnavailable(msg) => LiveError::DeviceUnavailable(msg),
        }
    }
}

impl From<CaptureError> for LiveError {
    fn from(err: CaptureError) -> Self {
        LiveError::DeviceUnavailable(err.to_string())
    }
}

impl LiveError {
    /// Only transport failures close the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LiveError::Connection(_))
    }
}
