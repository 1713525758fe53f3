use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::video::encoder::EncoderStatus;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigurationError),

    #[error("Encoder error: {0}")]
    Encoder(#[from] EncoderError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Frame rejected: {0}")]
    FrameRejected(#[from] RejectReason),

    #[error("Normalization error: {0}")]
    Normalize(#[from] NormalizeError),

    #[error("Stream is not running")]
    NotRunning,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Classify this error for terminal notifications
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Config(_) => ErrorKind::Configuration,
            AppError::Encoder(_) => ErrorKind::Encoder,
            AppError::Transport(_) => ErrorKind::Transport,
            AppError::FrameRejected(_) | AppError::Normalize(_) => ErrorKind::Frame,
            AppError::NotRunning
            | AppError::Internal(_)
            | AppError::Io(_)
            | AppError::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Whether the failure may go away on its own if retried
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Config(_) => false,
            AppError::Transport(e) => e.is_retryable(),
            AppError::Encoder(_) => true,
            _ => false,
        }
    }
}

/// Coarse error classification published with terminal error events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Encoder,
    Transport,
    Frame,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Configuration => write!(f, "configuration"),
            ErrorKind::Encoder => write!(f, "encoder"),
            ErrorKind::Transport => write!(f, "transport"),
            ErrorKind::Frame => write!(f, "frame"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// Invalid or missing stream configuration. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Publish URL is missing")]
    MissingUrl,

    #[error("Stream key is missing")]
    MissingStreamKey,

    #[error("Invalid publish URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Invalid setting {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },
}

/// Encoder session failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncoderError {
    /// Every hardware attempt and the software fallback failed
    #[error("Encoder setup failed: {cause}")]
    SetupFailed { cause: EncoderStatus },

    #[error("Encoder session is not running")]
    NotRunning,

    #[error("Encoder property {property} rejected: {status}")]
    PropertyRejected {
        property: &'static str,
        status: EncoderStatus,
    },

    #[error("Encode failed: {0}")]
    EncodeFailed(EncoderStatus),

    #[error("Encoder operation cancelled")]
    Cancelled,

    #[error("Encoder worker is gone")]
    WorkerGone,
}

/// Publish transport failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// The transport cannot speak the URL's protocol; retrying never helps
    #[error("URL scheme '{0}' is not supported by this transport")]
    UnsupportedScheme(String),

    #[error("Publish rejected: {0}")]
    PublishRejected(String),

    #[error("Server dropped the session after publish")]
    DroppedAfterPublish,

    #[error("Not connected")]
    NotConnected,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl TransportError {
    /// Cancellation is a deliberate stop and an unsupported scheme never
    /// changes; every other transport error is retried
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TransportError::Cancelled | TransportError::UnsupportedScheme(_)
        )
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// Why a frame was dropped before any expensive work
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    #[error("frame has a zero dimension")]
    ZeroDimension,

    #[error("frame is smaller than the supported minimum")]
    TooSmall,

    #[error("frame is larger than the supported maximum")]
    TooLarge,

    #[error("frame payload is shorter than its format requires")]
    Truncated,
}

/// Normalization failures. Only raised when no usable buffer can be produced.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("buffer pool exhausted")]
    PoolExhausted,

    #[error("cannot read {format} input: {reason}")]
    UnreadableInput { format: String, reason: String },

    #[error("scaling failed: {0}")]
    ScaleFailed(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        let err: AppError = ConfigurationError::MissingUrl.into();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(!err.is_retryable());

        let err: AppError = TransportError::NotConnected.into();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.is_retryable());

        let err: AppError = TransportError::Cancelled.into();
        assert!(!err.is_retryable());

        let err: AppError = RejectReason::TooSmall.into();
        assert_eq!(err.kind(), ErrorKind::Frame);
    }

    #[test]
    fn test_error_messages() {
        let err = TransportError::Timeout {
            operation: "connect",
            timeout_ms: 8000,
        };
        assert_eq!(err.to_string(), "connect timed out after 8000ms");

        let err = EncoderError::SetupFailed {
            cause: EncoderStatus::EncoderNotFound,
        };
        assert!(err.to_string().contains("encoder not found"));
    }
}
