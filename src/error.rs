//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - **Streaming errors** (`DecodeError`, `CaptureError`, `SessionError`, `VoiceError`):
//!   produced by the audio pipeline and the live session. They follow the
//!   propagation policy of the voice subsystem: a `DecodeError` only drops one
//!   chunk, the other two always tear the whole session down.
//! - **HTTP errors** (`AppError`): what the control API hands back to the host
//!   panel, rendered as a JSON envelope by actix's `ResponseError`.
//!
//! ## Propagation:
//! ```text
//! DecodeError  -> logged + counted, stream continues
//! CaptureError -> session closed, surfaced as VoiceError::Capture (user may retry open)
//! SessionError -> session closed, surfaced as VoiceError::Session (no auto-reconnect)
//! VoiceError   -> AppError (HTTP 503 / 502 / 500)
//! ```

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use std::time::Duration;

/// A single inbound chunk could not be turned into samples.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("audio payload is not valid base64: {0}")]
    InvalidEncoding(String),

    #[error("audio payload has {0} bytes, expected whole 16-bit samples")]
    OddLength(usize),

    #[error("{samples} samples do not divide into {channels} channels")]
    PartialFrame { samples: usize, channels: u16 },
}

/// The microphone could not be opened or stopped delivering audio.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("no audio input device available")]
    NoInputDevice,

    #[error("no audio output device available")]
    NoOutputDevice,

    #[error("audio device '{0}' not found")]
    DeviceNotFound(String),

    #[error("unsupported device configuration: {0}")]
    UnsupportedConfig(String),

    #[error("audio stream failed: {0}")]
    Stream(String),

    #[error("audio devices unavailable: {0}")]
    Unavailable(String),
}

/// The remote endpoint refused, dropped or confused the stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("failed to connect to live endpoint: {0}")]
    Connect(String),

    #[error("live endpoint rejected the session: {0}")]
    Rejected(String),

    #[error("live endpoint disconnected: {0}")]
    Disconnected(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("live endpoint did not become ready within {0:?}")]
    Timeout(Duration),

    #[error("session was closed before it became ready")]
    Cancelled,
}

/// Session-level failure surfaced to whoever called `open`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VoiceError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Custom error types for the HTTP control API.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **DeviceUnavailable**: Microphone or speaker could not be used (503 errors)
/// - **UpstreamError**: The live endpoint failed the session (502 errors)
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),

    /// Audio devices could not be acquired
    DeviceUnavailable(String),

    /// The remote live endpoint failed
    UpstreamError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::DeviceUnavailable(msg) => write!(f, "Audio device unavailable: {}", msg),
            AppError::UpstreamError(msg) => write!(f, "Live session error: {}", msg),
        }
    }
}

/// Converts errors into the JSON envelope the panel understands.
///
/// ```json
/// {
///   "error": {
///     "type": "device_unavailable",
///     "message": "no audio input device available",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            AppError::DeviceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "device_unavailable", msg)
            }
            AppError::UpstreamError(msg) => (StatusCode::BAD_GATEWAY, "session_error", msg),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<VoiceError> for AppError {
    fn from(err: VoiceError) -> Self {
        match err {
            VoiceError::Capture(e) => AppError::DeviceUnavailable(e.to_string()),
            VoiceError::Session(e) => AppError::UpstreamError(e.to_string()),
        }
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;
