//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - **BridgeError**: domain failures of the bridge itself (Bluetooth link,
//!   realtime session, audio decode, playback output). The controller maps
//!   these onto link statuses; they never cross the HTTP boundary directly.
//! - **AppError**: what an HTTP handler returns. It knows how to turn itself
//!   into a JSON error response.
//!
//! ## Key Rust Concepts:
//! - **enum with data**: each variant carries a human-readable detail string
//! - **Display + std::error::Error**: lets `BridgeError` work with `?`, `anyhow`
//!   and `tracing` field formatting
//! - **From trait**: automatic conversion between error types with `?`

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Failures of the hardware link, the realtime session, or the audio pipeline.
///
/// ## Propagation policy:
/// Errors raised while connecting are caught by the controller and turned into
/// an `Error` status for the affected link only. Nothing is retried.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// The platform has no usable Bluetooth capability (no adapter, feature disabled)
    LinkUnavailable(String),

    /// The user declined pairing or no device matched the scan filter
    PairingFailed(String),

    /// The GATT connection to the selected device could not be established
    GattConnectFailed(String),

    /// The device is connected but lacks the audio service or characteristic
    ServiceOrCharacteristicMissing(String),

    /// The realtime session could not be opened or its setup was rejected
    SessionHandshakeFailed(String),

    /// The realtime session failed after it was established
    Transport(String),

    /// Audio payload could not be decoded (odd length, bad base64, ...)
    Decode(String),

    /// No playback output is attached, or the output refused the buffer
    OutputUnavailable(String),

    /// The operation is not allowed in the current link state
    InvalidState(String),
}

impl BridgeError {
    /// Short machine-readable tag, used in event payloads and JSON errors.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::LinkUnavailable(_) => "link_unavailable",
            BridgeError::PairingFailed(_) => "pairing_failed",
            BridgeError::GattConnectFailed(_) => "gatt_connect_failed",
            BridgeError::ServiceOrCharacteristicMissing(_) => "service_missing",
            BridgeError::SessionHandshakeFailed(_) => "session_handshake_failed",
            BridgeError::Transport(_) => "transport_error",
            BridgeError::Decode(_) => "decode_error",
            BridgeError::OutputUnavailable(_) => "output_unavailable",
            BridgeError::InvalidState(_) => "invalid_state",
        }
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::LinkUnavailable(msg) => write!(f, "Bluetooth unavailable: {}", msg),
            BridgeError::PairingFailed(msg) => write!(f, "Pairing failed: {}", msg),
            BridgeError::GattConnectFailed(msg) => write!(f, "GATT connect failed: {}", msg),
            BridgeError::ServiceOrCharacteristicMissing(msg) => {
                write!(f, "Audio service or characteristic missing: {}", msg)
            }
            BridgeError::SessionHandshakeFailed(msg) => write!(f, "Session handshake failed: {}", msg),
            BridgeError::Transport(msg) => write!(f, "Session transport error: {}", msg),
            BridgeError::Decode(msg) => write!(f, "Audio decode error: {}", msg),
            BridgeError::OutputUnavailable(msg) => write!(f, "Audio output unavailable: {}", msg),
            BridgeError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl std::error::Error for BridgeError {}

/// Errors returned by HTTP handlers.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500)
/// - **BadRequest**: Client sent invalid data (400)
/// - **Conflict**: Request is valid but clashes with the current bridge state (409)
/// - **ConfigError**: Configuration problems (500)
/// - **ValidationError**: Data validation failed (400)
/// - **Unavailable**: The platform lacks a capability the bridge needs (503)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    Conflict(String),
    ConfigError(String),
    ValidationError(String),
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Converts errors into JSON responses of the form:
///
/// ```json
/// { "error": { "type": "conflict", "message": "...", "timestamp": "..." } }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
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

/// JSON parsing errors are the client's fault, so they map to 400.
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

/// A command the bridge refuses in its current state is a 409; a missing
/// platform capability is a 503; any other link failure is a 500.
impl From<BridgeError> for AppError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::InvalidState(msg) => AppError::Conflict(msg),
            BridgeError::LinkUnavailable(msg) => AppError::Unavailable(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

/// Shorthand for `Result<T, AppError>` in handlers.
pub type AppResult<T> = Result<T, AppError>;
