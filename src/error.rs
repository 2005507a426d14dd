//! # Error Handling
//!
//! Two error families live here:
//! - [`AppError`]: failures of plain HTTP handlers, converted into JSON HTTP responses
//! - [`RelayError`]: failures inside a relay session, converted into `{"type":"error"}` frames
//!
//! ## Key Rust Concepts for Error Handling:
//! - **Enums for Error Types**: each variant is one failure scenario, with data attached
//! - **Display trait**: defines the human-readable message (what the client sees)
//! - **ResponseError trait**: lets actix-web turn an `AppError` into an HTTP response
//! - **No panics on the relay path**: every `RelayError` ends up as a frame or a log line

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors returned by HTTP handlers (including the WebSocket upgrade handlers).
///
/// ## Error Categories:
/// - **BadRequest**: the upgrade request was not a valid WebSocket handshake (400)
/// - **ServiceUnavailable**: the relay is at its concurrent session limit (503)
#[derive(Debug)]
pub enum AppError {
    /// Client sent an invalid request
    BadRequest(String),

    /// The server cannot take more work right now
    ServiceUnavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Maps each error to a status code and a consistent JSON body:
/// ```json
/// {
///   "error": {
///     "type": "service_unavailable",
///     "message": "Maximum concurrent sessions (10) reached",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST, // 400
                "bad_request",
                msg.clone(),
            ),
            AppError::ServiceUnavailable(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE, // 503
                "service_unavailable",
                msg.clone(),
            ),
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

/// Type alias for Results that use the HTTP error type.
pub type AppResult<T> = Result<T, AppError>;

/// Errors raised while relaying between a client socket and an upstream speech API.
///
/// ## How each variant is handled by the session:
/// - **Connect phase** (`MissingApiKey`, `UpstreamConnect`, `ConnectTimeout`):
///   one error frame, then the session closes. Clients reconnect to retry.
/// - **Per message** (`UpstreamReported`, `UpstreamClosed`, `LinkNotOpen`, `InvalidClientMessage`,
///   `UnsupportedInput`): one error frame, the session keeps running.
/// - **Protocol noise** (`UpstreamProtocol`): logged and swallowed.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayError {
    /// No API key configured for the named upstream service
    MissingApiKey { service: &'static str },

    /// Handshake or socket failure while opening the upstream link
    UpstreamConnect(String),

    /// The upstream did not complete its handshake in time
    ConnectTimeout { timeout_ms: u64 },

    /// The upstream closed an open link on its own
    UpstreamClosed,

    /// Upstream sent something we could not parse
    UpstreamProtocol(String),

    /// Upstream explicitly reported an error
    UpstreamReported(String),

    /// Tried to use a link that is not open
    LinkNotOpen,

    /// Client message could not be decoded for this relay
    InvalidClientMessage(String),

    /// The link variant cannot handle this kind of input
    UnsupportedInput { link: &'static str },
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::MissingApiKey { service } => {
                write!(f, "No API key configured for the {} service", service)
            }
            RelayError::UpstreamConnect(msg) => write!(f, "Failed to connect upstream: {}", msg),
            RelayError::ConnectTimeout { timeout_ms } => {
                write!(f, "Upstream connection timed out after {}ms", timeout_ms)
            }
            RelayError::UpstreamClosed => write!(f, "upstream connection closed"),
            RelayError::UpstreamProtocol(msg) => write!(f, "Malformed upstream frame: {}", msg),
            // Upstream messages are forwarded to the client verbatim
            RelayError::UpstreamReported(msg) => write!(f, "{}", msg),
            RelayError::LinkNotOpen => write!(f, "WebSocket connection not established"),
            RelayError::InvalidClientMessage(msg) => write!(f, "Invalid message: {}", msg),
            RelayError::UnsupportedInput { link } => {
                write!(f, "The {} relay cannot handle this message", link)
            }
        }
    }
}

impl std::error::Error for RelayError {}
