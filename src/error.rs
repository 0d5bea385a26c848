//! Unified error types for the CDP Relay Core

use thiserror::Error;

/// Unified Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the relay
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network errors
    #[error("Network error: {0}")]
    Net(#[from] std::net::AddrParseError),

    /// WebSocket errors
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// CDP protocol errors
    #[error("CDP error: {0}")]
    Cdp(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No extension is bound to service this request
    #[error("Extension not connected")]
    NoExtension,

    /// A referenced target does not exist
    #[error("Target not found: {0}")]
    TargetNotFound(String),

    /// An outbound extension request exceeded its deadline
    #[error("Extension request timeout after {0}ms: {1}")]
    Timeout(u64, String),

    /// Extension socket closed while requests were outstanding
    #[error("Extension connection closed")]
    ExtensionClosed,

    /// WebSocket/HTTP upgrade rejected: missing or wrong token
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// WebSocket/HTTP upgrade rejected: origin or site not allowed
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Malformed request body or frame
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Privileged request sent the wrong `Content-Type`
    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new WebSocket error
    pub fn websocket<S: Into<String>>(msg: S) -> Self {
        Error::WebSocket(msg.into())
    }

    /// Create a new CDP error
    pub fn cdp<S: Into<String>>(msg: S) -> Self {
        Error::Cdp(msg.into())
    }

    /// Create a new target-not-found error
    pub fn target_not_found<S: Into<String>>(id: S) -> Self {
        Error::TargetNotFound(id.into())
    }

    /// Create a new timeout error for the given method, after `timeout_ms`
    pub fn timeout<S: Into<String>>(timeout_ms: u64, method: S) -> Self {
        Error::Timeout(timeout_ms, method.into())
    }

    /// Create a new configuration error
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Error::Configuration(msg.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Create a new unsupported-media-type error
    pub fn unsupported_media_type<S: Into<String>>(msg: S) -> Self {
        Error::UnsupportedMediaType(msg.into())
    }

    /// Map this error onto the HTTP status code the discovery/security
    /// surface should answer with (spec §7/§6 status table).
    pub fn http_status(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Error::TargetNotFound(_) | Error::NoExtension => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
