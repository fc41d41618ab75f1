//! Error types for the bridge proxy.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while classifying, resolving or forwarding a request.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Invalid source tag, missing or invalid configuration.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message.
        message: String,
    },

    /// No bridge matches the token, id or payload.
    #[error("Unknown bridge: {message}")]
    UnknownBridge {
        /// Error message.
        message: String,
    },

    /// No homeserver matches the id.
    #[error("Unknown homeserver: {message}")]
    UnknownHomeserver {
        /// Error message.
        message: String,
    },

    /// A ping acknowledgement referenced a transaction nobody recorded.
    #[error("Unknown transaction: {transaction_id}")]
    UnknownTransaction {
        /// The unresolved transaction id.
        transaction_id: String,
    },

    /// The request is structurally unusable (e.g. ping without `transaction_id`).
    #[error("Bad request: {message}")]
    BadRequest {
        /// Error message.
        message: String,
    },

    /// Inbound body exceeded the configured limit.
    #[error("Payload too large: limit is {limit} bytes")]
    PayloadTooLarge {
        /// Configured limit in bytes.
        limit: usize,
    },

    /// Connection failure or timeout talking to a bridge or homeserver.
    #[error("Upstream transport error: {message}")]
    UpstreamTransport {
        /// Error message.
        message: String,
        /// Whether the failure was a timeout.
        timed_out: bool,
    },

    /// Request-log or correlation-store backend failure.
    #[error("Storage error: {message}")]
    Storage {
        /// Error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProxyError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an unknown-bridge error.
    pub fn unknown_bridge(message: impl Into<String>) -> Self {
        Self::UnknownBridge {
            message: message.into(),
        }
    }

    /// Create an unknown-homeserver error.
    pub fn unknown_homeserver(message: impl Into<String>) -> Self {
        Self::UnknownHomeserver {
            message: message.into(),
        }
    }

    /// Create an unknown-transaction error.
    pub fn unknown_transaction(transaction_id: impl Into<String>) -> Self {
        Self::UnknownTransaction {
            transaction_id: transaction_id.into(),
        }
    }

    /// Create a bad-request error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Create an upstream transport error.
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::UpstreamTransport {
            message: message.into(),
            timed_out: false,
        }
    }

    /// Create an upstream timeout error.
    pub fn upstream_timeout(message: impl Into<String>) -> Self {
        Self::UpstreamTransport {
            message: message.into(),
            timed_out: true,
        }
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Get the HTTP status code for this error.
    #[allow(clippy::match_same_arms)]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Configuration { .. } => 400,
            Self::UnknownBridge { .. } => 404,
            Self::UnknownHomeserver { .. } => 404,
            Self::UnknownTransaction { .. } => 404,
            Self::BadRequest { .. } => 400,
            Self::PayloadTooLarge { .. } => 413,
            Self::UpstreamTransport { timed_out, .. } => {
                if *timed_out {
                    504
                } else {
                    502
                }
            }
            Self::Storage { .. } => 500,
            Self::Io(_) => 500,
            Self::Http(_) => 500,
            Self::Json(_) => 400,
        }
    }

    /// Whether this error means the request had no resolvable counterpart.
    pub fn is_unhandled(&self) -> bool {
        matches!(
            self,
            Self::UnknownBridge { .. }
                | Self::UnknownHomeserver { .. }
                | Self::UnknownTransaction { .. }
        )
    }

    /// Get the error category for logs and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::UnknownBridge { .. } => "unknown_bridge",
            Self::UnknownHomeserver { .. } => "unknown_homeserver",
            Self::UnknownTransaction { .. } => "unknown_transaction",
            Self::BadRequest { .. } => "bad_request",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::UpstreamTransport { .. } => "upstream",
            Self::Storage { .. } => "storage",
            Self::Io(_) => "io",
            Self::Http(_) => "http",
            Self::Json(_) => "json",
        }
    }

    /// Matrix `errcode` reported to the caller.
    pub fn errcode(&self) -> &'static str {
        match self {
            Self::UnknownBridge { .. }
            | Self::UnknownHomeserver { .. }
            | Self::UnknownTransaction { .. } => "M_NOT_FOUND",
            Self::BadRequest { .. } | Self::Json(_) => "M_BAD_JSON",
            Self::Configuration { .. } => "M_INVALID_PARAM",
            Self::PayloadTooLarge { .. } => "M_TOO_LARGE",
            _ => "M_UNKNOWN",
        }
    }
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Matrix-style error body returned for failures produced by the proxy itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Matrix error code.
    pub errcode: String,
    /// Human-readable message.
    pub error: String,
    /// Request ID for correlation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ErrorResponse {
    /// Create a new error response.
    pub fn new(errcode: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            errcode: errcode.into(),
            error: error.into(),
            request_id: None,
        }
    }

    /// Set the request ID.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

impl From<&ProxyError> for ErrorResponse {
    fn from(err: &ProxyError) -> Self {
        Self::new(err.errcode(), err.to_string())
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.errcode, self.error)
    }
}
