//! Error types for a3s-gateway

use thiserror::Error;

/// Errors that can occur in the gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A provider could not be reached or is misconfigured
    #[error("Connection error: {0}")]
    Connection(String),

    /// A connected provider rejected a call
    #[error("Operation error: {0}")]
    Operation(String),

    /// Every registered provider failed to connect
    #[error("No provider available")]
    NoProviderAvailable,

    /// The requested RPC method does not exist
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    /// A one-shot call did not receive a response in time
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// A stream failed after it was opened
    #[error("Stream error: {0}")]
    Stream(String),

    /// RPC arguments were missing or malformed
    #[error("Invalid parameters for '{method}': {reason}")]
    InvalidParams { method: String, reason: String },

    /// Administrative method called from an unprivileged session
    #[error("Method '{0}' is not allowed from this session")]
    Forbidden(String),

    /// Message transport failure (channel closed, bad frame, I/O)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Stable machine-readable code carried in response envelopes
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Operation(_) => "operation",
            Self::NoProviderAvailable => "no_provider",
            Self::UnknownMethod(_) => "unknown_method",
            Self::Timeout(_) => "timeout",
            Self::Stream(_) => "stream",
            Self::InvalidParams { .. } => "invalid_params",
            Self::Forbidden(_) => "forbidden",
            Self::Transport(_) => "transport",
            Self::Serialization(_) => "serialization",
            Self::Config(_) => "config",
        }
    }

    /// Rebuild an error received from the other side of the transport
    pub fn from_remote(code: Option<&str>, message: String) -> Self {
        match code {
            Some("connection") => Self::Connection(message),
            Some("no_provider") => Self::NoProviderAvailable,
            Some("unknown_method") => Self::UnknownMethod(message),
            Some("timeout") => Self::Timeout(message),
            Some("stream") => Self::Stream(message),
            Some("invalid_params") => Self::InvalidParams {
                method: String::new(),
                reason: message,
            },
            Some("forbidden") => Self::Forbidden(message),
            Some("transport") => Self::Transport(message),
            Some("config") => Self::Config(message),
            _ => Self::Operation(message),
        }
    }

    pub(crate) fn invalid_params(method: &str, reason: impl Into<String>) -> Self {
        Self::InvalidParams {
            method: method.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
