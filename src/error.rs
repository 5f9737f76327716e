//! Error types for the Beacon link layer

use thiserror::Error;

use crate::protocol::{ErrorCode, ErrorShape};

/// Result type alias for Beacon link operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the gateway protocol core
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Device identity could not be loaded, parsed or used
    #[error("identity error: {0}")]
    Identity(String),

    /// Authentication/authorization error (handshake rejected)
    #[error("auth error: {0}")]
    Auth(String),

    /// Target peer is not connected
    #[error("not connected: {0}")]
    NotConnected(String),

    /// No terminal response arrived within the bound
    #[error("timeout: {0}")]
    Timeout(String),

    /// Transport send failed or peer went away
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Malformed or rejected request
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Pinned TLS fingerprint did not match the server certificate
    #[error("tls fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },

    /// Error response returned by the remote gateway
    #[error("gateway error {code}: {message}")]
    Gateway { code: ErrorCode, message: String },

    /// Connection closed while the operation was outstanding
    #[error("gateway closed ({code}): {reason}")]
    Closed { code: u16, reason: String },

    /// Socket-level failure
    #[error("transport error: {0}")]
    Transport(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Wire error code for this error
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotConnected(_) => ErrorCode::NotConnected,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Unavailable(_) | Self::Closed { .. } | Self::Transport(_) | Self::Io(_) => {
                ErrorCode::Unavailable
            }
            Self::Gateway { code, .. } => *code,
            Self::Config(_)
            | Self::Identity(_)
            | Self::Auth(_)
            | Self::InvalidRequest(_)
            | Self::FingerprintMismatch { .. }
            | Self::Serialization(_)
            | Self::Toml(_) => ErrorCode::InvalidRequest,
        }
    }

    /// Convert to the wire error shape
    #[must_use]
    pub fn to_shape(&self) -> ErrorShape {
        match self {
            Self::Gateway { code, message } => ErrorShape::new(*code, message.clone()),
            other => ErrorShape::new(other.code(), other.to_string()),
        }
    }
}

impl From<ErrorShape> for Error {
    fn from(shape: ErrorShape) -> Self {
        Self::Gateway {
            code: shape.code,
            message: shape.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_taxonomy() {
        assert_eq!(Error::NotConnected("n1".into()).code(), ErrorCode::NotConnected);
        assert_eq!(Error::Timeout("t".into()).code(), ErrorCode::Timeout);
        assert_eq!(
            Error::Closed {
                code: 1006,
                reason: String::new()
            }
            .code(),
            ErrorCode::Unavailable
        );
        assert_eq!(Error::Auth("bad sig".into()).code(), ErrorCode::InvalidRequest);
    }

    #[test]
    fn gateway_shape_round_trips_code() {
        let shape = ErrorShape::new(ErrorCode::Timeout, "slow node");
        let err = Error::from(shape);
        let back = err.to_shape();
        assert_eq!(back.code, ErrorCode::Timeout);
        assert_eq!(back.message, "slow node");
    }
}
